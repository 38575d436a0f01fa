use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// One entry of the grammatical-case reference list, ordered by name.
#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct CaseView {
    pub id: i64,
    pub name: String,
    pub abbreviation: String,
    pub color: String,
    pub description: String,
}

/// A sentence as handed to the client at exercise start. Only the indices of
/// annotated words are exposed; the correct case ids stay server-side until
/// the sentence is checked.
#[derive(Deserialize, Serialize, Debug)]
pub struct SentenceView {
    pub id: i64,
    pub text: String,
    pub annotated_indices: Vec<i32>,
}
