use crate::schema::{session_assignments, session_participants, together_sessions};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub const SESSION_STATUS_LOBBY: &str = "lobby";
pub const SESSION_STATUS_IN_PROGRESS: &str = "in_progress";
pub const SESSION_STATUS_COMPLETED: &str = "completed";

/// The fixed palette participants pick their identity color from. Uniqueness
/// within a session is enforced by the database, not by the client's view of
/// the roster.
pub const COLOR_PALETTE: [&str; 8] = [
    "red", "orange", "amber", "green", "teal", "blue", "violet", "pink",
];

const NAME_ADJECTIVES: [&str; 12] = [
    "brave", "clever", "curious", "eager", "gentle", "jolly", "lively", "merry", "nimble",
    "plucky", "quick", "witty",
];

const NAME_ANIMALS: [&str; 12] = [
    "badger", "falcon", "fox", "heron", "lynx", "marmot", "otter", "owl", "raven", "squirrel",
    "stoat", "weasel",
];

/// Picks the playful two-word display name a participant joins under.
pub fn random_display_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = NAME_ADJECTIVES[rng.random_range(0..NAME_ADJECTIVES.len())];
    let animal = NAME_ANIMALS[rng.random_range(0..NAME_ANIMALS.len())];
    format!("{} {}", adjective, animal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentKind {
    Sentence,
    Flashcard,
}

impl AssignmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentKind::Sentence => "sentence",
            AssignmentKind::Flashcard => "flashcard",
        }
    }
}

/// Builds the shared exercise queue for a session: every sampled sentence
/// and flashcard exactly once, in a shuffled order that is fixed at creation
/// time so all participants see the same sequence.
pub fn build_assignment_plan<R: Rng + ?Sized>(
    sentence_ids: &[i64],
    flashcard_ids: &[i64],
    rng: &mut R,
) -> Vec<(AssignmentKind, i64)> {
    let mut plan: Vec<(AssignmentKind, i64)> = sentence_ids
        .iter()
        .map(|id| (AssignmentKind::Sentence, *id))
        .chain(
            flashcard_ids
                .iter()
                .map(|id| (AssignmentKind::Flashcard, *id)),
        )
        .collect();
    plan.shuffle(rng);
    plan
}

#[derive(Insertable, Debug)]
#[diesel(table_name = together_sessions)]
pub struct NewTogetherSession {
    pub host_id: i64,
    pub status: String,
    pub current_position: i32,
    // created_at has a DB default (CURRENT_TIMESTAMP)
    // completed_at is nullable (defaults to NULL)
}

#[derive(Insertable, Debug)]
#[diesel(table_name = session_participants)]
pub struct NewSessionParticipant {
    pub session_id: i64,
    pub student_id: i64,
    pub color: String,
    pub display_name: String,
    // joined_at has a DB default (CURRENT_TIMESTAMP)
}

#[derive(Insertable, Debug)]
#[diesel(table_name = session_assignments)]
pub struct NewSessionAssignment {
    pub session_id: i64,
    pub position: i32,
    pub kind: String,
    pub source_id: i64,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct CreateTogetherResponse {
    pub session_id: i64,
    pub assignment_count: i32,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct JoinSessionResponse {
    pub participant_id: i64,
    pub display_name: String,
    /// Palette colors no current participant holds.
    pub available_colors: Vec<String>,
}

/// The authoritative full-state snapshot reactive clients reconcile with.
#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct TogetherSessionView {
    pub id: i64,
    pub host_id: i64,
    pub status: String,
    pub current_position: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct ParticipantView {
    pub id: i64,
    pub student_id: i64,
    pub color: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct AssignmentView {
    pub position: i32,
    pub kind: String,
    pub source_id: i64,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct AdvanceTogetherResponse {
    pub status: String,
    pub current_position: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_contains_every_item_exactly_once() {
        let sentences = [10, 11, 12];
        let flashcards = [20, 21];
        let plan = build_assignment_plan(&sentences, &flashcards, &mut rand::rng());

        assert_eq!(plan.len(), 5);
        for id in sentences {
            assert_eq!(
                plan.iter()
                    .filter(|(kind, source)| *kind == AssignmentKind::Sentence && *source == id)
                    .count(),
                1
            );
        }
        for id in flashcards {
            assert_eq!(
                plan.iter()
                    .filter(|(kind, source)| *kind == AssignmentKind::Flashcard && *source == id)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn plan_preserves_kind_counts() {
        let sentences: Vec<i64> = (0..7).collect();
        let flashcards: Vec<i64> = (100..103).collect();
        let plan = build_assignment_plan(&sentences, &flashcards, &mut rand::rng());

        let sentence_count = plan
            .iter()
            .filter(|(kind, _)| *kind == AssignmentKind::Sentence)
            .count();
        let flashcard_count = plan
            .iter()
            .filter(|(kind, _)| *kind == AssignmentKind::Flashcard)
            .count();
        assert_eq!(sentence_count, 7);
        assert_eq!(flashcard_count, 3);
    }

    #[test]
    fn plan_of_nothing_is_empty() {
        let plan = build_assignment_plan(&[], &[], &mut rand::rng());
        assert!(plan.is_empty());
    }

    #[test]
    fn display_names_come_from_the_word_lists() {
        let name = random_display_name(&mut rand::rng());
        let mut parts = name.split(' ');
        let adjective = parts.next().unwrap();
        let animal = parts.next().unwrap();
        assert!(parts.next().is_none());
        assert!(NAME_ADJECTIVES.contains(&adjective));
        assert!(NAME_ANIMALS.contains(&animal));
    }
}
