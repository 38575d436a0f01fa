use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct StudentProgressRow {
    pub chapter_id: i64,
    pub total_exercises: i32,
    pub completed_exercises: i32,
    pub total_attempts: i32,
    pub total_correct: i32,
    pub last_practiced_at: DateTime<Utc>,
}

/// Progress as reported to teachers. Accuracy is derived at read time from
/// the stored counters, never persisted.
#[derive(Deserialize, Serialize, Debug)]
pub struct StudentProgressResponse {
    pub chapter_id: i64,
    pub total_exercises: i32,
    pub completed_exercises: i32,
    pub total_attempts: i32,
    pub total_correct: i32,
    pub accuracy: f64,
    pub last_practiced_at: DateTime<Utc>,
}

impl From<StudentProgressRow> for StudentProgressResponse {
    fn from(row: StudentProgressRow) -> Self {
        let accuracy = if row.total_attempts > 0 {
            f64::from(row.total_correct) / f64::from(row.total_attempts) * 100.0
        } else {
            0.0
        };
        StudentProgressResponse {
            chapter_id: row.chapter_id,
            total_exercises: row.total_exercises,
            completed_exercises: row.completed_exercises,
            total_attempts: row.total_attempts,
            total_correct: row.total_correct,
            accuracy,
            last_practiced_at: row.last_practiced_at,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct AttemptView {
    pub id: i64,
    pub sentence_id: i64,
    pub word_index: i32,
    pub selected_case_id: Option<i64>,
    pub correct_case_id: i64,
    pub is_correct: bool,
    pub time_spent_seconds: i32,
    pub created_at: DateTime<Utc>,
}
