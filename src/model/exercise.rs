use crate::engine::{ExerciseKind, Phase};
use crate::model::content::{CaseView, SentenceView};
use crate::schema::{exercise_attempts, exercise_sessions, feedback_jobs, student_progress};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

pub const EXERCISE_STATUS_IN_PROGRESS: &str = "in_progress";
pub const EXERCISE_STATUS_COMPLETED: &str = "completed";
pub const EXERCISE_STATUS_ABANDONED: &str = "abandoned";

pub const FEEDBACK_STATUS_PENDING: &str = "pending";
pub const FEEDBACK_STATUS_DONE: &str = "done";
pub const FEEDBACK_STATUS_FAILED: &str = "failed";

#[derive(Insertable, Debug)]
#[diesel(table_name = exercise_sessions)]
pub struct NewExerciseSession {
    pub student_id: i64,
    pub chapter_id: i64,
    pub kind: String,
    pub difficulty: String,
    pub total_questions: i32,
    pub status: String,
    pub exit_code: Option<String>,
    // created_at has a DB default (CURRENT_TIMESTAMP)
    // completed_at is nullable (defaults to NULL)
}

#[derive(Insertable, Debug)]
#[diesel(table_name = exercise_attempts)]
pub struct NewExerciseAttempt {
    pub session_id: i64,
    pub sentence_id: i64,
    pub word_index: i32,
    pub selected_case_id: Option<i64>,
    pub correct_case_id: i64,
    pub is_correct: bool,
    pub time_spent_seconds: i32,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = feedback_jobs)]
pub struct NewFeedbackJob {
    pub session_id: i64,
    pub status: String,
    pub attempts: i32,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = student_progress)]
pub struct NewStudentProgress {
    pub student_id: i64,
    pub chapter_id: i64,
    pub total_exercises: i32,
    pub completed_exercises: i32,
    pub total_attempts: i32,
    pub total_correct: i32,
    pub last_practiced_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct CreateExerciseResponse {
    pub session_id: i64,
    pub kind: ExerciseKind,
    pub phase: Phase,
    pub sentences: Vec<SentenceView>,
    pub cases: Vec<CaseView>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ExercisePhaseResponse {
    pub phase: Phase,
    pub current_index: usize,
    pub sentence_count: usize,
    pub focus_lost: bool,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct SubmissionSummary {
    pub attempts_written: i32,
    pub correct_count: i32,
    pub time_spent_seconds_per_attempt: i32,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct AdvanceResponse {
    pub completed: bool,
    /// Index of the sentence now current, absent once the run is completed.
    pub current_index: Option<usize>,
    pub summary: Option<SubmissionSummary>,
}

#[derive(Deserialize, Serialize, Debug, Queryable)]
pub struct FeedbackStatusResponse {
    pub status: String,
    pub summary: Option<String>,
}
