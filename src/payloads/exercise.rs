use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreateExercisePayload {
    pub student_id: i64,
    pub chapter_id: i64,
    pub kind: String,
    pub difficulty: String,
    pub question_count: i64,
    /// Teacher-supplied abort code, required for test exercises.
    pub exit_code: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BeginExercisePayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct SelectWordPayload {
    pub session_id: i64,
    pub student_id: i64,
    pub word_index: i32,
}

#[derive(Deserialize, Debug)]
pub struct ChooseCasePayload {
    pub session_id: i64,
    pub student_id: i64,
    pub case_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct CheckAnswerPayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct AdvanceExercisePayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct FocusPayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct ExitExercisePayload {
    pub session_id: i64,
    pub student_id: i64,
    pub exit_code: String,
}

#[derive(Deserialize, Debug)]
pub struct GetFeedbackStatusParams {
    pub session_id: i64,
}
