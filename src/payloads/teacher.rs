use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct GetStudentProgressParams {
    pub student_id: i64,
    pub chapter_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
pub struct GetSessionAttemptsParams {
    pub session_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct DeleteExerciseSessionPayload {
    pub session_id: i64,
}
