use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct CreateTogetherPayload {
    pub host_id: i64,
    pub chapter_id: i64,
    pub sentence_count: i64,
    pub flashcard_count: i64,
}

#[derive(Deserialize, Debug)]
pub struct JoinSessionPayload {
    pub session_id: i64,
    pub student_id: i64,
    pub color: String,
}

#[derive(Deserialize, Debug)]
pub struct LeaveSessionPayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct StartSessionPayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct AdvanceSessionPayload {
    pub session_id: i64,
    pub student_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct GetSessionParams {
    pub session_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct GetParticipantsParams {
    pub session_id: i64,
}

#[derive(Deserialize, Debug)]
pub struct GetAssignmentsParams {
    pub session_id: i64,
}
