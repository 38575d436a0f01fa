use super::helper;
use crate::AppState;
use crate::errors::AppError;
use crate::model::teacher::{AttemptView, StudentProgressResponse, StudentProgressRow};
use crate::payloads::teacher::{
    DeleteExerciseSessionPayload, GetSessionAttemptsParams, GetStudentProgressParams,
};
use crate::response::ApiResponse;
use crate::schema::{
    exercise_attempts::dsl as ea_dsl, exercise_sessions::dsl as es_dsl,
    feedback_jobs::dsl as fj_dsl, student_progress::dsl as sp_dsl,
    students::dsl as students_dsl,
};
use anyhow::anyhow;
use axum::extract::Query;
use axum::{Json, extract::State};
use diesel::dsl::exists;
use diesel::prelude::*;
use tracing::{debug, error, info, instrument};

/// Reports a student's per-chapter progress counters with the accuracy
/// percentage derived from them.
///
/// Query Parameters:
/// * `student_id`: The student to report on.
/// * `chapter_id` (optional): Restrict the report to one chapter.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<StudentProgressResponse>`: One entry per practiced chapter
///   (200 OK).
/// * `404 Not Found`: If the student does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_student_progress(
    State(state): State<AppState>,
    Query(params): Query<GetStudentProgressParams>,
) -> Result<ApiResponse<Vec<StudentProgressResponse>>, AppError> {
    debug!("Get student progress params: {:?}", params);
    let student_id = params.student_id;
    let chapter_id = params.chapter_id;

    let student_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(students_dsl::students.find(student_id))).get_result::<bool>(conn)
    })
    .await?;
    if !student_exists {
        error!("Student with ID {} not found.", student_id);
        return Err(AppError::NotFound(format!(
            "Student with ID {} not found.",
            student_id
        )));
    }

    let rows = helper::run_query(&state.pool, move |conn| {
        let mut query = sp_dsl::student_progress
            .filter(sp_dsl::student_id.eq(student_id))
            .into_boxed();
        if let Some(chapter_id) = chapter_id {
            query = query.filter(sp_dsl::chapter_id.eq(chapter_id));
        }
        query
            .order(sp_dsl::chapter_id.asc())
            .select((
                sp_dsl::chapter_id,
                sp_dsl::total_exercises,
                sp_dsl::completed_exercises,
                sp_dsl::total_attempts,
                sp_dsl::total_correct,
                sp_dsl::last_practiced_at,
            ))
            .load::<StudentProgressRow>(conn)
    })
    .await?;

    let progress: Vec<StudentProgressResponse> =
        rows.into_iter().map(StudentProgressResponse::from).collect();
    Ok(ApiResponse::ok(progress))
}

/// Lists every attempt written by a submitted exercise session, in the order
/// they were answered.
///
/// Query Parameters:
/// * `session_id`: The exercise session whose attempts to list.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<AttemptView>` (200 OK).
/// * `404 Not Found`: If the exercise session does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_session_attempts(
    State(state): State<AppState>,
    Query(params): Query<GetSessionAttemptsParams>,
) -> Result<ApiResponse<Vec<AttemptView>>, AppError> {
    debug!("Get session attempts params: {:?}", params);
    let session_id = params.session_id;

    let session_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(es_dsl::exercise_sessions.find(session_id))).get_result::<bool>(conn)
    })
    .await?;
    if !session_exists {
        error!("Exercise session with ID {} not found.", session_id);
        return Err(AppError::NotFound(format!(
            "Exercise session with ID {} not found.",
            session_id
        )));
    }

    let attempts = helper::run_query(&state.pool, move |conn| {
        ea_dsl::exercise_attempts
            .filter(ea_dsl::session_id.eq(session_id))
            .order(ea_dsl::id.asc())
            .select((
                ea_dsl::id,
                ea_dsl::sentence_id,
                ea_dsl::word_index,
                ea_dsl::selected_case_id,
                ea_dsl::correct_case_id,
                ea_dsl::is_correct,
                ea_dsl::time_spent_seconds,
                ea_dsl::created_at,
            ))
            .load::<AttemptView>(conn)
    })
    .await?;

    Ok(ApiResponse::ok(attempts))
}

/// Deletes an exercise session with its attempts and feedback job, and drops
/// any still-active in-memory run for it. Progress counters already earned
/// by the student stay untouched.
///
/// Request Body: `DeleteExerciseSessionPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `bool`: true once the session is gone (200 OK).
/// * `404 Not Found`: If the exercise session does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn delete_exercise_session(
    State(state): State<AppState>,
    Json(payload): Json<DeleteExerciseSessionPayload>,
) -> Result<ApiResponse<bool>, AppError> {
    let session_id = payload.session_id;
    info!("Deleting exercise session {}", session_id);

    let conn = state.pool.get().await?;
    let tx_result: Result<usize, AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx| {
                diesel::delete(fj_dsl::feedback_jobs.filter(fj_dsl::session_id.eq(session_id)))
                    .execute(tx)?;
                diesel::delete(
                    ea_dsl::exercise_attempts.filter(ea_dsl::session_id.eq(session_id)),
                )
                .execute(tx)?;
                let rows_affected =
                    diesel::delete(es_dsl::exercise_sessions.find(session_id)).execute(tx)?;
                Ok(rows_affected)
            })
        })
        .await?;
    let rows_affected = tx_result?;

    match rows_affected {
        0 => {
            error!("Exercise session with ID {} not found.", session_id);
            Err(AppError::NotFound(format!(
                "Exercise session with ID {} not found.",
                session_id
            )))
        }
        1 => {
            state
                .runs
                .lock()
                .map_err(|_| {
                    AppError::InternalServerError(anyhow!("exercise run registry lock poisoned"))
                })?
                .remove(&session_id);
            info!("Deleted exercise session {}", session_id);
            Ok(ApiResponse::ok(true))
        }
        n => {
            error!(
                "Deleting one exercise session affected {} rows (session {})",
                n, session_id
            );
            Err(AppError::InternalServerError(anyhow!(
                "Unexpected number of rows deleted: {}",
                n
            )))
        }
    }
}
