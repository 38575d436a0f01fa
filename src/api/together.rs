use super::helper;
use crate::AppState;
use crate::errors::AppError;
use crate::events::SessionEventKind;
use crate::model::together::{
    AdvanceTogetherResponse, AssignmentView, COLOR_PALETTE, CreateTogetherResponse,
    JoinSessionResponse, NewSessionAssignment, NewSessionParticipant, NewTogetherSession,
    ParticipantView, SESSION_STATUS_COMPLETED, SESSION_STATUS_IN_PROGRESS, SESSION_STATUS_LOBBY,
    TogetherSessionView, build_assignment_plan, random_display_name,
};
use crate::payloads::together::{
    AdvanceSessionPayload, CreateTogetherPayload, GetAssignmentsParams, GetParticipantsParams,
    GetSessionParams, JoinSessionPayload, LeaveSessionPayload, StartSessionPayload,
};
use crate::response::ApiResponse;
use crate::schema::{
    chapters::dsl as chapters_dsl, flashcards::dsl as fc_dsl, sentences::dsl as sen_dsl,
    session_assignments::dsl as sa_dsl, session_participants::dsl as part_dsl,
    students::dsl as students_dsl, together_sessions::dsl as ts_dsl,
};
use axum::extract::Query;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Json, extract::State};
use chrono::Utc;
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use futures::Stream;
use rand::seq::SliceRandom;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::log::warn;
use tracing::{debug, error, info, instrument};

/// The minimum roster size a host can start a session with.
const MIN_PARTICIPANTS: i64 = 2;

/// Creates a Together session: samples the requested number of sentences and
/// flashcards from the chapter, freezes them into a shuffled assignment plan
/// and opens the lobby.
///
/// Request Body: `CreateTogetherPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `CreateTogetherResponse`: Session id and plan length (200 OK).
/// * `404 Not Found`: If the host or chapter does not exist.
/// * `422 Unprocessable Entity`: On negative counts or when the chapter
///   yields no content at all (an empty plan is never persisted).
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateTogetherPayload>,
) -> Result<ApiResponse<CreateTogetherResponse>, AppError> {
    info!(
        "Creating together session hosted by student_id: {} in chapter_id: {}",
        payload.host_id, payload.chapter_id
    );
    debug!("Create together payload: {:?}", payload);

    if payload.sentence_count < 0 || payload.flashcard_count < 0 {
        return Err(AppError::UnprocessableEntity(
            "sentence_count and flashcard_count must not be negative".to_string(),
        ));
    }

    let host_id = payload.host_id;
    let chapter_id = payload.chapter_id;

    let host_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(students_dsl::students.find(host_id))).get_result::<bool>(conn)
    })
    .await?;
    if !host_exists {
        error!("Student with ID {} not found.", host_id);
        return Err(AppError::NotFound(format!(
            "Student with ID {} not found.",
            host_id
        )));
    }

    let chapter_exists = helper::run_query(&state.pool, move |conn| {
        diesel::select(exists(chapters_dsl::chapters.find(chapter_id))).get_result::<bool>(conn)
    })
    .await?;
    if !chapter_exists {
        error!("Chapter with ID {} not found.", chapter_id);
        return Err(AppError::NotFound(format!(
            "Chapter with ID {} not found.",
            chapter_id
        )));
    }

    let sentence_count = payload.sentence_count;
    let flashcard_count = payload.flashcard_count;

    let conn = state.pool.get().await?;
    let tx_result: Result<(i64, i32), AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx| {
                let mut sentence_ids = sen_dsl::sentences
                    .filter(sen_dsl::chapter_id.eq(chapter_id))
                    .select(sen_dsl::id)
                    .load::<i64>(tx)?;
                let mut flashcard_ids = fc_dsl::flashcards
                    .filter(fc_dsl::chapter_id.eq(chapter_id))
                    .select(fc_dsl::id)
                    .load::<i64>(tx)?;

                let mut rng = rand::rng();
                sentence_ids.shuffle(&mut rng);
                sentence_ids.truncate(sentence_count as usize);
                flashcard_ids.shuffle(&mut rng);
                flashcard_ids.truncate(flashcard_count as usize);

                let plan = build_assignment_plan(&sentence_ids, &flashcard_ids, &mut rng);
                if plan.is_empty() {
                    warn!(
                        "Chapter {} yielded no content for a together session",
                        chapter_id
                    );
                    return Err(AppError::UnprocessableEntity(format!(
                        "Chapter {} has no content for a together session",
                        chapter_id
                    )));
                }

                let new_session = NewTogetherSession {
                    host_id,
                    status: SESSION_STATUS_LOBBY.to_string(),
                    current_position: 1,
                };
                let session_id = diesel::insert_into(ts_dsl::together_sessions)
                    .values(&new_session)
                    .returning(ts_dsl::id)
                    .get_result::<i64>(tx)?;

                // positions are the 1-based play order
                let assignments: Vec<NewSessionAssignment> = plan
                    .iter()
                    .enumerate()
                    .map(|(index, (kind, source_id))| NewSessionAssignment {
                        session_id,
                        position: index as i32 + 1,
                        kind: kind.as_str().to_string(),
                        source_id: *source_id,
                    })
                    .collect();
                diesel::insert_into(sa_dsl::session_assignments)
                    .values(&assignments)
                    .execute(tx)?;

                Ok((session_id, assignments.len() as i32))
            })
        })
        .await?;
    let (session_id, assignment_count) = tx_result?;

    info!(
        "Created together session {} with {} assignments",
        session_id, assignment_count
    );
    Ok(ApiResponse::ok(CreateTogetherResponse {
        session_id,
        assignment_count,
    }))
}

/// Joins a lobby under a chosen identity color and a generated display name.
/// Color uniqueness is enforced by the database, so two participants racing
/// for the same color resolve deterministically: one wins, one gets 409.
///
/// Request Body: `JoinSessionPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `JoinSessionResponse`: Participant id, display name and the colors still
///   free (200 OK).
/// * `404 Not Found`: If the session or student does not exist.
/// * `409 Conflict`: If the session already started, the color is taken, or
///   the student already joined.
/// * `422 Unprocessable Entity`: If the color is not in the palette.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn join_session(
    State(state): State<AppState>,
    Json(payload): Json<JoinSessionPayload>,
) -> Result<ApiResponse<JoinSessionResponse>, AppError> {
    let session_id = payload.session_id;
    let student_id = payload.student_id;
    info!(
        "Student {} joining together session {} as '{}'",
        student_id, session_id, payload.color
    );

    if !COLOR_PALETTE.contains(&payload.color.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Color '{}' is not in the palette {:?}",
            payload.color, COLOR_PALETTE
        )));
    }

    let status = load_session_status(&state, session_id).await?;
    if status != SESSION_STATUS_LOBBY {
        return Err(AppError::Conflict(format!(
            "Together session {} is no longer accepting participants",
            session_id
        )));
    }

    let display_name = random_display_name(&mut rand::rng());
    let new_participant = NewSessionParticipant {
        session_id,
        student_id,
        color: payload.color.clone(),
        display_name: display_name.clone(),
    };

    let conn = state.pool.get().await?;
    let insert_result: Result<i64, DieselError> = conn
        .interact(move |conn_sync| {
            diesel::insert_into(part_dsl::session_participants)
                .values(&new_participant)
                .returning(part_dsl::id)
                .get_result::<i64>(conn_sync)
        })
        .await?;

    let participant_id = match insert_result {
        Ok(id) => id,
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
            let constraint = info.constraint_name().unwrap_or_default();
            warn!(
                "Unique violation '{}' joining session {}",
                constraint, session_id
            );
            if constraint.contains("color") {
                return Err(AppError::Conflict(format!(
                    "Color '{}' is already taken in session {}",
                    payload.color, session_id
                )));
            }
            return Err(AppError::Conflict(format!(
                "Student {} already joined session {}",
                student_id, session_id
            )));
        }
        Err(DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)) => {
            return Err(AppError::NotFound(format!(
                "Student with ID {} not found.",
                student_id
            )));
        }
        Err(other) => return Err(AppError::from(other)),
    };

    let available_colors = load_available_colors(&state, session_id).await?;
    state.events.publish(session_id, SessionEventKind::RosterChanged);

    info!(
        "Student {} joined session {} as participant {} ('{}')",
        student_id, session_id, participant_id, display_name
    );
    Ok(ApiResponse::ok(JoinSessionResponse {
        participant_id,
        display_name,
        available_colors,
    }))
}

/// Removes a participant, freeing their color. Allowed at any time; leaving
/// does not affect the session's progression for the others.
///
/// Request Body: `LeaveSessionPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `bool`: true once the participant is removed (200 OK).
/// * `404 Not Found`: If the session does not exist or the student is not a
///   participant of it.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn leave_session(
    State(state): State<AppState>,
    Json(payload): Json<LeaveSessionPayload>,
) -> Result<ApiResponse<bool>, AppError> {
    let session_id = payload.session_id;
    let student_id = payload.student_id;
    info!(
        "Student {} leaving together session {}",
        student_id, session_id
    );

    load_session_status(&state, session_id).await?;

    let rows_affected = helper::run_query(&state.pool, move |conn| {
        diesel::delete(
            part_dsl::session_participants
                .filter(part_dsl::session_id.eq(session_id))
                .filter(part_dsl::student_id.eq(student_id)),
        )
        .execute(conn)
    })
    .await?;

    match rows_affected {
        0 => Err(AppError::NotFound(format!(
            "Student {} is not a participant of session {}",
            student_id, session_id
        ))),
        1 => {
            state.events.publish(session_id, SessionEventKind::RosterChanged);
            Ok(ApiResponse::ok(true))
        }
        n => {
            error!(
                "Removing one participant affected {} rows (session {}, student {})",
                n, session_id, student_id
            );
            Err(AppError::InternalServerError(anyhow::anyhow!(
                "Unexpected number of rows deleted: {}",
                n
            )))
        }
    }
}

/// Starts a session. Only the host may start, only from the lobby, and only
/// with at least two participants in the roster.
///
/// Request Body: `StartSessionPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `AdvanceTogetherResponse`: The running state at position 1 (200 OK).
/// * `403 Forbidden`: If the caller is not the host.
/// * `404 Not Found`: If the session does not exist.
/// * `409 Conflict`: If the session is not in the lobby.
/// * `422 Unprocessable Entity`: If fewer than two participants joined.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionPayload>,
) -> Result<ApiResponse<AdvanceTogetherResponse>, AppError> {
    let session_id = payload.session_id;
    info!("Starting together session {}", session_id);

    let session = load_session(&state, session_id).await?;
    ensure_host(&session, payload.student_id)?;
    if session.status != SESSION_STATUS_LOBBY {
        return Err(AppError::Conflict(format!(
            "Together session {} is not in the lobby",
            session_id
        )));
    }

    let participant_count = helper::run_query(&state.pool, move |conn| {
        part_dsl::session_participants
            .filter(part_dsl::session_id.eq(session_id))
            .count()
            .get_result::<i64>(conn)
    })
    .await?;
    if participant_count < MIN_PARTICIPANTS {
        return Err(AppError::UnprocessableEntity(format!(
            "Together session {} needs at least {} participants to start, has {}",
            session_id, MIN_PARTICIPANTS, participant_count
        )));
    }

    let rows_affected = helper::run_query(&state.pool, move |conn| {
        diesel::update(
            ts_dsl::together_sessions
                .find(session_id)
                .filter(ts_dsl::status.eq(SESSION_STATUS_LOBBY)),
        )
        .set(ts_dsl::status.eq(SESSION_STATUS_IN_PROGRESS))
        .execute(conn)
    })
    .await?;
    if rows_affected != 1 {
        // a concurrent start won the race between our check and the update
        return Err(AppError::Conflict(format!(
            "Together session {} is not in the lobby",
            session_id
        )));
    }

    state
        .events
        .publish(session_id, SessionEventKind::SessionStarted);

    info!(
        "Together session {} started with {} participants",
        session_id, participant_count
    );
    Ok(ApiResponse::ok(AdvanceTogetherResponse {
        status: SESSION_STATUS_IN_PROGRESS.to_string(),
        current_position: 1,
    }))
}

/// Advances the shared position past the current assignment, or completes
/// the session when the plan is exhausted. Host only.
///
/// Request Body: `AdvanceSessionPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `AdvanceTogetherResponse`: The new status and position (200 OK).
/// * `403 Forbidden`: If the caller is not the host.
/// * `404 Not Found`: If the session does not exist.
/// * `409 Conflict`: If the session is not in progress.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn advance_session(
    State(state): State<AppState>,
    Json(payload): Json<AdvanceSessionPayload>,
) -> Result<ApiResponse<AdvanceTogetherResponse>, AppError> {
    let session_id = payload.session_id;
    info!("Advancing together session {}", session_id);

    let session = load_session(&state, session_id).await?;
    ensure_host(&session, payload.student_id)?;
    if session.status != SESSION_STATUS_IN_PROGRESS {
        return Err(AppError::Conflict(format!(
            "Together session {} is not in progress",
            session_id
        )));
    }

    let assignment_count = helper::run_query(&state.pool, move |conn| {
        sa_dsl::session_assignments
            .filter(sa_dsl::session_id.eq(session_id))
            .count()
            .get_result::<i64>(conn)
    })
    .await?;

    // positions are 1-based; stepping past the last assignment completes
    if i64::from(session.current_position) + 1 > assignment_count {
        let now_ts = Utc::now();
        let rows_affected = helper::run_query(&state.pool, move |conn| {
            diesel::update(
                ts_dsl::together_sessions
                    .find(session_id)
                    .filter(ts_dsl::status.eq(SESSION_STATUS_IN_PROGRESS)),
            )
            .set((
                ts_dsl::status.eq(SESSION_STATUS_COMPLETED),
                ts_dsl::completed_at.eq(now_ts),
            ))
            .execute(conn)
        })
        .await?;
        if rows_affected != 1 {
            return Err(AppError::Conflict(format!(
                "Together session {} is not in progress",
                session_id
            )));
        }

        state
            .events
            .publish(session_id, SessionEventKind::SessionUpdated);
        state.events.close(session_id);

        info!("Together session {} completed", session_id);
        return Ok(ApiResponse::ok(AdvanceTogetherResponse {
            status: SESSION_STATUS_COMPLETED.to_string(),
            current_position: session.current_position,
        }));
    }

    // guard on the position we read, so a duplicated advance (host
    // double-click, client retry) increments exactly once
    let expected_position = session.current_position;
    let new_position = helper::run_query(&state.pool, move |conn| {
        diesel::update(
            ts_dsl::together_sessions
                .find(session_id)
                .filter(ts_dsl::status.eq(SESSION_STATUS_IN_PROGRESS))
                .filter(ts_dsl::current_position.eq(expected_position)),
        )
        .set(ts_dsl::current_position.eq(ts_dsl::current_position + 1))
        .returning(ts_dsl::current_position)
        .get_result::<i32>(conn)
    })
    .await
    .map_err(|err| match err {
        AppError::NotFound(_) => AppError::Conflict(format!(
            "Together session {} changed concurrently; advance not applied",
            session_id
        )),
        other => other,
    })?;

    state
        .events
        .publish(session_id, SessionEventKind::SessionUpdated);

    info!(
        "Together session {} advanced to position {}",
        session_id, new_position
    );
    Ok(ApiResponse::ok(AdvanceTogetherResponse {
        status: SESSION_STATUS_IN_PROGRESS.to_string(),
        current_position: new_position,
    }))
}

/// Fetches the authoritative session snapshot. Clients reconcile with this
/// after every advisory event.
///
/// Query Parameters:
/// * `session_id`: The session to fetch.
///
/// Returns (wrapped in `ApiResponse`)
/// * `TogetherSessionView` (200 OK).
/// * `404 Not Found`: If the session does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_session(
    State(state): State<AppState>,
    Query(params): Query<GetSessionParams>,
) -> Result<ApiResponse<TogetherSessionView>, AppError> {
    debug!("Get together session params: {:?}", params);
    let session = load_session(&state, params.session_id).await?;
    Ok(ApiResponse::ok(session))
}

/// Lists the roster of a session in join order.
///
/// Query Parameters:
/// * `session_id`: The session whose participants to list.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<ParticipantView>` (200 OK).
/// * `404 Not Found`: If the session does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_participants(
    State(state): State<AppState>,
    Query(params): Query<GetParticipantsParams>,
) -> Result<ApiResponse<Vec<ParticipantView>>, AppError> {
    debug!("Get participants params: {:?}", params);
    let session_id = params.session_id;

    // 404 for a session that never existed rather than an empty roster
    load_session_status(&state, session_id).await?;

    let participants = helper::run_query(&state.pool, move |conn| {
        part_dsl::session_participants
            .filter(part_dsl::session_id.eq(session_id))
            .order(part_dsl::joined_at.asc())
            .select((
                part_dsl::id,
                part_dsl::student_id,
                part_dsl::color,
                part_dsl::display_name,
                part_dsl::joined_at,
            ))
            .load::<ParticipantView>(conn)
    })
    .await?;

    Ok(ApiResponse::ok(participants))
}

/// Lists the frozen assignment plan in play order.
///
/// Query Parameters:
/// * `session_id`: The session whose plan to list.
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<AssignmentView>` (200 OK).
/// * `404 Not Found`: If the session does not exist.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_assignments(
    State(state): State<AppState>,
    Query(params): Query<GetAssignmentsParams>,
) -> Result<ApiResponse<Vec<AssignmentView>>, AppError> {
    debug!("Get assignments params: {:?}", params);
    let session_id = params.session_id;

    load_session_status(&state, session_id).await?;

    let assignments = helper::run_query(&state.pool, move |conn| {
        sa_dsl::session_assignments
            .filter(sa_dsl::session_id.eq(session_id))
            .order(sa_dsl::position.asc())
            .select((sa_dsl::position, sa_dsl::kind, sa_dsl::source_id))
            .load::<AssignmentView>(conn)
    })
    .await?;

    Ok(ApiResponse::ok(assignments))
}

/// Streams advisory events for a session as server-sent events. Each event
/// is a nudge naming the session and the kind of change; subscribers re-read
/// the session endpoints to reconcile. A slow consumer that overflows the
/// channel simply keeps listening, its next reconcile catches it up.
///
/// Query Parameters:
/// * `session_id`: The session to listen on.
///
/// Returns
/// * An SSE stream of `SessionEvent` payloads, one event type per
///   `SessionEventKind`.
/// * `404 Not Found`: If the session does not exist.
#[instrument(skip(state, params))]
pub async fn session_events(
    State(state): State<AppState>,
    Query(params): Query<GetSessionParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session_id = params.session_id;
    info!("Opening event stream for together session {}", session_id);

    load_session_status(&state, session_id).await?;

    let rx = state.events.subscribe(session_id);
    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse_event = match Event::default()
                        .event(event.kind.as_str())
                        .json_data(&event)
                    {
                        Ok(sse_event) => sse_event,
                        Err(err) => {
                            error!("Failed to serialize session event: {:?}", err);
                            continue;
                        }
                    };
                    return Some((Ok(sse_event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Event stream for session {} lagged, skipped {} events",
                        session_id, skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn load_session(state: &AppState, session_id: i64) -> Result<TogetherSessionView, AppError> {
    helper::run_query(&state.pool, move |conn| {
        ts_dsl::together_sessions
            .find(session_id)
            .select((
                ts_dsl::id,
                ts_dsl::host_id,
                ts_dsl::status,
                ts_dsl::current_position,
                ts_dsl::created_at,
                ts_dsl::completed_at,
            ))
            .first::<TogetherSessionView>(conn)
    })
    .await
    .map_err(|err| match err {
        AppError::NotFound(_) => AppError::NotFound(format!(
            "Together session with ID {} not found",
            session_id
        )),
        other => other,
    })
}

async fn load_session_status(state: &AppState, session_id: i64) -> Result<String, AppError> {
    helper::run_query(&state.pool, move |conn| {
        ts_dsl::together_sessions
            .find(session_id)
            .select(ts_dsl::status)
            .first::<String>(conn)
    })
    .await
    .map_err(|err| match err {
        AppError::NotFound(_) => AppError::NotFound(format!(
            "Together session with ID {} not found",
            session_id
        )),
        other => other,
    })
}

async fn load_available_colors(
    state: &AppState,
    session_id: i64,
) -> Result<Vec<String>, AppError> {
    let taken = helper::run_query(&state.pool, move |conn| {
        part_dsl::session_participants
            .filter(part_dsl::session_id.eq(session_id))
            .select(part_dsl::color)
            .load::<String>(conn)
    })
    .await?;

    Ok(COLOR_PALETTE
        .iter()
        .filter(|color| !taken.iter().any(|t| t == *color))
        .map(|color| color.to_string())
        .collect())
}

fn ensure_host(session: &TogetherSessionView, student_id: i64) -> Result<(), AppError> {
    if session.host_id != student_id {
        warn!(
            "Student {} attempted a host action on session {} hosted by {}",
            student_id, session.id, session.host_id
        );
        return Err(AppError::Forbidden(format!(
            "Only the host may control together session {}",
            session.id
        )));
    }
    Ok(())
}
