use super::helper;
use crate::AppState;
use crate::engine::{Advance, ExerciseKind, ExerciseRun, SentenceItem};
use crate::model::content::{CaseView, SentenceView};
use crate::model::exercise::{
    AdvanceResponse, CreateExerciseResponse, EXERCISE_STATUS_ABANDONED,
    EXERCISE_STATUS_COMPLETED, EXERCISE_STATUS_IN_PROGRESS, ExercisePhaseResponse,
    FEEDBACK_STATUS_PENDING, FeedbackStatusResponse, NewExerciseAttempt, NewExerciseSession,
    NewFeedbackJob, NewStudentProgress, SubmissionSummary,
};
use crate::payloads::exercise::{
    AdvanceExercisePayload, BeginExercisePayload, CheckAnswerPayload, ChooseCasePayload,
    CreateExercisePayload, ExitExercisePayload, FocusPayload, GetFeedbackStatusParams,
    SelectWordPayload,
};
use crate::{
    engine::{Annotation, AnswerOutcome, WordReveal},
    errors::AppError,
    response::ApiResponse,
    schema::{
        chapters::dsl as chapters_dsl, exercise_attempts::dsl as ea_dsl,
        exercise_sessions::dsl as es_dsl, feedback_jobs::dsl as fj_dsl,
        grammatical_cases::dsl as gc_dsl, sentences::dsl as sen_dsl,
        student_progress::dsl as sp_dsl, students::dsl as students_dsl,
        word_annotations::dsl as wa_dsl,
    },
};
use anyhow::anyhow;
use axum::extract::Query;
use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use diesel::dsl::exists;
use diesel::prelude::*;
use std::collections::BTreeMap;
use tracing::log::warn;
use tracing::{debug, error, info, instrument};

const DIFFICULTIES: [&str; 3] = ["easy", "medium", "hard"];

/// Runs whose client vanished mid-exercise are evicted once they reach this
/// age; their session rows stay `in_progress` until a teacher deletes them.
const STALE_RUN_MAX_AGE_HOURS: i64 = 24;

/// Creates an exercise session for a student: picks the sentences, loads
/// their annotations and the case reference list, persists the session row
/// and registers the in-memory run the remaining `/student` operations act
/// on.
///
/// Sentence selection honors the requested difficulty first and backfills
/// from the same chapter ignoring difficulty when too few match.
///
/// Request Body: `CreateExercisePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `CreateExerciseResponse`: Session id, sentences and cases (200 OK).
/// * `404 Not Found`: If the student or chapter does not exist.
/// * `422 Unprocessable Entity`: On an unknown kind/difficulty, a missing
///   exit code for a test, a non-positive question count, or a chapter with
///   no sentences at all.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, payload))]
pub async fn create_exercise(
    State(state): State<AppState>,
    Json(payload): Json<CreateExercisePayload>,
) -> Result<ApiResponse<CreateExerciseResponse>, AppError> {
    info!(
        "Creating {} exercise for student_id: {} in chapter_id: {}",
        payload.kind, payload.student_id, payload.chapter_id
    );
    debug!("Create exercise payload: {:?}", payload);

    let kind = ExerciseKind::parse(&payload.kind).ok_or_else(|| {
        AppError::UnprocessableEntity(format!("Unknown exercise kind '{}'", payload.kind))
    })?;
    if !DIFFICULTIES.contains(&payload.difficulty.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Unknown difficulty '{}'. Allowed: {:?}",
            payload.difficulty, DIFFICULTIES
        )));
    }
    if payload.question_count < 1 {
        return Err(AppError::UnprocessableEntity(
            "question_count must be at least 1".to_string(),
        ));
    }
    if kind == ExerciseKind::Test && payload.exit_code.is_none() {
        return Err(AppError::UnprocessableEntity(
            "Test exercises require an exit code".to_string(),
        ));
    }

    let student_id = payload.student_id;
    let chapter_id = payload.chapter_id;

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

    let difficulty = payload.difficulty.clone();
    let question_count = payload.question_count;
    let exit_code = payload.exit_code.clone();
    let kind_str = kind.as_str().to_string();

    type SentenceRow = (i64, String);
    type AnnotationRow = (i64, i32, i64, Option<String>);

    let conn = state.pool.get().await?;
    let tx_result: Result<(i64, Vec<SentenceRow>, Vec<AnnotationRow>, Vec<CaseView>), AppError> =
        conn.interact(move |conn_sync| {
            conn_sync.transaction(|tx| {
                let mut picked: Vec<SentenceRow> = sen_dsl::sentences
                    .filter(sen_dsl::chapter_id.eq(chapter_id))
                    .filter(sen_dsl::difficulty.eq(&difficulty))
                    .order(sen_dsl::id.asc())
                    .limit(question_count)
                    .select((sen_dsl::id, sen_dsl::text))
                    .load::<SentenceRow>(tx)?;

                // difficulty-relaxing backfill from the same chapter
                if (picked.len() as i64) < question_count {
                    let picked_ids: Vec<i64> = picked.iter().map(|(id, _)| *id).collect();
                    let mut extra = sen_dsl::sentences
                        .filter(sen_dsl::chapter_id.eq(chapter_id))
                        .filter(sen_dsl::id.ne_all(picked_ids))
                        .order(sen_dsl::id.asc())
                        .limit(question_count - picked.len() as i64)
                        .select((sen_dsl::id, sen_dsl::text))
                        .load::<SentenceRow>(tx)?;
                    picked.append(&mut extra);
                }

                if picked.is_empty() {
                    warn!(
                        "No sentences available in chapter {} for a new exercise",
                        chapter_id
                    );
                    return Err(AppError::UnprocessableEntity(format!(
                        "Chapter {} has no sentences to practice",
                        chapter_id
                    )));
                }

                let sentence_ids: Vec<i64> = picked.iter().map(|(id, _)| *id).collect();
                let annotations = wa_dsl::word_annotations
                    .filter(wa_dsl::sentence_id.eq_any(sentence_ids))
                    .order((wa_dsl::sentence_id.asc(), wa_dsl::word_index.asc()))
                    .select((
                        wa_dsl::sentence_id,
                        wa_dsl::word_index,
                        wa_dsl::case_id,
                        wa_dsl::explanation,
                    ))
                    .load::<AnnotationRow>(tx)?;

                let cases = gc_dsl::grammatical_cases
                    .order(gc_dsl::name.asc())
                    .select((
                        gc_dsl::id,
                        gc_dsl::name,
                        gc_dsl::abbreviation,
                        gc_dsl::color,
                        gc_dsl::description,
                    ))
                    .load::<CaseView>(tx)?;

                let new_session = NewExerciseSession {
                    student_id,
                    chapter_id,
                    kind: kind_str,
                    difficulty,
                    total_questions: picked.len() as i32,
                    status: EXERCISE_STATUS_IN_PROGRESS.to_string(),
                    exit_code,
                };
                let session_id = diesel::insert_into(es_dsl::exercise_sessions)
                    .values(&new_session)
                    .returning(es_dsl::id)
                    .get_result::<i64>(tx)?;

                Ok((session_id, picked, annotations, cases))
            })
        })
        .await?;
    let (session_id, picked, annotations, cases) = tx_result?;

    let mut annotation_map: BTreeMap<i64, BTreeMap<usize, Annotation>> = BTreeMap::new();
    for (sentence_id, word_index, case_id, explanation) in annotations {
        annotation_map.entry(sentence_id).or_default().insert(
            word_index as usize,
            Annotation {
                case_id,
                explanation,
            },
        );
    }

    let sentences: Vec<SentenceItem> = picked
        .iter()
        .map(|(id, text)| SentenceItem {
            id: *id,
            text: text.clone(),
            annotations: annotation_map.remove(id).unwrap_or_default(),
        })
        .collect();

    let sentence_views: Vec<SentenceView> = sentences
        .iter()
        .map(|s| SentenceView {
            id: s.id,
            text: s.text.clone(),
            annotated_indices: s.annotations.keys().map(|idx| *idx as i32).collect(),
        })
        .collect();

    let run = ExerciseRun::new(
        session_id,
        student_id,
        kind,
        payload.exit_code.clone(),
        sentences,
    );
    let phase = run.phase();
    {
        let mut runs = lock_runs(&state)?;
        sweep_stale_runs(&mut runs, Utc::now());
        runs.insert(session_id, run);
    }

    info!(
        "Created exercise session {} for student {} with {} sentences",
        session_id,
        student_id,
        sentence_views.len()
    );
    Ok(ApiResponse::ok(CreateExerciseResponse {
        session_id,
        kind,
        phase,
        sentences: sentence_views,
        cases,
    }))
}

/// Leaves the focus-lock waiting state of a test exercise. A no-op for runs
/// that never waited.
///
/// Request Body: `BeginExercisePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ExercisePhaseResponse`: The run's phase after starting (200 OK).
/// * `403 Forbidden`: If the caller does not own the run.
/// * `404 Not Found`: If no active run exists for the session.
#[instrument(skip(state, payload))]
pub async fn begin_exercise(
    State(state): State<AppState>,
    Json(payload): Json<BeginExercisePayload>,
) -> Result<ApiResponse<ExercisePhaseResponse>, AppError> {
    info!("Beginning exercise session {}", payload.session_id);

    with_run(&state, payload.session_id, payload.student_id, |run| {
        run.begin();
        Ok(phase_response(run))
    })
    .map(ApiResponse::ok)
}

/// Reports the phase of an active run, e.g. after a reconnect.
///
/// Query Parameters:
/// * `session_id`, `student_id`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ExercisePhaseResponse` (200 OK).
/// * `403 Forbidden` / `404 Not Found`: As for the other run operations.
#[instrument(skip(state, params))]
pub async fn get_exercise_state(
    State(state): State<AppState>,
    Query(params): Query<BeginExercisePayload>,
) -> Result<ApiResponse<ExercisePhaseResponse>, AppError> {
    debug!("Get exercise state params: {:?}", params);

    with_run(&state, params.session_id, params.student_id, |run| {
        Ok(phase_response(run))
    })
    .map(ApiResponse::ok)
}

/// Marks a word of the current sentence as the pending selection.
///
/// Request Body: `SelectWordPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `bool`: true if the word is annotated and is now selected, false if the
///   index carries no annotation and nothing changed (200 OK).
/// * `403 Forbidden` / `404 Not Found`: As for the other run operations.
/// * `409 Conflict`: If the fullscreen lock is engaged.
/// * `422 Unprocessable Entity`: If the run is not in the answering phase.
#[instrument(skip(state, payload))]
pub async fn select_word(
    State(state): State<AppState>,
    Json(payload): Json<SelectWordPayload>,
) -> Result<ApiResponse<bool>, AppError> {
    debug!("Select word payload: {:?}", payload);
    if payload.word_index < 0 {
        return Err(AppError::UnprocessableEntity(
            "word_index must not be negative".to_string(),
        ));
    }

    with_run(&state, payload.session_id, payload.student_id, |run| {
        Ok(run.select_word(payload.word_index as usize)?)
    })
    .map(ApiResponse::ok)
}

/// Records the case judgment for the pending word selection. Re-answering a
/// word replaces the previous answer.
///
/// Request Body: `ChooseCasePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `AnswerOutcome`: The answered word plus answered/required counts for the
///   current sentence (200 OK).
/// * `422 Unprocessable Entity`: If no word is selected.
/// * `403` / `404` / `409`: As for the other run operations.
#[instrument(skip(state, payload))]
pub async fn choose_case(
    State(state): State<AppState>,
    Json(payload): Json<ChooseCasePayload>,
) -> Result<ApiResponse<AnswerOutcome>, AppError> {
    debug!("Choose case payload: {:?}", payload);

    with_run(&state, payload.session_id, payload.student_id, |run| {
        Ok(run.choose_case(payload.case_id)?)
    })
    .map(ApiResponse::ok)
}

/// Checks the current sentence, revealing per-word correctness. Rejected
/// while annotated words are unanswered; vacuously allowed for sentences
/// without annotations.
///
/// Request Body: `CheckAnswerPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `Vec<WordReveal>`: One entry per annotated word (200 OK).
/// * `422 Unprocessable Entity`: If the sentence is incomplete or already
///   checked.
/// * `403` / `404` / `409`: As for the other run operations.
#[instrument(skip(state, payload))]
pub async fn check_answer(
    State(state): State<AppState>,
    Json(payload): Json<CheckAnswerPayload>,
) -> Result<ApiResponse<Vec<WordReveal>>, AppError> {
    debug!("Check answer payload: {:?}", payload);

    with_run(&state, payload.session_id, payload.student_id, |run| {
        Ok(run.check_answer()?)
    })
    .map(ApiResponse::ok)
}

/// Advances past the checked sentence. On the last sentence this submits the
/// whole run: every answer becomes an attempt row, the session row is marked
/// completed exactly once, the student's chapter progress is incremented
/// atomically and a feedback job is enqueued, all in one transaction. If the
/// write fails the run stays on its feedback screen and the call can simply
/// be retried.
///
/// Request Body: `AdvanceExercisePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `AdvanceResponse`: The next sentence index, or the submission summary
///   once completed (200 OK).
/// * `409 Conflict`: If the session was already completed.
/// * `422 Unprocessable Entity`: If the current sentence is unchecked.
/// * `403` / `404`: As for the other run operations.
/// * `500 Internal Server Error`: If the submission transaction fails.
#[instrument(skip(state, payload))]
pub async fn advance_exercise(
    State(state): State<AppState>,
    Json(payload): Json<AdvanceExercisePayload>,
) -> Result<ApiResponse<AdvanceResponse>, AppError> {
    let session_id = payload.session_id;
    info!("Advancing exercise session {}", session_id);

    let (created_at, chapter_id): (DateTime<Utc>, i64) =
        helper::run_query(&state.pool, move |conn| {
            es_dsl::exercise_sessions
                .find(session_id)
                .select((es_dsl::created_at, es_dsl::chapter_id))
                .first::<(DateTime<Utc>, i64)>(conn)
        })
        .await
        .map_err(|err| match err {
            AppError::NotFound(_) => AppError::NotFound(format!(
                "Exercise session with ID {} not found",
                session_id
            )),
            other => other,
        })?;
    let elapsed_seconds = (Utc::now() - created_at).num_seconds().max(0);

    let advance = with_run(&state, session_id, payload.student_id, |run| {
        Ok(run.advance(elapsed_seconds)?)
    })?;

    let draft = match advance {
        Advance::Next(index) => {
            info!(
                "Exercise session {} moved on to sentence index {}",
                session_id, index
            );
            return Ok(ApiResponse::ok(AdvanceResponse {
                completed: false,
                current_index: Some(index),
                summary: None,
            }));
        }
        Advance::Submit(draft) => draft,
    };

    let student_id = payload.student_id;
    let attempt_count = draft.attempt_count;
    let correct_count = draft.correct_count;
    let per_attempt_seconds = draft
        .attempts
        .first()
        .map(|a| a.time_spent_seconds)
        .unwrap_or(0);
    let new_attempts: Vec<NewExerciseAttempt> = draft
        .attempts
        .iter()
        .map(|a| NewExerciseAttempt {
            session_id,
            sentence_id: a.sentence_id,
            word_index: a.word_index,
            selected_case_id: a.selected_case_id,
            correct_case_id: a.correct_case_id,
            is_correct: a.is_correct,
            time_spent_seconds: a.time_spent_seconds,
        })
        .collect();

    let now_ts = Utc::now();
    let conn = state.pool.get().await?;
    let tx_result: Result<(), AppError> = conn
        .interact(move |conn_sync| {
            conn_sync.transaction(|tx| {
                // exactly-once guard: only an in-progress session completes
                let rows_affected = diesel::update(
                    es_dsl::exercise_sessions
                        .find(session_id)
                        .filter(es_dsl::status.eq(EXERCISE_STATUS_IN_PROGRESS)),
                )
                .set((
                    es_dsl::status.eq(EXERCISE_STATUS_COMPLETED),
                    es_dsl::completed_at.eq(now_ts),
                ))
                .execute(tx)?;
                if rows_affected != 1 {
                    warn!(
                        "Exercise session {} is no longer in progress; refusing to submit twice",
                        session_id
                    );
                    return Err(AppError::Conflict(format!(
                        "Exercise session {} is not in progress",
                        session_id
                    )));
                }

                diesel::insert_into(ea_dsl::exercise_attempts)
                    .values(&new_attempts)
                    .execute(tx)?;

                // atomic increments, no read-modify-write of the aggregate
                let new_progress = NewStudentProgress {
                    student_id,
                    chapter_id,
                    total_exercises: 1,
                    completed_exercises: 1,
                    total_attempts: attempt_count,
                    total_correct: correct_count,
                    last_practiced_at: now_ts,
                };
                diesel::insert_into(sp_dsl::student_progress)
                    .values(&new_progress)
                    .on_conflict((sp_dsl::student_id, sp_dsl::chapter_id))
                    .do_update()
                    .set((
                        sp_dsl::total_exercises.eq(sp_dsl::total_exercises + 1),
                        sp_dsl::completed_exercises.eq(sp_dsl::completed_exercises + 1),
                        sp_dsl::total_attempts.eq(sp_dsl::total_attempts + attempt_count),
                        sp_dsl::total_correct.eq(sp_dsl::total_correct + correct_count),
                        sp_dsl::last_practiced_at.eq(now_ts),
                    ))
                    .execute(tx)?;

                // outbox entry for the generative feedback side effect
                let new_job = NewFeedbackJob {
                    session_id,
                    status: FEEDBACK_STATUS_PENDING.to_string(),
                    attempts: 0,
                };
                diesel::insert_into(fj_dsl::feedback_jobs)
                    .values(&new_job)
                    .execute(tx)?;

                Ok(())
            })
        })
        .await?;
    tx_result?;

    {
        let mut runs = lock_runs(&state)?;
        if let Some(run) = runs.get_mut(&session_id) {
            run.mark_completed();
        }
        runs.remove(&session_id);
    }

    info!(
        "Exercise session {} submitted: {} attempts, {} correct",
        session_id, attempt_count, correct_count
    );
    Ok(ApiResponse::ok(AdvanceResponse {
        completed: true,
        current_index: None,
        summary: Some(SubmissionSummary {
            attempts_written: attempt_count,
            correct_count,
            time_spent_seconds_per_attempt: per_attempt_seconds,
        }),
    }))
}

/// Flags that a test run left fullscreen. All answering operations are
/// rejected until `resume_focus`. A no-op outside test mode.
///
/// Request Body: `FocusPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ExercisePhaseResponse` (200 OK).
/// * `403 Forbidden` / `404 Not Found`: As for the other run operations.
#[instrument(skip(state, payload))]
pub async fn report_focus_lost(
    State(state): State<AppState>,
    Json(payload): Json<FocusPayload>,
) -> Result<ApiResponse<ExercisePhaseResponse>, AppError> {
    info!("Focus lost reported for session {}", payload.session_id);

    with_run(&state, payload.session_id, payload.student_id, |run| {
        run.report_focus_lost();
        Ok(phase_response(run))
    })
    .map(ApiResponse::ok)
}

/// Clears the fullscreen lock after an explicit resume.
///
/// Request Body: `FocusPayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `ExercisePhaseResponse` (200 OK).
/// * `403 Forbidden` / `404 Not Found`: As for the other run operations.
#[instrument(skip(state, payload))]
pub async fn resume_focus(
    State(state): State<AppState>,
    Json(payload): Json<FocusPayload>,
) -> Result<ApiResponse<ExercisePhaseResponse>, AppError> {
    info!("Focus resumed for session {}", payload.session_id);

    with_run(&state, payload.session_id, payload.student_id, |run| {
        run.resume_focus();
        Ok(phase_response(run))
    })
    .map(ApiResponse::ok)
}

/// Aborts a test run with the teacher-supplied exit code. On a match the
/// session is marked abandoned and every collected answer is discarded; no
/// attempts are written. A mismatch changes nothing. The run is only
/// abandoned in memory after the status update is durable, so a failed
/// update leaves the run playable and the exit can simply be retried.
///
/// Request Body: `ExitExercisePayload`
///
/// Returns (wrapped in `ApiResponse`)
/// * `bool`: true once the session is abandoned (200 OK).
/// * `403 Forbidden`: If the exit code does not match or the caller does not
///   own the run.
/// * `404 Not Found`: If no active run exists for the session.
/// * `422 Unprocessable Entity`: If the run is not a test.
/// * `500 Internal Server Error`: If the status update fails.
#[instrument(skip(state, payload))]
pub async fn exit_exercise(
    State(state): State<AppState>,
    Json(payload): Json<ExitExercisePayload>,
) -> Result<ApiResponse<bool>, AppError> {
    let session_id = payload.session_id;
    info!("Exit requested for exercise session {}", session_id);

    with_run(&state, session_id, payload.student_id, |run| {
        Ok(run.verify_exit_code(&payload.exit_code)?)
    })?;

    // nothing has been mutated yet; an error here leaves the run playable
    let rows_affected = helper::run_query(&state.pool, move |conn| {
        diesel::update(
            es_dsl::exercise_sessions
                .find(session_id)
                .filter(es_dsl::status.eq(EXERCISE_STATUS_IN_PROGRESS)),
        )
        .set(es_dsl::status.eq(EXERCISE_STATUS_ABANDONED))
        .execute(conn)
    })
    .await?;
    if rows_affected != 1 {
        warn!(
            "Exercise session {} row was not in progress at exit",
            session_id
        );
    }

    {
        let mut runs = lock_runs(&state)?;
        if let Some(run) = runs.get_mut(&session_id) {
            run.mark_abandoned();
        }
        runs.remove(&session_id);
    }

    info!("Exercise session {} abandoned without attempts", session_id);
    Ok(ApiResponse::ok(true))
}

/// Reports the state of the generative-feedback job for a submitted session.
/// Clients poll this until the status leaves `pending`.
///
/// Query Parameters:
/// * `session_id`: The submitted exercise session.
///
/// Returns (wrapped in `ApiResponse`)
/// * `FeedbackStatusResponse`: Job status and the summary once available
///   (200 OK).
/// * `404 Not Found`: If no feedback job exists for the session.
/// * `500 Internal Server Error`: If a database error occurs.
#[instrument(skip(state, params))]
pub async fn get_feedback_status(
    State(state): State<AppState>,
    Query(params): Query<GetFeedbackStatusParams>,
) -> Result<ApiResponse<FeedbackStatusResponse>, AppError> {
    let session_id = params.session_id;
    debug!("Get feedback status for session {}", session_id);

    let status = helper::run_query(&state.pool, move |conn| {
        fj_dsl::feedback_jobs
            .filter(fj_dsl::session_id.eq(session_id))
            .select((fj_dsl::status, fj_dsl::summary))
            .first::<FeedbackStatusResponse>(conn)
    })
    .await
    .map_err(|err| match err {
        AppError::NotFound(_) => AppError::NotFound(format!(
            "No feedback job found for exercise session {}",
            session_id
        )),
        other => other,
    })?;

    Ok(ApiResponse::ok(status))
}

fn phase_response(run: &ExerciseRun) -> ExercisePhaseResponse {
    ExercisePhaseResponse {
        phase: run.phase(),
        current_index: run.current_index(),
        sentence_count: run.sentence_count(),
        focus_lost: run.focus_lost(),
    }
}

/// Bounds the run registry: registrations older than the cutoff are dropped.
/// Called opportunistically whenever a new run is registered.
fn sweep_stale_runs(runs: &mut std::collections::HashMap<i64, ExerciseRun>, now: DateTime<Utc>) {
    let before = runs.len();
    runs.retain(|_, run| now - run.created_at() < chrono::Duration::hours(STALE_RUN_MAX_AGE_HOURS));
    let swept = before - runs.len();
    if swept > 0 {
        info!("Swept {} stale exercise runs from the registry", swept);
    }
}

fn lock_runs(
    state: &AppState,
) -> Result<std::sync::MutexGuard<'_, std::collections::HashMap<i64, ExerciseRun>>, AppError> {
    state
        .runs
        .lock()
        .map_err(|_| AppError::InternalServerError(anyhow!("exercise run registry lock poisoned")))
}

/// Looks up the caller's active run and hands it to `f`. Rejects callers
/// that do not own the session.
fn with_run<T>(
    state: &AppState,
    session_id: i64,
    student_id: i64,
    f: impl FnOnce(&mut ExerciseRun) -> Result<T, AppError>,
) -> Result<T, AppError> {
    let mut runs = lock_runs(state)?;
    let run = runs.get_mut(&session_id).ok_or_else(|| {
        AppError::NotFound(format!(
            "No active exercise run for session ID {}",
            session_id
        ))
    })?;
    if run.student_id() != student_id {
        warn!(
            "Student {} attempted to act on exercise session {} owned by student {}",
            student_id,
            session_id,
            run.student_id()
        );
        return Err(AppError::Forbidden(format!(
            "Exercise session {} does not belong to student {}",
            session_id, student_id
        )));
    }
    f(run)
}
