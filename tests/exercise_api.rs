use axum::http::StatusCode;
use kasus_server::model::exercise::{
    AdvanceResponse, CreateExerciseResponse, ExercisePhaseResponse, FeedbackStatusResponse,
};
use kasus_server::response::ApiResponse;
use serde_json::{Value, json};

mod helpers;
use helpers::{
    count_feedback_jobs, count_session_attempts, create_test_annotation, create_test_case,
    create_test_chapter, create_test_sentence, create_test_student, get_progress_counters,
    get_session_status, setup_test_environment,
};

// create_exercise

#[tokio::test]
async fn test_create_exercise_success() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1001, "anna@test.com", "Anna").await;
    let chapter_id = create_test_chapter(&pool, "Chapter 1", 1).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let gen_id = create_test_case(&pool, "genitive", "GEN", "green").await;
    let sentence_id = create_test_sentence(&pool, chapter_id, "Koira juoksee pihalla", "easy").await;
    create_test_annotation(&pool, sentence_id, 0, nom_id).await;
    create_test_annotation(&pool, sentence_id, 2, gen_id).await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "practice",
            "difficulty": "easy",
            "question_count": 5,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<CreateExerciseResponse> = response.json();
    assert_eq!(body.status_code, 200);
    let data = body.data.expect("expected response data");

    assert_eq!(data.sentences.len(), 1);
    assert_eq!(data.sentences[0].id, sentence_id);
    assert_eq!(data.sentences[0].annotated_indices, vec![0, 2]);
    assert_eq!(data.cases.len(), 2);

    assert_eq!(get_session_status(&pool, data.session_id).await, "in_progress");
}

#[tokio::test]
async fn test_create_exercise_backfills_across_difficulties() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1002, "ben@test.com", "Ben").await;
    let chapter_id = create_test_chapter(&pool, "Chapter 2", 2).await;
    create_test_sentence(&pool, chapter_id, "Easy sentence", "easy").await;
    create_test_sentence(&pool, chapter_id, "Hard sentence one", "hard").await;
    create_test_sentence(&pool, chapter_id, "Hard sentence two", "hard").await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "practice",
            "difficulty": "easy",
            "question_count": 3,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<CreateExerciseResponse> = response.json();
    let data = body.data.expect("expected response data");
    assert_eq!(data.sentences.len(), 3);
}

#[tokio::test]
async fn test_create_exercise_unknown_student() {
    let (server, pool) = setup_test_environment().await;
    let chapter_id = create_test_chapter(&pool, "Chapter 3", 3).await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": 9999,
            "chapter_id": chapter_id,
            "kind": "practice",
            "difficulty": "easy",
            "question_count": 1,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: ApiResponse<Value> = response.json();
    assert!(body.status_message.contains("Student with ID 9999 not found"));
}

#[tokio::test]
async fn test_create_exercise_rejects_unknown_kind() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, 1003, "carl@test.com", "Carl").await;
    let chapter_id = create_test_chapter(&pool, "Chapter 4", 4).await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "quiz",
            "difficulty": "easy",
            "question_count": 1,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_create_test_exercise_requires_exit_code() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, 1004, "dina@test.com", "Dina").await;
    let chapter_id = create_test_chapter(&pool, "Chapter 5", 5).await;
    create_test_sentence(&pool, chapter_id, "A sentence", "easy").await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "test",
            "difficulty": "easy",
            "question_count": 1,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: ApiResponse<Value> = response.json();
    assert!(body.status_message.contains("exit code"));
}

#[tokio::test]
async fn test_create_exercise_rejects_empty_chapter() {
    let (server, pool) = setup_test_environment().await;
    let student_id = create_test_student(&pool, 1005, "emma@test.com", "Emma").await;
    let chapter_id = create_test_chapter(&pool, "Empty Chapter", 6).await;

    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "practice",
            "difficulty": "easy",
            "question_count": 5,
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: ApiResponse<Value> = response.json();
    assert!(body.status_message.contains("no sentences"));
}

// full practice flow

async fn create_practice_session(
    server: &helpers::TestServer,
    student_id: i64,
    chapter_id: i64,
    question_count: i64,
) -> CreateExerciseResponse {
    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "practice",
            "difficulty": "easy",
            "question_count": question_count,
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<CreateExerciseResponse> = response.json();
    body.data.expect("expected create response data")
}

#[tokio::test]
async fn test_practice_flow_submits_attempts_and_progress() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1010, "finn@test.com", "Finn").await;
    let chapter_id = create_test_chapter(&pool, "Flow Chapter", 7).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let gen_id = create_test_case(&pool, "genitive", "GEN", "green").await;

    // first sentence annotated at words 0 and 2, second sentence bare
    let s1 = create_test_sentence(&pool, chapter_id, "Kissa nukkuu matolla", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;
    create_test_annotation(&pool, s1, 2, gen_id).await;
    let _s2 = create_test_sentence(&pool, chapter_id, "Aurinko paistaa", "easy").await;

    let created = create_practice_session(&server, student_id, chapter_id, 2).await;
    let session_id = created.session_id;
    assert_eq!(created.sentences.len(), 2);

    // answer word 0 correctly
    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<bool> = response.json();
    assert_eq!(body.data, Some(true));

    let response = server
        .post("/student/choose_case")
        .json(&json!({"session_id": session_id, "student_id": student_id, "case_id": nom_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    // checking now must fail, word 2 is still unanswered
    let response = server
        .post("/student/check_answer")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    // answer word 2 incorrectly
    server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 2}))
        .await;
    let response = server
        .post("/student/choose_case")
        .json(&json!({"session_id": session_id, "student_id": student_id, "case_id": nom_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server
        .post("/student/check_answer")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server
        .post("/student/advance_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<AdvanceResponse> = response.json();
    let advance = body.data.expect("expected advance data");
    assert!(!advance.completed);
    assert_eq!(advance.current_index, Some(1));

    // the bare sentence checks vacuously
    let response = server
        .post("/student/check_answer")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server
        .post("/student/advance_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<AdvanceResponse> = response.json();
    let advance = body.data.expect("expected advance data");
    assert!(advance.completed);
    let summary = advance.summary.expect("expected submission summary");
    assert_eq!(summary.attempts_written, 2);
    assert_eq!(summary.correct_count, 1);

    // durable state: session completed, two attempts, one job, progress counters
    assert_eq!(get_session_status(&pool, session_id).await, "completed");
    assert_eq!(count_session_attempts(&pool, session_id).await, 2);
    assert_eq!(count_feedback_jobs(&pool, session_id).await, 1);
    let counters = get_progress_counters(&pool, student_id, chapter_id).await;
    assert_eq!(counters, Some((1, 1, 2, 1)));

    // the run is gone once submitted
    let response = server
        .post("/student/advance_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_progress_counters_accumulate_across_sessions() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1011, "greta@test.com", "Greta").await;
    let chapter_id = create_test_chapter(&pool, "Accumulate Chapter", 8).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Talo on suuri", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    for _ in 0..2 {
        let created = create_practice_session(&server, student_id, chapter_id, 1).await;
        let session_id = created.session_id;

        server
            .post("/student/select_word")
            .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
            .await;
        server
            .post("/student/choose_case")
            .json(&json!({"session_id": session_id, "student_id": student_id, "case_id": nom_id}))
            .await;
        server
            .post("/student/check_answer")
            .json(&json!({"session_id": session_id, "student_id": student_id}))
            .await;
        let response = server
            .post("/student/advance_exercise")
            .json(&json!({"session_id": session_id, "student_id": student_id}))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    let counters = get_progress_counters(&pool, student_id, chapter_id).await;
    assert_eq!(counters, Some((2, 2, 2, 2)));
}

#[tokio::test]
async fn test_selecting_unannotated_word_is_noop() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1012, "hugo@test.com", "Hugo").await;
    let chapter_id = create_test_chapter(&pool, "Noop Chapter", 9).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Vesi on kylmaa", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_practice_session(&server, student_id, chapter_id, 1).await;
    let session_id = created.session_id;

    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 1}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<bool> = response.json();
    assert_eq!(body.data, Some(false));

    // no selection was made, so choosing a case is rejected
    let response = server
        .post("/student/choose_case")
        .json(&json!({"session_id": session_id, "student_id": student_id, "case_id": nom_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_run_ownership_is_enforced() {
    let (server, pool) = setup_test_environment().await;

    let owner_id = create_test_student(&pool, 1013, "ines@test.com", "Ines").await;
    let other_id = create_test_student(&pool, 1014, "jussi@test.com", "Jussi").await;
    let chapter_id = create_test_chapter(&pool, "Ownership Chapter", 10).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Ovi on auki", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_practice_session(&server, owner_id, chapter_id, 1).await;

    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": created.session_id, "student_id": other_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

// test mode

async fn create_test_mode_session(
    server: &helpers::TestServer,
    student_id: i64,
    chapter_id: i64,
    exit_code: &str,
) -> CreateExerciseResponse {
    let response = server
        .post("/student/create_exercise")
        .json(&json!({
            "student_id": student_id,
            "chapter_id": chapter_id,
            "kind": "test",
            "difficulty": "easy",
            "question_count": 1,
            "exit_code": exit_code,
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<CreateExerciseResponse> = response.json();
    body.data.expect("expected create response data")
}

#[tokio::test]
async fn test_test_mode_waits_for_begin() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1020, "kaisa@test.com", "Kaisa").await;
    let chapter_id = create_test_chapter(&pool, "Test Chapter", 11).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Juna saapuu asemalle", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_test_mode_session(&server, student_id, chapter_id, "1234").await;
    let session_id = created.session_id;

    // answering before begin is rejected
    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = server
        .post("/student/begin_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<ExercisePhaseResponse> = response.json();
    let phase = body.data.expect("expected phase data");
    assert!(!phase.focus_lost);

    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_focus_loss_blocks_answering() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1021, "lena@test.com", "Lena").await;
    let chapter_id = create_test_chapter(&pool, "Focus Chapter", 12).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Lumi sataa hiljaa", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_test_mode_session(&server, student_id, chapter_id, "4321").await;
    let session_id = created.session_id;

    server
        .post("/student/begin_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    server
        .post("/student/report_focus_lost")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;

    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);

    server
        .post("/student/resume_focus")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;

    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_exit_code_gates_abandonment() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1022, "mika@test.com", "Mika").await;
    let chapter_id = create_test_chapter(&pool, "Exit Chapter", 13).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Kirja on poydalla", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_test_mode_session(&server, student_id, chapter_id, "9876").await;
    let session_id = created.session_id;

    server
        .post("/student/begin_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;

    // wrong code changes nothing, in the database or in memory
    let response = server
        .post("/student/exit_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id, "exit_code": "0000"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(get_session_status(&pool, session_id).await, "in_progress");

    // the run is still playable after the failed exit attempt
    let response = server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    // right code abandons without writing attempts
    let response = server
        .post("/student/exit_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id, "exit_code": "9876"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(get_session_status(&pool, session_id).await, "abandoned");
    assert_eq!(count_session_attempts(&pool, session_id).await, 0);
    assert_eq!(count_feedback_jobs(&pool, session_id).await, 0);

    // and the run is gone
    let response = server
        .post("/student/exit_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id, "exit_code": "9876"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exit_code_rejected_for_practice() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1023, "noora@test.com", "Noora").await;
    let chapter_id = create_test_chapter(&pool, "Practice Exit Chapter", 14).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Kahvi on kuumaa", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_practice_session(&server, student_id, chapter_id, 1).await;

    let response = server
        .post("/student/exit_exercise")
        .json(&json!({"session_id": created.session_id, "student_id": student_id, "exit_code": "1234"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
}

// feedback status

#[tokio::test]
async fn test_feedback_job_is_pending_after_submit() {
    let (server, pool) = setup_test_environment().await;

    let student_id = create_test_student(&pool, 1030, "olli@test.com", "Olli").await;
    let chapter_id = create_test_chapter(&pool, "Feedback Chapter", 15).await;
    let nom_id = create_test_case(&pool, "nominative", "NOM", "blue").await;
    let s1 = create_test_sentence(&pool, chapter_id, "Metsa on vihrea", "easy").await;
    create_test_annotation(&pool, s1, 0, nom_id).await;

    let created = create_practice_session(&server, student_id, chapter_id, 1).await;
    let session_id = created.session_id;

    server
        .post("/student/select_word")
        .json(&json!({"session_id": session_id, "student_id": student_id, "word_index": 0}))
        .await;
    server
        .post("/student/choose_case")
        .json(&json!({"session_id": session_id, "student_id": student_id, "case_id": nom_id}))
        .await;
    server
        .post("/student/check_answer")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;
    server
        .post("/student/advance_exercise")
        .json(&json!({"session_id": session_id, "student_id": student_id}))
        .await;

    let response = server
        .get(&format!(
            "/student/get_feedback_status?session_id={}",
            session_id
        ))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: ApiResponse<FeedbackStatusResponse> = response.json();
    let status = body.data.expect("expected feedback status data");
    assert_eq!(status.status, "pending");
    assert!(status.summary.is_none());
}

#[tokio::test]
async fn test_feedback_status_unknown_session() {
    let (server, _pool) = setup_test_environment().await;

    let response = server
        .get("/student/get_feedback_status?session_id=424242")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
