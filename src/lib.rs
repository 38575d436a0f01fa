use crate::cli::Args;
use crate::engine::ExerciseRun;
use crate::events::EventBus;
use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use axum_keycloak_auth::PassthroughMode;
use axum_keycloak_auth::instance::{KeycloakAuthInstance, KeycloakConfig};
use axum_keycloak_auth::layer::KeycloakAuthLayer;
use deadpool_diesel::Runtime;
use deadpool_diesel::postgres::{Manager, Pool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::log::info;

pub mod cli;
pub mod engine;
pub mod events;
pub mod feedback;
pub mod model;
pub mod payloads;
pub mod response;
pub mod schema;

mod api;
mod errors;

/// Shared application state. The pool holds the durable rows; `runs` holds
/// the in-memory state machines of exercise sessions currently being played;
/// `events` carries the advisory nudges for Together sessions.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub runs: Arc<Mutex<HashMap<i64, ExerciseRun>>>,
    pub events: EventBus,
}

impl AppState {
    pub fn new(pool: Pool) -> Self {
        AppState {
            pool,
            runs: Arc::new(Mutex::new(HashMap::new())),
            events: EventBus::new(),
        }
    }
}

pub fn init_router(args: &Args, pool: Pool) -> anyhow::Result<Router> {
    info!("Initializing Keycloak authentication layer...");
    let keycloak_layer =
        init_protection_layer(args).context("Failed to initialize Keycloak layer")?;

    info!("Initializing router...");
    Ok(init_router_internal(AppState::new(pool), keycloak_layer))
}

pub fn init_test_router(pool: Pool) -> Router {
    let student_api = student_routes();
    let together_api = together_routes();
    let teacher_api = teacher_routes();

    Router::new()
        .nest("/student", student_api)
        .nest("/together", together_api)
        .nest("/teacher", teacher_api)
        .with_state(AppState::new(pool))
}

pub fn init_pool(conn_str: &str, max_size: u32) -> anyhow::Result<Pool> {
    let manager = Manager::new(conn_str, Runtime::Tokio1);
    let pool = Pool::builder(manager).max_size(max_size as usize).build()?;
    Ok(pool)
}

fn init_router_internal(state: AppState, keycloak_layer: KeycloakAuthLayer<String>) -> Router {
    let student_api = student_routes().layer(keycloak_layer.clone());
    let together_api = together_routes().layer(keycloak_layer.clone());
    let teacher_api = teacher_routes().layer(keycloak_layer.clone());

    Router::new()
        .nest("/student", student_api)
        .nest("/together", together_api)
        .nest("/teacher", teacher_api)
        .with_state(state)
}

fn init_protection_layer(args: &Args) -> anyhow::Result<KeycloakAuthLayer<String>> {
    let config = KeycloakConfig::builder()
        .server(args.keycloak_server_url.clone())
        .realm(args.keycloak_realm.clone())
        .build();

    let instance = KeycloakAuthInstance::new(config);

    let layer = KeycloakAuthLayer::builder()
        .instance(instance)
        .passthrough_mode(PassthroughMode::Block)
        .persist_raw_claims(false)
        .expected_audiences(vec![args.keycloak_audiences.clone()])
        .build();

    Ok(layer)
}

fn student_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route("/create_exercise", post(api::exercise::create_exercise))
        .route("/begin_exercise", post(api::exercise::begin_exercise))
        .route(
            "/get_exercise_state",
            get(api::exercise::get_exercise_state),
        )
        .route("/select_word", post(api::exercise::select_word))
        .route("/choose_case", post(api::exercise::choose_case))
        .route("/check_answer", post(api::exercise::check_answer))
        .route("/advance_exercise", post(api::exercise::advance_exercise))
        .route(
            "/report_focus_lost",
            post(api::exercise::report_focus_lost),
        )
        .route("/resume_focus", post(api::exercise::resume_focus))
        .route("/exit_exercise", post(api::exercise::exit_exercise))
        .route(
            "/get_feedback_status",
            get(api::exercise::get_feedback_status),
        )
    // public routes go here
}

fn together_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route("/create_session", post(api::together::create_session))
        .route("/join_session", post(api::together::join_session))
        .route("/leave_session", post(api::together::leave_session))
        .route("/start_session", post(api::together::start_session))
        .route("/advance_session", post(api::together::advance_session))
        .route("/get_session", get(api::together::get_session))
        .route("/get_participants", get(api::together::get_participants))
        .route("/get_assignments", get(api::together::get_assignments))
        .route("/events", get(api::together::session_events))
    // public routes go here
}

fn teacher_routes() -> Router<AppState> {
    Router::new()
        // protected routes go here
        .route(
            "/get_student_progress",
            get(api::teacher::get_student_progress),
        )
        .route(
            "/get_session_attempts",
            get(api::teacher::get_session_attempts),
        )
        .route(
            "/delete_exercise_session",
            post(api::teacher::delete_exercise_session),
        )
    // public routes go here
}
