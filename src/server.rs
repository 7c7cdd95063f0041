//! HTTP observer transport.
//!
//! - `GET  /api/state`  current snapshot
//! - `GET  /api/agents` available agents
//! - `POST /api/start`  `{"white": "...", "black": "..."}`
//! - `POST /api/stop`
//! - `GET  /api/events` server-sent `gameState` events, one per state change

use crate::session::{Participants, SessionHandle, SessionSnapshot};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use std::convert::Infallible;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tracing::{debug, info, instrument, warn};

/// Shared state for request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    handle: SessionHandle,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl AppState {
    /// Creates handler state from a session handle and its snapshot feed.
    pub fn new(handle: SessionHandle, snapshots: watch::Receiver<SessionSnapshot>) -> Self {
        Self { handle, snapshots }
    }
}

/// Builds the observer router.
#[instrument(skip(state))]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/agents", get(get_agents))
        .route("/api/start", post(start_game))
        .route("/api/stop", post(stop_game))
        .route("/api/events", get(events))
        .layer(ServiceBuilder::new().map_request(|req: Request<Body>| {
            info!(method = %req.method(), uri = %req.uri(), "Incoming HTTP request");
            req
        }))
        .with_state(state)
}

/// Binds `host:port` and serves until the process exits.
#[instrument(skip(state))]
pub async fn serve(host: &str, port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Observer server ready at http://{}:{}/", host, port);
    axum::serve(listener, router(state)).await
}

async fn get_state(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.snapshots.borrow().clone())
}

async fn get_agents(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.handle.list_agents().await)
}

#[instrument(skip(state))]
async fn start_game(
    State(state): State<AppState>,
    Json(participants): Json<Participants>,
) -> Response {
    match state.handle.start(participants) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "Start failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.message).into_response()
        }
    }
}

#[instrument(skip(state))]
async fn stop_game(State(state): State<AppState>) -> Response {
    match state.handle.stop() {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "Stop failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.message).into_response()
        }
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Observer subscribed to events");
    let stream = futures::stream::unfold(
        (state.snapshots.clone(), true),
        |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            let event = Event::default()
                .event("gameState")
                .json_data(&snapshot)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Some((Ok(event), (rx, false)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}
