#![forbid(unsafe_code)]

//! HTTP front door: validates video ids, scrapes the bootstrap, and upgrades
//! subscribers onto their session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::Upstream;

use crate::server::registry::SessionRegistry;
use crate::server::sink::Subscriber;

/// Outbound payloads buffered per connection before the socket task.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Readiness flag flipped once startup finishes.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub struct AppState {
	pub registry: Arc<SessionRegistry>,
	pub upstream: Arc<dyn Upstream>,
	pub health: HealthState,
}

/// Build the relay router.
pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/live/{video_id}", get(live_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
	if state.health.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}

#[derive(Debug, Clone, Deserialize)]
struct LiveQuery {
	adapter: Option<String>,
}

/// `GET /live/{video_id}` — WebSocket upgrade onto the video's session.
async fn live_handler(
	State(state): State<Arc<AppState>>,
	Path(video_id): Path<String>,
	Query(query): Query<LiveQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	let Ok(video_id) = video_id.parse::<VideoId>() else {
		return StatusCode::NOT_FOUND.into_response();
	};

	let kind = match query.adapter.as_deref() {
		None => AdapterKind::default(),
		Some(name) => match name.parse::<AdapterKind>() {
			Ok(kind) => kind,
			Err(_) => return StatusCode::NOT_FOUND.into_response(),
		},
	};

	// The bootstrap is fetched before the upgrade so a dead or chat-less
	// video is reported as a plain HTTP failure.
	let bootstrap = match state.upstream.bootstrap(&video_id).await {
		Ok(bootstrap) => bootstrap,
		Err(err) => {
			warn!(video_id = %video_id, error = %err, "bootstrap failed");
			metrics::counter!("chatrelay_bootstrap_failures_total").increment(1);
			return (StatusCode::BAD_GATEWAY, "bootstrap failed").into_response();
		}
	};

	metrics::counter!("chatrelay_connections_total").increment(1);
	info!(video_id = %video_id, adapter = %kind, "accepted live chat subscriber");

	ws.on_upgrade(move |socket| handle_socket(socket, state, video_id, kind, bootstrap))
}

async fn handle_socket(
	socket: WebSocket,
	state: Arc<AppState>,
	video_id: VideoId,
	kind: AdapterKind,
	bootstrap: chatrelay_platform::Bootstrap,
) {
	let session = state.registry.acquire_or_create(&video_id).await;
	session.init(bootstrap).await;

	let (out_tx, mut out_rx) = mpsc::channel::<String>(SUBSCRIBER_CHANNEL_CAPACITY);
	let subscriber = Subscriber::new(out_tx);
	let subscriber_id = subscriber.id();
	session.attach(kind, subscriber).await;

	let (mut ws_tx, mut ws_rx) = socket.split();

	loop {
		tokio::select! {
			payload = out_rx.recv() => {
				match payload {
					Some(text) => {
						if ws_tx.send(Message::Text(text.into())).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}

			// There is no upstream write path; inbound frames matter only
			// for liveness.
			msg = ws_rx.next() => {
				match msg {
					Some(Ok(Message::Close(_))) | None => break,
					Some(Err(_)) => break,
					Some(Ok(_)) => {}
				}
			}
		}
	}

	debug!(video_id = %video_id, adapter = %kind, "subscriber socket closed");
	session.detach(kind, subscriber_id).await;
}
