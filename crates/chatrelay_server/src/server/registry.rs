#![forbid(unsafe_code)]

//! Video id → session map. The only cross-session structure; it serializes
//! creation and destruction, never traffic.

use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_domain::VideoId;
use chatrelay_platform::Upstream;
use chatrelay_platform::events::unix_ms_now;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::server::session::{Session, SessionConfig};

pub struct SessionRegistry {
	cfg: SessionConfig,
	upstream: Arc<dyn Upstream>,
	sessions: Mutex<HashMap<VideoId, Arc<Session>>>,
}

impl SessionRegistry {
	pub fn new(cfg: SessionConfig, upstream: Arc<dyn Upstream>) -> Arc<Self> {
		Arc::new(Self {
			cfg,
			upstream,
			sessions: Mutex::new(HashMap::new()),
		})
	}

	/// Return the unique session for `video_id`, creating it on first use.
	/// The map lock serializes concurrent creation per key.
	pub async fn acquire_or_create(&self, video_id: &VideoId) -> Arc<Session> {
		let mut sessions = self.sessions.lock().await;
		if let Some(session) = sessions.get(video_id) {
			return Arc::clone(session);
		}

		let session = Session::new(video_id.clone(), self.cfg.clone(), Arc::clone(&self.upstream));
		sessions.insert(video_id.clone(), Arc::clone(&session));
		metrics::gauge!("chatrelay_sessions").set(sessions.len() as f64);
		info!(video_id = %video_id, sessions = sessions.len(), "session created");
		session
	}

	/// Drop the session for `video_id`, if any. Idempotent.
	pub async fn deregister(&self, video_id: &VideoId) {
		let mut sessions = self.sessions.lock().await;
		if sessions.remove(video_id).is_some() {
			metrics::gauge!("chatrelay_sessions").set(sessions.len() as f64);
			info!(video_id = %video_id, "session deregistered");
		}
	}

	pub async fn session_count(&self) -> usize {
		self.sessions.lock().await.len()
	}

	/// Periodically drop sessions that have sat drained past the grace
	/// window. Drained sessions are kept around for fast re-attach.
	pub fn start_sweeper(self: &Arc<Self>) {
		let registry = Arc::clone(self);
		tokio::spawn(async move {
			let period = registry.cfg.drained_grace / 2;
			let mut interval = tokio::time::interval(period.max(std::time::Duration::from_secs(1)));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

			loop {
				interval.tick().await;
				registry.sweep_drained().await;
			}
		});
	}

	async fn sweep_drained(&self) {
		let grace_ms = self.cfg.drained_grace.as_millis() as i64;
		let now = unix_ms_now();

		// The map lock is held across the check and the removal so a
		// concurrent acquire cannot resurrect a session mid-sweep.
		let mut sessions = self.sessions.lock().await;
		let ids: Vec<VideoId> = sessions.keys().cloned().collect();

		for video_id in ids {
			let Some(session) = sessions.get(&video_id) else {
				continue;
			};
			let snapshot = session.snapshot().await;
			let expired = snapshot.subscriber_count == 0
				&& snapshot.drained_since_ms.map(|at| now - at > grace_ms).unwrap_or(false);
			if expired {
				sessions.remove(&video_id);
				debug!(video_id = %video_id, "swept drained session");
			}
		}

		metrics::gauge!("chatrelay_sessions").set(sessions.len() as f64);
	}
}

impl std::fmt::Debug for SessionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRegistry").finish()
	}
}
