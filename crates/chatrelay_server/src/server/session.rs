#![forbid(unsafe_code)]

//! Per-video chat session: a single-flight polling actor that owns the
//! continuation token, multiplexes events to adapter sinks, and refreshes its
//! own bootstrap when the upstream stalls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::events::unix_ms_now;
use chatrelay_platform::{Bootstrap, PollError, Upstream};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::make_adapter;
use crate::server::filters::{DedupWindow, TimeBarrier};
use crate::server::sink::{AdapterSink, Subscriber};

/// Timing and capacity tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Delay before the first poll after an attach wakes the session.
	pub initial_tick_delay: Duration,
	/// Poll spacing when the upstream suggests nothing.
	pub default_poll_delay: Duration,
	/// Clamp bounds for upstream-suggested poll spacing.
	pub min_poll_delay: Duration,
	pub max_poll_delay: Duration,
	/// Poll spacing after a transient upstream failure.
	pub error_retry_delay: Duration,
	/// Requeue spacing while the session is not ready to poll.
	pub not_ready_retry_delay: Duration,
	/// How long polls may go without an OK response before a heal fires.
	pub deadman: Duration,
	/// How long the token may sit unchanged, with OK polls but no events,
	/// before a heal fires.
	pub token_stall: Duration,
	pub heal_backoff_min: Duration,
	pub heal_backoff_max: Duration,
	pub dedup_capacity: usize,
	pub barrier_grace: Duration,
	pub outbox_capacity: usize,
	/// Spacing between payload deliveries within one sink.
	pub drain_interval: Duration,
	pub ping_interval: Duration,
	/// How long a drained session is kept for fast re-attach.
	pub drained_grace: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			initial_tick_delay: Duration::from_millis(1_000),
			default_poll_delay: Duration::from_millis(3_000),
			min_poll_delay: Duration::from_millis(1_000),
			max_poll_delay: Duration::from_millis(20_000),
			error_retry_delay: Duration::from_millis(5_000),
			not_ready_retry_delay: Duration::from_millis(2_000),
			deadman: Duration::from_millis(45_000),
			token_stall: Duration::from_millis(30_000),
			heal_backoff_min: Duration::from_millis(5_000),
			heal_backoff_max: Duration::from_millis(60_000),
			dedup_capacity: 50,
			barrier_grace: Duration::from_millis(5_000),
			outbox_capacity: 500,
			drain_interval: Duration::from_millis(100),
			ping_interval: Duration::from_millis(30_000),
			drained_grace: Duration::from_secs(60),
		}
	}
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	/// Created, no bootstrap yet.
	Uninit,
	/// Bootstrapped and polling while subscribers exist.
	Ready,
	/// Last subscriber departed; no tick pending, outboxes discarded.
	Drained,
}

/// Point-in-time view of session internals.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
	pub phase: SessionPhase,
	pub continuation: String,
	pub heal_backoff: Duration,
	pub tick_pending: bool,
	pub subscriber_count: usize,
	pub drained_since_ms: Option<i64>,
}

#[derive(Default)]
struct TickTimer {
	handle: Option<AbortHandle>,
	/// Bumped on every schedule/clear; a fired tick that observes a stale
	/// generation returns without acting.
	generation: u64,
	pending: bool,
}

impl TickTimer {
	fn clear(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.abort();
		}
		self.generation = self.generation.wrapping_add(1);
		self.pending = false;
	}
}

struct SessionState {
	phase: SessionPhase,
	bootstrap: Option<Bootstrap>,
	continuation: String,
	last_ok_poll_ms: i64,
	token_changed_ms: i64,
	last_event_ms: i64,
	/// Set when an OK poll carried no continuation at all.
	stalled: bool,
	heal_backoff: Duration,
	next_heal_allowed_ms: i64,
	sinks: HashMap<AdapterKind, AdapterSink>,
	dedup: DedupWindow,
	barrier: TimeBarrier,
	timer: TickTimer,
	ping_task: Option<AbortHandle>,
	drained_since_ms: Option<i64>,
}

impl SessionState {
	fn has_subscribers(&self) -> bool {
		self.sinks.values().any(|s| !s.is_empty())
	}

	fn subscriber_count(&self) -> usize {
		self.sinks.values().map(AdapterSink::subscriber_count).sum()
	}

	/// Queue a debug notice on every sink, ordered with chat payloads.
	fn broadcast_debug(&mut self, message: &str) {
		let payload = json!({ "debug": true, "message": message }).to_string();
		for sink in self.sinks.values_mut() {
			sink.offer_raw(payload.clone());
		}
	}
}

/// The per-video actor. All field mutations happen under `state`; ticks,
/// attaches, detaches, init, and heal never overlap.
pub struct Session {
	video_id: VideoId,
	cfg: SessionConfig,
	upstream: Arc<dyn Upstream>,
	state: Mutex<SessionState>,
}

impl Session {
	pub fn new(video_id: VideoId, cfg: SessionConfig, upstream: Arc<dyn Upstream>) -> Arc<Self> {
		let state = SessionState {
			phase: SessionPhase::Uninit,
			bootstrap: None,
			continuation: String::new(),
			last_ok_poll_ms: 0,
			token_changed_ms: 0,
			last_event_ms: 0,
			stalled: false,
			heal_backoff: cfg.heal_backoff_min,
			next_heal_allowed_ms: 0,
			sinks: HashMap::new(),
			dedup: DedupWindow::new(cfg.dedup_capacity),
			barrier: TimeBarrier::new(0, cfg.barrier_grace.as_millis() as i64),
			timer: TickTimer::default(),
			ping_task: None,
			drained_since_ms: None,
		};

		Arc::new(Self {
			video_id,
			cfg,
			upstream,
			state: Mutex::new(state),
		})
	}

	pub fn video_id(&self) -> &VideoId {
		&self.video_id
	}

	pub async fn snapshot(&self) -> SessionSnapshot {
		let st = self.state.lock().await;
		SessionSnapshot {
			phase: st.phase,
			continuation: st.continuation.clone(),
			heal_backoff: st.heal_backoff,
			tick_pending: st.timer.pending,
			subscriber_count: st.subscriber_count(),
			drained_since_ms: st.drained_since_ms,
		}
	}

	/// Adopt the initial bootstrap. Duplicate init is a no-op.
	pub async fn init(&self, bootstrap: Bootstrap) {
		let mut st = self.state.lock().await;
		if st.phase != SessionPhase::Uninit {
			return;
		}

		let now = unix_ms_now();
		st.continuation = bootstrap.initial_continuation.clone();
		st.bootstrap = Some(bootstrap);
		st.barrier.reset(now);
		st.last_ok_poll_ms = now;
		st.token_changed_ms = now;
		st.last_event_ms = now;
		st.phase = SessionPhase::Ready;

		info!(video_id = %self.video_id, "session ready");
	}

	/// Register a subscriber on the sink for `kind`, creating the sink on
	/// first use, and make sure a tick is pending.
	pub async fn attach(self: &Arc<Self>, kind: AdapterKind, subscriber: Subscriber) {
		let mut st = self.state.lock().await;

		if st.phase == SessionPhase::Drained {
			st.phase = SessionPhase::Ready;
			st.drained_since_ms = None;
			debug!(video_id = %self.video_id, "session revived by attach");
		}

		let sink = st
			.sinks
			.entry(kind)
			.or_insert_with(|| AdapterSink::new(make_adapter(kind, &self.video_id), self.cfg.outbox_capacity));

		// The greeting goes to the new subscriber only, ahead of any queued
		// chat, so it bypasses the shared outbox.
		if let Some(greeting) = sink.adapter().greeting() {
			subscriber.send(greeting);
		}
		sink.attach(subscriber);

		metrics::counter!("chatrelay_subscribers_attached_total").increment(1);
		info!(video_id = %self.video_id, adapter = %kind, subscribers = st.subscriber_count(), "subscriber attached");

		if st.ping_task.is_none() {
			self.spawn_ping(&mut st);
		}
		if !st.timer.pending {
			self.schedule(&mut st, self.cfg.initial_tick_delay);
		}
	}

	/// Remove a subscriber. Empties its sink when it was the last one there,
	/// and drains the session when it was the last one overall.
	pub async fn detach(&self, kind: AdapterKind, subscriber_id: Uuid) {
		let mut st = self.state.lock().await;

		if let Some(sink) = st.sinks.get_mut(&kind) {
			sink.detach(subscriber_id);
			if sink.is_empty() {
				st.sinks.remove(&kind);
			}
		}

		metrics::counter!("chatrelay_subscribers_detached_total").increment(1);

		if !st.has_subscribers() {
			self.drain_out(&mut st);
		}
	}

	/// Last subscriber left: stop ticking and discard queued output.
	fn drain_out(&self, st: &mut SessionState) {
		st.timer.clear();
		if let Some(ping) = st.ping_task.take() {
			ping.abort();
		}
		st.sinks.clear();
		if st.phase == SessionPhase::Ready {
			st.phase = SessionPhase::Drained;
		}
		st.drained_since_ms = Some(unix_ms_now());
		info!(video_id = %self.video_id, "session drained");
	}

	fn schedule(self: &Arc<Self>, st: &mut SessionState, delay: Duration) {
		st.timer.clear();
		let generation = st.timer.generation;
		st.timer.pending = true;

		let session = Arc::clone(self);
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			session.tick(generation).await;
		});
		st.timer.handle = Some(handle.abort_handle());
	}

	/// One scheduled poll step.
	async fn tick(self: Arc<Self>, generation: u64) {
		let mut st = self.state.lock().await;
		if st.timer.generation != generation {
			// Superseded while this tick waited on the lock.
			return;
		}
		st.timer.pending = false;
		st.timer.handle = None;

		if st.phase != SessionPhase::Ready || st.continuation.is_empty() {
			self.schedule(&mut st, self.cfg.not_ready_retry_delay);
			return;
		}

		if !st.has_subscribers() {
			st.timer.clear();
			return;
		}

		let now = unix_ms_now();
		if self.heal_due(&st, now) && now >= st.next_heal_allowed_ms {
			if !self.heal(&mut st).await {
				// heal() queued debug notices on every outbox; without a
				// drain here they would sit undelivered for the whole outage.
				self.kick_drains(&mut st);
				let wait_ms = (st.next_heal_allowed_ms - unix_ms_now()).max(0) as u64;
				let delay = Duration::from_millis(wait_ms).max(self.cfg.min_poll_delay);
				self.schedule(&mut st, delay);
				return;
			}
		}

		let Some(bootstrap) = st.bootstrap.clone() else {
			self.schedule(&mut st, self.cfg.not_ready_retry_delay);
			return;
		};
		let token = st.continuation.clone();

		// The lock stays held across the request: single-flight per session
		// is structural, and attaches simply queue behind the poll.
		let delay = match self.upstream.poll(&bootstrap, &token).await {
			Ok(outcome) => {
				let now = unix_ms_now();
				st.last_ok_poll_ms = now;
				metrics::counter!("chatrelay_polls_ok_total").increment(1);

				match outcome.next_continuation {
					Some(next) => {
						if next != st.continuation {
							debug!(
								video_id = %self.video_id,
								kind = outcome.kind.as_str(),
								"adopted next continuation"
							);
							st.continuation = next;
							st.token_changed_ms = now;
						}
						st.stalled = false;
					}
					None => {
						debug!(video_id = %self.video_id, "poll returned no continuation, flagging stall");
						st.stalled = true;
					}
				}

				let mut delivered: u64 = 0;
				for event in &outcome.events {
					if !st.barrier.accept(event.timestamp_ms) {
						continue;
					}
					match event.id.as_deref() {
						Some(id) if !id.is_empty() => {
							if !st.dedup.admit(id) {
								continue;
							}
						}
						// Missing/empty ids bypass dedup, but text messages
						// always require one; other id-less actions fan out
						// as-is.
						_ if event.text.is_some() => continue,
						_ => {}
					}

					st.last_event_ms = now;
					delivered += 1;
					for sink in st.sinks.values_mut() {
						sink.offer(event);
					}
				}
				if delivered > 0 {
					metrics::counter!("chatrelay_events_total").increment(delivered);
				}

				outcome
					.suggested_delay
					.map(|d| d.clamp(self.cfg.min_poll_delay, self.cfg.max_poll_delay))
					.unwrap_or(self.cfg.default_poll_delay)
			}
			Err(err) => {
				metrics::counter!("chatrelay_polls_failed_total").increment(1);
				warn!(video_id = %self.video_id, error = %err, "chat poll failed");

				let line = match &err {
					PollError::Throttled => "chat fetch throttled: upstream subrequest limit".to_string(),
					other => format!("chat fetch failed: {other}"),
				};
				st.broadcast_debug(&line);

				self.cfg.error_retry_delay
			}
		};

		self.kick_drains(&mut st);

		if st.has_subscribers() {
			self.schedule(&mut st, delay.max(self.cfg.min_poll_delay));
		} else {
			st.timer.clear();
		}
	}

	fn heal_due(&self, st: &SessionState, now: i64) -> bool {
		if st.stalled {
			return true;
		}
		if now - st.last_ok_poll_ms > self.cfg.deadman.as_millis() as i64 {
			return true;
		}
		// Token stall: polls keep succeeding, but the cursor and the chat
		// have both been frozen since the token last moved.
		now - st.token_changed_ms > self.cfg.token_stall.as_millis() as i64 && st.last_event_ms <= st.token_changed_ms
	}

	/// Replace the bootstrap wholesale. Returns `true` on success.
	async fn heal(&self, st: &mut SessionState) -> bool {
		st.broadcast_debug("refreshing token…");
		info!(video_id = %self.video_id, "session heal: refreshing bootstrap");

		match self.upstream.bootstrap(&self.video_id).await {
			Ok(bootstrap) => {
				let now = unix_ms_now();
				st.continuation = bootstrap.initial_continuation.clone();
				st.bootstrap = Some(bootstrap);
				// A fresh continuation replays recent history; the barrier
				// must not reject it.
				st.barrier.reset(now);
				st.last_ok_poll_ms = now;
				st.token_changed_ms = now;
				st.last_event_ms = now;
				st.stalled = false;
				st.heal_backoff = self.cfg.heal_backoff_min;
				st.next_heal_allowed_ms = now + self.cfg.heal_backoff_min.as_millis() as i64;

				metrics::counter!("chatrelay_heals_ok_total").increment(1);
				info!(video_id = %self.video_id, "session heal succeeded");
				true
			}
			Err(err) => {
				let now = unix_ms_now();
				let waited = st.heal_backoff;
				st.next_heal_allowed_ms = now + waited.as_millis() as i64;
				st.heal_backoff = (waited * 2).min(self.cfg.heal_backoff_max);

				metrics::counter!("chatrelay_heals_failed_total").increment(1);
				warn!(
					video_id = %self.video_id,
					error = %err,
					backoff_ms = waited.as_millis() as u64,
					"session heal failed"
				);
				st.broadcast_debug(&format!("token refresh failed: {err}"));
				false
			}
		}
	}

	/// Start a drain task for every sink with queued output and no drainer.
	fn kick_drains(self: &Arc<Self>, st: &mut SessionState) {
		let kinds: Vec<AdapterKind> = st
			.sinks
			.iter()
			.filter(|(_, sink)| sink.needs_drain())
			.map(|(kind, _)| *kind)
			.collect();

		for kind in kinds {
			if let Some(sink) = st.sinks.get_mut(&kind) {
				sink.mark_draining();
			}
			self.spawn_drain(kind);
		}
	}

	fn spawn_drain(self: &Arc<Self>, kind: AdapterKind) {
		let session = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let (payload, targets) = {
					let mut st = session.state.lock().await;
					let Some(sink) = st.sinks.get_mut(&kind) else {
						// Sink removed while draining; nothing left to flush.
						return;
					};
					match sink.pop_for_delivery() {
						Some(next) => next,
						None => {
							sink.clear_draining();
							return;
						}
					}
				};

				for tx in targets {
					// A full subscriber channel drops this payload for that
					// subscriber only; closed channels are pruned next pop.
					let _ = tx.try_send(payload.clone());
				}

				tokio::time::sleep(session.cfg.drain_interval).await;
			}
		});
	}

	fn spawn_ping(self: &Arc<Self>, st: &mut SessionState) {
		let session = Arc::clone(self);
		let handle = tokio::spawn(async move {
			let payload = json!({ "type": "ping" }).to_string();
			let mut interval = tokio::time::interval(session.cfg.ping_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			// The first interval tick fires immediately; a fresh attach does
			// not need a ping.
			interval.tick().await;

			loop {
				interval.tick().await;
				let mut st = session.state.lock().await;
				if !st.has_subscribers() {
					return;
				}
				for sink in st.sinks.values_mut() {
					sink.send_direct(&payload);
				}
			}
		});
		st.ping_task = Some(handle.abort_handle());
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session").field("video_id", &self.video_id).finish()
	}
}
