#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::{
	Author, Bootstrap, BootstrapError, ChatEvent, ContinuationKind, PollError, PollOutcome, TextMessage, Upstream,
};
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use chatrelay_platform::events::unix_ms_now;

use crate::server::session::{Session, SessionConfig, SessionPhase};
use crate::server::sink::Subscriber;

fn video() -> VideoId {
	"dQw4w9WgXcQ".parse().expect("valid VideoId")
}

fn fast_config() -> SessionConfig {
	SessionConfig {
		initial_tick_delay: Duration::from_millis(10),
		default_poll_delay: Duration::from_millis(30),
		min_poll_delay: Duration::from_millis(10),
		max_poll_delay: Duration::from_millis(200),
		error_retry_delay: Duration::from_millis(30),
		not_ready_retry_delay: Duration::from_millis(20),
		deadman: Duration::from_millis(150),
		token_stall: Duration::from_secs(10),
		heal_backoff_min: Duration::from_millis(50),
		heal_backoff_max: Duration::from_millis(400),
		dedup_capacity: 50,
		barrier_grace: Duration::from_millis(5_000),
		outbox_capacity: 500,
		drain_interval: Duration::from_millis(5),
		ping_interval: Duration::from_secs(10),
		drained_grace: Duration::from_secs(60),
	}
}

fn mk_bootstrap(token: &str) -> Bootstrap {
	Bootstrap {
		api_key: "key".to_string(),
		client_version: "2.0".to_string(),
		visitor_data: "vd".to_string(),
		initial_data: json!({}),
		initial_continuation: token.to_string(),
	}
}

fn text_event(id: &str, author: &str, text: &str, timestamp_ms: i64) -> ChatEvent {
	ChatEvent {
		id: Some(id.to_string()),
		timestamp_ms,
		action: json!({}),
		text: Some(TextMessage {
			id: id.to_string(),
			author: Author {
				id: format!("u-{id}"),
				name: author.to_string(),
				badges: Vec::new(),
			},
			text: text.to_string(),
		}),
	}
}

fn outcome(events: Vec<ChatEvent>, next: &str, delay_ms: u64) -> PollOutcome {
	PollOutcome {
		events,
		next_continuation: Some(next.to_string()),
		suggested_delay: Some(Duration::from_millis(delay_ms)),
		kind: ContinuationKind::Timed,
	}
}

/// Fake upstream fed from scripted queues. When a queue runs dry, polls echo
/// the caller's token back with no events, and bootstraps fail.
struct ScriptedUpstream {
	polls: Mutex<VecDeque<Result<PollOutcome, PollError>>>,
	bootstraps: Mutex<VecDeque<Result<Bootstrap, BootstrapError>>>,
	poll_tokens: Mutex<Vec<String>>,
	bootstrap_times: Mutex<Vec<Instant>>,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	hold: Duration,
}

impl ScriptedUpstream {
	fn new() -> Arc<Self> {
		Self::with_hold(Duration::from_millis(2))
	}

	/// `hold` keeps each poll request open, to exercise overlap detection.
	fn with_hold(hold: Duration) -> Arc<Self> {
		Arc::new(Self {
			polls: Mutex::new(VecDeque::new()),
			bootstraps: Mutex::new(VecDeque::new()),
			poll_tokens: Mutex::new(Vec::new()),
			bootstrap_times: Mutex::new(Vec::new()),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
			hold,
		})
	}

	async fn push_poll(&self, result: Result<PollOutcome, PollError>) {
		self.polls.lock().await.push_back(result);
	}

	async fn push_bootstrap(&self, result: Result<Bootstrap, BootstrapError>) {
		self.bootstraps.lock().await.push_back(result);
	}

	async fn seen_tokens(&self) -> Vec<String> {
		self.poll_tokens.lock().await.clone()
	}

	async fn poll_count(&self) -> usize {
		self.poll_tokens.lock().await.len()
	}

	async fn bootstrap_times(&self) -> Vec<Instant> {
		self.bootstrap_times.lock().await.clone()
	}

	fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Upstream for ScriptedUpstream {
	async fn bootstrap(&self, _video_id: &VideoId) -> Result<Bootstrap, BootstrapError> {
		self.bootstrap_times.lock().await.push(Instant::now());
		self.bootstraps
			.lock()
			.await
			.pop_front()
			.unwrap_or(Err(BootstrapError::MissingField("scripted bootstrap exhausted")))
	}

	async fn poll(&self, _bootstrap: &Bootstrap, continuation: &str) -> Result<PollOutcome, PollError> {
		let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(current, Ordering::SeqCst);
		self.poll_tokens.lock().await.push(continuation.to_string());

		tokio::time::sleep(self.hold).await;

		let result = self.polls.lock().await.pop_front().unwrap_or_else(|| {
			Ok(PollOutcome {
				events: Vec::new(),
				next_continuation: Some(continuation.to_string()),
				suggested_delay: Some(Duration::from_millis(20)),
				kind: ContinuationKind::Timed,
			})
		});

		self.in_flight.fetch_sub(1, Ordering::SeqCst);
		result
	}
}

fn subscriber() -> (Subscriber, mpsc::Receiver<String>) {
	let (tx, rx) = mpsc::channel(256);
	(Subscriber::new(tx), rx)
}

async fn recv_json(rx: &mut mpsc::Receiver<String>) -> JsonValue {
	let payload = timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("expected payload within timeout")
		.expect("subscriber channel open");
	serde_json::from_str(&payload).expect("payload is json")
}

/// Receive payloads until one satisfies `pred`, within a bounded budget.
async fn recv_json_until(rx: &mut mpsc::Receiver<String>, pred: impl Fn(&JsonValue) -> bool) -> JsonValue {
	for _ in 0..100 {
		let value = recv_json(rx).await;
		if pred(&value) {
			return value;
		}
	}
	panic!("no matching payload within budget");
}

#[tokio::test]
async fn happy_path_delivers_envelope_and_adopts_token() {
	let upstream = ScriptedUpstream::new();
	let ts = unix_ms_now();
	upstream.push_poll(Ok(outcome(vec![text_event("m1", "A", "hi", ts)], "T1", 20))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let greeting = recv_json(&mut rx).await;
	assert_eq!(greeting.get("debug"), Some(&json!(true)), "first payload is the greeting");

	let envelope = recv_json(&mut rx).await;
	assert_eq!(envelope.get("type").and_then(JsonValue::as_str), Some("message"));
	assert_eq!(envelope.get("id").and_then(JsonValue::as_str), Some("m1"));
	assert_eq!(envelope.get("message").and_then(JsonValue::as_str), Some("hi"));
	assert_eq!(envelope.get("unix").and_then(JsonValue::as_i64), Some(ts));
	assert_eq!(envelope.pointer("/author/id").and_then(JsonValue::as_str), Some("u-m1"));
	assert_eq!(envelope.pointer("/author/name").and_then(JsonValue::as_str), Some("A"));

	// The adopted token is echoed verbatim on the next poll.
	let mut adopted = false;
	for _ in 0..100 {
		let tokens = upstream.seen_tokens().await;
		if tokens.len() >= 2 {
			assert_eq!(tokens[0], "T0");
			assert_eq!(tokens[1], "T1");
			adopted = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(adopted, "second poll never issued");
}

#[tokio::test]
async fn duplicate_ids_are_suppressed_across_polls() {
	let upstream = ScriptedUpstream::new();
	let ts = unix_ms_now();
	upstream.push_poll(Ok(outcome(vec![text_event("m1", "A", "hi", ts)], "T1", 10))).await;
	upstream.push_poll(Ok(outcome(vec![text_event("m1", "A", "hi", ts)], "T2", 10))).await;
	upstream.push_poll(Ok(outcome(vec![text_event("m2", "B", "yo", ts)], "T3", 10))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let greeting = recv_json(&mut rx).await;
	assert_eq!(greeting.get("debug"), Some(&json!(true)));

	let first = recv_json(&mut rx).await;
	assert_eq!(first.get("id").and_then(JsonValue::as_str), Some("m1"));

	// The repeated m1 must not arrive; the next envelope is m2.
	let second = recv_json(&mut rx).await;
	assert_eq!(second.get("id").and_then(JsonValue::as_str), Some("m2"));
}

#[tokio::test]
async fn single_upstream_request_in_flight() {
	let upstream = ScriptedUpstream::with_hold(Duration::from_millis(30));

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, _rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	tokio::time::sleep(Duration::from_millis(400)).await;

	assert!(upstream.poll_count().await >= 3, "expected several polls");
	assert_eq!(upstream.max_in_flight(), 1, "polls must never overlap");
}

#[tokio::test]
async fn deadman_triggers_heal_and_adopts_fresh_token() {
	let upstream = ScriptedUpstream::new();
	for _ in 0..40 {
		upstream.push_poll(Err(PollError::HttpStatus(503))).await;
	}
	upstream.push_bootstrap(Ok(mk_bootstrap("T0p"))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	// Subscribers are told about the refresh.
	let notice = recv_json_until(&mut rx, |v| {
		v.get("message").and_then(JsonValue::as_str).map(|m| m.contains("refreshing token")).unwrap_or(false)
	})
	.await;
	assert_eq!(notice.get("debug"), Some(&json!(true)));

	let mut healed = false;
	for _ in 0..200 {
		if upstream.seen_tokens().await.iter().any(|t| t == "T0p") {
			healed = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(healed, "poll never used the refreshed token");
	assert!(!upstream.bootstrap_times().await.is_empty());
}

#[tokio::test]
async fn heal_backoff_doubles_then_resets_on_success() {
	let upstream = ScriptedUpstream::new();
	for _ in 0..200 {
		upstream.push_poll(Err(PollError::HttpStatus(503))).await;
	}
	upstream.push_bootstrap(Err(BootstrapError::HttpStatus(500))).await;
	upstream.push_bootstrap(Err(BootstrapError::HttpStatus(500))).await;
	upstream.push_bootstrap(Err(BootstrapError::HttpStatus(500))).await;
	upstream.push_bootstrap(Ok(mk_bootstrap("T0p"))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, _rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let mut times = Vec::new();
	for _ in 0..300 {
		times = upstream.bootstrap_times().await;
		if times.len() >= 4 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(times.len() >= 4, "expected four heal attempts, saw {}", times.len());

	// Gaps between consecutive failed attempts follow the doubling ladder.
	let gap1 = times[1] - times[0];
	let gap2 = times[2] - times[1];
	let gap3 = times[3] - times[2];
	assert!(gap2 > gap1, "expected {gap2:?} > {gap1:?}");
	assert!(gap3 > gap2, "expected {gap3:?} > {gap2:?}");

	// The fourth attempt succeeded and reset the backoff.
	let snapshot = session.snapshot().await;
	assert_eq!(snapshot.heal_backoff, fast_config().heal_backoff_min);
	assert_eq!(snapshot.continuation, "T0p");
}

#[tokio::test]
async fn ok_poll_without_continuation_stalls_into_heal() {
	let upstream = ScriptedUpstream::new();
	upstream
		.push_poll(Ok(PollOutcome {
			events: Vec::new(),
			next_continuation: None,
			suggested_delay: None,
			kind: ContinuationKind::None,
		}))
		.await;
	upstream.push_bootstrap(Ok(mk_bootstrap("TN"))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, _rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let mut healed = false;
	for _ in 0..200 {
		if upstream.seen_tokens().await.iter().any(|t| t == "TN") {
			healed = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(healed, "stall did not trigger a heal");
	assert_eq!(upstream.bootstrap_times().await.len(), 1);
}

#[tokio::test]
async fn no_polls_before_first_attach() {
	let upstream = ScriptedUpstream::new();
	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(upstream.poll_count().await, 0);
	assert!(!session.snapshot().await.tick_pending);
}

#[tokio::test]
async fn last_detach_stops_polling_and_drains() {
	let upstream = ScriptedUpstream::new();
	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, _rx) = subscriber();
	let sub_id = sub.id();
	session.attach(AdapterKind::Json, sub).await;

	let mut polled = false;
	for _ in 0..100 {
		if upstream.poll_count().await >= 1 {
			polled = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(polled);

	session.detach(AdapterKind::Json, sub_id).await;

	let snapshot = session.snapshot().await;
	assert_eq!(snapshot.phase, SessionPhase::Drained);
	assert!(!snapshot.tick_pending, "no tick may be pending after drain");
	assert_eq!(snapshot.subscriber_count, 0);

	// Give any in-flight tick time to settle, then confirm polling stopped.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let count = upstream.poll_count().await;
	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(upstream.poll_count().await, count, "polls continued after drain");
}

#[tokio::test]
async fn attach_revives_drained_session() {
	let upstream = ScriptedUpstream::new();
	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub1, _rx1) = subscriber();
	let sub1_id = sub1.id();
	session.attach(AdapterKind::Json, sub1).await;
	session.detach(AdapterKind::Json, sub1_id).await;
	assert_eq!(session.snapshot().await.phase, SessionPhase::Drained);

	let before = upstream.poll_count().await;
	let (sub2, mut rx2) = subscriber();
	session.attach(AdapterKind::Json, sub2).await;
	assert_eq!(session.snapshot().await.phase, SessionPhase::Ready);

	let greeting = recv_json(&mut rx2).await;
	assert_eq!(greeting.get("debug"), Some(&json!(true)));

	let mut resumed = false;
	for _ in 0..100 {
		if upstream.poll_count().await > before {
			resumed = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(resumed, "polling did not resume after re-attach");
}

#[tokio::test]
async fn late_subscriber_gets_greeting_first() {
	let upstream = ScriptedUpstream::new();
	let ts = unix_ms_now();
	upstream.push_poll(Ok(outcome(vec![text_event("m1", "A", "hi", ts)], "T1", 10))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub1, mut rx1) = subscriber();
	session.attach(AdapterKind::Json, sub1).await;

	// Wait until the session is demonstrably flowing.
	let _ = recv_json(&mut rx1).await;
	let first = recv_json_until(&mut rx1, |v| v.get("type").and_then(JsonValue::as_str) == Some("message")).await;
	assert_eq!(first.get("id").and_then(JsonValue::as_str), Some("m1"));

	let (sub2, mut rx2) = subscriber();
	session.attach(AdapterKind::Json, sub2).await;
	upstream.push_poll(Ok(outcome(vec![text_event("m2", "B", "yo", ts)], "T2", 10))).await;

	let greeting = recv_json(&mut rx2).await;
	assert_eq!(greeting.get("debug"), Some(&json!(true)), "late subscriber's first payload is the greeting");

	let envelope = recv_json_until(&mut rx2, |v| v.get("type").and_then(JsonValue::as_str) == Some("message")).await;
	assert_eq!(envelope.get("id").and_then(JsonValue::as_str), Some("m2"));
}

#[tokio::test]
async fn old_events_are_blocked_by_the_time_barrier() {
	let upstream = ScriptedUpstream::new();
	let now = unix_ms_now();
	upstream
		.push_poll(Ok(outcome(
			vec![
				text_event("old", "A", "from the before-times", now - 60_000),
				text_event("new", "B", "fresh", now),
			],
			"T1",
			10,
		)))
		.await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let _greeting = recv_json(&mut rx).await;
	let envelope = recv_json_until(&mut rx, |v| v.get("type").and_then(JsonValue::as_str) == Some("message")).await;
	assert_eq!(envelope.get("id").and_then(JsonValue::as_str), Some("new"));
}

#[tokio::test]
async fn poll_failure_broadcasts_debug_and_recovers() {
	let upstream = ScriptedUpstream::new();
	let ts = unix_ms_now();
	upstream.push_poll(Err(PollError::Throttled)).await;
	upstream.push_poll(Ok(outcome(vec![text_event("m1", "A", "hi", ts)], "T1", 10))).await;

	let session = Session::new(video(), fast_config(), upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let _greeting = recv_json(&mut rx).await;

	let debug_line = recv_json_until(&mut rx, |v| v.get("debug") == Some(&json!(true))).await;
	let message = debug_line.get("message").and_then(JsonValue::as_str).unwrap_or_default();
	assert!(message.contains("throttled"), "unexpected debug line: {message}");

	// Delivery resumes silently once the upstream recovers.
	let envelope = recv_json_until(&mut rx, |v| v.get("type").and_then(JsonValue::as_str) == Some("message")).await;
	assert_eq!(envelope.get("id").and_then(JsonValue::as_str), Some("m1"));
}

#[tokio::test]
async fn drain_paces_deliveries_within_a_sink() {
	let mut cfg = fast_config();
	cfg.drain_interval = Duration::from_millis(50);

	let upstream = ScriptedUpstream::new();
	let ts = unix_ms_now();
	upstream
		.push_poll(Ok(outcome(
			vec![
				text_event("m1", "A", "1", ts),
				text_event("m2", "A", "2", ts),
				text_event("m3", "A", "3", ts),
				text_event("m4", "A", "4", ts),
			],
			"T1",
			10,
		)))
		.await;

	let session = Session::new(video(), cfg, upstream.clone());
	session.init(mk_bootstrap("T0")).await;

	let (sub, mut rx) = subscriber();
	session.attach(AdapterKind::Json, sub).await;

	let _greeting = recv_json(&mut rx).await;

	let mut arrivals = Vec::new();
	while arrivals.len() < 4 {
		let value = recv_json(&mut rx).await;
		if value.get("type").and_then(JsonValue::as_str) == Some("message") {
			arrivals.push(Instant::now());
		}
	}

	let total = arrivals[3] - arrivals[0];
	assert!(
		total >= Duration::from_millis(120),
		"four payloads arrived too fast: {total:?}"
	);
}
