#![forbid(unsafe_code)]

//! Per-adapter output sink: a subscriber set plus a bounded, rate-drained
//! outbox of serialized payloads.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::OutputAdapter;
use chatrelay_platform::ChatEvent;

/// A live subscriber connection: an id plus the outbound payload channel its
/// socket task drains.
#[derive(Debug, Clone)]
pub struct Subscriber {
	id: Uuid,
	tx: mpsc::Sender<String>,
}

impl Subscriber {
	pub fn new(tx: mpsc::Sender<String>) -> Self {
		Self { id: Uuid::new_v4(), tx }
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	/// Best-effort direct send, bypassing the sink outbox. A full channel
	/// drops the payload for this subscriber only.
	pub fn send(&self, payload: String) -> bool {
		self.tx.try_send(payload).is_ok()
	}

	fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// One output adapter plus its subscribers and outbox.
///
/// The outbox keeps the newest payloads under overrun: overflow drops from
/// the head. A single drain task per sink delivers one payload per drain
/// interval to every subscriber.
pub struct AdapterSink {
	adapter: Box<dyn OutputAdapter>,
	subscribers: Vec<Subscriber>,
	outbox: VecDeque<String>,
	capacity: usize,
	draining: bool,
	dropped_total: u64,
}

impl AdapterSink {
	pub fn new(adapter: Box<dyn OutputAdapter>, capacity: usize) -> Self {
		Self {
			adapter,
			subscribers: Vec::new(),
			outbox: VecDeque::new(),
			capacity,
			draining: false,
			dropped_total: 0,
		}
	}

	pub fn adapter(&self) -> &dyn OutputAdapter {
		self.adapter.as_ref()
	}

	pub fn attach(&mut self, subscriber: Subscriber) {
		self.subscribers.push(subscriber);
	}

	pub fn detach(&mut self, subscriber_id: Uuid) {
		self.subscribers.retain(|s| s.id() != subscriber_id);
	}

	pub fn is_empty(&self) -> bool {
		self.subscribers.is_empty()
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.len()
	}

	pub fn outbox_len(&self) -> usize {
		self.outbox.len()
	}

	/// Transform one event for this sink's wire format and enqueue it.
	/// A `None` transform filters the event for this sink.
	pub fn offer(&mut self, event: &ChatEvent) {
		if let Some(payload) = self.adapter.transform(event) {
			self.enqueue(payload);
		}
	}

	/// Enqueue a pre-serialized payload (debug lines), bypassing transform.
	pub fn offer_raw(&mut self, payload: String) {
		self.enqueue(payload);
	}

	fn enqueue(&mut self, payload: String) {
		if self.outbox.len() >= self.capacity {
			self.outbox.pop_front();
			self.dropped_total += 1;
			if self.dropped_total.is_power_of_two() {
				debug!(
					adapter = %self.adapter.kind(),
					dropped_total = self.dropped_total,
					"sink outbox overrun, dropping oldest"
				);
			}
		}
		self.outbox.push_back(payload);
	}

	/// Whether a drain task should be started for this sink.
	pub fn needs_drain(&self) -> bool {
		!self.draining && !self.outbox.is_empty() && !self.subscribers.is_empty()
	}

	pub fn mark_draining(&mut self) {
		self.draining = true;
	}

	pub fn clear_draining(&mut self) {
		self.draining = false;
	}

	/// Pop the next payload and the current delivery targets, pruning closed
	/// subscribers first. Returns `None` when there is nothing to deliver or
	/// nobody left to deliver to.
	pub fn pop_for_delivery(&mut self) -> Option<(String, Vec<mpsc::Sender<String>>)> {
		self.prune_closed();
		if self.subscribers.is_empty() {
			return None;
		}
		let payload = self.outbox.pop_front()?;
		let targets = self.subscribers.iter().map(|s| s.tx.clone()).collect();
		Some((payload, targets))
	}

	/// Broadcast a payload to every subscriber immediately (keepalive pings).
	pub fn send_direct(&mut self, payload: &str) {
		self.prune_closed();
		for sub in &self.subscribers {
			let _ = sub.send(payload.to_string());
		}
	}

	fn prune_closed(&mut self) {
		self.subscribers.retain(|s| !s.is_closed());
	}
}

impl std::fmt::Debug for AdapterSink {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AdapterSink")
			.field("adapter", &self.adapter.kind())
			.field("subscribers", &self.subscribers.len())
			.field("outbox", &self.outbox.len())
			.field("draining", &self.draining)
			.finish()
	}
}
