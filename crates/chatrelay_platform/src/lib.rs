#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod events;
pub mod poller;

use std::time::Duration;

use async_trait::async_trait;
use chatrelay_domain::VideoId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::bootstrap::PageScraper;
use crate::poller::ChatPoller;

/// Session bootstrap scraped from a video watch page.
///
/// Immutable for the life of a chat session; the auto-heal path replaces it
/// wholesale with a freshly scraped snapshot.
#[derive(Debug, Clone)]
pub struct Bootstrap {
	pub api_key: String,
	pub client_version: String,
	pub visitor_data: String,
	pub initial_data: JsonValue,
	pub initial_continuation: String,
}

/// One platform-native chat action plus the fields the relay derives from it.
#[derive(Debug, Clone)]
pub struct ChatEvent {
	/// Platform message id, when the action carries one.
	pub id: Option<String>,

	/// Milliseconds since the Unix epoch: the action's `timestampUsec` when
	/// present, otherwise the wall clock at receipt.
	pub timestamp_ms: i64,

	/// The raw action object as received.
	pub action: JsonValue,

	/// Typed view for the common text-message variant.
	pub text: Option<TextMessage>,
}

/// Typed view of a text chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
	pub id: String,
	pub author: Author,
	pub text: String,
}

/// Message author reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub badges: Vec<Badge>,
}

/// Author badge as surfaced on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Badge {
	pub tooltip: String,
	#[serde(rename = "type")]
	pub badge_type: String,
	pub badge: String,
}

/// Which continuation variant a poll response carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationKind {
	Timed,
	Invalidation,
	Reload,
	/// Token found only by the generic deep scan.
	Fallback,
	/// No token anywhere in the response.
	None,
}

impl ContinuationKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ContinuationKind::Timed => "timed",
			ContinuationKind::Invalidation => "invalidation",
			ContinuationKind::Reload => "reload",
			ContinuationKind::Fallback => "fallback",
			ContinuationKind::None => "none",
		}
	}
}

/// Parsed result of one upstream poll.
#[derive(Debug, Clone)]
pub struct PollOutcome {
	pub events: Vec<ChatEvent>,
	pub next_continuation: Option<String>,
	pub suggested_delay: Option<Duration>,
	pub kind: ContinuationKind,
}

/// Errors from one upstream poll request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
	#[error("upstream returned status {0}")]
	HttpStatus(u16),
	#[error("upstream rate limit hit")]
	Throttled,
	#[error("upstream request timed out")]
	Timeout,
	#[error("transport error: {0}")]
	Transport(String),
}

/// Errors from scraping a watch page.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BootstrapError {
	#[error("watch page returned status {0}")]
	HttpStatus(u16),
	#[error("watch page missing {0}")]
	MissingField(&'static str),
	#[error("transport error: {0}")]
	Transport(String),
}

/// Upstream chat platform seam consumed by the relay core.
///
/// The production implementation talks to the real platform; tests inject
/// scripted fakes.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
	/// Fetch the video page and extract a fresh session bootstrap.
	async fn bootstrap(&self, video_id: &VideoId) -> Result<Bootstrap, BootstrapError>;

	/// Issue one long-poll request with the current continuation token.
	async fn poll(&self, bootstrap: &Bootstrap, continuation: &str) -> Result<PollOutcome, PollError>;
}

/// Tunables for the production upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
	pub watch_base_url: String,
	pub chat_base_url: String,
	pub user_agent: String,
	/// Hard per-request deadline for the chat endpoint.
	pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
	fn default() -> Self {
		Self {
			watch_base_url: "https://www.youtube.com".to_string(),
			chat_base_url: "https://www.youtube.com".to_string(),
			user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".to_string(),
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Production upstream: page scraper plus chat poller sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct InnertubeUpstream {
	scraper: PageScraper,
	poller: ChatPoller,
}

impl InnertubeUpstream {
	pub fn new(cfg: UpstreamConfig) -> Self {
		let http = reqwest::Client::new();
		Self {
			scraper: PageScraper::new(http.clone(), &cfg),
			poller: ChatPoller::new(http, &cfg),
		}
	}
}

#[async_trait]
impl Upstream for InnertubeUpstream {
	async fn bootstrap(&self, video_id: &VideoId) -> Result<Bootstrap, BootstrapError> {
		self.scraper.fetch(video_id).await
	}

	async fn poll(&self, bootstrap: &Bootstrap, continuation: &str) -> Result<PollOutcome, PollError> {
		self.poller.poll(bootstrap, continuation).await
	}
}
