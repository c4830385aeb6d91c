#![forbid(unsafe_code)]

//! Watch-page scraper: extracts the chat session bootstrap (api key, client
//! version, visitor token, initial data, initial continuation) from the
//! public video page.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header;
use serde_json::Value as JsonValue;
use tracing::debug;

use chatrelay_domain::VideoId;

use crate::events::find_continuation_anywhere;
use crate::{Bootstrap, BootstrapError, UpstreamConfig};

static API_KEY_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#""INNERTUBE_API_KEY"\s*:\s*"([^"]+)""#).expect("static regex"));
static CLIENT_VERSION_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#""INNERTUBE_CONTEXT_CLIENT_VERSION"\s*:\s*"([^"]+)""#).expect("static regex"));
static VISITOR_DATA_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#""visitorData"\s*:\s*"([^"]+)""#).expect("static regex"));

#[derive(Debug, Clone)]
pub struct PageScraper {
	http: reqwest::Client,
	watch_base_url: String,
	user_agent: String,
	request_timeout: Duration,
}

impl PageScraper {
	pub fn new(http: reqwest::Client, cfg: &UpstreamConfig) -> Self {
		Self {
			http,
			watch_base_url: cfg.watch_base_url.clone(),
			user_agent: cfg.user_agent.clone(),
			request_timeout: cfg.request_timeout,
		}
	}

	/// Fetch the watch page for `video_id` and extract a bootstrap snapshot.
	pub async fn fetch(&self, video_id: &VideoId) -> Result<Bootstrap, BootstrapError> {
		let url = format!("{}/watch?v={}", self.watch_base_url.trim_end_matches('/'), video_id.as_str());

		let resp = self
			.http
			.get(url)
			.header(header::USER_AGENT, &self.user_agent)
			.header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
			.timeout(self.request_timeout)
			.send()
			.await
			.map_err(|e| BootstrapError::Transport(e.to_string()))?;

		if !resp.status().is_success() {
			return Err(BootstrapError::HttpStatus(resp.status().as_u16()));
		}

		let page = resp.text().await.map_err(|e| BootstrapError::Transport(e.to_string()))?;
		let bootstrap = parse_watch_page(&page)?;

		debug!(
			video_id = %video_id,
			client_version = %bootstrap.client_version,
			continuation_len = bootstrap.initial_continuation.len(),
			"scraped watch page bootstrap"
		);

		Ok(bootstrap)
	}
}

/// Extract a bootstrap from raw watch-page HTML.
pub fn parse_watch_page(page: &str) -> Result<Bootstrap, BootstrapError> {
	let api_key = capture(&API_KEY_RE, page).ok_or(BootstrapError::MissingField("INNERTUBE_API_KEY"))?;
	let client_version =
		capture(&CLIENT_VERSION_RE, page).ok_or(BootstrapError::MissingField("INNERTUBE_CONTEXT_CLIENT_VERSION"))?;
	let visitor_data = capture(&VISITOR_DATA_RE, page).ok_or(BootstrapError::MissingField("visitorData"))?;

	let initial_json = extract_json_after(page, "ytInitialData").ok_or(BootstrapError::MissingField("ytInitialData"))?;
	let initial_data: JsonValue =
		serde_json::from_str(initial_json).map_err(|e| BootstrapError::Transport(format!("parse ytInitialData: {e}")))?;

	let initial_continuation =
		initial_continuation(&initial_data).ok_or(BootstrapError::MissingField("live chat continuation"))?;

	Ok(Bootstrap {
		api_key,
		client_version,
		visitor_data,
		initial_data,
		initial_continuation,
	})
}

fn capture(re: &Regex, page: &str) -> Option<String> {
	re.captures(page).map(|c| c[1].to_string())
}

/// Slice the balanced JSON object that follows the first occurrence of
/// `marker` (skipping past the `=` or `:` assignment between them).
fn extract_json_after<'a>(page: &'a str, marker: &str) -> Option<&'a str> {
	let at = page.find(marker)?;
	let rest = &page[at + marker.len()..];
	let open = rest.find('{')?;
	let body = &rest[open..];

	let mut depth = 0usize;
	let mut in_string = false;
	let mut escaped = false;
	for (idx, b) in body.bytes().enumerate() {
		if escaped {
			escaped = false;
			continue;
		}
		match b {
			b'\\' if in_string => escaped = true,
			b'"' => in_string = !in_string,
			b'{' if !in_string => depth += 1,
			b'}' if !in_string => {
				depth -= 1;
				if depth == 0 {
					return Some(&body[..=idx]);
				}
			}
			_ => {}
		}
	}
	None
}

/// Find the initial live-chat continuation inside the page's initial data.
///
/// Prefers the `liveChatRenderer.continuations` entries; falls back to a deep
/// scan of that renderer subtree.
fn initial_continuation(initial_data: &JsonValue) -> Option<String> {
	let renderer = find_object_named(initial_data, "liveChatRenderer")?;

	if let Some(continuations) = renderer.get("continuations").and_then(JsonValue::as_array) {
		for entry in continuations {
			for variant in [
				"reloadContinuationData",
				"timedContinuationData",
				"invalidationContinuationData",
			] {
				if let Some(token) = entry.pointer(&format!("/{variant}/continuation")).and_then(JsonValue::as_str) {
					return Some(token.to_string());
				}
			}
		}
	}

	find_continuation_anywhere(renderer)
}

/// Depth-first scan for the first object stored under a field named `key`.
fn find_object_named<'a>(value: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
	match value {
		JsonValue::Object(map) => {
			if let Some(found) = map.get(key)
				&& found.is_object()
			{
				return Some(found);
			}
			map.values().find_map(|v| find_object_named(v, key))
		}
		JsonValue::Array(items) => items.iter().find_map(|v| find_object_named(v, key)),
		_ => None,
	}
}
