#![forbid(unsafe_code)]

//! Single-flight long-poll client for the platform chat endpoint.

use std::time::Duration;

use reqwest::header;
use serde::Serialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::events;
use crate::{Bootstrap, PollError, PollOutcome, UpstreamConfig};

const LIVE_CHAT_PATH: &str = "/youtubei/v1/live_chat/get_live_chat";

/// Marker string the upstream emits when a hosted runtime exhausts its
/// subrequest quota.
const THROTTLE_MARKER: &str = "Too many subrequests";

#[derive(Debug, Clone)]
pub struct ChatPoller {
	http: reqwest::Client,
	chat_base_url: String,
	user_agent: String,
	request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct LiveChatRequest<'a> {
	context: RequestContext<'a>,
	continuation: &'a str,
	#[serde(rename = "currentPlayerState")]
	current_player_state: PlayerState,
}

#[derive(Debug, Serialize)]
struct RequestContext<'a> {
	client: ClientInfo<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
	client_name: &'static str,
	client_version: &'a str,
	visitor_data: &'a str,
	hl: &'static str,
	gl: &'static str,
	platform: &'static str,
	client_form_factor: &'static str,
}

#[derive(Debug, Serialize)]
struct PlayerState {
	#[serde(rename = "playerOffsetMs")]
	player_offset_ms: &'static str,
}

impl ChatPoller {
	pub fn new(http: reqwest::Client, cfg: &UpstreamConfig) -> Self {
		Self {
			http,
			chat_base_url: cfg.chat_base_url.clone(),
			user_agent: cfg.user_agent.clone(),
			request_timeout: cfg.request_timeout,
		}
	}

	fn endpoint(&self, api_key: &str) -> Result<Url, PollError> {
		let mut url = Url::parse(&self.chat_base_url).map_err(|e| PollError::Transport(format!("chat base url: {e}")))?;
		url.set_path(LIVE_CHAT_PATH);
		url.query_pairs_mut()
			.append_pair("key", api_key)
			.append_pair("prettyPrint", "false");
		Ok(url)
	}

	/// Issue one POST with the current continuation and mine the response.
	pub async fn poll(&self, bootstrap: &Bootstrap, continuation: &str) -> Result<PollOutcome, PollError> {
		let url = self.endpoint(&bootstrap.api_key)?;
		let body = LiveChatRequest {
			context: RequestContext {
				client: ClientInfo {
					client_name: "WEB",
					client_version: &bootstrap.client_version,
					visitor_data: &bootstrap.visitor_data,
					hl: "en",
					gl: "US",
					platform: "DESKTOP",
					client_form_factor: "UNKNOWN_FORM_FACTOR",
				},
			},
			continuation,
			current_player_state: PlayerState { player_offset_ms: "0" },
		};

		let resp = self
			.http
			.post(url)
			.header(header::USER_AGENT, &self.user_agent)
			.timeout(self.request_timeout)
			.json(&body)
			.send()
			.await
			.map_err(classify_transport)?;

		let status = resp.status();
		let text = resp.text().await.map_err(classify_transport)?;

		// The throttle signal can arrive with any status code.
		if text.contains(THROTTLE_MARKER) {
			return Err(PollError::Throttled);
		}
		if !status.is_success() {
			return Err(PollError::HttpStatus(status.as_u16()));
		}

		let payload: JsonValue =
			serde_json::from_str(&text).map_err(|e| PollError::Transport(format!("parse chat response: {e}")))?;

		Ok(events::parse_poll_payload(&payload, events::unix_ms_now()))
	}
}

fn classify_transport(err: reqwest::Error) -> PollError {
	if err.is_timeout() {
		PollError::Timeout
	} else {
		PollError::Transport(err.to_string())
	}
}
