#![forbid(unsafe_code)]

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::{Badge, ChatEvent};
use serde::Serialize;
use serde_json::json;

use super::OutputAdapter;

/// Default wire format: one JSON envelope per text chat message.
pub struct JsonAdapter {
	video_id: VideoId,
}

impl JsonAdapter {
	pub fn new(video_id: VideoId) -> Self {
		Self { video_id }
	}
}

#[derive(Debug, Serialize)]
struct MessageEnvelope<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	id: &'a str,
	unix: i64,
	message: &'a str,
	author: AuthorEnvelope<'a>,
}

#[derive(Debug, Serialize)]
struct AuthorEnvelope<'a> {
	id: &'a str,
	name: &'a str,
	badges: &'a [Badge],
}

impl OutputAdapter for JsonAdapter {
	fn kind(&self) -> AdapterKind {
		AdapterKind::Json
	}

	fn greeting(&self) -> Option<String> {
		Some(
			json!({
				"debug": true,
				"message": format!("attached to live chat for {}", self.video_id),
			})
			.to_string(),
		)
	}

	fn transform(&self, event: &ChatEvent) -> Option<String> {
		let text = event.text.as_ref()?;
		let envelope = MessageEnvelope {
			kind: "message",
			id: &text.id,
			unix: event.timestamp_ms,
			message: &text.text,
			author: AuthorEnvelope {
				id: &text.author.id,
				name: &text.author.name,
				badges: &text.author.badges,
			},
		};
		serde_json::to_string(&envelope).ok()
	}
}
