#![forbid(unsafe_code)]

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::ChatEvent;
use serde_json::json;

use super::OutputAdapter;

/// Pass-through wire format: the platform-native action object, unmodified.
pub struct RawAdapter {
	video_id: VideoId,
}

impl RawAdapter {
	pub fn new(video_id: VideoId) -> Self {
		Self { video_id }
	}
}

impl OutputAdapter for RawAdapter {
	fn kind(&self) -> AdapterKind {
		AdapterKind::Raw
	}

	fn greeting(&self) -> Option<String> {
		Some(
			json!({
				"debug": true,
				"message": format!("attached to live chat for {} (raw actions)", self.video_id),
			})
			.to_string(),
		)
	}

	fn transform(&self, event: &ChatEvent) -> Option<String> {
		Some(event.action.to_string())
	}
}
