#![forbid(unsafe_code)]

mod irc;
mod json;
mod raw;

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::ChatEvent;

pub use irc::IrcAdapter;
pub use json::JsonAdapter;
pub use raw::RawAdapter;

/// One output wire format.
///
/// Adapters are pure: they turn a chat event into an already-serialized
/// payload, or filter it for their subscribers by returning `None`. The relay
/// core depends on nothing beyond this trait.
pub trait OutputAdapter: Send + Sync {
	fn kind(&self) -> AdapterKind;

	/// First payload a newly attached subscriber receives, ahead of any
	/// queued chat.
	fn greeting(&self) -> Option<String>;

	/// Serialize one event for this wire format; `None` drops the event for
	/// this sink only.
	fn transform(&self, event: &ChatEvent) -> Option<String>;
}

/// Build the adapter backing a sink of the given kind.
pub fn make_adapter(kind: AdapterKind, video_id: &VideoId) -> Box<dyn OutputAdapter> {
	match kind {
		AdapterKind::Json => Box::new(JsonAdapter::new(video_id.clone())),
		AdapterKind::Irc => Box::new(IrcAdapter::new(video_id.clone())),
		AdapterKind::Raw => Box::new(RawAdapter::new(video_id.clone())),
	}
}
