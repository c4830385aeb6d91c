#![forbid(unsafe_code)]

use chatrelay_domain::{AdapterKind, VideoId};
use chatrelay_platform::ChatEvent;

use super::OutputAdapter;

const SERVER_NAME: &str = "chat.relay";

/// IRC-style wire format: one PRIVMSG line per text chat message.
pub struct IrcAdapter {
	channel: String,
}

impl IrcAdapter {
	pub fn new(video_id: VideoId) -> Self {
		Self {
			channel: format!("#{video_id}"),
		}
	}
}

/// Collapse an author display name into something nick-shaped.
fn nick_of(name: &str) -> String {
	let nick: String = name
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
		.collect();
	if nick.is_empty() { "anonymous".to_string() } else { nick }
}

impl OutputAdapter for IrcAdapter {
	fn kind(&self) -> AdapterKind {
		AdapterKind::Irc
	}

	fn greeting(&self) -> Option<String> {
		Some(format!(":{SERVER_NAME} NOTICE {} :attached to live chat", self.channel))
	}

	fn transform(&self, event: &ChatEvent) -> Option<String> {
		let text = event.text.as_ref()?;
		let nick = nick_of(&text.author.name);
		// Strip line breaks so one message stays one IRC line.
		let body: String = text.text.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect();
		Some(format!(
			":{nick}!{user}@{SERVER_NAME} PRIVMSG {channel} :{body}",
			user = text.author.id,
			channel = self.channel,
		))
	}
}
