#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid video id: {0}")]
	InvalidVideoId(String),
	#[error("unknown adapter: {0}")]
	UnknownAdapter(String),
}

/// Platform video identifier: exactly 11 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
	pub const LEN: usize = 11;

	/// Create a validated `VideoId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.len() != Self::LEN || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
			return Err(ParseIdError::InvalidVideoId(id));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for VideoId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for VideoId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		VideoId::new(s.to_string())
	}
}

/// Output adapter families a subscriber may request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
	#[default]
	Json,
	Irc,
	Raw,
}

impl AdapterKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			AdapterKind::Json => "json",
			AdapterKind::Irc => "irc",
			AdapterKind::Raw => "raw",
		}
	}
}

impl fmt::Display for AdapterKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AdapterKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"json" => Ok(AdapterKind::Json),
			"irc" => Ok(AdapterKind::Irc),
			"raw" => Ok(AdapterKind::Raw),
			other => Err(ParseIdError::UnknownAdapter(other.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn video_id_accepts_canonical_form() {
		let id = VideoId::new("dQw4w9WgXcQ").unwrap();
		assert_eq!(id.as_str(), "dQw4w9WgXcQ");
		assert_eq!(id.to_string(), "dQw4w9WgXcQ");
	}

	#[test]
	fn video_id_accepts_underscore_and_dash() {
		assert!(VideoId::new("a_b-C_d-E_f").is_ok());
	}

	#[test]
	fn video_id_rejects_bad_input() {
		assert_eq!(VideoId::new(""), Err(ParseIdError::Empty));
		assert!(VideoId::new("short").is_err());
		assert!(VideoId::new("exactly12chr").is_err());
		assert!(VideoId::new("has space!!").is_err());
		assert!(VideoId::new("ütf8isnotok").is_err());
	}

	#[test]
	fn adapter_kind_parse_and_display() {
		assert_eq!("json".parse::<AdapterKind>().unwrap(), AdapterKind::Json);
		assert_eq!("IRC".parse::<AdapterKind>().unwrap(), AdapterKind::Irc);
		assert_eq!(AdapterKind::Raw.to_string(), "raw");
		assert_eq!(AdapterKind::default(), AdapterKind::Json);
		assert!("xml".parse::<AdapterKind>().is_err());
	}
}
