#![forbid(unsafe_code)]

//! Pure mining of chat poll payloads: continuation extraction, action
//! gathering, and per-action parsing. Everything here is synchronous and
//! side-effect free; unknown subtrees stay `serde_json::Value`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value as JsonValue;

use crate::{Author, Badge, ChatEvent, ContinuationKind, PollOutcome, TextMessage};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Parse one chat poll response body into a `PollOutcome`.
pub fn parse_poll_payload(payload: &JsonValue, received_at_ms: i64) -> PollOutcome {
	let (next_continuation, suggested_delay, kind) = mine_continuation(payload);
	let events = gather_actions(payload)
		.into_iter()
		.filter_map(|action| parse_action(action, received_at_ms))
		.collect();

	PollOutcome {
		events,
		next_continuation,
		suggested_delay,
		kind,
	}
}

/// Known continuation variants in descending priority, paired with their kind.
const CONTINUATION_VARIANTS: [(&str, ContinuationKind); 3] = [
	("timedContinuationData", ContinuationKind::Timed),
	("invalidationContinuationData", ContinuationKind::Invalidation),
	("reloadContinuationData", ContinuationKind::Reload),
];

/// Extract the next continuation token from a poll response.
///
/// Walks `continuationContents.liveChatContinuation.continuations[*]` for the
/// known variants first; failing that, deep-scans the whole payload for any
/// string field named `continuation`.
///
/// Variant priority outranks array position: a `timedContinuationData` in a
/// later entry beats a `reloadContinuationData` in an earlier one. Real
/// responses carry a single entry, so this only matters for degenerate
/// payloads.
pub fn mine_continuation(payload: &JsonValue) -> (Option<String>, Option<Duration>, ContinuationKind) {
	if let Some(continuations) = payload
		.pointer("/continuationContents/liveChatContinuation/continuations")
		.and_then(JsonValue::as_array)
	{
		for (variant, kind) in CONTINUATION_VARIANTS {
			for entry in continuations {
				let Some(data) = entry.get(variant) else {
					continue;
				};
				if let Some(token) = data.get("continuation").and_then(JsonValue::as_str) {
					let delay = data.get("timeoutMs").and_then(JsonValue::as_u64).map(Duration::from_millis);
					return (Some(token.to_string()), delay, kind);
				}
			}
		}
	}

	if let Some(token) = find_continuation_anywhere(payload) {
		return (Some(token), None, ContinuationKind::Fallback);
	}

	(None, None, ContinuationKind::None)
}

/// Depth-first scan for any string field named `continuation`.
pub fn find_continuation_anywhere(value: &JsonValue) -> Option<String> {
	match value {
		JsonValue::Object(map) => {
			if let Some(token) = map.get("continuation").and_then(JsonValue::as_str) {
				return Some(token.to_string());
			}
			map.values().find_map(find_continuation_anywhere)
		}
		JsonValue::Array(items) => items.iter().find_map(find_continuation_anywhere),
		_ => None,
	}
}

/// Gather action objects from every location the platform is known to put them.
pub fn gather_actions(payload: &JsonValue) -> Vec<&JsonValue> {
	let mut actions = Vec::new();

	if let Some(items) = payload
		.pointer("/continuationContents/liveChatContinuation/actions")
		.and_then(JsonValue::as_array)
	{
		actions.extend(items);
	}

	if let Some(endpoints) = payload.get("onResponseReceivedEndpoints").and_then(JsonValue::as_array) {
		for endpoint in endpoints {
			for path in [
				"/appendContinuationItemsAction/continuationItems",
				"/reloadContinuationItemsCommand/continuationItems",
			] {
				if let Some(items) = endpoint.pointer(path).and_then(JsonValue::as_array) {
					actions.extend(items);
				}
			}
		}
	}

	actions
}

/// Parse a single action into a `ChatEvent`.
///
/// Returns `None` when the action is malformed; the caller skips it and the
/// rest of the batch is unaffected.
pub fn parse_action(action: &JsonValue, received_at_ms: i64) -> Option<ChatEvent> {
	let obj = action.as_object()?;

	if let Some(add) = obj.get("addChatItemAction") {
		let item = add.get("item")?.as_object()?;
		let (renderer_name, renderer) = item.iter().next()?;
		let renderer = renderer.as_object()?;

		let id = renderer.get("id").and_then(JsonValue::as_str).map(str::to_string);
		let timestamp_ms = renderer
			.get("timestampUsec")
			.and_then(JsonValue::as_str)
			.and_then(|s| s.trim().parse::<i64>().ok())
			.map(|usec| usec / 1_000)
			.unwrap_or(received_at_ms);

		let text = if renderer_name == "liveChatTextMessageRenderer" {
			// Text messages require an id downstream; a renderer without one
			// is malformed and the whole action is skipped.
			Some(parse_text_message(renderer, id.as_deref()?)?)
		} else {
			None
		};

		return Some(ChatEvent {
			id,
			timestamp_ms,
			action: action.clone(),
			text,
		});
	}

	// Non-add actions (deletions, pins, ticker updates) pass through with
	// whatever target id they carry and the receipt wall clock.
	let id = obj
		.values()
		.find_map(|v| v.get("targetItemId").and_then(JsonValue::as_str))
		.map(str::to_string);

	Some(ChatEvent {
		id,
		timestamp_ms: received_at_ms,
		action: action.clone(),
		text: None,
	})
}

fn parse_text_message(renderer: &serde_json::Map<String, JsonValue>, id: &str) -> Option<TextMessage> {
	let name = renderer.get("authorName")?.get("simpleText")?.as_str()?;
	let author_id = renderer.get("authorExternalChannelId")?.as_str()?;
	let runs = renderer.get("message")?.get("runs")?.as_array()?;

	let badges = renderer
		.get("authorBadges")
		.and_then(JsonValue::as_array)
		.map(|list| parse_badges(list))
		.unwrap_or_default();

	Some(TextMessage {
		id: id.to_string(),
		author: Author {
			id: author_id.to_string(),
			name: name.to_string(),
			badges,
		},
		text: runs_to_text(runs),
	})
}

fn runs_to_text(runs: &[JsonValue]) -> String {
	let mut out = String::new();
	for run in runs {
		if let Some(text) = run.get("text").and_then(JsonValue::as_str) {
			out.push_str(text);
		} else if let Some(emoji) = run.get("emoji") {
			let shortcut = emoji
				.pointer("/shortcuts/0")
				.and_then(JsonValue::as_str)
				.or_else(|| emoji.get("emojiId").and_then(JsonValue::as_str));
			if let Some(s) = shortcut {
				out.push_str(s);
			}
		}
	}
	out
}

fn parse_badges(list: &[JsonValue]) -> Vec<Badge> {
	list.iter()
		.filter_map(|entry| entry.get("liveChatAuthorBadgeRenderer"))
		.filter_map(|renderer| {
			let tooltip = renderer.get("tooltip").and_then(JsonValue::as_str).unwrap_or_default();
			if let Some(icon_type) = renderer.pointer("/icon/iconType").and_then(JsonValue::as_str) {
				return Some(Badge {
					tooltip: tooltip.to_string(),
					badge_type: icon_type.to_string(),
					badge: icon_type.to_string(),
				});
			}
			let url = renderer.pointer("/customThumbnail/thumbnails/0/url").and_then(JsonValue::as_str)?;
			Some(Badge {
				tooltip: tooltip.to_string(),
				badge_type: "custom".to_string(),
				badge: url.to_string(),
			})
		})
		.collect()
}
