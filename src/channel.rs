//! Channel naming and topic derivation.
//!
//! Channel names are dotted hierarchical identifiers (e.g. `DESKTOP.LOCK`).
//! The *topic* is the first segment and names the physical broker
//! destination; all hierarchy levels under one topic share it.

use crate::message::{Message, ATTR_RECIPIENTS};

/// Returns the topic of a channel: the substring before the first `.`,
/// or the whole string if no `.` is present.
pub fn topic_of(channel: &str) -> &str {
    match channel.find('.') {
        Some(idx) => &channel[..idx],
        None => channel,
    }
}

/// Returns true if the channel name is well-formed: non-empty, with no
/// empty segments.
pub fn is_valid(channel: &str) -> bool {
    !channel.is_empty() && channel.split('.').all(|segment| !segment.is_empty())
}

/// Check if a fired event name matches a subscribed channel.
///
/// Matching rules:
/// - Exact match: `DESKTOP` matches `DESKTOP`
/// - Hierarchical: `DESKTOP` matches `DESKTOP.LOCK` (prefix match with dot
///   separator), but never `DESKTOPX`
pub fn channel_matches(event: &str, subscribed: &str) -> bool {
    if event == subscribed {
        return true;
    }
    event.starts_with(subscribed) && event[subscribed.len()..].starts_with('.')
}

/// Encode endpoint ids as a single recipients string `,id1,id2,...,idN,`.
///
/// The leading/trailing delimiters guarantee that membership tests never
/// false-positive on partial id matches. An empty id list encodes as the
/// empty string, which readers treat the same as an absent attribute
/// ("all endpoints").
pub fn encode_recipients<I, S>(ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = String::new();
    for id in ids {
        if encoded.is_empty() {
            encoded.push(',');
        }
        encoded.push_str(id.as_ref());
        encoded.push(',');
    }
    encoded
}

/// Test membership of one endpoint id in an encoded recipients string.
pub fn recipients_contain(encoded: &str, endpoint_id: &str) -> bool {
    let token = format!(",{},", endpoint_id);
    encoded.contains(&token)
}

/// Delivery predicate for one (channel, endpoint) subscription.
///
/// A message matches when its type equals the channel or is a hierarchical
/// descendant of it, and its recipients attribute is absent/empty or
/// contains the endpoint id as one comma-delimited token.
///
/// For brokers with server-side filtering the same predicate is expressed
/// as a selector string via [`Selector::expression`]; brokers without it
/// (e.g. NATS) evaluate [`Selector::matches`] subscribe-side.
#[derive(Debug, Clone)]
pub struct Selector {
    channel: String,
    endpoint_id: String,
}

impl Selector {
    pub fn new(channel: impl Into<String>, endpoint_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            endpoint_id: endpoint_id.into(),
        }
    }

    /// The boolean selector expression for selector-capable brokers.
    pub fn expression(&self) -> String {
        format!(
            "(type = '{c}' OR type LIKE '{c}.%') AND (recipients IS NULL OR recipients LIKE '%,{e},%')",
            c = self.channel,
            e = self.endpoint_id
        )
    }

    /// Evaluate the predicate locally against a message.
    pub fn matches(&self, message: &Message) -> bool {
        if !channel_matches(&message.kind, &self.channel) {
            return false;
        }
        match message.metadata.get(ATTR_RECIPIENTS) {
            None => true,
            Some(recipients) if recipients.is_empty() => true,
            Some(recipients) => recipients_contain(recipients, &self.endpoint_id),
        }
    }
}
