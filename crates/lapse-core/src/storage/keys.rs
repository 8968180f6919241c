//! Key naming for the delay records.
//!
//! A delayed message owns two keys derived from its UUID:
//! - the timer key is the bare hyphenated UUID, stored empty with a TTL;
//! - the payload key is the timer key followed by [`PAYLOAD_SUFFIX`].
//!
//! A third, short-lived claim key ([`CLAIM_SUFFIX`]) marks a payload that one
//! dispatcher is moving to its topic, so a concurrent one backs off.
//!
//! Expiration events only carry the key name, so the timer key must be the
//! identifier itself. Anything that does not parse back to a UUIDv4 is not
//! ours and gets ignored.

use uuid::{Uuid, Version};

pub const PAYLOAD_SUFFIX: &str = ":payload";
pub const CLAIM_SUFFIX: &str = ":claim";

/// Length of a hyphenated UUID (`8-4-4-4-12`).
const HYPHENATED_LEN: usize = 36;

pub fn timer_key(id: &Uuid) -> String {
    id.hyphenated().to_string()
}

pub fn payload_key(id: &Uuid) -> String {
    format!("{}{PAYLOAD_SUFFIX}", id.hyphenated())
}

pub fn claim_key(id: &Uuid) -> String {
    format!("{}{CLAIM_SUFFIX}", id.hyphenated())
}

/// Glob pattern matching every payload key on a node.
pub fn payload_pattern() -> String {
    format!("*{PAYLOAD_SUFFIX}")
}

/// Decode a timer key. Only canonical hyphenated v4 UUIDs are accepted.
pub fn parse_timer_key(key: &str) -> Option<Uuid> {
    if key.len() != HYPHENATED_LEN {
        return None;
    }
    let id = Uuid::parse_str(key).ok()?;
    (id.get_version() == Some(Version::Random)).then_some(id)
}

/// Decode a payload key back to its message identifier.
pub fn parse_payload_key(key: &str) -> Option<Uuid> {
    key.strip_suffix(PAYLOAD_SUFFIX).and_then(parse_timer_key)
}

/// Keyevent channel carrying expired key names for a database.
pub fn expired_channel(db: i64) -> String {
    format!("__keyevent@{db}__:expired")
}
