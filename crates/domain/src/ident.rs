//! Time-ordered entity identifiers.
//!
//! IDs have the form `<prefix>_<12 hex><14 base62>` — 26 characters after
//! the underscore. The hex field encodes `(millis << 12) | counter` truncated
//! to 48 bits; the per-millisecond counter keeps IDs generated in the same
//! millisecond in insertion order. Descending mode bit-complements the hex
//! field so lexicographic order reverses creation order (sessions list
//! newest-first that way).

use parking_lot::Mutex;
use rand::Rng;

/// Session IDs sort newest-first.
pub const SESSION: &str = "ses";
/// Message IDs sort oldest-first.
pub const MESSAGE: &str = "msg";
/// Part IDs sort oldest-first.
pub const PART: &str = "prt";
/// Event IDs sort oldest-first.
pub const EVENT: &str = "evt";
/// Background task IDs sort oldest-first.
pub const TASK: &str = "tsk";

const TIME_MASK: u64 = 0xFFFF_FFFF_FFFF;
const COUNTER_BITS: u64 = 12;
const RANDOM_LEN: usize = 14;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

struct GenState {
    last_ms: u64,
    counter: u64,
}

static STATE: Mutex<GenState> = Mutex::new(GenState {
    last_ms: 0,
    counter: 0,
});

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Sample the clock and combine with the per-millisecond counter.
fn next_value() -> u64 {
    let mut state = STATE.lock();
    let now = now_ms();
    if now == state.last_ms {
        state.counter += 1;
    } else {
        state.last_ms = now;
        state.counter = 0;
    }
    ((now << COUNTER_BITS) | (state.counter & 0xFFF)) & TIME_MASK
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_LEN)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect()
}

fn encode(prefix: &str, value: u64) -> String {
    format!("{prefix}_{value:012x}{}", random_suffix())
}

/// Generate an ID whose lexicographic order matches creation order.
pub fn ascending(prefix: &str) -> String {
    encode(prefix, next_value())
}

/// Generate an ID whose lexicographic order reverses creation order.
pub fn descending(prefix: &str) -> String {
    encode(prefix, !next_value() & TIME_MASK)
}

/// Check that `id` carries the expected prefix tag.
pub fn validate(id: &str, prefix: &str) -> bool {
    id.len() > prefix.len() + 1
        && id.as_bytes()[prefix.len()] == b'_'
        && id.starts_with(prefix)
}

/// Recover the millisecond timestamp from an ascending ID.
///
/// Only defined for ascending IDs — descending IDs store the complement and
/// decode to garbage.
pub fn extract_timestamp(id: &str) -> Option<u64> {
    let hex = id.split_once('_')?.1.get(..12)?;
    let value = u64::from_str_radix(hex, 16).ok()?;
    Some(value >> COUNTER_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_ids_sort_in_creation_order() {
        let ids: Vec<String> = (0..200).map(|_| ascending(MESSAGE)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn descending_ids_sort_in_reverse_creation_order() {
        let ids: Vec<String> = (0..200).map(|_| descending(SESSION)).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.reverse();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn id_shape() {
        let id = ascending(MESSAGE);
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), "msg_".len() + 26);
        let hex = &id["msg_".len().."msg_".len() + 12];
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn validate_checks_prefix() {
        let id = ascending(SESSION);
        assert!(validate(&id, SESSION));
        assert!(!validate(&id, MESSAGE));
        assert!(!validate("ses", SESSION));
        assert!(!validate("", SESSION));
    }

    #[test]
    fn extract_timestamp_is_close_to_now() {
        let before = super::now_ms() & (TIME_MASK >> COUNTER_BITS);
        let id = ascending(MESSAGE);
        let ts = extract_timestamp(&id).unwrap();
        assert!(ts >= before);
        assert!(ts <= before + 1_000);
    }

    #[test]
    fn extract_timestamp_rejects_malformed() {
        assert!(extract_timestamp("nounderscore").is_none());
        assert!(extract_timestamp("msg_zzzz").is_none());
    }

    #[test]
    fn same_millisecond_ids_keep_insertion_order() {
        // A tight loop lands many IDs on the same millisecond; the counter
        // must keep them ordered pairwise.
        let ids: Vec<String> = (0..500).map(|_| ascending(PART)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn no_collisions_across_many_ids() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(ascending(EVENT)));
        }
    }
}
