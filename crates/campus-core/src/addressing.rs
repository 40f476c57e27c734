//! Conversation addressing
//!
//! Two participants of a direct chat must land on the same node no matter
//! who opens the conversation. The address is built from the unordered pair:
//! the ids are sorted first, then joined as `{len(lo)}-{lo}{hi}`. The length
//! prefix keeps the join injective ("ab"+"c" and "a"+"bc" differ), and since
//! both ids are valid path segments the result is one as well.

use crate::identity::UserId;

/// Canonical path segment for the direct conversation between `a` and `b`
///
/// `conversation_address(a, b) == conversation_address(b, a)` for every pair,
/// including `a == b`.
pub fn conversation_address(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a.as_str() <= b.as_str() {
        (a.as_str(), b.as_str())
    } else {
        (b.as_str(), a.as_str())
    };
    format!("{}-{}{}", lo.len(), lo, hi)
}

/// Recover the two participants from an address, lower id first
pub fn participants(address: &str) -> Option<(UserId, UserId)> {
    let (len, rest) = address.split_once('-')?;
    let len: usize = len.parse().ok()?;
    if !rest.is_char_boundary(len) || len >= rest.len() {
        return None;
    }
    let (lo, hi) = rest.split_at(len);
    Some((UserId::new(lo).ok()?, UserId::new(hi).ok()?))
}

/// True when `user` takes part in the conversation at `address`
pub fn is_participant(address: &str, user: &UserId) -> bool {
    participants(address)
        .map(|(lo, hi)| &lo == user || &hi == user)
        .unwrap_or(false)
}
