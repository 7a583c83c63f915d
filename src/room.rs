use std::fmt;

use serde::{Deserialize, Serialize};

/// Key of the single public room every user can read and write.
pub const PUBLIC_ROOM: &str = "public_chat";

/// Canonical identifier of a conversation channel.
///
/// Rooms are never created explicitly; the first message written under
/// a key materializes the room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn public() -> Self {
        RoomKey(PUBLIC_ROOM.to_owned())
    }

    /// Private room between two users. Symmetric: both participants
    /// derive the same key independently, regardless of argument order.
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        RoomKey(format!("private_{lo}_{hi}"))
    }

    /// Key for a session's conversation; `None` means the public room.
    pub fn for_conversation(me: &str, partner: Option<&str>) -> Self {
        match partner {
            Some(partner) => Self::direct(me, partner),
            None => Self::public(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC_ROOM
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_is_symmetric() {
        assert_eq!(RoomKey::direct("alice", "bob"), RoomKey::direct("bob", "alice"));
        assert_eq!(RoomKey::direct("alice", "bob").as_str(), "private_alice_bob");
    }

    #[test]
    fn distinct_pairs_get_distinct_keys() {
        assert_ne!(RoomKey::direct("alice", "bob"), RoomKey::direct("alice", "carol"));
        assert_ne!(RoomKey::direct("alice", "bob"), RoomKey::public());
    }

    #[test]
    fn no_partner_means_public() {
        assert_eq!(RoomKey::for_conversation("alice", None), RoomKey::public());
        assert!(RoomKey::public().is_public());
        assert!(!RoomKey::direct("alice", "bob").is_public());
    }
}
