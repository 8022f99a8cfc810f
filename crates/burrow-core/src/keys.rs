//! Key material and role resolution for a dilated session.
//!
//! The outer rendezvous handshake leaves both peers with a shared 32-byte
//! master key and each other's "side" string. Everything here is derived
//! deterministically from those two inputs, so both peers agree on roles
//! and keys without further negotiation.

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;

// Key-derivation contexts. Fixed forever: both peers must derive the same
// directional keys from the same master key.
const LEADER_TO_FOLLOWER: &str = "dilation: leader->follower";
const FOLLOWER_TO_LEADER: &str = "dilation: follower->leader";

/// Which peer orchestrates connection establishment.
///
/// The leader picks the active L2 and owns the generation counter; the
/// follower connects when told to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// Resolve roles by comparing side strings: the lexicographically
    /// greater side leads. Sides are random strings picked independently
    /// by each peer, so equal sides cannot occur.
    pub fn from_sides(ours: &str, theirs: &str) -> Role {
        debug_assert_ne!(ours, theirs, "side strings must differ");
        if ours > theirs {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// First subchannel id this role allocates. The leader takes odd ids
    /// from 1, the follower even ids from 2; id 0 is the control channel.
    /// Each side then counts up by 2, so allocations never collide.
    pub fn first_subchannel_id(self) -> u32 {
        match self {
            Role::Leader => 1,
            Role::Follower => 2,
        }
    }
}

/// A single 32-byte directional key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

/// The two directional session keys, as seen from the local peer.
///
/// Each direction uses its own key, so a recorded frame reflected back at
/// its sender can never decrypt successfully.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub outbound: Key,
    pub inbound: Key,
}

impl SessionKeys {
    /// Derive both directional keys from the wormhole master key and pick
    /// outbound/inbound by role.
    pub fn derive(master_key: &[u8; KEY_SIZE], role: Role) -> SessionKeys {
        let leader_to_follower = Key(blake3::derive_key(LEADER_TO_FOLLOWER, master_key));
        let follower_to_leader = Key(blake3::derive_key(FOLLOWER_TO_LEADER, master_key));
        match role {
            Role::Leader => SessionKeys {
                outbound: leader_to_follower,
                inbound: follower_to_leader,
            },
            Role::Follower => SessionKeys {
                outbound: follower_to_leader,
                inbound: leader_to_follower,
            },
        }
    }
}
