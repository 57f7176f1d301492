//! Opaque identifiers used throughout the relay
//!
//! `Topic`, `SocketId` and `SubscriptionId` are all 32-byte values carried as
//! 64-character lowercase hex strings on the wire. The relay never inspects
//! their structure beyond that; it only ever compares, hashes and stores them.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

fn random_hex32() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

macro_rules! hex_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, random 32-byte identifier.
            pub fn generate() -> Self {
                Self(random_hex32())
            }

            /// Wrap an existing hex string without validating its shape.
            ///
            /// Used when the value arrives from the wire or from storage and
            /// has already been validated, or where validation is the caller's
            /// responsibility (e.g. topics are opaque and off-band agreed).
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the underlying hex string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

hex_id!(
    Topic,
    "A 64-character lowercase hex routing tag, opaque to the relay."
);
hex_id!(
    SocketId,
    "A fresh identifier assigned to a connection at accept time."
);
hex_id!(
    SubscriptionId,
    "A revocable handle returned to a subscriber by `subscribe`."
);
hex_id!(
    NodeId,
    "Identifies one relay process on the shared store's cross-node channels, \
     so a node can recognize and skip its own cross-node echoes."
);

/// sha256 content hash of a message payload, hex-encoded.
///
/// Used to key retained messages so a publisher can safely republish to
/// recover a lost ack without creating a duplicate retention entry.
pub fn message_hash(payload: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_ids() {
        let a = SocketId::generate();
        let b = SocketId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn message_hash_is_deterministic_and_content_addressed() {
        let h1 = message_hash("hello");
        let h2 = message_hash("hello");
        let h3 = message_hash("world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
