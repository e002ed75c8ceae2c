//! Identifiers and resume tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Client (connection) identifier. Monotonic, never reused in-process.
pub type ClientId = u64;

/// Allocator for client ids.
///
/// Ids start at 1 so that 0 can never be mistaken for a live client.
#[derive(Debug)]
pub struct ClientIdGen {
    next: AtomicU64,
}

impl ClientIdGen {
    /// Create a new generator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next client id.
    pub fn next_id(&self) -> ClientId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ClientIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Secret credential for reclaiming a disconnected session.
///
/// 32 bytes of entropy (two v4 UUIDs), URL-safe base64 without padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Generate a fresh token.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Token text as presented on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check a candidate token supplied by a reconnecting client.
    ///
    /// Constant time over the token bytes; only the length check can
    /// terminate early.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let token = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if token.len() != candidate.len() {
            return false;
        }
        let diff = token
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl From<String> for ResumeToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}
