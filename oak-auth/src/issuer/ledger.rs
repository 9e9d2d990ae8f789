//! Outstanding-challenge ledger.
//!
//! The issuer remembers exactly one outstanding challenge per key id. Minting
//! a new token supersedes the previous challenge, and redeeming consumes it,
//! so each challenge authenticates at most one request.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use subtle::ConstantTimeEq;

use crate::identity::KeyId;

/// Outcome of redeeming a challenge response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The response matched the outstanding challenge, which is now consumed.
    Accepted,
    /// No challenge is outstanding (never issued, or already redeemed).
    NoOutstanding,
    /// A challenge is outstanding but the response is for a different one.
    Mismatch,
    /// The outstanding challenge is older than the TTL; it has been dropped.
    Expired,
}

/// Trait for tracking issued challenges.
///
/// # Thread Safety
///
/// Uses `&self` to allow concurrent access. Implementations should use
/// interior mutability (e.g., `Mutex`, `DashMap`).
///
/// # Atomicity
///
/// `redeem` **MUST be atomic**: of two concurrent redemptions of the same
/// challenge, at most one may return [`RedeemOutcome::Accepted`]. Check and
/// removal must happen under one lock or one compare-and-swap.
pub trait ChallengeLedger: Send + Sync {
    /// Record `challenge` as the outstanding challenge for `key_id`,
    /// replacing any previous one.
    fn issue(&self, key_id: &KeyId, challenge: &[u8], now_utc_seconds: i64);

    /// Check `response` against the outstanding challenge and consume it.
    fn redeem(&self, key_id: &KeyId, response: &[u8], now_utc_seconds: i64) -> RedeemOutcome;
}

struct Outstanding {
    digest: [u8; 32],
    issued_at: i64,
}

/// TTL + capacity bounded in-memory ledger.
///
/// # Security Properties
///
/// - One outstanding challenge per key id
/// - Challenges are stored as SHA-256 digests and compared in constant time
/// - Memory-bounded via `max_entries`
/// - Lock-free concurrent access via DashMap
///
/// # Usage
///
/// ```
/// use oak_auth::issuer::MemoryLedger;
///
/// let ledger = MemoryLedger::new(300, 100_000);
/// assert!(ledger.is_empty());
/// ```
pub struct MemoryLedger {
    entries: DashMap<KeyId, Outstanding>,
    ttl_seconds: i64,
    max_entries: usize,
    /// Counter for periodic cleanup (avoids cleanup on every insert)
    issue_counter: AtomicU64,
}

impl MemoryLedger {
    /// Create a ledger whose challenges expire after `ttl_seconds`.
    ///
    /// When `max_entries` is reached the ledger first drops expired entries,
    /// then evicts an arbitrary one; that session must re-bootstrap.
    /// `max_entries` is clamped to at least 1.
    #[must_use]
    pub fn new(ttl_seconds: i64, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: DashMap::with_capacity(max_entries.min(1024)),
            ttl_seconds,
            max_entries,
            issue_counter: AtomicU64::new(0),
        }
    }

    /// Remove challenges older than the TTL.
    pub fn cleanup_expired(&self, now_utc_seconds: i64) {
        self.entries
            .retain(|_, entry| now_utc_seconds.saturating_sub(entry.issued_at) <= self.ttl_seconds);
    }

    /// Number of outstanding challenges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no challenge is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChallengeLedger for MemoryLedger {
    fn issue(&self, key_id: &KeyId, challenge: &[u8], now_utc_seconds: i64) {
        let count = self.issue_counter.fetch_add(1, Ordering::Relaxed);
        if count % 1000 == 0 {
            self.cleanup_expired(now_utc_seconds);
        }

        if !self.entries.contains_key(key_id) && self.entries.len() >= self.max_entries {
            self.cleanup_expired(now_utc_seconds);
            if self.entries.len() >= self.max_entries {
                let victim = self.entries.iter().next().map(|entry| entry.key().clone());
                if let Some(victim) = victim {
                    self.entries.remove(&victim);
                }
            }
        }

        self.entries.insert(
            key_id.clone(),
            Outstanding {
                digest: Sha256::digest(challenge).into(),
                issued_at: now_utc_seconds,
            },
        );
    }

    fn redeem(&self, key_id: &KeyId, response: &[u8], now_utc_seconds: i64) -> RedeemOutcome {
        let digest: [u8; 32] = Sha256::digest(response).into();

        // Entry API holds the shard lock across check and removal.
        match self.entries.entry(key_id.clone()) {
            Entry::Vacant(_) => RedeemOutcome::NoOutstanding,
            Entry::Occupied(entry) => {
                let outstanding = entry.get();
                if now_utc_seconds.saturating_sub(outstanding.issued_at) > self.ttl_seconds {
                    entry.remove();
                    RedeemOutcome::Expired
                } else if bool::from(outstanding.digest.ct_eq(&digest)) {
                    entry.remove();
                    RedeemOutcome::Accepted
                } else {
                    RedeemOutcome::Mismatch
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(n: u8) -> KeyId {
        KeyId::new(format!("KEY{n:02X}")).unwrap()
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_redeem_issued_challenge() {
        let ledger = MemoryLedger::new(300, 1000);
        ledger.issue(&key(1), b"nonce-1", NOW);

        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW + 1), RedeemOutcome::Accepted);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_second_redeem_is_replay() {
        let ledger = MemoryLedger::new(300, 1000);
        ledger.issue(&key(1), b"nonce-1", NOW);

        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW), RedeemOutcome::Accepted);
        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW), RedeemOutcome::NoOutstanding);
    }

    #[test]
    fn test_mismatch_keeps_challenge() {
        let ledger = MemoryLedger::new(300, 1000);
        ledger.issue(&key(1), b"nonce-2", NOW);

        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW), RedeemOutcome::Mismatch);
        assert_eq!(ledger.redeem(&key(1), b"nonce-2", NOW), RedeemOutcome::Accepted);
    }

    #[test]
    fn test_new_issue_supersedes_old() {
        let ledger = MemoryLedger::new(300, 1000);
        ledger.issue(&key(1), b"nonce-1", NOW);
        ledger.issue(&key(1), b"nonce-2", NOW);

        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW), RedeemOutcome::Mismatch);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_expired_challenge() {
        let ledger = MemoryLedger::new(30, 1000);
        ledger.issue(&key(1), b"nonce-1", NOW);

        // Exactly at the boundary is still valid.
        ledger.issue(&key(2), b"nonce-2", NOW);
        assert_eq!(ledger.redeem(&key(2), b"nonce-2", NOW + 30), RedeemOutcome::Accepted);

        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW + 31), RedeemOutcome::Expired);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let ledger = MemoryLedger::new(300, 1000);
        ledger.issue(&key(1), b"same", NOW);
        ledger.issue(&key(2), b"same", NOW);

        assert_eq!(ledger.redeem(&key(1), b"same", NOW), RedeemOutcome::Accepted);
        assert_eq!(ledger.redeem(&key(2), b"same", NOW), RedeemOutcome::Accepted);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let max_entries = 10;
        let ledger = MemoryLedger::new(300, max_entries);

        for n in 0..(max_entries as u8 + 5) {
            ledger.issue(&key(n), b"nonce", NOW);
        }

        assert!(ledger.len() <= max_entries);
    }

    #[test]
    fn test_zero_capacity_holds_one_challenge() {
        let ledger = MemoryLedger::new(300, 0);
        ledger.issue(&key(1), b"nonce-1", NOW);
        ledger.issue(&key(2), b"nonce-2", NOW);

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.redeem(&key(2), b"nonce-2", NOW), RedeemOutcome::Accepted);
        assert_eq!(ledger.redeem(&key(1), b"nonce-1", NOW), RedeemOutcome::NoOutstanding);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let ledger = MemoryLedger::new(10, 1000);
        ledger.issue(&key(1), b"old", NOW);
        ledger.issue(&key(2), b"new", NOW + 15);

        ledger.cleanup_expired(NOW + 15);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.redeem(&key(2), b"new", NOW + 15), RedeemOutcome::Accepted);
    }

    #[test]
    fn test_concurrent_redeem() {
        let ledger = Arc::new(MemoryLedger::new(300, 1000));
        ledger.issue(&key(7), b"contested", NOW);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.redeem(&key(7), b"contested", NOW))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == RedeemOutcome::Accepted)
            .count();
        assert_eq!(accepted, 1, "Exactly one concurrent redemption should succeed");
    }
}
