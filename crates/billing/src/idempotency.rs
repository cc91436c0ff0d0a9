//! In-process idempotency ledger
//!
//! Fast-path cache of recently processed transaction references, fronting
//! the authoritative `find_success_payment` store lookup. Entries expire
//! after a TTL so the map stays bounded; expiry only falls back to the
//! store check, it never weakens idempotency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct IdempotencyLedger {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IdempotencyLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this reference was recorded within the TTL window.
    pub fn seen(&self, txn_ref: &str) -> bool {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .get(txn_ref)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Record a processed reference. Expired entries are evicted here so the
    /// map never grows past what one TTL window produces.
    pub fn record(&self, txn_ref: &str) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ttl = self.ttl;
        entries.retain(|_, at| at.elapsed() < ttl);
        entries.insert(txn_ref.to_string(), Instant::now());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_then_seen() {
        let ledger = IdempotencyLedger::default();
        assert!(!ledger.seen("pi_123"));
        ledger.record("pi_123");
        assert!(ledger.seen("pi_123"));
        assert!(!ledger.seen("pi_other"));
    }

    #[test]
    fn test_expired_entries_evicted_on_record() {
        let ledger = IdempotencyLedger::new(Duration::from_millis(0));
        ledger.record("pi_old");
        assert!(!ledger.seen("pi_old"));
        ledger.record("pi_new");
        // pi_old was evicted during the second record
        assert_eq!(ledger.len(), 1);
    }
}
