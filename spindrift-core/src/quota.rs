//! Disk quota accounting for segment storage.
//!
//! One process-wide ledger tracks every byte of segment data attributable
//! to registered sessions, plus up-front reservations for encode runs that
//! have started but not yet produced output. Checks fail fast; nothing in
//! this module ever blocks on I/O or waits for space to free up.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::session::SessionId;

/// Errors from quota reservation checks.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Disk quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QuotaUsage {
    pub capacity_bytes: u64,
    /// Bytes of ready/writing segments on disk
    pub used_bytes: u64,
    /// Bytes reserved for runs that have not produced them yet
    pub reserved_bytes: u64,
}

impl QuotaUsage {
    /// Bytes still grantable to new reservations or writes.
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.used_bytes + self.reserved_bytes)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionUsage {
    used: u64,
    reserved: u64,
}

#[derive(Debug)]
struct Ledger {
    used: u64,
    reserved: u64,
    sessions: HashMap<SessionId, SessionUsage>,
}

/// Process-wide disk quota manager.
///
/// The ledger lock is a plain mutex taken per operation; it is never held
/// across an await point or any blocking wait.
pub struct DiskQuotaManager {
    capacity: u64,
    ledger: Mutex<Ledger>,
}

impl DiskQuotaManager {
    /// Create new quota manager with the configured capacity.
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            capacity: config.capacity_bytes,
            ledger: Mutex::new(Ledger {
                used: 0,
                reserved: 0,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Reserve headroom for a new encode run. Never blocks.
    ///
    /// # Errors
    /// - `QuotaError::QuotaExceeded` - Granting the reservation would push
    ///   used + reserved past capacity; the caller must not start the run
    pub fn reserve(&self, session_id: SessionId, bytes: u64) -> Result<(), QuotaError> {
        let mut ledger = self.ledger.lock();

        let committed = ledger.used + ledger.reserved;
        let available = self.capacity.saturating_sub(committed);
        if bytes > available {
            warn!(
                "Quota reservation denied for {}: requested {}, available {}",
                session_id, bytes, available
            );
            return Err(QuotaError::QuotaExceeded {
                requested: bytes,
                available,
            });
        }

        ledger.reserved += bytes;
        ledger.sessions.entry(session_id).or_default().reserved += bytes;
        debug!("Reserved {} bytes for {}", bytes, session_id);
        Ok(())
    }

    /// Record bytes actually written for a session's segment.
    ///
    /// The session's outstanding reservation absorbs the write first; only
    /// the excess counts against free capacity.
    ///
    /// # Errors
    /// - `QuotaError::QuotaExceeded` - The write would breach capacity; the
    ///   caller must throttle or stop the offending session
    pub fn commit(&self, session_id: SessionId, bytes: u64) -> Result<(), QuotaError> {
        let mut ledger = self.ledger.lock();

        let entry = ledger.sessions.entry(session_id).or_default();
        let from_reservation = entry.reserved.min(bytes);
        let excess = bytes - from_reservation;

        let committed = ledger.used + ledger.reserved;
        let available = self.capacity.saturating_sub(committed);
        if excess > available {
            return Err(QuotaError::QuotaExceeded {
                requested: excess,
                available,
            });
        }

        let entry = ledger.sessions.entry(session_id).or_default();
        entry.reserved -= from_reservation;
        entry.used += bytes;
        ledger.reserved -= from_reservation;
        ledger.used += bytes;
        Ok(())
    }

    /// Return a discarded segment's bytes to the pool. Idempotent callers
    /// must not double-release; the store guards that.
    pub fn release(&self, session_id: SessionId, bytes: u64) {
        let mut ledger = self.ledger.lock();

        if let Some(entry) = ledger.sessions.get_mut(&session_id) {
            let freed = entry.used.min(bytes);
            entry.used -= freed;
            ledger.used -= freed;
            debug!("Released {} bytes for {}", freed, session_id);
        }
    }

    /// Drop any reservation the session still holds, keeping written bytes.
    ///
    /// Called when an encode run ends; produced segments stay accounted
    /// until discarded.
    pub fn cancel_reservation(&self, session_id: SessionId) {
        let mut ledger = self.ledger.lock();

        if let Some(entry) = ledger.sessions.get_mut(&session_id) {
            let returned = entry.reserved;
            entry.reserved = 0;
            ledger.reserved -= returned;
        }
    }

    /// Remove a session from the ledger entirely, freeing all its bytes.
    ///
    /// After this the manager reports zero usage for the session, matching
    /// the registry no longer knowing it.
    pub fn drop_session(&self, session_id: SessionId) -> u64 {
        let mut ledger = self.ledger.lock();

        match ledger.sessions.remove(&session_id) {
            Some(entry) => {
                ledger.used -= entry.used;
                ledger.reserved -= entry.reserved;
                debug!(
                    "Dropped {} from quota ledger ({} used, {} reserved freed)",
                    session_id, entry.used, entry.reserved
                );
                entry.used + entry.reserved
            }
            None => 0,
        }
    }

    /// Current aggregate usage.
    pub fn usage(&self) -> QuotaUsage {
        let ledger = self.ledger.lock();
        QuotaUsage {
            capacity_bytes: self.capacity,
            used_bytes: ledger.used,
            reserved_bytes: ledger.reserved,
        }
    }

    /// Bytes currently attributed to one session, zero if unregistered.
    pub fn session_bytes(&self, session_id: SessionId) -> u64 {
        let ledger = self.ledger.lock();
        ledger
            .sessions
            .get(&session_id)
            .map(|e| e.used + e.reserved)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(capacity: u64) -> DiskQuotaManager {
        DiskQuotaManager::new(&QuotaConfig {
            capacity_bytes: capacity,
            run_reservation_bytes: 0,
        })
    }

    #[test]
    fn test_reserve_within_capacity() {
        let quota = manager(1000);
        let session = SessionId::new();

        quota.reserve(session, 600).unwrap();
        assert_eq!(quota.usage().reserved_bytes, 600);
        assert_eq!(quota.usage().available_bytes(), 400);
    }

    #[test]
    fn test_reserve_beyond_capacity_fails_fast() {
        let quota = manager(1000);
        let a = SessionId::new();
        let b = SessionId::new();

        quota.reserve(a, 800).unwrap();
        let err = quota.reserve(b, 300).unwrap_err();
        assert_eq!(
            err,
            QuotaError::QuotaExceeded {
                requested: 300,
                available: 200
            }
        );
        // Failed reservations leave the ledger untouched.
        assert_eq!(quota.session_bytes(b), 0);
    }

    #[test]
    fn test_commit_consumes_reservation_first() {
        let quota = manager(1000);
        let session = SessionId::new();

        quota.reserve(session, 500).unwrap();
        quota.commit(session, 300).unwrap();

        let usage = quota.usage();
        assert_eq!(usage.used_bytes, 300);
        assert_eq!(usage.reserved_bytes, 200);
        // Total committed is unchanged: the write came out of the reservation.
        assert_eq!(usage.available_bytes(), 500);
    }

    #[test]
    fn test_commit_excess_respects_capacity() {
        let quota = manager(1000);
        let session = SessionId::new();

        quota.reserve(session, 100).unwrap();
        quota.commit(session, 900).unwrap();
        assert!(quota.commit(session, 200).is_err());
    }

    #[test]
    fn test_release_and_drop_leave_no_residue() {
        let quota = manager(1000);
        let session = SessionId::new();

        quota.reserve(session, 200).unwrap();
        quota.commit(session, 500).unwrap();
        quota.release(session, 100);
        assert_eq!(quota.session_bytes(session), 400);

        let freed = quota.drop_session(session);
        assert_eq!(freed, 400);
        assert_eq!(quota.usage().used_bytes, 0);
        assert_eq!(quota.usage().reserved_bytes, 0);
        assert_eq!(quota.session_bytes(session), 0);
    }

    #[test]
    fn test_cancel_reservation_keeps_written_bytes() {
        let quota = manager(1000);
        let session = SessionId::new();

        quota.reserve(session, 400).unwrap();
        quota.commit(session, 250).unwrap();
        quota.cancel_reservation(session);

        let usage = quota.usage();
        assert_eq!(usage.used_bytes, 250);
        assert_eq!(usage.reserved_bytes, 0);
    }
}
