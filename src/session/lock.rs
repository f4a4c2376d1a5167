//! Ownership lock (DESIGN NOTES §9): a single-slot holder with
//! compare-and-swap semantics, gating OTA exclusivity without a generic
//! mutex around "whatever verb is currently running".

use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle identifying whoever holds the lock. `0` is reserved to mean
/// "no lock claimed" — every ordinary verb call passes it, and it can never
/// itself take the lock.
pub type HolderId = u64;

pub const NONE_HOLDER: HolderId = 0;

pub struct OwnershipLock {
    holder: AtomicU64,
}

impl OwnershipLock {
    pub fn new() -> Self {
        Self {
            holder: AtomicU64::new(NONE_HOLDER),
        }
    }

    /// Succeeds only if the lock is currently unheld.
    pub fn take(&self, holder: HolderId) -> bool {
        debug_assert_ne!(holder, NONE_HOLDER, "NONE_HOLDER can never take the lock");
        self.holder
            .compare_exchange(NONE_HOLDER, holder, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears the lock only if `holder` is the current owner.
    pub fn release(&self, holder: HolderId) -> bool {
        self.holder
            .compare_exchange(holder, NONE_HOLDER, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn held_by(&self) -> Option<HolderId> {
        match self.holder.load(Ordering::SeqCst) {
            NONE_HOLDER => None,
            id => Some(id),
        }
    }

    /// True if the lock is held by someone other than `holder` — the
    /// ownership gate every verb and `sendMessage` checks first (spec §4.4
    /// step 1, §4.5).
    pub fn blocks(&self, holder: HolderId) -> bool {
        matches!(self.held_by(), Some(current) if current != holder)
    }
}

impl Default for OwnershipLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_succeeds_only_when_free() {
        let lock = OwnershipLock::new();
        assert!(lock.take(7));
        assert!(!lock.take(8));
        assert!(lock.blocks(8));
        assert!(!lock.blocks(7));
    }

    #[test]
    fn release_requires_matching_holder() {
        let lock = OwnershipLock::new();
        lock.take(7);
        assert!(!lock.release(8));
        assert!(lock.blocks(8));
        assert!(lock.release(7));
        assert!(!lock.blocks(8));
    }
}
