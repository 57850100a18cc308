//! Crash injection utilities for testing crash recovery.
//!
//! A [`CrashInjector`] counts the writes and syncs a storage wrapper reports
//! and decides when a simulated crash happens. After the crash every further
//! operation of the wrapper should fail, freezing the stored bytes in the
//! state a power loss would leave behind.
//!
//! # Crash Points
//!
//! The [`CrashPoint`] enum models points in the staged header commit:
//!
//! ```text
//! Write data → Sync → Write staged header → Sync → Write primary header → Sync
//!          ↑       ↑                                ↑                   ↑
//!  DuringDataWrite │                  BeforePrimaryWrite /        AfterPrimarySync
//!          BeforeDataSync / BeforeStagedWrite   TornPrimaryWrite
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Points in the commit protocol where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Crash after a number of data writes, before any header update.
    ///
    /// Nodes, records or client slots may be partially written; both header
    /// images still describe the previous commit.
    DuringDataWrite,

    /// Crash on the sync that precedes the staged header write.
    BeforeDataSync,

    /// Crash instead of writing the staged header image.
    BeforeStagedWrite,

    /// Crash instead of writing the primary header image.
    ///
    /// The staged image already holds the new commit and has been synced;
    /// recovery must pick it up.
    BeforePrimaryWrite,

    /// Crash halfway through the primary header write.
    ///
    /// The primary image fails its checksum; recovery falls back to the
    /// staged copy.
    TornPrimaryWrite,

    /// Crash on the final sync, after both images were written.
    ///
    /// The commit reports failure but is fully on storage.
    AfterPrimarySync,
}

/// Tracks crash injection state for deterministic crash simulation.
///
/// # Thread Safety
///
/// All state is atomic, making `CrashInjector` safe to share across threads.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    sync_count: AtomicU32,
    header_write_count: AtomicU32,
    data_write_count: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a disarmed injector targeting `crash_point`.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            sync_count: AtomicU32::new(0),
            header_write_count: AtomicU32::new(0),
            data_write_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Arms the injector and resets its counters.
    ///
    /// The injector starts disarmed so that creating the store and writing
    /// initial data are unaffected.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.header_write_count.store(0, Ordering::SeqCst);
        self.data_write_count.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether the crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    fn trigger(&self, should_crash: bool) -> bool {
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }
        should_crash
    }

    /// Records a sync. Returns `true` if the crash happens now.
    pub fn on_sync(&self) -> bool {
        if !self.active() {
            return false;
        }
        let count = self.sync_count.fetch_add(1, Ordering::SeqCst);
        self.trigger(match self.crash_point {
            CrashPoint::BeforeDataSync => count == 0,
            CrashPoint::AfterPrimarySync => count == 2,
            _ => false,
        })
    }

    /// Records a header image write. Returns `true` if the crash happens now.
    ///
    /// For [`CrashPoint::TornPrimaryWrite`] the caller should apply part of
    /// the write before failing; see [`tears_write`](Self::tears_write).
    pub fn on_header_write(&self) -> bool {
        if !self.active() {
            return false;
        }
        let count = self.header_write_count.fetch_add(1, Ordering::SeqCst);
        self.trigger(match self.crash_point {
            CrashPoint::BeforeStagedWrite => count == 0,
            CrashPoint::BeforePrimaryWrite | CrashPoint::TornPrimaryWrite => count == 1,
            _ => false,
        })
    }

    /// Records a data write. Returns `true` once `threshold` writes went
    /// through.
    pub fn on_data_write(&self, threshold: u32) -> bool {
        if !self.active() {
            return false;
        }
        let count = self.data_write_count.fetch_add(1, Ordering::SeqCst);
        self.trigger(self.crash_point == CrashPoint::DuringDataWrite && count >= threshold)
    }

    /// Whether the crashing write should be partially applied.
    pub fn tears_write(&self) -> bool {
        self.crash_point == CrashPoint::TornPrimaryWrite
    }

    /// Returns the configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Returns the number of syncs observed since arming.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Returns the number of header writes observed since arming.
    pub fn header_write_count(&self) -> u32 {
        self.header_write_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_injector_starts_disarmed() {
        let injector = CrashInjector::new(CrashPoint::BeforeDataSync);
        assert!(!injector.has_crashed());
        assert!(!injector.on_sync());
        assert!(!injector.has_crashed());
    }

    #[test]
    fn test_crash_before_data_sync() {
        let injector = CrashInjector::new(CrashPoint::BeforeDataSync);
        injector.arm();
        assert!(injector.on_sync());
        assert!(injector.has_crashed());
        assert!(!injector.on_sync());
    }

    #[test]
    fn test_crash_before_primary_write() {
        let injector = CrashInjector::new(CrashPoint::BeforePrimaryWrite);
        injector.arm();

        assert!(!injector.on_sync());
        assert!(!injector.on_header_write());
        assert!(!injector.on_sync());
        assert!(injector.on_header_write());
        assert!(injector.has_crashed());
        assert!(!injector.tears_write());
    }

    #[test]
    fn test_torn_primary_write() {
        let injector = CrashInjector::new(CrashPoint::TornPrimaryWrite);
        injector.arm();
        assert!(!injector.on_header_write());
        assert!(injector.on_header_write());
        assert!(injector.tears_write());
    }

    #[test]
    fn test_crash_after_primary_sync() {
        let injector = CrashInjector::new(CrashPoint::AfterPrimarySync);
        injector.arm();
        assert!(!injector.on_sync());
        assert!(!injector.on_sync());
        assert!(injector.on_sync());
        assert_eq!(injector.sync_count(), 3);
    }

    #[test]
    fn test_crash_during_data_write() {
        let injector = CrashInjector::new(CrashPoint::DuringDataWrite);
        injector.arm();

        assert!(!injector.on_data_write(2));
        assert!(!injector.on_data_write(2));
        assert!(injector.on_data_write(2));
        assert!(injector.has_crashed());
        assert!(!injector.on_header_write());
        assert_eq!(injector.header_write_count(), 0);
    }

    #[test]
    fn test_arm_resets_state() {
        let injector = CrashInjector::new(CrashPoint::BeforeDataSync);
        injector.arm();
        assert!(injector.on_sync());

        injector.arm();
        assert!(!injector.has_crashed());
        assert_eq!(injector.sync_count(), 0);
    }

    #[test]
    fn test_disarm_prevents_crash() {
        let injector = CrashInjector::new(CrashPoint::BeforeStagedWrite);
        injector.arm();
        injector.disarm();
        assert!(!injector.on_header_write());
        assert!(!injector.has_crashed());
    }
}
