//! PID-tagged spin-lock word for unrelated processes.
//!
//! The word lives in a shared segment: 0 means free, any other value is the
//! PID of the holder. A second word mirrors the holder PID for diagnostics
//! and stale-lock takeover. Blocking, timeouts, and reentrancy are policy
//! and live in the `shmap` crate; this is just the atomic mechanism.

use crate::sync::{AtomicU32, Ordering};

/// Borrowed view over the lock word and its PID mirror.
#[derive(Clone, Copy)]
pub struct SpinWord<'a> {
    word: &'a AtomicU32,
    pid_mirror: &'a AtomicU32,
}

impl<'a> SpinWord<'a> {
    pub fn new(word: &'a AtomicU32, pid_mirror: &'a AtomicU32) -> Self {
        Self { word, pid_mirror }
    }

    /// One attempt to take the lock for `pid`.
    ///
    /// Returns `Err(holder)` with the PID observed holding the lock.
    #[inline]
    pub fn try_lock(&self, pid: u32) -> Result<(), u32> {
        debug_assert_ne!(pid, 0);
        match self
            .word
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                self.pid_mirror.store(pid, Ordering::Release);
                Ok(())
            }
            Err(holder) => Err(holder),
        }
    }

    /// Release the lock held by `pid`.
    ///
    /// Only the holder may release; on mismatch nothing is cleared and
    /// `false` is returned so the caller can flag the misuse.
    #[inline]
    pub fn unlock(&self, pid: u32) -> bool {
        if self.word.load(Ordering::Acquire) != pid {
            return false;
        }
        self.pid_mirror.store(0, Ordering::Release);
        self.word.store(0, Ordering::Release);
        true
    }

    /// Unconditionally take the lock for `pid`, regardless of the holder.
    ///
    /// This is the stale-lock takeover path; the displaced PID is returned.
    #[inline]
    pub fn force_lock(&self, pid: u32) -> u32 {
        debug_assert_ne!(pid, 0);
        let old = self.word.swap(pid, Ordering::AcqRel);
        self.pid_mirror.store(pid, Ordering::Release);
        old
    }

    /// PID currently holding the lock, or 0 if free.
    #[inline]
    pub fn holder(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// PID recorded in the mirror word.
    #[inline]
    pub fn mirrored_pid(&self) -> u32 {
        self.pid_mirror.load(Ordering::Acquire)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::AtomicU32;

    #[test]
    fn lock_unlock_cycle() {
        let word = AtomicU32::new(0);
        let mirror = AtomicU32::new(0);
        let spin = SpinWord::new(&word, &mirror);

        spin.try_lock(42).unwrap();
        assert_eq!(spin.holder(), 42);
        assert_eq!(spin.mirrored_pid(), 42);

        assert_eq!(spin.try_lock(7), Err(42));

        assert!(spin.unlock(42));
        assert_eq!(spin.holder(), 0);
        assert_eq!(spin.mirrored_pid(), 0);
    }

    #[test]
    fn unlock_by_non_holder_is_refused() {
        let word = AtomicU32::new(0);
        let mirror = AtomicU32::new(0);
        let spin = SpinWord::new(&word, &mirror);

        spin.try_lock(42).unwrap();
        assert!(!spin.unlock(7));
        assert_eq!(spin.holder(), 42);
    }

    #[test]
    fn force_lock_displaces_holder() {
        let word = AtomicU32::new(0);
        let mirror = AtomicU32::new(0);
        let spin = SpinWord::new(&word, &mirror);

        spin.try_lock(42).unwrap();
        assert_eq!(spin.force_lock(7), 42);
        assert_eq!(spin.holder(), 7);
        assert_eq!(spin.mirrored_pid(), 7);
    }

    #[test]
    fn contended_acquire_is_exclusive() {
        use std::sync::atomic::{AtomicU32 as StdU32, Ordering as StdOrdering};
        use std::sync::Arc;

        let word = Arc::new(AtomicU32::new(0));
        let mirror = Arc::new(AtomicU32::new(0));
        let inside = Arc::new(StdU32::new(0));

        let handles: Vec<_> = (1..=4u32)
            .map(|pid| {
                let word = word.clone();
                let mirror = mirror.clone();
                let inside = inside.clone();
                std::thread::spawn(move || {
                    let spin = SpinWord::new(&word, &mirror);
                    for _ in 0..1_000 {
                        while spin.try_lock(pid).is_err() {
                            std::hint::spin_loop();
                        }
                        assert_eq!(inside.fetch_add(1, StdOrdering::SeqCst), 0);
                        inside.fetch_sub(1, StdOrdering::SeqCst);
                        assert!(spin.unlock(pid));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }
}
