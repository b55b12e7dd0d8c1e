//! The inter-process lock guarding the control block and stream buffer.
//!
//! One contract, two interchangeable mechanisms, selected per map at
//! creation:
//!
//! - **Fast** (default): a recursive, robust, process-shared pthread mutex
//!   embedded in the control segment. Cheap under contention but requires a
//!   platform with process-shared mutexes (unix).
//! - **Shared**: a spin lock over the control block's 4-byte lock word plus
//!   a PID mirror. Works between completely unrelated processes and
//!   supports stale-lock takeover when a holder dies.
//!
//! Reentrancy is per PID and reference-counted locally; acquire and release
//! must pair up.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use shmap_primitives::SpinWord;

#[cfg(unix)]
use shmap_primitives::mutex::{LockRecovery, SharedMutex};

use serde::Serialize;

use crate::control::ControlBlock;

/// Which lock mechanism a map uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockKind {
    Fast,
    Shared,
}

/// Failure to take or keep the inter-process lock.
#[derive(Debug)]
pub enum LockError {
    /// Non-blocking acquire found the lock held by `blocking_pid`.
    CannotAcquire { blocking_pid: u32 },
    /// Blocking acquire gave up after `waited` without stealing.
    Timeout { waited: Duration },
    /// Another process took over a lock this process believed it held.
    Stolen { expected: u32, by: u32 },
    /// The OS mutex failed outright.
    Os(io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::CannotAcquire { blocking_pid } => {
                write!(f, "cannot acquire lock, held by pid {blocking_pid}")
            }
            LockError::Timeout { waited } => {
                write!(f, "lock acquire timed out after {waited:?}")
            }
            LockError::Stolen { expected, by } => {
                write!(f, "lock owned by pid {expected} was stolen by pid {by}")
            }
            LockError::Os(e) => write!(f, "lock OS error: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LockError {
    fn from(e: io::Error) -> Self {
        LockError::Os(e)
    }
}

/// Diagnostic snapshot of the lock state.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub kind: LockKind,
    /// PID in the lock word (shared variant) or mirror (fast variant).
    pub holder_pid: u32,
    /// PID recorded in the mirror word.
    pub mirrored_pid: u32,
    /// This process's reentrant hold count.
    pub local_count: u32,
    pub self_pid: u32,
}

/// The per-process lock handle. State in the control block is shared; the
/// reentrancy count is ours alone.
pub struct Ipl {
    kind: LockKind,
    pid: u32,
    held: u32,
    sleep: Duration,
    #[cfg(unix)]
    mutex: Option<SharedMutex>,
}

impl Ipl {
    /// Wrap the lock words of a control block.
    ///
    /// For the fast variant on unix, `mutex` must be the handle to the
    /// mutex embedded in the same control block. On platforms without
    /// process-shared mutexes the fast variant degrades to the spin lock.
    pub fn new(kind: LockKind, sleep: Duration, #[cfg(unix)] mutex: Option<SharedMutex>) -> Self {
        #[cfg(not(unix))]
        let kind = LockKind::Shared;
        Self {
            kind,
            pid: std::process::id(),
            held: 0,
            sleep,
            #[cfg(unix)]
            mutex,
        }
    }

    #[inline]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    #[inline]
    fn spin<'a>(&self, control: &'a ControlBlock) -> SpinWord<'a> {
        SpinWord::new(&control.lock_word, &control.lock_pid)
    }

    /// Take the lock.
    ///
    /// - `block = false` fails immediately with the blocking PID.
    /// - `timeout` bounds a blocking acquire; on expiry the call either
    ///   fails with [`LockError::Timeout`] or, with `steal_after_timeout`,
    ///   forcibly takes the lock from its (presumed dead) holder. Stealing
    ///   is only meaningful for the shared variant; the fast variant relies
    ///   on mutex robustness instead.
    pub fn acquire(
        &mut self,
        control: &ControlBlock,
        block: bool,
        timeout: Option<Duration>,
        steal_after_timeout: bool,
    ) -> Result<(), LockError> {
        if self.held > 0 {
            // Reentrant acquire. Verify nobody clobbered our ownership.
            let holder = self.locked_by(control);
            if holder != self.pid {
                return Err(LockError::Stolen {
                    expected: self.pid,
                    by: holder,
                });
            }
            if self.kind == LockKind::Fast {
                self.fast_lock(control, block, timeout)?;
            }
            self.held += 1;
            return Ok(());
        }

        match self.kind {
            LockKind::Shared => self.shared_lock(control, block, timeout, steal_after_timeout)?,
            LockKind::Fast => self.fast_lock(control, block, timeout)?,
        }
        self.held = 1;
        Ok(())
    }

    fn shared_lock(
        &self,
        control: &ControlBlock,
        block: bool,
        timeout: Option<Duration>,
        steal_after_timeout: bool,
    ) -> Result<(), LockError> {
        let spin = self.spin(control);
        let start = Instant::now();
        loop {
            let holder = match spin.try_lock(self.pid) {
                Ok(()) => return Ok(()),
                Err(holder) => holder,
            };
            if !block {
                return Err(LockError::CannotAcquire {
                    blocking_pid: holder,
                });
            }
            if let Some(limit) = timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    if steal_after_timeout {
                        let old = spin.force_lock(self.pid);
                        tracing::warn!(
                            stale_pid = old,
                            pid = self.pid,
                            "stole shared lock after timeout"
                        );
                        return Ok(());
                    }
                    return Err(LockError::Timeout { waited });
                }
            }
            if self.sleep.is_zero() {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(self.sleep);
            }
        }
    }

    #[cfg(unix)]
    fn fast_lock(
        &self,
        control: &ControlBlock,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let mutex = self.mutex.expect("fast lock requires the embedded mutex");
        let recovery = if !block {
            match mutex.try_lock()? {
                None => {
                    return Err(LockError::CannotAcquire {
                        blocking_pid: control.lock_pid.load(shmap_primitives::sync::Ordering::Acquire),
                    })
                }
                Some(r) => r,
            }
        } else if let Some(limit) = timeout {
            match mutex.lock_timeout(limit)? {
                None => return Err(LockError::Timeout { waited: limit }),
                Some(r) => r,
            }
        } else {
            mutex.lock()?
        };
        if recovery == LockRecovery::PreviousOwnerDied {
            tracing::warn!(
                pid = self.pid,
                "previous lock holder died; mutex state recovered"
            );
        }
        if self.held == 0 {
            control
                .lock_pid
                .store(self.pid, shmap_primitives::sync::Ordering::Release);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn fast_lock(
        &self,
        _control: &ControlBlock,
        _block: bool,
        _timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        unreachable!("fast variant degrades to shared at construction")
    }

    /// Release one level of the lock.
    ///
    /// Returns `false` (and leaves shared state untouched) when this process
    /// does not hold the lock; the misuse is logged, not fatal.
    pub fn release(&mut self, control: &ControlBlock) -> bool {
        if self.held == 0 {
            tracing::warn!(pid = self.pid, "release without matching acquire");
            return false;
        }
        self.held -= 1;
        match self.kind {
            LockKind::Shared => {
                if self.held == 0 && !self.spin(control).unlock(self.pid) {
                    tracing::warn!(
                        pid = self.pid,
                        holder = self.spin(control).holder(),
                        "shared lock was not ours to release"
                    );
                    return false;
                }
            }
            LockKind::Fast => {
                #[cfg(unix)]
                {
                    if self.held == 0 {
                        control
                            .lock_pid
                            .store(0, shmap_primitives::sync::Ordering::Release);
                    }
                    if let Some(mutex) = self.mutex {
                        if let Err(e) = mutex.unlock() {
                            tracing::warn!(error = %e, "mutex unlock failed");
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// PID currently holding the lock, or 0 if free.
    pub fn locked_by(&self, control: &ControlBlock) -> u32 {
        match self.kind {
            LockKind::Shared => self.spin(control).holder(),
            LockKind::Fast => control
                .lock_pid
                .load(shmap_primitives::sync::Ordering::Acquire),
        }
    }

    /// Diagnostic snapshot.
    pub fn status(&self, control: &ControlBlock) -> LockStatus {
        LockStatus {
            kind: self.kind,
            holder_pid: self.locked_by(control),
            mirrored_pid: control
                .lock_pid
                .load(shmap_primitives::sync::Ordering::Acquire),
            local_count: self.held,
            self_pid: self.pid,
        }
    }

    /// Manual stale-lock recovery: clear the shared words and the local
    /// count. Only safe when the operator knows the holder is gone.
    pub fn reset(&mut self, control: &ControlBlock) {
        tracing::warn!(pid = self.pid, "manually resetting inter-process lock");
        control
            .lock_word
            .store(0, shmap_primitives::sync::Ordering::Release);
        control
            .lock_pid
            .store(0, shmap_primitives::sync::Ordering::Release);
        self.held = 0;
    }
}
