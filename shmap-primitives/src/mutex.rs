//! Recursive, robust, process-shared pthread mutex embedded in shared memory.
//!
//! The mutex bytes live inside a shared segment at an 8-aligned offset; the
//! creating process initializes them once, every attacher wraps the same
//! address. Robustness means a holder dying does not wedge the map: the next
//! locker gets `EOWNERDEAD`, marks the state consistent, and proceeds.

use std::io;
use std::time::Duration;

/// Bytes reserved for the mutex inside a shared segment.
///
/// `pthread_mutex_t` is 40 bytes on 64-bit Linux; one cache line leaves
/// headroom for other libc implementations.
pub const SHARED_MUTEX_SIZE: usize = 64;

const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= SHARED_MUTEX_SIZE);

/// Outcome of a successful lock call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRecovery {
    /// Normal acquisition.
    Clean,
    /// The previous holder died; the state was marked consistent.
    PreviousOwnerDied,
}

/// Handle to a process-shared pthread mutex at a fixed shared address.
#[derive(Clone, Copy)]
pub struct SharedMutex {
    raw: *mut libc::pthread_mutex_t,
}

impl SharedMutex {
    /// Initialize a mutex in zeroed shared memory and return a handle.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`SHARED_MUTEX_SIZE`] bytes of zeroed,
    /// 8-aligned shared memory that no other process is touching yet.
    pub unsafe fn init_at(ptr: *mut u8) -> io::Result<Self> {
        debug_assert!(ptr as usize % 8 == 0);
        let raw = ptr as *mut libc::pthread_mutex_t;

        let mut attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let attr_ptr = attr.as_mut_ptr();
        check(libc::pthread_mutexattr_setpshared(
            attr_ptr,
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check(libc::pthread_mutexattr_settype(
            attr_ptr,
            libc::PTHREAD_MUTEX_RECURSIVE,
        ))?;
        #[cfg(target_os = "linux")]
        check(libc::pthread_mutexattr_setrobust(
            attr_ptr,
            libc::PTHREAD_MUTEX_ROBUST,
        ))?;

        let rc = libc::pthread_mutex_init(raw, attr_ptr);
        libc::pthread_mutexattr_destroy(attr_ptr);
        check(rc)?;

        Ok(Self { raw })
    }

    /// Wrap a mutex another process already initialized at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to memory initialized by [`SharedMutex::init_at`]
    /// and still mapped in this process.
    pub unsafe fn attach_at(ptr: *mut u8) -> Self {
        debug_assert!(ptr as usize % 8 == 0);
        Self {
            raw: ptr as *mut libc::pthread_mutex_t,
        }
    }

    /// Block until the mutex is held.
    pub fn lock(&self) -> io::Result<LockRecovery> {
        self.handle_lock_rc(unsafe { libc::pthread_mutex_lock(self.raw) })
    }

    /// Try to take the mutex without blocking; `None` means it is busy.
    pub fn try_lock(&self) -> io::Result<Option<LockRecovery>> {
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw) };
        if rc == libc::EBUSY {
            return Ok(None);
        }
        self.handle_lock_rc(rc).map(Some)
    }

    /// Block with a deadline; `None` means the timeout expired.
    #[cfg(target_os = "linux")]
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<Option<LockRecovery>> {
        let mut now = std::mem::MaybeUninit::<libc::timespec>::uninit();
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let now = unsafe { now.assume_init() };

        let mut abs = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
        };
        if abs.tv_nsec >= 1_000_000_000 {
            abs.tv_sec += 1;
            abs.tv_nsec -= 1_000_000_000;
        }

        let rc = unsafe { libc::pthread_mutex_timedlock(self.raw, &abs) };
        if rc == libc::ETIMEDOUT {
            return Ok(None);
        }
        self.handle_lock_rc(rc).map(Some)
    }

    /// Portable fallback: poll `try_lock` until the timeout expires.
    #[cfg(not(target_os = "linux"))]
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<Option<LockRecovery>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(recovery) = self.try_lock()? {
                return Ok(Some(recovery));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Release one level of the (recursive) mutex.
    pub fn unlock(&self) -> io::Result<()> {
        check(unsafe { libc::pthread_mutex_unlock(self.raw) })
    }

    fn handle_lock_rc(&self, rc: libc::c_int) -> io::Result<LockRecovery> {
        #[cfg(target_os = "linux")]
        if rc == libc::EOWNERDEAD {
            // Previous holder died mid-critical-section. The control block
            // is repaired by the caller forcing a full dump; here we only
            // mark the mutex usable again.
            check(unsafe { libc::pthread_mutex_consistent(self.raw) })?;
            return Ok(LockRecovery::PreviousOwnerDied);
        }
        check(rc)?;
        Ok(LockRecovery::Clean)
    }
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn lock_is_recursive() {
        let heap = HeapRegion::new_zeroed(SHARED_MUTEX_SIZE);
        let mutex = unsafe { SharedMutex::init_at(heap.region().as_ptr()) }.unwrap();

        assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
        assert_eq!(mutex.lock().unwrap(), LockRecovery::Clean);
        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
    }

    #[test]
    fn try_lock_reports_busy_across_threads() {
        let heap = HeapRegion::new_zeroed(SHARED_MUTEX_SIZE);
        let ptr = heap.region().as_ptr() as usize;
        let mutex = unsafe { SharedMutex::init_at(ptr as *mut u8) }.unwrap();

        mutex.lock().unwrap();
        let busy = std::thread::spawn(move || {
            let mutex = unsafe { SharedMutex::attach_at(ptr as *mut u8) };
            mutex.try_lock().unwrap().is_none()
        })
        .join()
        .unwrap();
        assert!(busy);
        mutex.unlock().unwrap();
    }

    #[test]
    fn lock_timeout_expires_under_contention() {
        let heap = HeapRegion::new_zeroed(SHARED_MUTEX_SIZE);
        let ptr = heap.region().as_ptr() as usize;
        let mutex = unsafe { SharedMutex::init_at(ptr as *mut u8) }.unwrap();

        mutex.lock().unwrap();
        let timed_out = std::thread::spawn(move || {
            let mutex = unsafe { SharedMutex::attach_at(ptr as *mut u8) };
            mutex
                .lock_timeout(Duration::from_millis(50))
                .unwrap()
                .is_none()
        })
        .join()
        .unwrap();
        assert!(timed_out);
        mutex.unlock().unwrap();
    }
}
