//! POSIX shared memory segments (`shm_open` + `mmap` with `MAP_SHARED`).

use std::ffi::CString;
use std::io;

use crate::region::Region;

use super::{check_name, SegmentError};

/// A named POSIX shared-memory segment mapped into this process.
///
/// Created segments appear under `/dev/shm` on Linux. Dropping the handle
/// unmaps the region; the name stays registered until
/// [`SharedSegment::unlink_by_name`] removes it.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    ptr: *mut u8,
    len: usize,
    created: bool,
}

impl SharedSegment {
    /// Register a new segment under `name` and map it.
    ///
    /// Fails with [`SegmentError::AlreadyExists`] if the name is taken.
    pub fn create(name: &str, size: usize) -> Result<Self, SegmentError> {
        check_name(name)?;
        if size == 0 {
            return Err(SegmentError::Invalid {
                name: name.to_string(),
                reason: "size must be > 0",
            });
        }

        let os_name = os_name(name);
        let fd = unsafe {
            libc::shm_open(
                os_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EEXIST) {
                SegmentError::AlreadyExists(name.to_string())
            } else {
                SegmentError::Os(err)
            });
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(os_name.as_ptr());
            }
            return Err(SegmentError::Os(err));
        }

        let ptr = map_fd(fd, size);
        unsafe { libc::close(fd) };
        let ptr = match ptr {
            Ok(p) => p,
            Err(err) => {
                unsafe { libc::shm_unlink(os_name.as_ptr()) };
                return Err(SegmentError::Os(err));
            }
        };

        Ok(Self {
            name: name.to_string(),
            ptr,
            len: size,
            created: true,
        })
    }

    /// Attach to an existing segment. The registered size determines the
    /// mapping size.
    pub fn attach(name: &str) -> Result<Self, SegmentError> {
        check_name(name)?;

        let os_name = os_name(name);
        let fd = unsafe { libc::shm_open(os_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                SegmentError::NotFound(name.to_string())
            } else {
                SegmentError::Os(err)
            });
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(SegmentError::Os(err));
        }
        let size = unsafe { stat.assume_init() }.st_size as usize;
        if size == 0 {
            // The creator registered the name but has not sized it yet.
            unsafe { libc::close(fd) };
            return Err(SegmentError::Invalid {
                name: name.to_string(),
                reason: "segment is zero-sized",
            });
        }

        let ptr = map_fd(fd, size);
        unsafe { libc::close(fd) };
        let ptr = ptr.map_err(SegmentError::Os)?;

        Ok(Self {
            name: name.to_string(),
            ptr,
            len: size,
            created: false,
        })
    }

    /// Remove `name` from the OS namespace.
    ///
    /// Existing attachments stay valid until each holder drops its mapping.
    /// With `ignore_errors`, a missing name is not an error; this is the
    /// cleanup path for residue left by crashed processes.
    pub fn unlink_by_name(name: &str, ignore_errors: bool) -> Result<(), SegmentError> {
        if let Err(e) = check_name(name) {
            return if ignore_errors { Ok(()) } else { Err(e) };
        }
        let os_name = os_name(name);
        if unsafe { libc::shm_unlink(os_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if !ignore_errors {
                return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                    SegmentError::NotFound(name.to_string())
                } else {
                    SegmentError::Os(err)
                });
            }
        }
        Ok(())
    }

    /// The logical segment name (without the platform prefix).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapping size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is zero bytes (never for live segments).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle registered the name (vs. attached to it).
    #[inline]
    pub fn created(&self) -> bool {
        self.created
    }

    /// A `Region` view of the mapped bytes.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping is valid for the lifetime of self.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping stays valid while the handle lives, and all shared
// mutation goes through atomics or is serialized by the caller's lock.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

/// POSIX wants a leading slash and no interior slashes.
fn os_name(name: &str) -> CString {
    CString::new(format!("/{name}")).expect("segment name contains NUL")
}

fn map_fd(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}
