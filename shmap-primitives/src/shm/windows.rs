//! Windows shared memory segments (pagefile-backed named file mappings).
//!
//! Windows reclaims a mapping when the last handle to it closes, so there is
//! no unlink syscall; `unlink_by_name` is a no-op and the creator is expected
//! to keep its handle open until teardown.

use std::io;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use crate::region::Region;

use super::{check_name, SegmentError};

/// A named Windows shared-memory segment mapped into this process.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    handle: HANDLE,
    ptr: *mut u8,
    len: usize,
    created: bool,
}

impl SharedSegment {
    /// Register a new segment under `name` and map it.
    pub fn create(name: &str, size: usize) -> Result<Self, SegmentError> {
        check_name(name)?;
        if size == 0 {
            return Err(SegmentError::Invalid {
                name: name.to_string(),
                reason: "size must be > 0",
            });
        }

        let wide = wide_name(name);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                core::ptr::null(),
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                wide.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(SegmentError::Os(io::Error::last_os_error()));
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(SegmentError::AlreadyExists(name.to_string()));
        }

        let ptr = map_view(handle)?;
        Ok(Self {
            name: name.to_string(),
            handle,
            ptr,
            len: size,
            created: true,
        })
    }

    /// Attach to an existing segment; the mapped size is discovered from the
    /// view.
    pub fn attach(name: &str) -> Result<Self, SegmentError> {
        check_name(name)?;

        let wide = wide_name(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide.as_ptr()) };
        if handle.is_null() {
            let err = io::Error::last_os_error();
            return Err(if unsafe { GetLastError() } == ERROR_FILE_NOT_FOUND {
                SegmentError::NotFound(name.to_string())
            } else {
                SegmentError::Os(err)
            });
        }

        let ptr = map_view(handle)?;
        let len = view_size(ptr);
        if len == 0 {
            unsafe {
                UnmapViewOfFile(view_address(ptr));
                CloseHandle(handle);
            }
            return Err(SegmentError::Invalid {
                name: name.to_string(),
                reason: "segment is zero-sized",
            });
        }

        Ok(Self {
            name: name.to_string(),
            handle,
            ptr,
            len,
            created: false,
        })
    }

    /// No-op on Windows: the segment vanishes when the last handle closes.
    pub fn unlink_by_name(_name: &str, _ignore_errors: bool) -> Result<(), SegmentError> {
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
        // SAFETY: the view is valid for the lifetime of self.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(view_address(self.ptr));
            CloseHandle(self.handle);
        }
    }
}

fn view_address(ptr: *mut u8) -> MEMORY_MAPPED_VIEW_ADDRESS {
    MEMORY_MAPPED_VIEW_ADDRESS { Value: ptr as _ }
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

/// Session-local namespace, UTF-16, NUL-terminated.
fn wide_name(name: &str) -> Vec<u16> {
    format!("Local\\{name}")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

fn map_view(handle: HANDLE) -> Result<*mut u8, SegmentError> {
    let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
    if view.Value.is_null() {
        let err = io::Error::last_os_error();
        unsafe { CloseHandle(handle) };
        return Err(SegmentError::Os(err));
    }
    Ok(view.Value as *mut u8)
}

fn view_size(ptr: *mut u8) -> usize {
    let mut info = core::mem::MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
    let written = unsafe {
        VirtualQuery(
            ptr as _,
            info.as_mut_ptr(),
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return 0;
    }
    unsafe { info.assume_init() }.RegionSize
}
