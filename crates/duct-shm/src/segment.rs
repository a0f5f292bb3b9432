//! POSIX shared-memory segments.
//!
//! The creator makes the object exclusively (`O_CREAT | O_EXCL`) so two
//! dialers can never silently share a connection id; the acceptor opens the
//! same name read-write. Unmapping happens on drop; unlinking the name is a
//! separate, owner-only step.

use std::ffi::CString;

use duct_types::{Result, Status};

#[derive(Debug)]
pub struct ShmSegment {
    ptr: *mut u8,
    len: usize,
    fd: libc::c_int,
    name: String,
}

// SAFETY: the mapping is valid for the lifetime of the segment and all
// cross-thread access goes through atomics or the semaphore protocol.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Status::invalid_argument("segment name contains NUL"))
}

impl ShmSegment {
    /// Create and map a new zero-filled segment. Fails if the name exists.
    pub fn create_exclusive(name: &str, len: usize) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid NUL-terminated shm name.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(Status::io_error(format!(
                "shm_open(create) failed: {name} ({})",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: fd is the segment opened above.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let e = std::io::Error::last_os_error();
            // SAFETY: fd is live; the name was created above.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(Status::io_error(format!("ftruncate(shm) failed ({e})")));
        }

        match map(fd, len) {
            Ok(ptr) => {
                // Fresh ftruncated pages are already zero; make the
                // guarantee explicit for reused names on exotic systems.
                // SAFETY: ptr covers len writable bytes.
                unsafe { std::ptr::write_bytes(ptr, 0, len) };
                Ok(Self {
                    ptr,
                    len,
                    fd,
                    name: name.to_string(),
                })
            }
            Err(e) => {
                // SAFETY: fd is live; the name was created above.
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(cname.as_ptr());
                }
                Err(e)
            }
        }
    }

    /// Open and map an existing segment, verifying its size.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid NUL-terminated shm name.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
        if fd < 0 {
            return Err(Status::io_error(format!(
                "shm_open(open) failed: {name} ({})",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: stat is a valid out-param; fd is live.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let e = std::io::Error::last_os_error();
            // SAFETY: fd is live.
            unsafe { libc::close(fd) };
            return Err(Status::io_error(format!("fstat(shm) failed ({e})")));
        }
        if (stat.st_size as usize) < len {
            // SAFETY: fd is live.
            unsafe { libc::close(fd) };
            return Err(Status::io_error(format!(
                "segment {name} is {} bytes, expected at least {len}",
                stat.st_size
            )));
        }

        match map(fd, len) {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                fd,
                name: name.to_string(),
            }),
            Err(e) => {
                // SAFETY: fd is live.
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the name from the system; open mappings stay valid.
    pub fn unlink(name: &str) {
        if let Ok(cname) = c_name(name) {
            // SAFETY: cname is a valid NUL-terminated shm name.
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }
    }
}

fn map(fd: libc::c_int, len: usize) -> Result<*mut u8> {
    // SAFETY: fd is a live shm descriptor sized to at least len.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Status::io_error(format!(
            "mmap(shm) failed ({})",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr.cast())
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the live mapping; fd is owned here.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct_types::StatusCode;

    fn unique_name(tag: &str) -> String {
        format!("/ductseg_{tag}_{}", std::process::id())
    }

    struct Unlink(String);
    impl Drop for Unlink {
        fn drop(&mut self) {
            ShmSegment::unlink(&self.0);
        }
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name("share");
        let _guard = Unlink(name.clone());

        let creator = ShmSegment::create_exclusive(&name, 4096).unwrap();
        let opener = ShmSegment::open(&name, 4096).unwrap();

        // SAFETY: both mappings cover 4096 valid bytes.
        unsafe {
            std::ptr::write(creator.as_ptr().add(100), 0xAB);
            assert_eq!(std::ptr::read(opener.as_ptr().add(100)), 0xAB);
        }
    }

    #[test]
    fn created_segment_is_zeroed() {
        let name = unique_name("zero");
        let _guard = Unlink(name.clone());
        let seg = ShmSegment::create_exclusive(&name, 4096).unwrap();
        // SAFETY: the mapping covers 4096 valid bytes.
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn exclusive_create_fails_on_existing() {
        let name = unique_name("excl");
        let _guard = Unlink(name.clone());
        let _seg = ShmSegment::create_exclusive(&name, 4096).unwrap();
        let err = ShmSegment::create_exclusive(&name, 4096).unwrap_err();
        assert_eq!(err.code(), StatusCode::IoError);
    }

    #[test]
    fn open_missing_fails() {
        let err = ShmSegment::open("/ductseg_missing_zz", 4096).unwrap_err();
        assert_eq!(err.code(), StatusCode::IoError);
    }

    #[test]
    fn open_rejects_undersized_segment() {
        let name = unique_name("size");
        let _guard = Unlink(name.clone());
        let _seg = ShmSegment::create_exclusive(&name, 1024).unwrap();
        let err = ShmSegment::open(&name, 4096).unwrap_err();
        assert_eq!(err.code(), StatusCode::IoError);
    }
}
