//! Named POSIX counting semaphores.
//!
//! The ring protocol uses two semaphores per direction (`items`, `spaces`)
//! as both the blocking primitive and the cross-process happens-before
//! edge. Timed waits use `sem_timedwait` where the platform has it; Apple
//! platforms historically do not, so they fall back to a try-wait loop with
//! a short sleep.

use std::ffi::CString;
use std::time::Duration;

use duct_types::{Result, Status};

#[cfg(target_vendor = "apple")]
use std::time::Instant;

#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

// SAFETY: sem_t handles from sem_open are process-global and safe to use
// from any thread; the pointer itself never changes after construction.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Status::invalid_argument("semaphore name contains NUL"))
}

impl NamedSemaphore {
    /// Create a semaphore that must not already exist.
    pub fn create_exclusive(name: &str, initial: u32) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid NUL-terminated semaphore name.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Status::io_error(format!(
                "sem_open(create) failed: {name} ({})",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { sem, name: cname })
    }

    /// Open an existing semaphore by name.
    pub fn open(name: &str) -> Result<Self> {
        let cname = c_name(name)?;
        // SAFETY: cname is a valid NUL-terminated semaphore name.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(Status::io_error(format!(
                "sem_open(open) failed: {name} ({})",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { sem, name: cname })
    }

    /// Increment the count, waking one waiter.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live semaphore handle.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(Status::io_error(format!(
                "sem_post failed ({})",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Decrement the count, blocking until it is positive.
    ///
    /// `None` blocks indefinitely; `Some(t)` fails with `Timeout` once `t`
    /// elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => loop {
                // SAFETY: self.sem is a live semaphore handle.
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(());
                }
                let e = std::io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Status::io_error(format!("sem_wait failed ({e})")));
            },
            Some(t) => self.wait_timed(t),
        }
    }

    #[cfg(not(target_vendor = "apple"))]
    fn wait_timed(&self, timeout: Duration) -> Result<()> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: now points to a valid timespec.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(Status::io_error(format!(
                "clock_gettime failed ({})",
                std::io::Error::last_os_error()
            )));
        }

        let nanos = timeout.as_nanos().min(i64::MAX as u128) as i64;
        let mut abs = libc::timespec {
            tv_sec: now.tv_sec + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: now.tv_nsec + (nanos % 1_000_000_000) as libc::c_long,
        };
        if abs.tv_nsec >= 1_000_000_000 {
            abs.tv_sec += 1;
            abs.tv_nsec -= 1_000_000_000;
        }

        loop {
            // SAFETY: self.sem is a live semaphore handle; abs is valid.
            if unsafe { libc::sem_timedwait(self.sem, &abs) } == 0 {
                return Ok(());
            }
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => {
                    return Err(Status::timeout("semaphore wait timed out"));
                }
                _ => return Err(Status::io_error(format!("sem_timedwait failed ({e})"))),
            }
        }
    }

    // macOS has no sem_timedwait; poll with a 1ms nap.
    #[cfg(target_vendor = "apple")]
    fn wait_timed(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: self.sem is a live semaphore handle.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(());
            }
            let e = std::io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(Status::timeout("semaphore wait timed out"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                _ => return Err(Status::io_error(format!("sem_trywait failed ({e})"))),
            }
        }
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    /// Remove the name from the system. Open handles stay usable until
    /// closed. Errors (already unlinked) are ignored.
    pub fn unlink(name: &str) {
        if let Ok(cname) = c_name(name) {
            // SAFETY: cname is a valid NUL-terminated semaphore name.
            unsafe {
                libc::sem_unlink(cname.as_ptr());
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a live handle owned by this value.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct_types::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("/ductsem_{tag}_{}", std::process::id())
    }

    struct Unlink(String);
    impl Drop for Unlink {
        fn drop(&mut self) {
            NamedSemaphore::unlink(&self.0);
        }
    }

    #[test]
    fn create_post_wait() {
        let name = unique_name("basic");
        let _guard = Unlink(name.clone());
        let sem = NamedSemaphore::create_exclusive(&name, 0).unwrap();
        sem.post().unwrap();
        sem.wait(None).unwrap();
    }

    #[test]
    fn initial_count_is_honored() {
        let name = unique_name("initial");
        let _guard = Unlink(name.clone());
        let sem = NamedSemaphore::create_exclusive(&name, 3).unwrap();
        for _ in 0..3 {
            sem.wait(Some(Duration::from_millis(100))).unwrap();
        }
        let err = sem.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.code(), StatusCode::Timeout);
    }

    #[test]
    fn exclusive_create_fails_on_existing() {
        let name = unique_name("excl");
        let _guard = Unlink(name.clone());
        let _sem = NamedSemaphore::create_exclusive(&name, 0).unwrap();
        let err = NamedSemaphore::create_exclusive(&name, 0).unwrap_err();
        assert_eq!(err.code(), StatusCode::IoError);
    }

    #[test]
    fn open_sees_creators_posts() {
        let name = unique_name("open");
        let _guard = Unlink(name.clone());
        let creator = NamedSemaphore::create_exclusive(&name, 0).unwrap();
        let opener = NamedSemaphore::open(&name).unwrap();
        creator.post().unwrap();
        opener.wait(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn wait_blocks_until_posted_from_other_thread() {
        let name = unique_name("cross");
        let _guard = Unlink(name.clone());
        let sem = Arc::new(NamedSemaphore::create_exclusive(&name, 0).unwrap());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let sem = sem.clone();
            let woke = woke.clone();
            thread::spawn(move || {
                sem.wait(Some(Duration::from_secs(5))).unwrap();
                woke.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));
        sem.post().unwrap();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn open_missing_name_fails() {
        let err = NamedSemaphore::open("/ductsem_does_not_exist_zz").unwrap_err();
        assert_eq!(err.code(), StatusCode::IoError);
    }
}
