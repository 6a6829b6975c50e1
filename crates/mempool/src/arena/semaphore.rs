//! Named POSIX semaphore used as a cross-process mutex.

use std::{ffi::CStr, io, ptr::NonNull, sync::Arc};

use snafu::{IntoError as _, ResultExt as _};

use crate::error::{ArenaError, LockSnafu, OpenSemaphoreSnafu};

/// A binary semaphore shared by every process that opens the same name.
///
/// The semaphore is created with an initial value of 1 if it does not exist
/// yet; otherwise the existing one is opened as is.
pub(crate) struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: Arc<CStr>,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    pub(crate) fn open(name: Arc<CStr>, permissions: u32) -> Result<Self, ArenaError> {
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                permissions as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        let sem = NonNull::new(sem)
            .filter(|sem| sem.as_ptr() != libc::SEM_FAILED)
            .ok_or_else(io::Error::last_os_error)
            .context(OpenSemaphoreSnafu {
                name: name.to_string_lossy(),
            })?;
        log::debug!("semaphore opened: name={name:?}");
        Ok(Self { sem, name })
    }

    /// Blocks until the semaphore is acquired.
    ///
    /// Interrupted waits are retried. The semaphore is released when the
    /// returned guard is dropped, including during unwinding.
    pub(crate) fn lock(&self) -> Result<SemaphoreGuard<'_>, ArenaError> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(SemaphoreGuard { semaphore: self });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(LockSnafu.into_error(err));
            }
        }
    }

    pub(crate) fn name(&self) -> &CStr {
        &self.name
    }

    fn unlock(&self) {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            log::warn!(
                "failed to release semaphore {:?}: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            log::warn!(
                "failed to close semaphore {:?}: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
        // Other processes may still use the semaphore; whoever unlinks last
        // gets `ENOENT`.
        if unsafe { libc::sem_unlink(self.name.as_ptr()) } != 0 {
            log::warn!(
                "failed to unlink semaphore {:?}: {}",
                self.name,
                io::Error::last_os_error()
            );
        } else {
            log::debug!("semaphore unlinked: name={:?}", self.name);
        }
    }
}

/// Holds the semaphore until dropped.
pub(crate) struct SemaphoreGuard<'a> {
    semaphore: &'a NamedSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.unlock();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{
        ffi::CString,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    fn unique_name(tag: &str) -> Arc<CStr> {
        let name = format!("/mempool-sem-{}-{tag}", std::process::id());
        CString::new(name).unwrap().into()
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let semaphore = NamedSemaphore::open(unique_name("release"), 0o600).unwrap();
        for _ in 0..3 {
            let _guard = semaphore.lock().unwrap();
        }
    }

    #[test]
    fn test_guard_releases_on_unwind() {
        let semaphore = NamedSemaphore::open(unique_name("unwind"), 0o600).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = semaphore.lock().unwrap();
            panic!("boom");
        }));
        assert!(res.is_err());
        drop(semaphore.lock().unwrap());
    }

    #[test]
    fn test_mutual_exclusion_between_threads() {
        let semaphore = Arc::new(NamedSemaphore::open(unique_name("threads"), 0o600).unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = semaphore.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_reopen_shares_state() {
        let name = unique_name("reopen");
        let first = NamedSemaphore::open(Arc::clone(&name), 0o600).unwrap();
        let second = NamedSemaphore::open(Arc::clone(&name), 0o600).unwrap();
        let guard = first.lock().unwrap();
        assert_eq!(unsafe { libc::sem_trywait(second.sem.as_ptr()) }, -1);
        drop(guard);
        assert_eq!(unsafe { libc::sem_trywait(second.sem.as_ptr()) }, 0);
        second.unlock();
        assert_eq!(second.name(), &*name);
    }
}
