//! System V shared memory segment with create-or-join semantics.

use std::{ffi::CStr, io, mem::MaybeUninit, path::PathBuf, ptr::NonNull};

use snafu::ResultExt as _;

use crate::error::{
    ArenaError, AttachSegmentSnafu, CreateSegmentSnafu, JoinSegmentSnafu, KeyGenerationSnafu,
    StatSegmentSnafu,
};

/// IPC key derived from an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentKey(libc::key_t);

impl SegmentKey {
    /// Derives a key with `ftok(3)`.
    ///
    /// The key depends on the identity (device and inode) of the file, so
    /// every process naming the same file obtains the same key.
    pub fn from_path(path: &CStr, project_id: u8) -> Result<Self, ArenaError> {
        let key = unsafe { libc::ftok(path.as_ptr(), libc::c_int::from(project_id)) };
        if key == -1 {
            return Err(io::Error::last_os_error()).context(KeyGenerationSnafu {
                path: PathBuf::from(path.to_string_lossy().into_owned()),
            });
        }
        Ok(Self(key))
    }

    #[must_use]
    pub fn raw(self) -> libc::key_t {
        self.0
    }
}

/// A shared memory segment attached to this process.
///
/// Dropping the segment detaches it and marks it for destruction, whether or
/// not other processes still have it attached.
pub(crate) struct SharedSegment {
    id: libc::c_int,
    addr: NonNull<u8>,
    len: usize,
    created: bool,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Creates the segment for `key`, or joins it if it already exists.
    ///
    /// Creation is attempted exclusively first; [`created`](Self::created)
    /// tells which path was taken.
    pub(crate) fn create_or_join(
        key: SegmentKey,
        len: usize,
        permissions: u32,
    ) -> Result<Self, ArenaError> {
        let mode = permissions as libc::c_int;
        let mut created = true;
        let mut id =
            unsafe { libc::shmget(key.raw(), len, mode | libc::IPC_CREAT | libc::IPC_EXCL) };
        if id == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err).context(CreateSegmentSnafu {
                    key: key.raw(),
                    size: len,
                });
            }
            created = false;
            id = unsafe { libc::shmget(key.raw(), len, mode) };
            if id == -1 {
                return Err(io::Error::last_os_error()).context(JoinSegmentSnafu {
                    key: key.raw(),
                    size: len,
                });
            }
        }

        let addr = unsafe { libc::shmat(id, core::ptr::null(), 0) };
        if addr.addr() == usize::MAX {
            let err = io::Error::last_os_error();
            remove(id);
            return Err(err).context(AttachSegmentSnafu { id });
        }
        let Some(addr) = NonNull::new(addr.cast::<u8>()) else {
            remove(id);
            return Err(io::Error::from(io::ErrorKind::AddrNotAvailable))
                .context(AttachSegmentSnafu { id });
        };

        let mut segment = Self {
            id,
            addr,
            len,
            created,
        };
        // A joined segment may be larger than requested.
        segment.len = segment.stat()?;

        log::debug!(
            "shared segment {}: key={:#x}, id={id}, addr={addr:p}, len={}",
            if created { "created" } else { "joined" },
            key.raw(),
            segment.len
        );
        Ok(segment)
    }

    fn stat(&self) -> Result<usize, ArenaError> {
        let mut stat = MaybeUninit::<libc::shmid_ds>::uninit();
        if unsafe { libc::shmctl(self.id, libc::IPC_STAT, stat.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error()).context(StatSegmentSnafu { id: self.id });
        }
        let stat = unsafe { stat.assume_init() };
        Ok(stat.shm_segsz as usize)
    }

    pub(crate) fn id(&self) -> libc::c_int {
        self.id
    }

    pub(crate) fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn created(&self) -> bool {
        self.created
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if unsafe { libc::shmdt(self.addr.as_ptr().cast()) } == -1 {
            log::warn!(
                "failed to detach shared segment id={}: {}",
                self.id,
                io::Error::last_os_error()
            );
        }
        remove(self.id);
    }
}

/// Marks a segment for destruction once the last process detaches.
fn remove(id: libc::c_int) {
    if unsafe { libc::shmctl(id, libc::IPC_RMID, core::ptr::null_mut()) } == -1 {
        log::warn!(
            "failed to remove shared segment id={id}: {}",
            io::Error::last_os_error()
        );
    } else {
        log::debug!("shared segment removed: id={id}");
    }
}
