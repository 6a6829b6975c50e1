use std::{
    ffi::{CStr, CString},
    os::unix::ffi::OsStrExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::{OptionExt as _, ensure};

use super::layout::{ARENA_HEADER_SIZE, BLOCK_ALIGN, BLOCK_HEADER_SIZE};
use crate::error::{
    ArenaError, ArenaTooLargeSnafu, ArenaTooSmallSnafu, InvalidPathSnafu, InvalidSemaphoreNameSnafu,
};

/// Default `ftok(3)` project identifier.
pub const DEFAULT_PROJECT_ID: u8 = b'a';

/// Default permission bits of a newly created segment.
pub const DEFAULT_SEGMENT_PERMISSIONS: u32 = 0o644;

/// Default permission bits of a newly created semaphore.
pub const DEFAULT_SEMAPHORE_PERMISSIONS: u32 = 0o666;

/// Longest semaphore name accepted, leading `/` included.
pub const MAX_SEMAPHORE_NAME_LEN: usize = 251;

/// Largest arena size accepted; the segment adds the arena header on top.
pub const MAX_ARENA_SIZE: usize =
    (isize::MAX.unsigned_abs() - ARENA_HEADER_SIZE) / BLOCK_ALIGN * BLOCK_ALIGN;

/// Parameters identifying a shared arena.
///
/// Processes that use the same key path, project identifier and semaphore
/// name share one arena. Strings are converted once here, so opening an arena
/// performs no heap allocation.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    key_path: Arc<CStr>,
    project_id: u8,
    semaphore_name: Arc<CStr>,
    size: usize,
    segment_permissions: u32,
    semaphore_permissions: u32,
}

impl ArenaConfig {
    /// Validates the arena parameters.
    ///
    /// `key_path` must name an existing file that stays in place while the
    /// arena is in use. `semaphore_name` must look like `/name`. `size` is
    /// rounded down to a multiple of [`BLOCK_ALIGN`] and may not exceed
    /// [`MAX_ARENA_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidPath`], [`ArenaError::InvalidSemaphoreName`],
    /// [`ArenaError::ArenaTooSmall`] or [`ArenaError::ArenaTooLarge`] if a
    /// parameter is unusable.
    pub fn new(
        key_path: impl AsRef<Path>,
        semaphore_name: &str,
        size: usize,
    ) -> Result<Self, ArenaError> {
        let key_path = key_path.as_ref();
        let c_key_path = CString::new(key_path.as_os_str().as_bytes())
            .ok()
            .with_context(|| InvalidPathSnafu {
                path: PathBuf::from(key_path),
            })?;

        let name = semaphore_name;
        ensure!(
            name.starts_with('/'),
            InvalidSemaphoreNameSnafu {
                name,
                reason: "must start with '/'",
            }
        );
        ensure!(
            name.len() > 1 && !name[1..].contains('/'),
            InvalidSemaphoreNameSnafu {
                name,
                reason: "must be '/' followed by a non-empty name without '/'",
            }
        );
        ensure!(
            name.len() <= MAX_SEMAPHORE_NAME_LEN,
            InvalidSemaphoreNameSnafu {
                name,
                reason: "too long",
            }
        );
        let c_name = CString::new(name)
            .ok()
            .with_context(|| InvalidSemaphoreNameSnafu {
                name,
                reason: "contains a NUL byte",
            })?;

        let aligned = size - size % BLOCK_ALIGN;
        ensure!(
            aligned >= BLOCK_HEADER_SIZE,
            ArenaTooSmallSnafu {
                size,
                minimum: BLOCK_HEADER_SIZE,
            }
        );
        ensure!(
            aligned <= MAX_ARENA_SIZE,
            ArenaTooLargeSnafu {
                size,
                maximum: MAX_ARENA_SIZE,
            }
        );

        Ok(Self {
            key_path: c_key_path.into(),
            project_id: DEFAULT_PROJECT_ID,
            semaphore_name: c_name.into(),
            size: aligned,
            segment_permissions: DEFAULT_SEGMENT_PERMISSIONS,
            semaphore_permissions: DEFAULT_SEMAPHORE_PERMISSIONS,
        })
    }

    #[must_use]
    pub fn with_project_id(mut self, project_id: u8) -> Self {
        self.project_id = project_id;
        self
    }

    #[must_use]
    pub fn with_segment_permissions(mut self, permissions: u32) -> Self {
        self.segment_permissions = permissions;
        self
    }

    #[must_use]
    pub fn with_semaphore_permissions(mut self, permissions: u32) -> Self {
        self.semaphore_permissions = permissions;
        self
    }

    #[must_use]
    pub fn key_path(&self) -> &CStr {
        &self.key_path
    }

    #[must_use]
    pub fn project_id(&self) -> u8 {
        self.project_id
    }

    #[must_use]
    pub fn semaphore_name(&self) -> &CStr {
        &self.semaphore_name
    }

    pub(crate) fn semaphore_name_arc(&self) -> Arc<CStr> {
        Arc::clone(&self.semaphore_name)
    }

    /// Bytes available to blocks, headers included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn segment_permissions(&self) -> u32 {
        self.segment_permissions
    }

    #[must_use]
    pub fn semaphore_permissions(&self) -> u32 {
        self.semaphore_permissions
    }
}
