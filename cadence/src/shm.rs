//! POSIX shared memory region for the snapshot ring.
//!
//! The host creates a runtime-sized region and writes state slices into it;
//! companion processes may map the same object read-only to inspect slices
//! directly. Cleanup follows a typestate pattern:
//!
//! - [`Creator`]: creates the object, maps read-write, unlinks on drop
//! - [`Opener`]: opens an existing object, maps read-only, never unlinks
//!
//! Unlike a typed mapping, the region is an untyped byte range; the slice
//! layout on top of it is owned by [`crate::ring`].

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::marker::PhantomData;
use std::ptr::{NonNull, null_mut};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced when creating or opening a shared region.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The POSIX shared memory name is not acceptable to `shm_open`.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `ftruncate`, `fstat` or `mmap` failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },

    /// The existing object's size does not match the expected region size.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },

    /// A region of zero bytes was requested.
    #[error("shared memory region must not be empty")]
    EmptyRegion,
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Cleanup behavior marker; see [`Creator`] and [`Opener`].
pub trait ShmMode {
    const SHOULD_UNLINK: bool;
    const PROT: ProtFlags;
}

/// Marker for the process that creates the region. Drop unmaps and unlinks.
#[derive(Debug)]
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
    const PROT: ProtFlags = ProtFlags::READ.union(ProtFlags::WRITE);
}

/// Marker for processes that inspect an existing region. The mapping is
/// read-only and drop leaves the name for the creator to clean up.
#[derive(Debug)]
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
    const PROT: ProtFlags = ProtFlags::READ;
}

/// A mapped POSIX shared memory object of `len` bytes.
#[derive(Debug)]
pub struct SharedRegion<M: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: String,
    _mode: PhantomData<M>,
}

// SAFETY: the mapping is plain shared memory, not thread-local state; all
// mutation goes through raw pointers whose exclusivity is enforced by the
// ring's cursor protocol, never through &mut aliasing.
unsafe impl<M: ShmMode> Send for SharedRegion<M> {}
// SAFETY: see above; &SharedRegion exposes only the base pointer and length.
unsafe impl<M: ShmMode> Sync for SharedRegion<M> {}

const POSIX_NAME_MAX: usize = 255;

/// Validates a name against portable `shm_open` requirements: leading `/`,
/// no further slashes, at most 255 bytes.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }
    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }
    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }
    Ok(())
}

impl SharedRegion<Creator> {
    /// Creates a fresh region of `len` zeroed bytes at `path`.
    ///
    /// Fails with `EEXIST` if an object of that name already exists; a host
    /// that wants to reclaim a leftover from a crashed run should
    /// `shm::unlink` first.
    pub fn create(path: &str, len: usize) -> Result<Self> {
        validate_shm_path(path)?;
        if len == 0 {
            return Err(ShmError::EmptyRegion);
        }

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        // SAFETY: fresh mapping of a kernel object that aliases no existing
        // Rust allocation; ftruncate succeeded so the object spans `len`
        // bytes; mmap returns page-aligned addresses. The object is
        // zero-filled by the kernel, which is the region's initial state.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                len,
                <Creator as ShmMode>::PROT,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };

        Ok(Self {
            ptr,
            len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl SharedRegion<Opener> {
    /// Opens an existing region, verifying its size, and maps it read-only.
    pub fn open(path: &str, expected_len: usize) -> Result<Self> {
        validate_shm_path(path)?;
        if expected_len == 0 {
            return Err(ShmError::EmptyRegion);
        }

        let fd = shm::open(path, shm::OFlags::RDONLY, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path, err));
            }
        };
        if stat.st_size != expected_len as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: expected_len,
                actual: stat.st_size,
            });
        }

        // SAFETY: the object exists and spans `expected_len` bytes (fstat
        // above); the mapping is read-only and aliases no local allocation.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                expected_len,
                <Opener as ShmMode>::PROT,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };

        Ok(Self {
            ptr,
            len: expected_len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<M: ShmMode> SharedRegion<M> {
    /// Base address of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Object name this region was created from.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<M: ShmMode> Drop for SharedRegion<M> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping established at
        // construction and nothing else unmaps it.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }
        if M::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_open_read() -> Result<()> {
        let path = "/cadence-test-region";
        let _ = shm::unlink(path);

        let region = match SharedRegion::<Creator>::create(path, 64) {
            Ok(region) => region,
            Err(err @ ShmError::PosixError { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("skipping create_write_open_read: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // SAFETY: exclusive access in this test, offset within bounds.
        unsafe {
            region.as_ptr().as_ptr().add(5).write(0xA7);
        }

        let reader = SharedRegion::<Opener>::open(path, 64)?;
        // SAFETY: read-only view of the 64-byte mapping.
        let byte = unsafe { reader.as_ptr().as_ptr().add(5).read() };
        assert_eq!(byte, 0xA7);
        Ok(())
    }

    #[test]
    fn open_rejects_size_mismatch() -> Result<()> {
        let path = "/cadence-test-mismatch";
        let _ = shm::unlink(path);

        let _region = match SharedRegion::<Creator>::create(path, 32) {
            Ok(region) => region,
            Err(err @ ShmError::PosixError { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("skipping open_rejects_size_mismatch: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match SharedRegion::<Opener>::open(path, 48) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 48);
                assert_eq!(actual, 32);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn path_validation() {
        assert!(validate_shm_path("/fine-name").is_ok());
        assert!(matches!(
            validate_shm_path("no-slash"),
            Err(ShmError::InvalidPath { .. })
        ));
        assert!(matches!(
            validate_shm_path("/a/b"),
            Err(ShmError::InvalidPath { .. })
        ));
        let long = format!("/{}", "x".repeat(255));
        assert!(matches!(
            validate_shm_path(&long),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn zero_length_rejected() {
        assert!(matches!(
            SharedRegion::<Creator>::create("/cadence-test-zero", 0),
            Err(ShmError::EmptyRegion)
        ));
    }
}
