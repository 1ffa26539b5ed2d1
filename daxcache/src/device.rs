//  Copyright 2025 Daxcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Backing region management.
//!
//! The pool device owns the single large mapping every value byte lives in.
//! It is created from either a directory (an anonymous, unlinked file is
//! reserved inside it) or a DAX / block device (the whole device is mapped
//! and its true size caps the configured capacity). The mapping is volatile
//! scratch space: it is never read back after process exit and carries no
//! format.

use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::{
        fd::AsRawFd,
        unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt},
    },
    path::Path,
    ptr::NonNull,
};

use nix::{
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
    unistd::{sysconf, SysconfVar},
};

use crate::{
    bits,
    error::{Error, Result},
};

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// The memory-mapped region backing a cache pool.
pub(crate) struct PoolDevice {
    addr: NonNull<u8>,
    capacity: usize,
}

impl std::fmt::Debug for PoolDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDevice")
            .field("addr", &self.addr)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl PoolDevice {
    /// Open the backing region at `path` with (at least) `capacity` bytes.
    ///
    /// For a directory the effective capacity is `capacity` rounded up to
    /// the mapping alignment; for a device it is the configured capacity
    /// truncated down to the device size.
    pub(crate) fn open(path: &Path, capacity: usize) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.file_type().is_dir() {
            Self::open_in_dir(path, capacity)
        } else {
            Self::open_device(path, capacity)
        }
    }

    pub(crate) fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve an anonymous unlinked file in `dir` and map it.
    fn open_in_dir(dir: &Path, capacity: usize) -> Result<Self> {
        let capacity = bits::align_up(page_size(), capacity);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .mode(0o600)
            .custom_flags(libc::O_TMPFILE | libc::O_EXCL)
            .open(dir)
        {
            Ok(file) => file,
            Err(e) => {
                // Some filesystems (and kernels) lack O_TMPFILE. Fall back to
                // a named temporary file that is unlinked right away.
                tracing::warn!("O_TMPFILE failed in {dir:?} ({e}), falling back to mkstemp");
                unlinked_tmpfile(dir)?
            }
        };

        nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, capacity as libc::off_t)?;

        let addr = map_shared(&file, capacity)?;
        tracing::debug!("pool mapped at {addr:?}, capacity {capacity} (dir {dir:?})");
        Ok(Self { addr, capacity })
    }

    /// Map a pre-existing file, block device or DAX character device.
    fn open_device(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let meta = file.metadata()?;

        let device_size = if meta.file_type().is_block_device() {
            let mut size = 0u64;
            // SAFETY: BLKGETSIZE64 writes a u64 behind the pointer.
            unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(Error::from)?;
            size as usize
        } else if meta.file_type().is_char_device() {
            devdax_size(meta.rdev())?
        } else {
            meta.len() as usize
        };

        // The device size is the hard ceiling of the cache size.
        let capacity = bits::align_down(page_size(), capacity.min(device_size));
        if capacity == 0 {
            return Err(Error::invalid_argument(format!(
                "device {path:?} is too small to back a pool"
            )));
        }

        let addr = map_shared(&file, capacity)?;
        tracing::debug!("pool mapped at {addr:?}, capacity {capacity} (device {path:?})");
        Ok(Self { addr, capacity })
    }
}

impl Drop for PoolDevice {
    fn drop(&mut self) {
        // SAFETY: `addr`/`capacity` describe exactly the mapping created in
        // `open`, and nothing dereferences it after the cache is gone.
        if let Err(e) = unsafe { munmap(self.addr.cast(), self.capacity) } {
            tracing::warn!("munmap failed: {e}");
        }
    }
}

// SAFETY: the mapping is plain memory; all access synchronization is done by
// the owners of the offsets handed out by the heap.
unsafe impl Send for PoolDevice {}
unsafe impl Sync for PoolDevice {}

fn map_shared(file: &File, capacity: usize) -> Result<NonNull<u8>> {
    let len = NonZeroUsize::new(capacity)
        .ok_or_else(|| Error::invalid_argument("zero-sized pool mapping"))?;
    // SAFETY: mapping a file we own for its whole fallocated length.
    let addr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(Error::from)?;
    Ok(addr.cast())
}

/// `mkstemp` + `unlink`: the file disappears from the namespace immediately
/// and its blocks are released when the mapping goes away.
fn unlinked_tmpfile(dir: &Path) -> Result<File> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let template = dir.join("daxcache.XXXXXX");
    let (fd, path) = nix::unistd::mkstemp(&template).map_err(Error::from)?;
    // SAFETY: mkstemp returned a freshly opened descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::unistd::unlink(&path).map_err(Error::from)?;
    Ok(File::from(fd))
}

/// Size of a device-DAX character device, as published in sysfs.
fn devdax_size(rdev: u64) -> Result<usize> {
    let (major, minor) = (libc::major(rdev), libc::minor(rdev));
    let sysfs = format!("/sys/dev/char/{major}:{minor}/size");
    let raw = std::fs::read_to_string(&sysfs)?;
    raw.trim()
        .parse::<usize>()
        .map_err(|_| Error::invalid_argument(format!("cannot parse {sysfs}: {raw:?}")))
}

pub(crate) fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|sz| sz as usize)
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_dir() {
        let dir = tempfile::tempdir().unwrap();

        let device = PoolDevice::open(dir.path(), 1 << 20).unwrap();
        assert!(device.capacity() >= 1 << 20);

        // The region must be writable and readable through the mapping.
        unsafe {
            let p = device.addr().as_ptr();
            p.write(0xab);
            p.add(device.capacity() - 1).write(0xcd);
            assert_eq!(p.read(), 0xab);
            assert_eq!(p.add(device.capacity() - 1).read(), 0xcd);
        }
    }

    #[test]
    fn test_open_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let file = File::create(&path).unwrap();
        file.set_len(2 << 20).unwrap();

        // Configured capacity is truncated down to the file size.
        let device = PoolDevice::open(&path, 8 << 20).unwrap();
        assert_eq!(device.capacity(), 2 << 20);
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = PoolDevice::open(&dir.path().join("noent"), 1 << 20).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
