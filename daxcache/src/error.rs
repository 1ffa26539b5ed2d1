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

use std::io;

use nix::errno::Errno;

/// Error type for all cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller passed a degenerate argument (bad sizes, reconfiguration
    /// after the cache is armed, ...). Never retried internally.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No entry with the given key exists.
    #[error("entry not found")]
    NotFound,

    /// A put found an entry with the exact same key already indexed.
    #[error("entry already exists")]
    AlreadyExists,

    /// The value cannot fit into the pool, even after evicting everything
    /// that is evictable.
    #[error("not enough space in the pool")]
    NoSpace,

    /// Eviction was requested but the replacement policy has nothing to
    /// offer: the cache is empty, every entry is pinned by concurrent users,
    /// or the policy does not support victim selection at all.
    #[error("no entry eligible for eviction")]
    NoEvictableEntry,

    /// The entry is transiently locked by another thread.
    #[error("entry is busy")]
    Busy,

    /// An operating system error while arming the cache (open, fallocate,
    /// mmap). Carries the underlying errno.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno a C caller would observe for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidArgument(_) => Errno::EINVAL,
            Self::NotFound => Errno::ENOENT,
            Self::AlreadyExists => Errno::EEXIST,
            Self::NoSpace => Errno::ENOSPC,
            Self::NoEvictableEntry => Errno::ESRCH,
            Self::Busy => Errno::EBUSY,
            Self::Io(e) => e
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound.errno(), Errno::ENOENT);
        assert_eq!(Error::AlreadyExists.errno(), Errno::EEXIST);
        assert_eq!(Error::NoSpace.errno(), Errno::ENOSPC);
        assert_eq!(Error::NoEvictableEntry.errno(), Errno::ESRCH);
        assert_eq!(Error::invalid_argument("x").errno(), Errno::EINVAL);
        assert_eq!(Error::from(Errno::EACCES).errno(), Errno::EACCES);
    }
}
