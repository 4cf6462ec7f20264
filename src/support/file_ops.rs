//-
// Copyright (c) 2026, The mbxstore authors
//
// This file is part of mbxstore.
//
// mbxstore is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option) any
// later version.
//
// mbxstore is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// mbxstore. If not, see <http://www.gnu.org/licenses/>.

//! Miscellaneous functions for working with files.

use std::fs;
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;

use log::error;
use nix::sys::stat::futimens;
use nix::sys::time::TimeSpec;

use crate::support::environment::Environment;
use crate::support::error::Error;

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Read bytes at `offset` into `dst` until `dst` is full or EOF is reached.
///
/// `Interrupted` errors are ignored and retried. Other errors are propagated.
pub fn read_full_at(
    file: &fs::File,
    mut dst: &mut [u8],
    mut offset: u64,
) -> io::Result<usize> {
    let mut total = 0;
    while !dst.is_empty() {
        match file.read_at(dst, offset) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                offset += n as u64;
                dst = &mut dst[n..];
            }
            Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

/// Whether a failed write risks clobbering data if we simply give up.
///
/// These are conditions an administrator can fix (by freeing space) while we
/// wait.
fn is_serious(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(nix::libc::ENOSPC) | Some(nix::libc::EDQUOT)
    )
}

/// Run `op`, retrying after the configured back-off if it fails with a
/// serious disk error.
fn retry_serious<R>(
    log_prefix: &str,
    env: &Environment,
    what: &str,
    mut op: impl FnMut() -> io::Result<R>,
) -> Result<R, Error> {
    let mut attempts = 0;
    loop {
        match op() {
            Ok(r) => return Ok(r),
            Err(e) if is_serious(&e) && attempts < env.disk_error_retries => {
                attempts += 1;
                error!(
                    "{} {} failed ({}), retrying in {}s",
                    log_prefix,
                    what,
                    e,
                    env.disk_error_backoff_secs
                );
                thread::sleep(env.disk_error_backoff());
            }
            Err(e) => {
                error!("{} {} failed: {}", log_prefix, what, e);
                return Err(e.into());
            }
        }
    }
}

/// Write all of `data` at `offset`.
pub fn write_all_at(
    log_prefix: &str,
    env: &Environment,
    file: &fs::File,
    data: &[u8],
    offset: u64,
) -> Result<(), Error> {
    retry_serious(log_prefix, env, "Write", || file.write_all_at(data, offset))
}

/// `fsync()` the file.
pub fn sync(
    log_prefix: &str,
    env: &Environment,
    file: &fs::File,
) -> Result<(), Error> {
    retry_serious(log_prefix, env, "Sync", || file.sync_all())
}

/// Truncate (or extend) the file to `len` bytes.
pub fn truncate(
    log_prefix: &str,
    env: &Environment,
    file: &fs::File,
    len: u64,
) -> Result<(), Error> {
    retry_serious(log_prefix, env, "Truncate", || file.set_len(len))
}

/// Set the access time of `file` to one second past its modification time.
///
/// Mail readers conventionally treat a mailbox whose access time is later
/// than its modification time as having been read since the last delivery.
pub fn mark_read(file: &fs::File) -> Result<(), Error> {
    let md = file.metadata()?;
    let mtime = mtime_of(&md);
    let atime = TimeSpec::new(mtime.0 + 1, mtime.1);
    futimens(file.as_raw_fd(), &atime, &TimeSpec::UTIME_OMIT)?;
    Ok(())
}

/// Extract the modification time as (seconds, nanoseconds).
pub fn mtime_of(md: &fs::Metadata) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (md.mtime(), md.mtime_nsec())
}

pub trait IgnoreKinds {
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

pub trait ErrorTransforms {
    type Coerced;
    fn on_exists(self, error: Error) -> Self::Coerced;
    fn on_not_found(self, error: Error) -> Self::Coerced;
}

impl<R, E: Into<Error>> ErrorTransforms for Result<R, E> {
    type Coerced = Result<R, Error>;

    fn on_exists(self, error: Error) -> Result<R, Error> {
        match self.map_err(|e| e.into()) {
            Err(Error::Io(e)) if io::ErrorKind::AlreadyExists == e.kind() => {
                Err(error)
            }
            Err(Error::Nix(nix::errno::Errno::EEXIST)) => Err(error),
            s => s,
        }
    }

    fn on_not_found(self, error: Error) -> Result<R, Error> {
        match self.map_err(|e| e.into()) {
            Err(Error::Io(e)) if io::ErrorKind::NotFound == e.kind() => {
                Err(error)
            }
            Err(Error::Nix(nix::errno::Errno::ENOENT)) => Err(error),
            s => s,
        }
    }
}
