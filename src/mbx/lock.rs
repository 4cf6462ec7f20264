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

//! Inter-process locking for MBX mailboxes.
//!
//! Two kinds of lock are involved.
//!
//! The mailbox file itself is `flock()`ed shared by every process that has it
//! open. A process that wants to move data around (compaction, deletion,
//! renaming) must upgrade that to exclusive, which can only succeed when it is
//! the sole holder. Exclusive requests never block; a process that cannot get
//! one simply falls back to a cheaper strategy.
//!
//! The "parse permission" is a lock on a separate file in the lock directory,
//! named after the device and inode of the mailbox so that every name the
//! mailbox is reachable by shares the same lock. It serialises parsing,
//! appending, UID assignment and keyword definition. Exclusive mailbox locks
//! may only be requested while holding an exclusive parse permission for the
//! same mailbox; since the file lock request never blocks, this ordering means
//! no two processes can deadlock on each other.
//!
//! The lock directory is usually world-writable, so the lock file is treated
//! as hostile: symlinks and files with extra hard links are refused, it is
//! opened with `O_NOFOLLOW`, and after locking we check that the name still
//! refers to the inode we locked (a previous exclusive holder unlinks it on
//! release).

use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::support::environment::Environment;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// The OS-level locking operation the coordinator is built on.
///
/// Locks are associated with the open file description, so two `File`s opened
/// separately on the same path contend with each other even within one
/// process.
pub trait LockPrimitive: Send + Sync {
    /// Lock `fd` in the given mode. If `wait` is false and the lock is held
    /// incompatibly by someone else, return `Ok(false)` immediately.
    ///
    /// Requesting a different mode on an already-locked descriptor converts
    /// the lock.
    fn lock(&self, fd: RawFd, mode: LockMode, wait: bool) -> Result<bool, Error>;
    fn unlock(&self, fd: RawFd) -> Result<(), Error>;
}

/// `LockPrimitive` implemented with BSD `flock()`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flock;

impl LockPrimitive for Flock {
    fn lock(&self, fd: RawFd, mode: LockMode, wait: bool) -> Result<bool, Error> {
        let arg = match (mode, wait) {
            (LockMode::Shared, true) => FlockArg::LockShared,
            (LockMode::Shared, false) => FlockArg::LockSharedNonblock,
            (LockMode::Exclusive, true) => FlockArg::LockExclusive,
            (LockMode::Exclusive, false) => FlockArg::LockExclusiveNonblock,
        };

        loop {
            match flock(fd, arg) {
                Ok(()) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) if !wait && Errno::EWOULDBLOCK == e => return Ok(false),
                Err(e) => return Err(Error::LockUnavailable(e)),
            }
        }
    }

    fn unlock(&self, fd: RawFd) -> Result<(), Error> {
        flock(fd, FlockArg::Unlock).map_err(Error::LockUnavailable)
    }
}

/// Hands out parse permissions and mailbox file locks.
///
/// This is cheap to clone; all clones share the same primitive.
#[derive(Clone)]
pub struct LockCoordinator {
    lock_dir: PathBuf,
    protection: u32,
    primitive: Arc<dyn LockPrimitive>,
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("lock_dir", &self.lock_dir)
            .field("protection", &format_args!("{:o}", self.protection))
            .finish()
    }
}

impl LockCoordinator {
    pub fn new(env: &Environment) -> Self {
        LockCoordinator::with_primitive(env, Arc::new(Flock))
    }

    pub fn with_primitive(
        env: &Environment,
        primitive: Arc<dyn LockPrimitive>,
    ) -> Self {
        LockCoordinator {
            lock_dir: env.lock_dir.clone(),
            protection: env.lock_protection,
            primitive,
        }
    }

    /// The path of the parse permission lock file for the mailbox with the
    /// given metadata.
    pub fn lock_path(&self, mailbox: &fs::Metadata) -> PathBuf {
        self.lock_dir
            .join(format!(".{:x}.{:x}", mailbox.dev(), mailbox.ino()))
    }

    /// Acquire the parse permission for `mailbox`, blocking until it is
    /// available.
    pub fn acquire_parse_permission(
        &self,
        mailbox: &fs::File,
        mode: LockMode,
    ) -> Result<ParsePermission, Error> {
        let path = self.lock_path(&mailbox.metadata()?);

        loop {
            check_lock_file(&path)?;

            let file = match fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(self.protection)
                .custom_flags(nix::libc::O_NOFOLLOW)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if Some(nix::libc::ELOOP) == e.raw_os_error() => {
                    error!(
                        "Lock file {} became a symlink while opening",
                        path.display()
                    );
                    return Err(Error::LockSecurity(path));
                }
                Err(e) => return Err(e.into()),
            };

            // The umask may have narrowed the mode. This only succeeds for
            // the file's owner, which is fine: whoever created it already
            // fixed it.
            if let Err(e) = file_ops::chmod(&path, self.protection) {
                debug!("Can't chmod lock file {}: {}", path.display(), e);
            }

            self.primitive.lock(file.as_raw_fd(), mode, true)?;

            // An exclusive holder unlinks the lock file on release, so the
            // inode we just locked may no longer be the one at `path`.
            let held = file.metadata()?;
            match fs::symlink_metadata(&path) {
                Ok(now) if now.dev() == held.dev() && now.ino() == held.ino() => {
                    if held.nlink() > 1 {
                        let _ = self.primitive.unlock(file.as_raw_fd());
                        error!(
                            "Lock file {} acquired extra hard links",
                            path.display()
                        );
                        return Err(Error::LockSecurity(path));
                    }

                    return Ok(ParsePermission {
                        file,
                        path,
                        mode,
                        primitive: Arc::clone(&self.primitive),
                    });
                }
                Ok(_) => (),
                Err(e) if io::ErrorKind::NotFound == e.kind() => (),
                Err(e) => {
                    let _ = self.primitive.unlock(file.as_raw_fd());
                    return Err(e.into());
                }
            }

            debug!("Lock file {} replaced while waiting, retrying", path.display());
            self.primitive.unlock(file.as_raw_fd())?;
        }
    }

    /// Lock the mailbox file itself.
    ///
    /// Shared requests block. Exclusive requests never block and return
    /// `Ok(false)`, with the shared lock still held, if another process has
    /// the file open; they also require
    /// an exclusive parse permission for the same mailbox, and fail with
    /// `LockOrder` without touching the OS if it is not given.
    pub fn lock_file(
        &self,
        mailbox: &fs::File,
        mode: LockMode,
        permission: Option<&ParsePermission>,
    ) -> Result<bool, Error> {
        match mode {
            LockMode::Shared => {
                self.primitive.lock(mailbox.as_raw_fd(), LockMode::Shared, true)
            }
            LockMode::Exclusive => {
                let path = self.lock_path(&mailbox.metadata()?);
                match permission {
                    Some(p) if LockMode::Exclusive == p.mode && path == p.path => {
                        let fd = mailbox.as_raw_fd();
                        if self.primitive.lock(fd, LockMode::Exclusive, false)? {
                            return Ok(true);
                        }

                        // flock() may release the shared lock before
                        // failing the conversion.
                        debug!("Mailbox {} is in use elsewhere", path.display());
                        self.primitive.lock(fd, LockMode::Shared, true)?;
                        Ok(false)
                    }
                    _ => {
                        error!(
                            "Exclusive lock of mailbox requested without \
                             holding {}",
                            path.display()
                        );
                        Err(Error::LockOrder)
                    }
                }
            }
        }
    }

    pub fn unlock_file(&self, mailbox: &fs::File) -> Result<(), Error> {
        self.primitive.unlock(mailbox.as_raw_fd())
    }

    /// Try to upgrade the lock on `mailbox` to exclusive.
    ///
    /// On success, returns a guard which downgrades the lock back to shared
    /// when dropped. The guard cannot outlive `permission`.
    pub fn try_exclusive<'a>(
        &self,
        mailbox: &fs::File,
        permission: &'a ParsePermission,
    ) -> Result<Option<ExclusiveLock<'a>>, Error> {
        if self.lock_file(mailbox, LockMode::Exclusive, Some(permission))? {
            Ok(Some(ExclusiveLock {
                // Shares the open file description, and therefore the lock
                file: mailbox.try_clone()?,
                primitive: Arc::clone(&self.primitive),
                _permission: PhantomData,
            }))
        } else {
            Ok(None)
        }
    }
}

/// Refuse to open lock files that look like an attack.
fn check_lock_file(path: &Path) -> Result<(), Error> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.file_type().is_symlink() => {
            error!("Lock file {} is a symlink", path.display());
            Err(Error::LockSecurity(path.to_owned()))
        }
        Ok(md) if md.nlink() > 1 => {
            error!(
                "Lock file {} has {} hard links",
                path.display(),
                md.nlink()
            );
            Err(Error::LockSecurity(path.to_owned()))
        }
        Ok(_) => Ok(()),
        Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A held parse permission. Released on drop.
pub struct ParsePermission {
    file: fs::File,
    path: PathBuf,
    mode: LockMode,
    primitive: Arc<dyn LockPrimitive>,
}

impl fmt::Debug for ParsePermission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParsePermission")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for ParsePermission {
    fn drop(&mut self) {
        // Unlink before unlocking so that nobody can acquire the inode we are
        // about to abandon without noticing it is gone.
        if LockMode::Exclusive == self.mode {
            if let Err(e) = fs::remove_file(&self.path).ignore_not_found() {
                debug!("Failed to remove {}: {}", self.path.display(), e);
            }
        }

        if let Err(e) = self.primitive.unlock(self.file.as_raw_fd()) {
            error!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// An exclusive lock on a mailbox file, downgraded to shared on drop.
pub struct ExclusiveLock<'a> {
    file: fs::File,
    primitive: Arc<dyn LockPrimitive>,
    _permission: PhantomData<&'a ParsePermission>,
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        if let Err(e) =
            self.primitive
                .lock(self.file.as_raw_fd(), LockMode::Shared, true)
        {
            error!("Failed to downgrade mailbox lock: {}", e);
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum LockEvent {
        Lock { fd: RawFd, mode: LockMode, wait: bool },
        Unlock { fd: RawFd },
    }

    /// A `LockPrimitive` which delegates to `Flock` but records every call,
    /// and panics if a non-blocking exclusive lock is requested while no
    /// blocking exclusive lock (i.e., a parse permission) is held.
    #[derive(Default)]
    pub struct RecordingPrimitive {
        pub events: Mutex<Vec<LockEvent>>,
        held_permissions: Mutex<HashSet<RawFd>>,
    }

    impl RecordingPrimitive {
        pub fn events(&self) -> Vec<LockEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl LockPrimitive for RecordingPrimitive {
        fn lock(
            &self,
            fd: RawFd,
            mode: LockMode,
            wait: bool,
        ) -> Result<bool, Error> {
            self.events
                .lock()
                .unwrap()
                .push(LockEvent::Lock { fd, mode, wait });

            match (mode, wait) {
                (LockMode::Exclusive, false) => assert!(
                    !self.held_permissions.lock().unwrap().is_empty(),
                    "exclusive mailbox lock without parse permission"
                ),
                (LockMode::Exclusive, true) => {
                    self.held_permissions.lock().unwrap().insert(fd);
                }
                _ => (),
            }

            let result = Flock.lock(fd, mode, wait);
            if let (LockMode::Exclusive, true, Err(_)) = (mode, wait, &result) {
                self.held_permissions.lock().unwrap().remove(&fd);
            }
            result
        }

        fn unlock(&self, fd: RawFd) -> Result<(), Error> {
            self.events.lock().unwrap().push(LockEvent::Unlock { fd });
            self.held_permissions.lock().unwrap().remove(&fd);
            Flock.unlock(fd)
        }
    }
}
