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

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::info;

use super::codec::{Header, HDRSIZE};
use super::lock::{LockCoordinator, LockMode};
use super::parse::next_uid_validity;
use super::stream::read_header;
use crate::support::environment::Environment;
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};

/// Create a new, empty mailbox at `path`.
pub fn create(env: &Environment, path: &Path) -> Result<(), Error> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(env.mailbox_protection)
        .open(path)
        .on_exists(Error::MailboxExists)?;

    let header = Header::new(next_uid_validity(0));
    let log_prefix = format!("mbx:{}", path.display());
    let result = file
        .write_all(&header.encode())
        .map_err(Error::from)
        .and_then(|_| file_ops::sync(&log_prefix, env, &file));
    if let Err(e) = result {
        let _ = fs::remove_file(path);
        return Err(e);
    }

    info!("{} Created", log_prefix);
    Ok(())
}

/// Whether `path` looks like an MBX mailbox.
pub fn is_valid(path: &Path) -> bool {
    fs::File::open(path)
        .map_err(Error::from)
        .and_then(|file| {
            let md = file.metadata()?;
            if !md.is_file() || md.len() < HDRSIZE as u64 {
                return Err(Error::NotMbx);
            }
            read_header(&file)
        })
        .is_ok()
}

/// Delete the mailbox at `path`, which must not be open anywhere.
pub fn delete(locks: &LockCoordinator, path: &Path) -> Result<(), Error> {
    with_sole_access(locks, path, || {
        fs::remove_file(path)?;
        info!("mbx:{} Deleted", path.display());
        Ok(())
    })
}

/// Rename the mailbox at `from` to `to`, which must not exist. The mailbox
/// must not be open anywhere.
pub fn rename(
    locks: &LockCoordinator,
    from: &Path,
    to: &Path,
) -> Result<(), Error> {
    with_sole_access(locks, from, || {
        // Linking fails if `to` exists, unlike rename()
        fs::hard_link(from, to).on_exists(Error::MailboxExists)?;
        fs::remove_file(from)?;
        info!("mbx:{} Renamed to {}", from.display(), to.display());
        Ok(())
    })
}

fn with_sole_access<R>(
    locks: &LockCoordinator,
    path: &Path,
    f: impl FnOnce() -> Result<R, Error>,
) -> Result<R, Error> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .on_not_found(Error::NxMailbox)?;
    read_header(&file)?;

    locks.lock_file(&file, LockMode::Shared, None)?;
    let permission = locks.acquire_parse_permission(&file, LockMode::Exclusive)?;
    let exclusive = locks.try_exclusive(&file, &permission)?;
    if exclusive.is_none() {
        return Err(Error::MailboxInUse);
    }

    f()
}
