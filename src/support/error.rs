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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Format errors. These are always fatal to the stream that hit them.
    #[error("Not an MBX mailbox")]
    NotMbx,
    #[error("Corrupt MBX header")]
    CorruptHeader,
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: &'static str },
    #[error("Message at offset {offset} runs past end of file")]
    TruncatedMessage { offset: u64 },
    #[error("Mailbox shrank from {was} to {now} bytes")]
    MailboxShrank { was: u64, now: u64 },

    // Lock errors
    #[error("Exclusive mailbox lock requested without parse permission")]
    LockOrder,
    #[error("Mailbox in use by another process")]
    MailboxInUse,
    #[error("Unable to lock mailbox: {0}")]
    LockUnavailable(nix::errno::Errno),
    #[error("Refusing to use suspicious lock file {0}")]
    LockSecurity(PathBuf),

    // Usage errors
    #[error("Mailbox is read-only")]
    ReadOnly,
    #[error("Mailbox stream has been closed")]
    StreamClosed,
    #[error("No such message")]
    NoSuchMessage,
    #[error("Bad message sequence")]
    BadSequence,
    #[error("Unknown system flag")]
    NxFlag,
    #[error("Unsafe keyword or mailbox name")]
    UnsafeName,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("No such mailbox")]
    NxMailbox,

    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether this error indicates the on-disk format can no longer be
    /// trusted.
    pub fn is_format_error(&self) -> bool {
        matches!(
            *self,
            Error::NotMbx
                | Error::CorruptHeader
                | Error::CorruptRecord { .. }
                | Error::TruncatedMessage { .. }
                | Error::MailboxShrank { .. }
        )
    }
}
