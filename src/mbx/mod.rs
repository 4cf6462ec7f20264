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

//! The MBX mailbox format.
//!
//! An MBX mailbox is a single file. It starts with a fixed 2048-byte header
//! block:
//!
//! ```text
//! *mbx*\r\n
//! <8 hex digits UIDVALIDITY><8 hex digits last assigned UID>\r\n
//! keyword 0\r\n
//! ...
//! keyword 29\r\n
//! <zero padding>
//! ```
//!
//! Empty keyword slots are empty lines. After the header, the file is a
//! sequence of records, each a record line followed by exactly `size` bytes
//! of message data:
//!
//! ```text
//! <dd-Mon-yyyy hh:mm:ss +zzzz>,<size>;<8 hex user flags><4 hex system flags>-<8 hex UID>\r\n
//! ```
//!
//! The day is space-padded. The user flag bits index the keyword table. The
//! system flag bits are `SEEN`, `DELETED`, `FLAGGED`, `ANSWERED` and `DRAFT`
//! plus the high `EXPUNGED` bit, which marks a record as hidden: logically
//! gone, but still occupying space because some other process had the file
//! open when it was expunged. Hidden records are dropped when the file is
//! next compacted.
//!
//! The 21-byte status field at the end of the record line (flags and UID) is
//! the only part of a record ever rewritten in place, which is what lets
//! several processes share a mailbox without rewriting it. A UID of zero
//! means "not yet assigned"; appenders write zero and the next process to
//! parse the record assigns the next UID under the parse permission (see
//! `lock`).
//!
//! The file only ever grows, except by compaction, which requires that no
//! other process has it open. A mailbox seen to shrink is treated as corrupt.

use std::path::Path;
use std::sync::Arc;

use chrono::prelude::*;

use crate::driver::{MailboxDriver, MailboxStream};
use crate::model::*;
use crate::support::environment::Environment;
use crate::support::error::Error;

pub mod admin;
mod append;
pub mod codec;
mod expunge;
mod fetch;
pub mod flags;
pub mod lock;
mod parse;
mod snarf;
pub mod stream;

pub use self::append::append;
pub use self::expunge::{RewriteMode, RewriteOutcome};
pub use self::lock::{LockCoordinator, LockMode, LockPrimitive};
pub use self::parse::ParseOutcome;
pub use self::stream::{MbxStream, MessageEntry};

/// The `MailboxDriver` for MBX files.
#[derive(Clone, Debug)]
pub struct MbxDriver {
    env: Arc<Environment>,
    locks: LockCoordinator,
}

impl MbxDriver {
    pub fn new(env: Environment) -> Self {
        let locks = LockCoordinator::new(&env);
        MbxDriver {
            env: Arc::new(env),
            locks,
        }
    }

    /// Create a driver whose locks go through `primitive`.
    pub fn with_lock_primitive(
        env: Environment,
        primitive: Arc<dyn LockPrimitive>,
    ) -> Self {
        let locks = LockCoordinator::with_primitive(&env, primitive);
        MbxDriver {
            env: Arc::new(env),
            locks,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }
}

impl MailboxDriver for MbxDriver {
    type Stream = MbxStream;

    fn name(&self) -> &'static str {
        "mbx"
    }

    fn is_valid(&self, path: &Path) -> bool {
        admin::is_valid(path)
    }

    fn create(&self, path: &Path) -> Result<(), Error> {
        admin::create(&self.env, path)
    }

    fn delete(&self, path: &Path) -> Result<(), Error> {
        admin::delete(&self.locks, path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        admin::rename(&self.locks, from, to)
    }

    fn open(
        &self,
        path: &Path,
        options: OpenOptions,
    ) -> Result<MbxStream, Error> {
        MbxStream::open(path, Arc::clone(&self.env), self.locks.clone(), options)
    }

    fn append(
        &self,
        path: &Path,
        messages: &[AppendMessage],
    ) -> Result<(), Error> {
        append::append(&self.env, &self.locks, path, messages)
    }
}

impl MailboxStream for MbxStream {
    fn count(&self) -> usize {
        MbxStream::count(self)
    }

    fn status(&self) -> MailboxStatus {
        MbxStream::status(self)
    }

    fn uid_of(&self, msgno: u32) -> Result<u32, Error> {
        MbxStream::uid_of(self, msgno)
    }

    fn msgno_of(&self, uid: u32) -> Option<u32> {
        MbxStream::msgno_of(self, uid)
    }

    fn resolve(&self, selector: &Selector) -> Result<Vec<u32>, Error> {
        MbxStream::resolve(self, selector)
    }

    fn ping(&mut self) -> Result<PollResponse, Error> {
        MbxStream::ping(self)
    }

    fn check(&mut self) -> Result<PollResponse, Error> {
        MbxStream::check(self)
    }

    fn expunge(&mut self) -> Result<ExpungeResponse, Error> {
        MbxStream::expunge(self)
    }

    fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>, Error> {
        MbxStream::fetch_header(self, msgno)
    }

    fn fetch_text(&mut self, msgno: u32, peek: bool) -> Result<Vec<u8>, Error> {
        MbxStream::fetch_text(self, msgno, peek)
    }

    fn fetch_message(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error> {
        MbxStream::fetch_message(self, msgno, peek)
    }

    fn fetch_flags(&mut self, msgno: u32) -> Result<Vec<Flag>, Error> {
        MbxStream::fetch_flags(self, msgno)
    }

    fn internal_date(
        &self,
        msgno: u32,
    ) -> Result<DateTime<FixedOffset>, Error> {
        MbxStream::internal_date(self, msgno)
    }

    fn set_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error> {
        MbxStream::set_flags(self, selector, flags)
    }

    fn clear_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error> {
        MbxStream::clear_flags(self, selector, flags)
    }

    fn copy(
        &mut self,
        selector: &Selector,
        dest: &Path,
        move_messages: bool,
    ) -> Result<usize, Error> {
        MbxStream::copy(self, selector, dest, move_messages)
    }

    fn close(self, expunge: bool) -> Result<(), Error> {
        MbxStream::close(self, expunge)
    }
}
