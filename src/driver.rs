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

//! The interface between a mail access layer and a storage format.
//!
//! A `MailboxDriver` knows how to recognise, create and manipulate mailboxes
//! of one format; opening one yields a `MailboxStream`, which is the session
//! state for one client's view of that mailbox.

use std::path::Path;

use chrono::prelude::*;

use crate::model::*;
use crate::support::error::Error;

pub trait MailboxDriver {
    type Stream: MailboxStream;

    /// The name of the format, for diagnostics.
    fn name(&self) -> &'static str;
    fn is_valid(&self, path: &Path) -> bool;
    fn create(&self, path: &Path) -> Result<(), Error>;
    fn delete(&self, path: &Path) -> Result<(), Error>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;
    fn open(
        &self,
        path: &Path,
        options: OpenOptions,
    ) -> Result<Self::Stream, Error>;
    fn append(
        &self,
        path: &Path,
        messages: &[AppendMessage],
    ) -> Result<(), Error>;
}

pub trait MailboxStream {
    fn count(&self) -> usize;
    fn status(&self) -> MailboxStatus;
    fn uid_of(&self, msgno: u32) -> Result<u32, Error>;
    fn msgno_of(&self, uid: u32) -> Option<u32>;
    fn resolve(&self, selector: &Selector) -> Result<Vec<u32>, Error>;

    fn ping(&mut self) -> Result<PollResponse, Error>;
    fn check(&mut self) -> Result<PollResponse, Error>;
    fn expunge(&mut self) -> Result<ExpungeResponse, Error>;

    fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>, Error>;
    fn fetch_text(&mut self, msgno: u32, peek: bool) -> Result<Vec<u8>, Error>;
    fn fetch_message(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error>;
    fn fetch_flags(&mut self, msgno: u32) -> Result<Vec<Flag>, Error>;
    fn internal_date(&self, msgno: u32)
        -> Result<DateTime<FixedOffset>, Error>;

    fn set_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error>;
    fn clear_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error>;
    fn copy(
        &mut self,
        selector: &Selector,
        dest: &Path,
        move_messages: bool,
    ) -> Result<usize, Error>;

    fn close(self, expunge: bool) -> Result<(), Error>
    where
        Self: Sized;
}
