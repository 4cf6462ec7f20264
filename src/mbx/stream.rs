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

use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::prelude::*;
use log::{error, info, warn};

use super::codec::*;
use super::lock::{LockCoordinator, LockMode, ParsePermission};
use crate::model::*;
use crate::support::environment::Environment;
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};

/// What is cached about one visible message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEntry {
    pub uid: u32,
    pub sys_flags: SysFlags,
    pub user_flags: u32,
    pub internal_date: DateTime<FixedOffset>,
    /// Size of the message data, excluding the record line.
    pub size: u64,
    /// Offset of the record line.
    pub offset: u64,
    /// Length of the record line including its CRLF.
    pub line_len: u64,
    /// Length of the message header, once it has been computed.
    pub header_size: Option<u64>,
    /// Whether the flags are known to match what is on disk.
    pub valid: bool,
    /// Whether this stream assigned the message's UID.
    pub recent: bool,
}

impl MessageEntry {
    pub fn data_offset(&self) -> u64 {
        self.offset + self.line_len
    }

    pub fn status_offset(&self) -> u64 {
        self.data_offset() - STATUS_FIELD_BACKOFF
    }

    /// Total bytes occupied in the file by the record line and data.
    pub fn record_len(&self) -> u64 {
        self.line_len + self.size
    }

    pub fn status(&self) -> StatusField {
        StatusField {
            user_flags: self.user_flags,
            sys_flags: self.sys_flags,
            uid: self.uid,
        }
    }
}

/// An open MBX mailbox.
///
/// Every process with the mailbox open holds a shared lock on the file for as
/// long as the stream lives. See the `lock` module for how this interacts
/// with parsing and compaction.
pub struct MbxStream {
    pub(super) log_prefix: String,
    pub(super) path: PathBuf,
    pub(super) file: fs::File,
    pub(super) env: Arc<Environment>,
    pub(super) locks: LockCoordinator,
    pub(super) read_only: bool,
    pub(super) inbox: bool,

    pub(super) header: Header,
    pub(super) messages: Vec<MessageEntry>,
    /// How far the file has been parsed.
    pub(super) file_size: u64,
    /// The modification time as of our own last write or refresh.
    pub(super) mtime: (i64, i64),
    /// Highest UID seen in record order, including hidden records.
    pub(super) last_uid_seen: u32,

    /// Flags on disk may have been changed by someone else.
    pub(super) flagcheck: bool,
    /// A full resync and reclamation attempt has been requested.
    pub(super) fullcheck: bool,
    /// The file contains hidden records whose space has not been reclaimed.
    pub(super) expunged: bool,
    pub(super) last_snarf: Option<Instant>,
    pub(super) closed: bool,

    /// Changes not yet reported by `ping()`.
    pub(super) pending: PollResponse,
    pub(super) pending_new: bool,

    /// Scratch space for bulk reads.
    pub(super) buf: Vec<u8>,
}

impl fmt::Debug for MbxStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MbxStream")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("messages", &self.messages.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl MbxStream {
    /// Open the mailbox at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        env: Arc<Environment>,
        locks: LockCoordinator,
        options: OpenOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let log_prefix = format!("mbx:{}", path.display());
        let mut read_only = options.read_only;

        let file = match fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
        {
            Err(e) if !read_only && io::ErrorKind::PermissionDenied == e.kind() => {
                warn!("{} Can't open for writing, opening read-only", log_prefix);
                read_only = true;
                fs::File::open(&path)
            }
            r => r,
        }
        .on_not_found(Error::NxMailbox)?;

        let md = file.metadata()?;
        if !md.is_file() || md.len() < HDRSIZE as u64 {
            return Err(Error::NotMbx);
        }

        locks.lock_file(&file, LockMode::Shared, None)?;

        let mut this = MbxStream {
            log_prefix,
            path,
            file,
            env,
            locks,
            read_only,
            inbox: options.inbox,
            header: Header::new(0),
            messages: Vec::new(),
            file_size: 0,
            mtime: (0, 0),
            last_uid_seen: 0,
            flagcheck: false,
            fullcheck: false,
            expunged: false,
            last_snarf: None,
            closed: false,
            pending: PollResponse::default(),
            pending_new: false,
            buf: Vec::new(),
        };

        {
            let permission = this.permission()?;
            this.parse(&permission)?;
        }

        if this.snarf_eligible() {
            this.try_snarf()?;
        }

        // Everything found so far is the initial state, not news
        this.pending = PollResponse::default();
        this.pending_new = false;

        info!(
            "{} Opened{}, {} messages, UIDVALIDITY {}",
            this.log_prefix,
            if this.read_only { " read-only" } else { "" },
            this.messages.len(),
            this.header.uid_validity
        );
        Ok(this)
    }

    /// Close the stream, first expunging if requested and possible.
    pub fn close(mut self, expunge: bool) -> Result<(), Error> {
        if expunge && !self.read_only && !self.closed {
            self.expunge()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn uid_validity(&self) -> u32 {
        self.header.uid_validity
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn uid_of(&self, msgno: u32) -> Result<u32, Error> {
        Ok(self.entry(msgno)?.uid)
    }

    /// Return the sequence number of the message with the given UID.
    pub fn msgno_of(&self, uid: u32) -> Option<u32> {
        self.messages
            .binary_search_by_key(&uid, |m| m.uid)
            .ok()
            .map(|ix| ix as u32 + 1)
    }

    /// Return the cached entry for `msgno`.
    pub fn entry(&self, msgno: u32) -> Result<&MessageEntry, Error> {
        self.ensure_open()?;
        msgno
            .checked_sub(1)
            .and_then(|ix| self.messages.get(ix as usize))
            .ok_or(Error::NoSuchMessage)
    }

    pub fn status(&self) -> MailboxStatus {
        MailboxStatus {
            messages: self.messages.len(),
            recent: self.messages.iter().filter(|m| m.recent).count(),
            unseen: self
                .messages
                .iter()
                .filter(|m| !m.sys_flags.contains(SysFlags::SEEN))
                .count(),
            uid_next: self.header.uid_last.saturating_add(1),
            uid_validity: self.header.uid_validity,
        }
    }

    /// Check for changes made by other processes and report everything the
    /// client has not yet been told about.
    pub fn ping(&mut self) -> Result<PollResponse, Error> {
        self.ensure_open()?;
        let result = self.ping_impl();
        self.fatal_check(result)
    }

    /// Like `ping()`, but forces every flag to be re-read from disk and tries
    /// to reclaim space from hidden messages.
    pub fn check(&mut self) -> Result<PollResponse, Error> {
        self.ensure_open()?;
        self.flagcheck = true;
        self.fullcheck = true;
        self.ping()
    }

    fn ping_impl(&mut self) -> Result<PollResponse, Error> {
        if self.snarf_eligible() {
            self.try_snarf()?;
        }

        let md = self.file.metadata()?;
        if md.len() != self.file_size
            || file_ops::mtime_of(&md) != self.mtime
            || self.flagcheck
            || self.fullcheck
        {
            let permission = self.permission()?;
            self.catch_up(&permission)?;
        }

        if !self.read_only && (self.expunged || self.fullcheck) {
            self.rewrite(false)?;
        }
        self.fullcheck = false;

        Ok(self.take_pending())
    }

    fn take_pending(&mut self) -> PollResponse {
        let mut response = mem::take(&mut self.pending);
        if mem::replace(&mut self.pending_new, false) {
            response.exists = Some(self.messages.len());
            response.recent = Some(self.status().recent);
        }
        response.fetch.sort_unstable();
        response.fetch.dedup();
        response
    }

    /// Bring the cache fully up to date with the file.
    ///
    /// Must be called while holding an exclusive parse permission.
    pub(super) fn catch_up(
        &mut self,
        permission: &ParsePermission,
    ) -> Result<(), Error> {
        let md = self.file.metadata()?;
        if self.flagcheck
            || self.fullcheck
            || file_ops::mtime_of(&md) != self.mtime
        {
            self.refresh_flags()?;
        }
        self.parse(permission)?;
        Ok(())
    }

    /// Re-read the status field of every cached message.
    ///
    /// Messages hidden by another process are removed from the cache and
    /// queued as expunged.
    fn refresh_flags(&mut self) -> Result<(), Error> {
        let mut ix = 0;
        while ix < self.messages.len() {
            let status = self.read_status(ix)?;
            if status.sys_flags.contains(SysFlags::EXPUNGED) {
                self.messages.remove(ix);
                self.note_expunged(ix as u32 + 1);
                self.expunged = true;
                continue;
            }

            let m = &mut self.messages[ix];
            if status.sys_flags != m.sys_flags
                || status.user_flags != m.user_flags
            {
                m.sys_flags = status.sys_flags;
                m.user_flags = status.user_flags;
                self.pending.fetch.push(ix as u32 + 1);
            }
            if 0 != status.uid && status.uid != m.uid {
                warn!(
                    "{} UID of message at {} changed from {} to {}",
                    self.log_prefix, m.offset, m.uid, status.uid
                );
                m.uid = status.uid;
            }
            m.valid = true;
            ix += 1;
        }

        self.mtime = file_ops::mtime_of(&self.file.metadata()?);
        self.flagcheck = false;
        Ok(())
    }

    /// Queue the expunge of `msgno` for the next poll.
    pub(super) fn note_expunged(&mut self, msgno: u32) {
        self.renumber_pending(msgno);
        self.pending.expunge.push(msgno);
    }

    /// Adjust queued flag changes for the removal of `msgno`.
    pub(super) fn renumber_pending(&mut self, msgno: u32) {
        self.pending.fetch.retain(|&f| f != msgno);
        for f in &mut self.pending.fetch {
            if *f > msgno {
                *f -= 1;
            }
        }
    }

    pub(super) fn permission(&self) -> Result<ParsePermission, Error> {
        self.locks
            .acquire_parse_permission(&self.file, LockMode::Exclusive)
    }

    pub(super) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }

    /// If `result` is a format error, the file can no longer be trusted, so
    /// shut the stream down.
    pub(super) fn fatal_check<R>(
        &mut self,
        result: Result<R, Error>,
    ) -> Result<R, Error> {
        if let Err(ref e) = result {
            if e.is_format_error() && !self.closed {
                error!("{} Closing corrupt mailbox: {}", self.log_prefix, e);
                self.closed = true;
                self.messages.clear();
                let _ = self.locks.unlock_file(&self.file);
            }
        }
        result
    }

    /// Read the on-disk status field of the cached message at `ix`.
    pub(super) fn read_status(&self, ix: usize) -> Result<StatusField, Error> {
        let m = &self.messages[ix];
        let mut buf = [0u8; STATUS_FIELD_LEN];
        let n = file_ops::read_full_at(&self.file, &mut buf, m.status_offset())?;
        if STATUS_FIELD_LEN != n {
            return Err(Error::TruncatedMessage { offset: m.offset });
        }
        StatusField::decode(&buf, m.offset)
    }

    /// Read and decode the header block from disk.
    pub(super) fn read_header(&self) -> Result<Header, Error> {
        read_header(&self.file)
    }

    pub(super) fn write_header(&self) -> Result<(), Error> {
        file_ops::write_all_at(
            &self.log_prefix,
            &self.env,
            &self.file,
            &self.header.encode(),
            0,
        )
    }

    /// If someone else wrote since our last look, make sure the next ping
    /// re-reads every status field. Call before writing anything that will
    /// be followed by `sync_status()`.
    pub(super) fn note_foreign_writes(&mut self) -> Result<(), Error> {
        if file_ops::mtime_of(&self.file.metadata()?) != self.mtime {
            self.flagcheck = true;
        }
        Ok(())
    }

    /// `fsync()` after status updates and record the resulting times.
    pub(super) fn sync_status(&mut self) -> Result<(), Error> {
        file_ops::sync(&self.log_prefix, &self.env, &self.file)?;
        file_ops::mark_read(&self.file)?;
        self.mtime = file_ops::mtime_of(&self.file.metadata()?);
        Ok(())
    }

    /// Resolve `selector` to a sorted, de-duplicated list of sequence
    /// numbers.
    pub fn resolve(&self, selector: &Selector) -> Result<Vec<u32>, Error> {
        self.ensure_open()?;
        let count = self.messages.len() as u32;

        if selector.by_uid {
            let max = self.messages.last().map_or(0, |m| m.uid);
            Ok(self
                .messages
                .iter()
                .enumerate()
                .filter(|&(_, m)| selector.set.contains(m.uid, max))
                .map(|(ix, _)| ix as u32 + 1)
                .collect())
        } else {
            if selector.set.max_explicit().map_or(false, |v| v > count) {
                return Err(Error::BadSequence);
            }
            Ok((1..=count)
                .filter(|&msgno| selector.set.contains(msgno, count))
                .collect())
        }
    }
}

impl Drop for MbxStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.locks.unlock_file(&self.file);
        }
    }
}

/// Read and decode the header block of an MBX file.
pub(super) fn read_header(file: &fs::File) -> Result<Header, Error> {
    let mut block = [0u8; HDRSIZE];
    if HDRSIZE != file_ops::read_full_at(file, &mut block, 0)? {
        return Err(Error::NotMbx);
    }
    Header::decode(&block)
}
