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

//! Incremental parsing of new records.
//!
//! Each pass starts at the size recorded by the previous one. This is also
//! where records appended by other processes get their UIDs.

use chrono::prelude::*;
use log::{info, warn};

use super::codec::*;
use super::lock::ParsePermission;
use super::stream::{MbxStream, MessageEntry};
use crate::support::critical::Critical;
use crate::support::error::Error;
use crate::support::file_ops;

/// Statistics about one parse pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Messages added to the cache.
    pub new: usize,
    /// How many of those were assigned a UID by this stream.
    pub recent: usize,
    /// Records whose UID was out of sequence and had to be replaced.
    pub uid_conflicts: u32,
    /// How many times UIDVALIDITY was changed. Never more than 1.
    pub validity_regenerations: u32,
}

/// Choose a new UIDVALIDITY, distinct from and greater than `old`.
pub(super) fn next_uid_validity(old: u32) -> u32 {
    let now = Utc::now().timestamp() as u32;
    if now > old {
        now
    } else {
        old.wrapping_add(1)
    }
}

impl MbxStream {
    /// Parse any records added to the file since the last pass.
    ///
    /// Records with no UID are assigned one. A record whose UID does not fit
    /// the strictly ascending sequence (or exceeds the header's last UID)
    /// also gets a fresh UID, and the first such record in a pass changes the
    /// mailbox's UIDVALIDITY. Read-only streams make these assignments in
    /// memory only.
    pub(super) fn parse(
        &mut self,
        _permission: &ParsePermission,
    ) -> Result<ParseOutcome, Error> {
        let md = self.file.metadata()?;
        let size = md.len();
        if size < self.file_size {
            return Err(Error::MailboxShrank {
                was: self.file_size,
                now: size,
            });
        }

        // Other processes may have defined keywords or assigned UIDs since
        // the last pass.
        let mut header = self.read_header()?;
        if self.read_only {
            header.uid_last = header.uid_last.max(self.header.uid_last);
            header.uid_validity =
                header.uid_validity.max(self.header.uid_validity);
        }
        self.header = header;

        let mut outcome = ParseOutcome::default();
        let mut header_dirty = false;
        let mut assigned = Vec::new();
        let mut pos = self.file_size.max(HDRSIZE as u64);

        while pos < size {
            let mut line = [0u8; MAX_RECORD_LINE_LEN];
            let n = file_ops::read_full_at(&self.file, &mut line, pos)?;
            let line_len =
                RecordLine::find_end(&line[..n]).ok_or(Error::CorruptRecord {
                    offset: pos,
                    reason: "unterminated record line",
                })?;
            let record = RecordLine::decode(&line[..line_len], pos)?;

            let data_offset = pos + line_len as u64;
            let end = data_offset
                .checked_add(record.size)
                .filter(|&end| end <= size)
                .ok_or(Error::TruncatedMessage { offset: pos })?;

            let mut uid = record.status.uid;
            if 0 != uid
                && (uid <= self.last_uid_seen || uid > self.header.uid_last)
            {
                warn!(
                    "{} UID {} at offset {} out of sequence \
                     (previous {}, last assigned {})",
                    self.log_prefix,
                    uid,
                    pos,
                    self.last_uid_seen,
                    self.header.uid_last
                );
                outcome.uid_conflicts += 1;
                if 0 == outcome.validity_regenerations {
                    self.header.uid_validity =
                        next_uid_validity(self.header.uid_validity);
                    outcome.validity_regenerations += 1;
                    header_dirty = true;
                    info!(
                        "{} UIDVALIDITY changed to {}",
                        self.log_prefix, self.header.uid_validity
                    );
                }
                uid = 0;
            }

            if record.status.sys_flags.contains(SysFlags::EXPUNGED) {
                if 0 != uid {
                    self.last_uid_seen = uid;
                }
                self.expunged = true;
                pos = end;
                continue;
            }

            let recent = 0 == uid;
            if recent {
                uid = self.header.uid_last.checked_add(1).ok_or(
                    Error::CorruptRecord {
                        offset: pos,
                        reason: "UID space exhausted",
                    },
                )?;
                self.header.uid_last = uid;
                header_dirty = true;
                assigned.push(self.messages.len());
            }
            self.last_uid_seen = uid;

            self.messages.push(MessageEntry {
                uid,
                sys_flags: record.status.sys_flags,
                user_flags: record.status.user_flags,
                internal_date: record.internal_date,
                size: record.size,
                offset: pos,
                line_len: line_len as u64,
                header_size: None,
                valid: true,
                recent: recent && !self.read_only,
            });
            outcome.new += 1;
            if recent && !self.read_only {
                outcome.recent += 1;
            }

            pos = end;
        }

        if !self.read_only && (header_dirty || !assigned.is_empty()) {
            let _critical = Critical::enter();
            // Header first: a crash before the records are written then
            // just wastes some UIDs.
            self.write_header()?;
            for ix in assigned {
                let m = &self.messages[ix];
                file_ops::write_all_at(
                    &self.log_prefix,
                    &self.env,
                    &self.file,
                    &m.status().encode(),
                    m.status_offset(),
                )?;
            }
            file_ops::sync(&self.log_prefix, &self.env, &self.file)?;
        }

        self.file_size = size;
        self.mtime = file_ops::mtime_of(&self.file.metadata()?);
        if outcome.new > 0 {
            self.pending_new = true;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::FileExt;

    use super::super::test_prelude::*;
    use super::*;
    use crate::model::*;

    fn record(uid: u32, flags: SysFlags, data: &[u8]) -> Vec<u8> {
        let mut out = RecordLine {
            internal_date: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2020, 1, 2, 3, 4, 5)
                .unwrap(),
            size: data.len() as u64,
            status: StatusField {
                user_flags: 0,
                sys_flags: flags,
                uid,
            },
        }
        .encode();
        out.extend_from_slice(data);
        out
    }

    fn push_raw(setup: &Setup, data: &[u8]) {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(setup.inbox())
            .unwrap();
        file.write_all(data).unwrap();
    }

    fn set_uid_last(setup: &Setup, uid_last: u32) {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(setup.inbox())
            .unwrap();
        let mut header = super::super::stream::read_header(&file).unwrap();
        header.uid_last = uid_last;
        file.write_all_at(&header.encode(), 0).unwrap();
    }

    #[test]
    fn conflicting_uids_regenerate_validity_once() {
        let setup = Setup::new();
        set_uid_last(&setup, 5);
        push_raw(&setup, &record(5, SysFlags::empty(), b"a\r\n"));
        let mut stream = setup.open_rw();
        let validity = stream.uid_validity();
        assert_eq!(5, stream.uid_of(1).unwrap());

        push_raw(&setup, &record(3, SysFlags::empty(), b"b\r\n"));
        push_raw(&setup, &record(2, SysFlags::SEEN, b"c\r\n"));

        let permission = stream.permission().unwrap();
        let outcome = stream.parse(&permission).unwrap();
        drop(permission);

        assert_eq!(2, outcome.new);
        assert_eq!(2, outcome.uid_conflicts);
        assert_eq!(1, outcome.validity_regenerations);
        assert_ne!(validity, stream.uid_validity());
        assert_eq!(vec![5, 6, 7], uids(&stream));

        // All of it was written back
        let reopened = setup.open_rw();
        assert_eq!(stream.uid_validity(), reopened.uid_validity());
        assert_eq!(vec![5, 6, 7], uids(&reopened));
        assert_eq!(8, reopened.status().uid_next);
    }

    #[test]
    fn uid_beyond_header_is_a_conflict() {
        let setup = Setup::new();
        set_uid_last(&setup, 2);
        push_raw(&setup, &record(1, SysFlags::empty(), b"a\r\n"));
        push_raw(&setup, &record(9, SysFlags::empty(), b"b\r\n"));

        let stream = setup.open_rw();
        assert_eq!(vec![1, 3], uids(&stream));
        assert_eq!(4, stream.status().uid_next);
    }

    #[test]
    fn hidden_records_are_skipped() {
        let setup = Setup::new();
        set_uid_last(&setup, 3);
        push_raw(&setup, &record(1, SysFlags::empty(), b"a\r\n"));
        push_raw(
            &setup,
            &record(2, SysFlags::DELETED | SysFlags::EXPUNGED, b"b\r\n"),
        );
        push_raw(&setup, &record(3, SysFlags::empty(), b"c\r\n"));

        let stream = setup.open_rw();
        assert_eq!(vec![1, 3], uids(&stream));
        assert!(stream.expunged);
    }

    #[test]
    fn read_only_assigns_uids_in_memory() {
        let setup = Setup::new();
        push_raw(&setup, &record(0, SysFlags::empty(), b"a\r\n"));
        let before = fs::read(setup.inbox()).unwrap();

        let stream = setup.open_ro();
        assert_eq!(vec![1], uids(&stream));
        assert_eq!(0, stream.status().recent);
        assert_eq!(before, fs::read(setup.inbox()).unwrap());

        let stream = setup.open_rw();
        assert_eq!(vec![1], uids(&stream));
        assert_eq!(1, stream.status().recent);
        assert_ne!(before, fs::read(setup.inbox()).unwrap());
    }

    #[test]
    fn truncated_body_is_fatal() {
        let setup = Setup::new();
        let mut rec = record(0, SysFlags::empty(), b"hello world\r\n");
        rec.truncate(rec.len() - 4);
        push_raw(&setup, &rec);

        assert_matches!(
            Err(Error::TruncatedMessage { offset }) if offset == HDRSIZE as u64,
            setup.try_open(OpenOptions::default())
        );
    }

    #[test]
    fn truncation_seen_by_open_stream_closes_it() {
        let setup = Setup::new();
        let mut stream = setup.open_rw();
        let mut rec = record(0, SysFlags::empty(), b"hello world\r\n");
        rec.truncate(rec.len() - 2);
        push_raw(&setup, &rec);

        assert_matches!(Err(Error::TruncatedMessage { .. }), stream.ping());
        assert_matches!(Err(Error::StreamClosed), stream.ping());
    }

    #[test]
    fn garbage_record_is_fatal() {
        let setup = Setup::new();
        push_raw(&setup, b"this is not a record line\r\n");
        assert_matches!(
            Err(Error::CorruptRecord { .. }),
            setup.try_open(OpenOptions::default())
        );
    }

    #[test]
    fn shrinking_is_fatal() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let mut stream = setup.open_rw();
        fs::OpenOptions::new()
            .write(true)
            .open(setup.inbox())
            .unwrap()
            .set_len(HDRSIZE as u64)
            .unwrap();

        assert_matches!(Err(Error::MailboxShrank { .. }), stream.ping());
    }
}
