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

//! Expunge and space reclamation.
//!
//! With the mailbox to ourselves, deleted and hidden records are squeezed out
//! by sliding later records down. Otherwise deleted records are only marked
//! hidden, and a later pass reclaims them.

use std::mem;

use log::info;

use super::codec::*;
use super::stream::MbxStream;
use crate::model::ExpungeResponse;
use crate::support::critical::Critical;
use crate::support::error::Error;
use crate::support::file_ops;

/// Records are moved in chunks of this size during compaction.
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewriteMode {
    /// The file was compacted under an exclusive lock.
    Compacted,
    /// Another process has the mailbox open, so deleted records were only
    /// marked hidden.
    HiddenOnly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Sequence numbers of removed messages, each relative to the numbering
    /// after the previous ones were removed.
    pub expunged: Vec<u32>,
    pub reclaimed: u64,
    pub mode: RewriteMode,
}

impl MbxStream {
    /// Permanently remove every message with `\Deleted` set.
    ///
    /// If this is the only process with the mailbox open, the file is
    /// compacted immediately. Otherwise the messages are hidden in place and
    /// the space is reclaimed by a later ping or check once the others have
    /// gone away.
    pub fn expunge(&mut self) -> Result<ExpungeResponse, Error> {
        self.ensure_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let result = self.rewrite(true);
        let outcome = self.fatal_check(result)?;

        // Expunges discovered while catching up come first, since the
        // numbering of our own is relative to them.
        let mut expunge = mem::take(&mut self.pending.expunge);
        expunge.extend(outcome.expunged);
        Ok(ExpungeResponse {
            expunge,
            reclaimed: outcome.reclaimed,
            compacted: RewriteMode::Compacted == outcome.mode,
        })
    }

    /// Reclaim space, removing deleted messages as well if `expunge` is set.
    pub(super) fn rewrite(
        &mut self,
        expunge: bool,
    ) -> Result<RewriteOutcome, Error> {
        let permission = self.permission()?;
        self.catch_up(&permission)?;

        let exclusive = self.locks.try_exclusive(&self.file, &permission)?;
        let outcome = if exclusive.is_some() {
            self.compact(expunge)?
        } else if expunge {
            self.hide_deleted()?
        } else {
            RewriteOutcome {
                expunged: Vec::new(),
                reclaimed: 0,
                mode: RewriteMode::HiddenOnly,
            }
        };
        drop(exclusive);
        drop(permission);

        self.fullcheck = false;
        Ok(outcome)
    }

    /// Slide every retained record down over the gaps left by deleted and
    /// hidden ones, then truncate.
    ///
    /// The caller must hold the exclusive file lock.
    fn compact(&mut self, expunge: bool) -> Result<RewriteOutcome, Error> {
        let _critical = Critical::enter();

        let old_size = self.file_size;
        let mut expunged = Vec::new();
        let mut write_pos = HDRSIZE as u64;
        let mut ix = 0;
        while ix < self.messages.len() {
            if expunge && self.messages[ix].sys_flags.contains(SysFlags::DELETED)
            {
                self.messages.remove(ix);
                let msgno = ix as u32 + 1;
                self.renumber_pending(msgno);
                expunged.push(msgno);
                continue;
            }

            let (offset, len) =
                (self.messages[ix].offset, self.messages[ix].record_len());
            if offset != write_pos {
                self.move_bytes(offset, write_pos, len)?;
                self.messages[ix].offset = write_pos;
            }
            write_pos += len;
            ix += 1;
        }

        if write_pos != old_size {
            file_ops::truncate(&self.log_prefix, &self.env, &self.file, write_pos)?;
            file_ops::sync(&self.log_prefix, &self.env, &self.file)?;
            self.mtime = file_ops::mtime_of(&self.file.metadata()?);
        }

        self.file_size = write_pos;
        self.expunged = false;
        let reclaimed = old_size - write_pos;
        if !expunged.is_empty() || reclaimed > 0 {
            info!(
                "{} Compacted: {} expunged, {} bytes reclaimed",
                self.log_prefix,
                expunged.len(),
                reclaimed
            );
        }

        Ok(RewriteOutcome {
            expunged,
            reclaimed,
            mode: RewriteMode::Compacted,
        })
    }

    /// Copy `len` bytes from `src` to the lower offset `dst`.
    fn move_bytes(&mut self, src: u64, dst: u64, len: u64) -> Result<(), Error> {
        let mut buf = mem::take(&mut self.buf);
        let mut done = 0u64;
        let result = (|| {
            while done < len {
                let n = (len - done).min(COPY_CHUNK as u64) as usize;
                buf.resize(n, 0);
                if n != file_ops::read_full_at(&self.file, &mut buf, src + done)? {
                    return Err(Error::TruncatedMessage { offset: src });
                }
                file_ops::write_all_at(
                    &self.log_prefix,
                    &self.env,
                    &self.file,
                    &buf,
                    dst + done,
                )?;
                done += n as u64;
            }
            Ok(())
        })();
        self.buf = buf;
        result
    }

    /// Mark every deleted message hidden without moving anything.
    fn hide_deleted(&mut self) -> Result<RewriteOutcome, Error> {
        let _critical = Critical::enter();

        let mut expunged = Vec::new();
        let mut ix = 0;
        while ix < self.messages.len() {
            if !self.messages[ix].sys_flags.contains(SysFlags::DELETED) {
                ix += 1;
                continue;
            }

            let m = &self.messages[ix];
            let mut status = m.status();
            status.sys_flags |= SysFlags::EXPUNGED;
            file_ops::write_all_at(
                &self.log_prefix,
                &self.env,
                &self.file,
                &status.encode(),
                m.status_offset(),
            )?;

            self.messages.remove(ix);
            let msgno = ix as u32 + 1;
            self.renumber_pending(msgno);
            expunged.push(msgno);
        }

        if !expunged.is_empty() {
            self.sync_status()?;
            self.expunged = true;
            info!(
                "{} Hid {} messages; mailbox in use elsewhere",
                self.log_prefix,
                expunged.len()
            );
        }

        Ok(RewriteOutcome {
            expunged,
            reclaimed: 0,
            mode: RewriteMode::HiddenOnly,
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::super::test_prelude::*;
    use super::*;
    use crate::model::*;

    #[test]
    fn hard_expunge_compacts() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[]);
        setup.append(b"Subject: two\r\n\r\nsecond message\r\n", &[]);
        setup.append(b"Subject: three\r\n\r\nthird\r\n", &[]);

        let mut stream = setup.open_rw();
        let before = fs::metadata(setup.inbox()).unwrap().len();
        let second_len = stream.entry(2).unwrap().record_len();
        let third_offset = stream.entry(3).unwrap().offset;
        let third_uid = stream.uid_of(3).unwrap();

        stream
            .set_flags(&Selector::msgnos(SeqSet::just(2)), &[Flag::Deleted])
            .unwrap();
        let response = stream.expunge().unwrap();
        assert_eq!(vec![2], response.expunge);
        assert!(response.compacted);
        assert_eq!(second_len, response.reclaimed);

        assert_eq!(before - second_len, fs::metadata(setup.inbox()).unwrap().len());
        assert_eq!(2, stream.count());
        assert_eq!(third_offset - second_len, stream.entry(2).unwrap().offset);
        assert_eq!(third_uid, stream.uid_of(2).unwrap());
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            stream.fetch_message(2, true).unwrap()
        );
    }

    #[test]
    fn compaction_preserves_retained_records() {
        let setup = Setup::new();
        let bodies: Vec<Vec<u8>> = (0..12)
            .map(|i| {
                let mut body = format!("Subject: {}\r\n\r\n", i).into_bytes();
                // Some larger than a copy chunk
                let fill = if 0 == i % 4 { COPY_CHUNK + 17 } else { i * 10 };
                body.extend(std::iter::repeat(b'a' + i as u8).take(fill));
                body.extend_from_slice(b"\r\n");
                body
            })
            .collect();
        for body in &bodies {
            setup.append(body, &[]);
        }

        let mut stream = setup.open_rw();
        let uids_before = uids(&stream);
        let doomed: Vec<u32> = vec![1, 2, 5, 8, 12];
        for &msgno in &doomed {
            stream
                .set_flags(&Selector::msgnos(SeqSet::just(msgno)), &[Flag::Deleted])
                .unwrap();
        }
        let response = stream.expunge().unwrap();
        // Each number is relative to the previous removal
        assert_eq!(vec![1, 1, 3, 5, 8], response.expunge);

        let kept: Vec<usize> = (0..12)
            .filter(|i| !doomed.contains(&(*i as u32 + 1)))
            .collect();
        let expected_uids: Vec<u32> =
            kept.iter().map(|&i| uids_before[i]).collect();

        drop(stream);
        let mut stream = setup.open_rw();
        assert_eq!(expected_uids, uids(&stream));
        let mut total = HDRSIZE as u64;
        for (msgno, &i) in (1u32..).zip(&kept) {
            assert_eq!(bodies[i], stream.fetch_message(msgno, true).unwrap());
            total += stream.entry(msgno).unwrap().record_len();
        }
        assert_eq!(total, fs::metadata(setup.inbox()).unwrap().len());
    }

    #[test]
    fn soft_expunge_then_reclaim() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[]);
        setup.append(b"Subject: two\r\n\r\nsecond\r\n", &[]);
        setup.append(b"Subject: three\r\n\r\nthird\r\n", &[]);

        let mut a = setup.open_rw();
        let mut b = setup.open_ro();
        let size = fs::metadata(setup.inbox()).unwrap().len();

        a.set_flags(&Selector::msgnos(SeqSet::just(2)), &[Flag::Deleted])
            .unwrap();
        let response = a.expunge().unwrap();
        assert_eq!(vec![2], response.expunge);
        assert!(!response.compacted);
        assert_eq!(0, response.reclaimed);
        // Nothing moved
        assert_eq!(size, fs::metadata(setup.inbox()).unwrap().len());
        assert_eq!(2, a.count());

        let poll = b.check().unwrap();
        assert_eq!(vec![2], poll.expunge);
        assert_eq!(2, b.count());
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            b.fetch_message(2, true).unwrap()
        );

        // Still in use, so reclamation keeps failing quietly
        assert!(a.ping().unwrap().is_empty());
        assert_eq!(size, fs::metadata(setup.inbox()).unwrap().len());

        drop(b);
        assert!(a.check().unwrap().is_empty());
        let reclaimed = fs::metadata(setup.inbox()).unwrap().len();
        assert!(reclaimed < size);
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            a.fetch_message(2, true).unwrap()
        );

        let c = setup.open_ro();
        assert_eq!(uids(&a), uids(&c));
    }

    #[test]
    fn soft_expunge_leaves_mailbox_shared() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[]);
        setup.append(b"Subject: two\r\n\r\nsecond\r\n", &[]);
        setup.append(b"Subject: three\r\n\r\nthird\r\n", &[]);

        let mut a = setup.open_rw();
        let mut b = setup.open_rw();
        let size = fs::metadata(setup.inbox()).unwrap().len();

        a.set_flags(&Selector::msgnos(SeqSet::just(2)), &[Flag::Deleted])
            .unwrap();
        assert!(!a.expunge().unwrap().compacted);

        // a's failed attempt at an exclusive lock must not have released its
        // shared one, so b cannot compact either
        let poll = b.check().unwrap();
        assert_eq!(vec![2], poll.expunge);
        assert_eq!(size, fs::metadata(setup.inbox()).unwrap().len());

        assert!(a.ping().unwrap().is_empty());
        assert_eq!(size, fs::metadata(setup.inbox()).unwrap().len());
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            a.fetch_message(2, true).unwrap()
        );

        drop(a);
        assert!(b.check().unwrap().is_empty());
        assert!(fs::metadata(setup.inbox()).unwrap().len() < size);
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            b.fetch_message(2, true).unwrap()
        );
    }

    #[test]
    fn flags_not_written_over_hidden_record() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[]);

        let mut a = setup.open_rw();
        let mut b = setup.open_rw();

        a.set_flags(&Selector::all(), &[Flag::Deleted]).unwrap();
        a.expunge().unwrap();

        // b still thinks the message exists
        assert_eq!(
            Vec::<u32>::new(),
            b.set_flags(&Selector::all(), &[Flag::Seen]).unwrap()
        );
        let poll = b.check().unwrap();
        assert_eq!(vec![1], poll.expunge);
        assert_eq!(0, b.count());
    }

    #[test]
    fn expunge_read_only_rejected() {
        let setup = Setup::new();
        let mut stream = setup.open_ro();
        assert_matches!(Err(Error::ReadOnly), stream.expunge());
    }
}
