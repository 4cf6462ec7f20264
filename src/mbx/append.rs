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
use std::path::Path;

use chrono::prelude::*;
use log::{error, info};

use super::codec::*;
use super::flags::{define_keywords, masks_for, FlagChange};
use super::lock::{LockCoordinator, LockMode};
use super::stream::{read_header, MbxStream};
use crate::model::{AppendMessage, Flag, Selector};
use crate::support::critical::Critical;
use crate::support::environment::Environment;
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};

/// Append `messages` to the mailbox at `dest` as one atomic batch.
///
/// Either every message is added, or the file is left exactly as it was.
/// The new records carry no UID; the next process to parse the mailbox
/// assigns them.
pub fn append(
    env: &Environment,
    locks: &LockCoordinator,
    dest: &Path,
    messages: &[AppendMessage],
) -> Result<(), Error> {
    let log_prefix = format!("mbx:{}", dest.display());
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(dest)
        .on_not_found(Error::NxMailbox)?;
    let md = file.metadata()?;
    if !md.is_file() || md.len() < HDRSIZE as u64 {
        return Err(Error::NotMbx);
    }

    let _permission = locks.acquire_parse_permission(&file, LockMode::Exclusive)?;
    let _critical = Critical::enter();

    let mut header = read_header(&file)?;
    if define_keywords(
        &log_prefix,
        &mut header,
        messages.iter().flat_map(|m| m.flags.iter()),
    ) {
        file_ops::write_all_at(&log_prefix, env, &file, &header.encode(), 0)?;
    }

    let start = file.metadata()?.len();
    write_batch(&log_prefix, env, &file, &header, start, messages)?;
    info!("{} Appended {} messages", log_prefix, messages.len());
    Ok(())
}

/// Write `messages` as new records starting at `start`, which must be the
/// current end of `file`, and `fsync()`.
///
/// On failure the file is truncated back to `start`.
pub(super) fn write_batch(
    log_prefix: &str,
    env: &Environment,
    file: &fs::File,
    header: &Header,
    start: u64,
    messages: &[AppendMessage],
) -> Result<u64, Error> {
    write_batch_with(log_prefix, env, file, header, start, messages, |data, pos| {
        file_ops::write_all_at(log_prefix, env, file, data, pos)
    })
}

/// `write_batch()`, with each chunk of data written by `write`.
fn write_batch_with(
    log_prefix: &str,
    env: &Environment,
    file: &fs::File,
    header: &Header,
    start: u64,
    messages: &[AppendMessage],
    mut write: impl FnMut(&[u8], u64) -> Result<(), Error>,
) -> Result<u64, Error> {
    let result = (|| {
        let mut pos = start;
        for message in messages {
            let (sys_flags, user_flags) = masks_for(header, &message.flags);
            let line = RecordLine {
                internal_date: message
                    .internal_date
                    .unwrap_or_else(|| Local::now().into()),
                size: message.data.len() as u64,
                status: StatusField {
                    user_flags,
                    sys_flags,
                    uid: 0,
                },
            }
            .encode();

            write(&line, pos)?;
            pos += line.len() as u64;
            write(&message.data, pos)?;
            pos += message.data.len() as u64;
        }
        file_ops::sync(log_prefix, env, file)?;
        Ok(pos)
    })();

    if let Err(ref e) = result {
        error!("{} Append failed, rolling back: {}", log_prefix, e);
        if let Err(e2) = file_ops::truncate(log_prefix, env, file, start)
            .and_then(|_| file_ops::sync(log_prefix, env, file))
        {
            error!("{} Rollback failed: {}", log_prefix, e2);
        }
    }

    result
}

impl MbxStream {
    /// Copy the selected messages to the mailbox at `dest`, preserving their
    /// flags and internal dates.
    ///
    /// With `move_messages`, the originals are marked `\Deleted` once the
    /// copy has succeeded. Returns the number of messages copied.
    pub fn copy(
        &mut self,
        selector: &Selector,
        dest: &Path,
        move_messages: bool,
    ) -> Result<usize, Error> {
        let result = self.copy_impl(selector, dest, move_messages);
        self.fatal_check(result)
    }

    fn copy_impl(
        &mut self,
        selector: &Selector,
        dest: &Path,
        move_messages: bool,
    ) -> Result<usize, Error> {
        self.ensure_open()?;
        if move_messages && self.read_only {
            return Err(Error::ReadOnly);
        }

        let msgnos = self.resolve(selector)?;
        let mut batch = Vec::with_capacity(msgnos.len());
        for &msgno in &msgnos {
            let ix = (msgno - 1) as usize;
            let mut flags = self.fetch_flags(msgno)?;
            if move_messages {
                flags.retain(|f| Flag::Deleted != *f);
            }
            batch.push(AppendMessage {
                flags,
                internal_date: Some(self.messages[ix].internal_date),
                data: self.read_message_data(ix)?,
            });
        }

        append(&self.env, &self.locks, dest, &batch)?;

        if move_messages {
            self.note_foreign_writes()?;
            let mut changed = false;
            for &msgno in &msgnos {
                changed |= self.update_status(
                    (msgno - 1) as usize,
                    FlagChange::set(SysFlags::DELETED, 0),
                )?;
            }
            if changed {
                self.sync_status()?;
            }
        }

        Ok(batch.len())
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use super::super::test_prelude::*;
    use super::*;
    use crate::model::*;

    #[test]
    fn append_is_seen_by_open_stream() {
        let setup = Setup::new();
        let mut stream = setup.open_rw();
        assert!(stream.ping().unwrap().is_empty());

        let date = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2021, 6, 7, 8, 9, 10)
            .unwrap();
        append(
            &setup.env,
            &setup.locks,
            &setup.inbox(),
            &[
                AppendMessage {
                    flags: vec![Flag::Flagged, Flag::Keyword("work".to_owned())],
                    internal_date: Some(date),
                    data: b"Subject: one\r\n\r\nbody\r\n".to_vec(),
                },
                AppendMessage {
                    flags: vec![],
                    internal_date: None,
                    data: b"Subject: two\r\n\r\nbody\r\n".to_vec(),
                },
            ],
        )
        .unwrap();

        let poll = stream.ping().unwrap();
        assert_eq!(Some(2), poll.exists);
        assert_eq!(Some(2), poll.recent);
        assert_eq!(vec![1, 2], uids(&stream));
        assert_eq!(date, stream.internal_date(1).unwrap());
        assert_eq!(
            vec![Flag::Flagged, Flag::Keyword("work".to_owned())],
            stream.fetch_flags(1).unwrap()
        );

        // A second ping has nothing new to say
        assert!(stream.ping().unwrap().is_empty());
    }

    #[test]
    fn append_to_non_mailbox_rejected() {
        let setup = Setup::new();
        let path = setup.root.path().join("junk");
        fs::write(&path, b"hello").unwrap();
        assert_matches!(
            Err(Error::NotMbx),
            append(&setup.env, &setup.locks, &path, &[])
        );
        assert_matches!(
            Err(Error::NxMailbox),
            append(&setup.env, &setup.locks, &setup.root.path().join("nx"), &[])
        );
    }

    #[test]
    fn failed_batch_is_rolled_back() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let before = fs::read(setup.inbox()).unwrap();

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(setup.inbox())
            .unwrap();
        let header = read_header(&file).unwrap();
        let message = |subject: &str| AppendMessage {
            flags: vec![Flag::Seen],
            internal_date: None,
            data: format!("Subject: {}\r\n\r\nbody\r\n", subject).into_bytes(),
        };

        // The first message and the second record line reach the file
        // before the write of the second body fails
        let mut writes = 0;
        let result = write_batch_with(
            "test",
            &setup.env,
            &file,
            &header,
            before.len() as u64,
            &[message("two"), message("three")],
            |data, pos| {
                writes += 1;
                if writes > 3 {
                    return Err(Error::Io(io::Error::from_raw_os_error(
                        nix::libc::EIO,
                    )));
                }
                file_ops::write_all_at("test", &setup.env, &file, data, pos)
            },
        );
        assert_matches!(Err(Error::Io(_)), result);
        assert_eq!(4, writes);
        assert_eq!(before, fs::read(setup.inbox()).unwrap());

        let stream = setup.open_rw();
        assert_eq!(1, stream.count());
    }

    #[test]
    fn copy_and_move() {
        let setup = Setup::new();
        let other = setup.root.path().join("other");
        crate::mbx::admin::create(&setup.env, &other).unwrap();

        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[Flag::Seen]);
        setup.append(b"Subject: two\r\n\r\nsecond\r\n", &[]);
        setup.append(b"Subject: three\r\n\r\nthird\r\n", &[]);

        let mut stream = setup.open_rw();
        assert_eq!(
            2,
            stream
                .copy(&Selector::msgnos("1,3".parse().unwrap()), &other, false)
                .unwrap()
        );
        assert!(stream.fetch_flags(1).unwrap().iter().all(|f| Flag::Deleted != *f));

        assert_eq!(
            1,
            stream
                .copy(&Selector::uids(SeqSet::just(2)), &other, true)
                .unwrap()
        );
        assert!(stream.fetch_flags(2).unwrap().contains(&Flag::Deleted));

        let mut dest = setup.open(&other, OpenOptions::default());
        assert_eq!(3, dest.count());
        assert_eq!(vec![Flag::Seen], dest.fetch_flags(1).unwrap());
        assert_eq!(
            b"Subject: three\r\n\r\nthird\r\n".to_vec(),
            dest.fetch_message(2, true).unwrap()
        );
        assert_eq!(
            stream.internal_date(2).unwrap(),
            dest.internal_date(3).unwrap()
        );
        assert!(dest.fetch_flags(3).unwrap().is_empty());
    }

    #[test]
    fn move_from_read_only_rejected() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nfirst\r\n", &[]);
        let mut stream = setup.open_ro();
        assert_matches!(
            Err(Error::ReadOnly),
            stream.copy(&Selector::all(), &setup.inbox(), true)
        );
    }
}
