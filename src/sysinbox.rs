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

//! Reading and draining a traditional Berkeley mbox spool file.
//!
//! Messages are separated by `From ` lines, which must be at the start of the
//! file or follow an empty line. Flags are recovered from the `Status`,
//! `X-Status` and `X-Keywords` headers that other mail software leaves
//! behind; those headers (and the UID bookkeeping headers of the same
//! software) are removed from the imported message.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use chrono::prelude::*;
use log::{debug, warn};

use crate::mbx::codec::is_valid_keyword;
use crate::mbx::lock::{Flock, LockMode, LockPrimitive};
use crate::model::{AppendMessage, Flag};
use crate::support::environment::Environment;
use crate::support::error::Error;
use crate::support::file_ops;

const FROM_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Headers which describe state in the spool's own format and must not be
/// carried into the imported message.
const STRIPPED_HEADERS: &[&str] = &[
    "status",
    "x-status",
    "x-keywords",
    "x-uid",
    "x-imap",
    "x-imapbase",
];

/// An exclusively locked system inbox.
///
/// The lock is held until this is dropped.
pub struct SystemInbox {
    log_prefix: String,
    file: fs::File,
    consumed: u64,
}

impl SystemInbox {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        Flock.lock(file.as_raw_fd(), LockMode::Exclusive, true)?;
        Ok(SystemInbox {
            log_prefix: format!("spool:{}", path.display()),
            file,
            consumed: 0,
        })
    }

    /// Read every message currently in the file.
    pub fn read_messages(&mut self) -> Result<Vec<AppendMessage>, Error> {
        let len = self.file.metadata()?.len();
        let mut data = vec![0u8; len as usize];
        let n = file_ops::read_full_at(&self.file, &mut data, 0)?;
        data.truncate(n);
        self.consumed = n as u64;

        if !data.is_empty() && !data.starts_with(b"From ") {
            warn!(
                "{} Does not start with a From line, not importing",
                self.log_prefix
            );
            self.consumed = 0;
            return Ok(Vec::new());
        }

        let messages = parse_messages(&data);
        debug!(
            "{} Read {} messages in {} bytes",
            self.log_prefix,
            messages.len(),
            self.consumed
        );
        Ok(messages)
    }

    /// Remove everything returned by `read_messages()` from the file,
    /// keeping anything delivered since.
    pub fn remove_consumed(&mut self, env: &Environment) -> Result<(), Error> {
        if 0 == self.consumed {
            return Ok(());
        }

        let len = self.file.metadata()?.len();
        let tail_len = len.saturating_sub(self.consumed);
        if tail_len > 0 {
            let mut tail = vec![0u8; tail_len as usize];
            let n =
                file_ops::read_full_at(&self.file, &mut tail, self.consumed)?;
            tail.truncate(n);
            file_ops::write_all_at(&self.log_prefix, env, &self.file, &tail, 0)?;
        }
        file_ops::truncate(&self.log_prefix, env, &self.file, tail_len)?;
        file_ops::sync(&self.log_prefix, env, &self.file)?;
        self.consumed = 0;
        Ok(())
    }
}

/// Split and convert the whole of an mbox file.
///
/// Some software keeps a pseudo-message carrying its own state at the start
/// of the file, marked by an `X-IMAP` header. It is dropped. The header
/// means nothing special on any later message.
fn parse_messages(data: &[u8]) -> Vec<AppendMessage> {
    split_messages(data)
        .into_iter()
        .enumerate()
        .filter(|&(ix, raw)| 0 != ix || !is_pseudo_message(raw))
        .map(|(_, raw)| convert(raw))
        .collect()
}

fn is_pseudo_message(raw: &[u8]) -> bool {
    lines(raw)
        .skip(1)
        .take_while(|line| b"\n" != *line)
        .any(|line| {
            line.len() > 7 && line[..7].eq_ignore_ascii_case(b"x-imap:")
        })
}

/// Split an mbox file into messages, each starting with its `From ` line.
fn split_messages(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    if data.starts_with(b"From ") {
        starts.push(0);
    }
    for pos in memchr::memmem::find_iter(data, b"\n\nFrom ") {
        starts.push(pos + 2);
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(data.len());
            let mut message = &data[start..end];
            // The blank line before the next separator belongs to the
            // format, not the message.
            if message.ends_with(b"\n\n") {
                message = &message[..message.len() - 1];
            }
            message
        })
        .collect()
}

/// Convert one raw mbox message (starting with its `From ` line) to an
/// appendable message.
fn convert(raw: &[u8]) -> AppendMessage {
    let from_end = memchr::memchr(b'\n', raw).map_or(raw.len(), |p| p + 1);
    let internal_date = parse_from_line(&raw[..from_end]);
    let rest = &raw[from_end..];

    let header_end = memchr::memmem::find(rest, b"\n\n")
        .map(|p| p + 1)
        .unwrap_or(rest.len());
    let (headers, body) = rest.split_at(header_end);

    let mut flags = Vec::new();
    let mut kept = Vec::with_capacity(headers.len());
    let mut stripping = false;
    for line in lines(headers) {
        if line.first().map_or(false, |&ch| b' ' == ch || b'\t' == ch) {
            if !stripping {
                kept.extend_from_slice(line);
            }
            continue;
        }

        let colon = match memchr::memchr(b':', line) {
            Some(colon) => colon,
            None => {
                stripping = false;
                kept.extend_from_slice(line);
                continue;
            }
        };
        let name = String::from_utf8_lossy(&line[..colon]).to_ascii_lowercase();
        let value = String::from_utf8_lossy(&line[colon + 1..]);

        stripping = STRIPPED_HEADERS.contains(&name.as_str());
        if !stripping {
            kept.extend_from_slice(line);
            continue;
        }

        match name.as_str() {
            "status" => {
                if value.contains('R') {
                    flags.push(Flag::Seen);
                }
            }
            "x-status" => {
                for (ch, flag) in &[
                    ('D', Flag::Deleted),
                    ('F', Flag::Flagged),
                    ('A', Flag::Answered),
                    ('T', Flag::Draft),
                ] {
                    if value.contains(*ch) {
                        flags.push(flag.clone());
                    }
                }
            }
            "x-keywords" => {
                for kw in value.split(|ch: char| ' ' == ch || ',' == ch) {
                    let kw = kw.trim();
                    if !kw.is_empty() && is_valid_keyword(kw.as_bytes()) {
                        flags.push(Flag::Keyword(kw.to_owned()));
                    }
                }
            }
            _ => (),
        }
    }

    let mut data = Vec::with_capacity(kept.len() + body.len() + 64);
    to_crlf(&mut data, &kept);
    to_crlf(&mut data, body);

    AppendMessage {
        flags,
        internal_date: Some(internal_date),
        data,
    }
}

/// Extract the delivery date from a `From sender date` line, falling back to
/// the current time.
fn parse_from_line(line: &[u8]) -> DateTime<FixedOffset> {
    let line = String::from_utf8_lossy(line);
    line.trim_end()
        .strip_prefix("From ")
        .and_then(|rest| rest.trim_start().splitn(2, ' ').nth(1))
        .and_then(|date| {
            NaiveDateTime::parse_from_str(date.trim(), FROM_DATE_FORMAT).ok()
        })
        .and_then(|date| Local.from_local_datetime(&date).earliest())
        .map(|date| date.into())
        .unwrap_or_else(|| Local::now().into())
}

/// Iterate over the lines of `data`, each including its terminating LF.
fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = memchr::memchr(b'\n', rest).map_or(rest.len(), |p| p + 1);
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

/// Append `src` to `dst`, turning bare LFs into CRLF.
fn to_crlf(dst: &mut Vec<u8>, src: &[u8]) {
    let mut prev = if dst.last() == Some(&b'\r') { b'\r' } else { 0 };
    for &ch in src {
        if b'\n' == ch && b'\r' != prev {
            dst.push(b'\r');
        }
        dst.push(ch);
        prev = ch;
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    const SPOOL: &[u8] = b"From alice@example.com Tue Jan  7 10:11:12 2020\n\
Subject: first\n\
Status: RO\n\
X-Status: F\n\
X-Keywords: $Label1, work\n\
X-UID: 12\n\
\n\
Body one\n\
From here is not a separator\n\
\n\
From bob@example.com Wed Jan  8 01:02:03 2020\n\
Status: O\n\
Subject: second\n\
\n\
Body two\n";

    #[test]
    fn split_and_convert() {
        let messages = parse_messages(SPOOL);
        assert_eq!(2, messages.len());

        assert_eq!(
            "Subject: first\r\n\r\nBody one\r\nFrom here is not a separator\r\n"
                .as_bytes()
                .to_vec(),
            messages[0].data
        );
        assert_eq!(
            vec![
                Flag::Seen,
                Flag::Flagged,
                Flag::Keyword("$Label1".to_owned()),
                Flag::Keyword("work".to_owned()),
            ],
            messages[0].flags
        );
        let date = messages[0].internal_date.unwrap().naive_local();
        assert_eq!(
            NaiveDate::from_ymd_opt(2020, 1, 7)
                .unwrap()
                .and_hms_opt(10, 11, 12)
                .unwrap(),
            date
        );

        assert_eq!(
            b"Subject: second\r\n\r\nBody two\r\n".to_vec(),
            messages[1].data
        );
        assert!(messages[1].flags.is_empty());
    }

    #[test]
    fn pseudo_message_skipped() {
        let spool = b"From MAILER-DAEMON Tue Jan  7 10:11:12 2020\n\
Subject: DON'T DELETE THIS MESSAGE -- FOLDER INTERNAL DATA\n\
X-IMAP: 1234 0000000003\n\
\n\
internal\n\
\n\
From bob@example.com Wed Jan  8 01:02:03 2020\n\
Subject: real\n\
\n\
text\n";
        let messages = parse_messages(spool);
        assert_eq!(1, messages.len());
        assert_eq!(b"Subject: real\r\n\r\ntext\r\n".to_vec(), messages[0].data);
    }

    #[test]
    fn x_imap_on_later_message_is_real_mail() {
        let spool = b"From bob@example.com Wed Jan  8 01:02:03 2020\n\
Subject: first\n\
\n\
one\n\
\n\
From carol@example.com Thu Jan  9 01:02:03 2020\n\
Subject: forwarded folder\n\
X-IMAP: 1234 0000000003\n\
\n\
two\n";
        let messages = parse_messages(spool);
        assert_eq!(2, messages.len());
        assert_eq!(
            b"Subject: forwarded folder\r\n\r\ntwo\r\n".to_vec(),
            messages[1].data
        );
    }

    #[test]
    fn drained_spool_keeps_nothing_it_did_not_return() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("spool");
        let spool = b"From bob@example.com Wed Jan  8 01:02:03 2020\n\
Subject: first\n\
\n\
one\n\
\n\
From carol@example.com Thu Jan  9 01:02:03 2020\n\
X-IMAP: 1234 0000000003\n\
Subject: second\n\
\n\
two\n";
        fs::write(&path, &spool[..]).unwrap();

        let mut inbox = SystemInbox::open(&path).unwrap();
        let messages = inbox.read_messages().unwrap();
        assert_eq!(2, messages.len());
        assert_eq!(b"Subject: second\r\n\r\ntwo\r\n".to_vec(), messages[1].data);

        inbox.remove_consumed(&Environment::default()).unwrap();
        drop(inbox);
        assert_eq!(0, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn bad_from_date_falls_back_to_now() {
        let before = Local::now().timestamp() - 5;
        let date = parse_from_line(b"From someone garbage\n");
        assert!(date.timestamp() > before);
    }

    #[test]
    fn remove_consumed_keeps_later_delivery() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("spool");
        fs::write(&path, SPOOL).unwrap();

        let mut inbox = SystemInbox::open(&path).unwrap();
        assert_eq!(2, inbox.read_messages().unwrap().len());

        // Someone appends while we hold the messages
        let late = b"From carol@example.com Thu Jan  9 01:02:03 2020\n\
Subject: late\n\nlate\n";
        {
            use std::io::Write;
            fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap()
                .write_all(late)
                .unwrap();
        }

        inbox.remove_consumed(&Environment::default()).unwrap();
        drop(inbox);
        assert_eq!(late.to_vec(), fs::read(&path).unwrap());
    }
}
