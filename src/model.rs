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

//! Types shared between the storage engine and the generic mailbox layer.

use std::fmt;
use std::str::FromStr;

use chrono::prelude::*;

use crate::support::error::Error;

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
#[derive(Clone, Eq)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if crate::mbx::codec::is_valid_keyword(s.as_bytes()) {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords are matched case-insensitively, like the keyword
            // table in the mailbox header.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }
}

/// Marker used inside `SeqSet` for `*`.
const STAR: u32 = u32::MAX;

/// A set of sequence numbers or UIDs in IMAP sequence-set syntax.
///
/// `*` stands for the largest value in the mailbox at the time the set is
/// resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeqSet {
    ranges: Vec<(u32, u32)>,
}

impl SeqSet {
    /// The set `1:*`.
    pub fn all() -> Self {
        SeqSet {
            ranges: vec![(1, STAR)],
        }
    }

    pub fn just(v: u32) -> Self {
        SeqSet {
            ranges: vec![(v, v)],
        }
    }

    pub fn range(start: u32, end: u32) -> Self {
        SeqSet {
            ranges: vec![(start, end)],
        }
    }

    /// Test whether `v` is in this set, taking `*` to mean `max`.
    pub fn contains(&self, v: u32, max: u32) -> bool {
        self.ranges.iter().any(|&(a, b)| {
            let a = if STAR == a { max } else { a };
            let b = if STAR == b { max } else { b };
            a.min(b) <= v && v <= a.max(b)
        })
    }

    /// The largest explicit (non-`*`) value in the set, if any.
    pub fn max_explicit(&self) -> Option<u32> {
        self.ranges
            .iter()
            .flat_map(|&(a, b)| vec![a, b])
            .filter(|&v| STAR != v)
            .max()
    }
}

impl FromStr for SeqSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        fn value(s: &str) -> Result<u32, Error> {
            if "*" == s {
                Ok(STAR)
            } else {
                s.parse::<u32>()
                    .ok()
                    .filter(|&v| 0 != v && STAR != v)
                    .ok_or(Error::BadSequence)
            }
        }

        let mut ranges = Vec::new();
        for part in s.split(',') {
            let range = match part.find(':') {
                Some(colon) => {
                    (value(&part[..colon])?, value(&part[colon + 1..])?)
                }
                None => {
                    let v = value(part)?;
                    (v, v)
                }
            };
            ranges.push(range);
        }

        Ok(SeqSet { ranges })
    }
}

/// Identifies a set of messages in an open stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    pub set: SeqSet,
    /// If true, `set` contains UIDs rather than sequence numbers.
    pub by_uid: bool,
}

impl Selector {
    pub fn msgnos(set: SeqSet) -> Self {
        Selector { set, by_uid: false }
    }

    pub fn uids(set: SeqSet) -> Self {
        Selector { set, by_uid: true }
    }

    pub fn all() -> Self {
        Selector::msgnos(SeqSet::all())
    }
}

/// Options for opening a stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    /// The mailbox is the user's INBOX, and so is eligible for importing
    /// mail from the system inbox.
    pub inbox: bool,
}

/// Changes that must be reported to the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollResponse {
    /// Sequence numbers of expunged messages, in the order they must be
    /// reported. Each is relative to the numbering after the previous ones
    /// were removed.
    pub expunge: Vec<u32>,
    /// The new message count, if new messages arrived.
    pub exists: Option<usize>,
    /// The new number of recent messages, if new messages arrived.
    pub recent: Option<usize>,
    /// Sequence numbers of messages whose flags were changed by another
    /// process.
    pub fetch: Vec<u32>,
}

impl PollResponse {
    pub fn is_empty(&self) -> bool {
        self.expunge.is_empty()
            && self.exists.is_none()
            && self.recent.is_none()
            && self.fetch.is_empty()
    }
}

/// The result of an expunge request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpungeResponse {
    /// Sequence numbers of removed messages, as in `PollResponse::expunge`.
    pub expunge: Vec<u32>,
    /// Bytes of file space given back.
    pub reclaimed: u64,
    /// Whether the file was physically compacted. When false, the messages
    /// are hidden and their space will be reclaimed later.
    pub compacted: bool,
}

/// A message to be appended to a mailbox.
#[derive(Clone, Debug)]
pub struct AppendMessage {
    pub flags: Vec<Flag>,
    /// Defaults to the current time.
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// The raw message, which must already use CRLF line endings.
    pub data: Vec<u8>,
}

/// Summary information about an open mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxStatus {
    pub messages: usize,
    pub recent: usize,
    pub unseen: usize,
    pub uid_next: u32,
    pub uid_validity: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_flags() {
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_eq!(
            Flag::Keyword("$Junk".to_owned()),
            "$junk".parse::<Flag>().unwrap()
        );
        assert_matches!(Err(Error::NxFlag), "\\Recent".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "foo bar".parse::<Flag>());
    }

    #[test]
    fn seq_set_parse_and_contains() {
        let set: SeqSet = "1:3,7,10:*".parse().unwrap();
        assert!(set.contains(1, 20));
        assert!(set.contains(3, 20));
        assert!(!set.contains(4, 20));
        assert!(set.contains(7, 20));
        assert!(set.contains(15, 20));
        assert!(!set.contains(15, 12));
        assert_eq!(Some(10), set.max_explicit());

        // Reversed ranges are legal
        let set: SeqSet = "5:2".parse().unwrap();
        assert!(set.contains(3, 9));

        let set: SeqSet = "*".parse().unwrap();
        assert!(set.contains(9, 9));
        assert!(!set.contains(8, 9));
        assert_eq!(None, set.max_explicit());

        assert_matches!(Err(Error::BadSequence), "0".parse::<SeqSet>());
        assert_matches!(Err(Error::BadSequence), "1:".parse::<SeqSet>());
        assert_matches!(Err(Error::BadSequence), "a".parse::<SeqSet>());
        assert_matches!(Err(Error::BadSequence), "".parse::<SeqSet>());
    }
}
