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

//! Encoding and decoding of the MBX header block and record lines.
//!
//! Nothing in here performs I/O. The format has no escaping or redundancy, so
//! every decoder is strict about field widths and digit classes; anything
//! unexpected is reported as corruption rather than guessed at.

use std::str;

use bitflags::bitflags;
use chrono::prelude::*;

use crate::support::error::Error;

/// Size of the header block at the start of every MBX file.
pub const HDRSIZE: usize = 2048;
/// Number of keyword slots in the header.
pub const NUSERFLAGS: usize = 30;
/// Longest keyword name that will be stored in the header.
pub const MAX_KEYWORD_LEN: usize = 64;
/// The magic tag which starts the header block.
pub const MAGIC: &[u8; 7] = b"*mbx*\r\n";
/// Width of the `<8hex><4hex>-<8hex>` status field.
pub const STATUS_FIELD_LEN: usize = 21;
/// Distance from the start of the status field to the start of the message
/// data (the field itself plus its CRLF).
pub const STATUS_FIELD_BACKOFF: u64 = STATUS_FIELD_LEN as u64 + 2;
/// Record lines longer than this are never produced and are treated as
/// corruption when reading.
pub const MAX_RECORD_LINE_LEN: usize = 128;

const UID_VALIDITY_OFFSET: usize = 7;
const UID_LAST_OFFSET: usize = 15;
const KEYWORDS_OFFSET: usize = 25;

const DATE_FORMAT_OUT: &str = "%e-%b-%Y %H:%M:%S %z";
const DATE_FORMAT_IN: &str = "%d-%b-%Y %H:%M:%S %z";

bitflags! {
    /// The system flag bits of a status field.
    pub struct SysFlags: u16 {
        const SEEN = 0x0001;
        const DELETED = 0x0002;
        const FLAGGED = 0x0004;
        const ANSWERED = 0x0008;
        const DRAFT = 0x0010;
        /// Driver-private: the record has been expunged, but its space has
        /// not been reclaimed yet.
        const EXPUNGED = 0x8000;
    }
}

/// The keyword table from the header.
///
/// Slot `i` names the keyword represented by bit `i` of a record's user
/// flags. Slots are never reassigned once defined.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keywords {
    slots: [Option<String>; NUSERFLAGS],
}

impl Keywords {
    pub fn get(&self, slot: usize) -> Option<&str> {
        self.slots.get(slot).and_then(|s| s.as_deref())
    }

    /// Find the slot holding `name`, ignoring ASCII case.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_deref().map_or(false, |s| s.eq_ignore_ascii_case(name))
        })
    }

    /// Find or allocate the slot for `name`.
    ///
    /// Returns `None` if the name is not a valid keyword or the table is
    /// full.
    pub fn define(&mut self, name: &str) -> Option<usize> {
        if !is_valid_keyword(name.as_bytes()) {
            return None;
        }

        if let Some(slot) = self.find(name) {
            return Some(slot);
        }

        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(name.to_owned());
        Some(slot)
    }

    /// Iterate over the defined (slot, name) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(ix, s)| s.as_deref().map(|s| (ix, s)))
    }

    /// Return the names of the keywords set in `mask`, in slot order.
    ///
    /// Bits referring to undefined slots are ignored.
    pub fn names_in(&self, mask: u32) -> Vec<&str> {
        self.iter()
            .filter(|&(ix, _)| 0 != mask & (1 << ix))
            .map(|(_, name)| name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Whether `name` may be stored as a keyword.
///
/// Keywords must be IMAP atoms, which also guarantees that they cannot
/// contain the CR or LF that delimit header lines.
pub fn is_valid_keyword(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_KEYWORD_LEN
        && name.iter().copied().all(is_atom_char)
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

/// The decoded header block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub uid_validity: u32,
    pub uid_last: u32,
    pub keywords: Keywords,
}

impl Header {
    /// Create the header for a brand new, empty mailbox.
    pub fn new(uid_validity: u32) -> Self {
        Header {
            uid_validity,
            uid_last: 0,
            keywords: Keywords::default(),
        }
    }

    pub fn decode(data: &[u8; HDRSIZE]) -> Result<Self, Error> {
        if !data.starts_with(MAGIC) {
            return Err(Error::NotMbx);
        }

        let uid_validity =
            parse_hex(&data[UID_VALIDITY_OFFSET..UID_LAST_OFFSET])
                .ok_or(Error::CorruptHeader)?;
        let uid_last = parse_hex(&data[UID_LAST_OFFSET..UID_LAST_OFFSET + 8])
            .ok_or(Error::CorruptHeader)?;
        if b"\r\n" != &data[KEYWORDS_OFFSET - 2..KEYWORDS_OFFSET] {
            return Err(Error::CorruptHeader);
        }

        let mut keywords = Keywords::default();
        let mut pos = KEYWORDS_OFFSET;
        for slot in keywords.slots.iter_mut() {
            // Older writers stop after the last defined keyword, leaving
            // the rest of the block as padding.
            if 0 == data[pos] {
                break;
            }

            let line = &data[pos..];
            let end = memchr::memmem::find(line, b"\r\n")
                .ok_or(Error::CorruptHeader)?;
            let name = &line[..end];
            if !name.is_empty() {
                if !is_valid_keyword(name) {
                    return Err(Error::CorruptHeader);
                }
                // is_valid_keyword() admits only ASCII
                *slot = Some(
                    str::from_utf8(name)
                        .map_err(|_| Error::CorruptHeader)?
                        .to_owned(),
                );
            }

            pos += end + 2;
            if pos >= HDRSIZE {
                break;
            }
        }

        Ok(Header {
            uid_validity,
            uid_last,
            keywords,
        })
    }

    pub fn encode(&self) -> [u8; HDRSIZE] {
        let mut out = [0u8; HDRSIZE];
        out[..MAGIC.len()].copy_from_slice(MAGIC);
        put_hex(
            &mut out[UID_VALIDITY_OFFSET..UID_LAST_OFFSET],
            self.uid_validity,
        );
        put_hex(
            &mut out[UID_LAST_OFFSET..UID_LAST_OFFSET + 8],
            self.uid_last,
        );
        out[KEYWORDS_OFFSET - 2..KEYWORDS_OFFSET].copy_from_slice(b"\r\n");

        // Keywords are at most MAX_KEYWORD_LEN bytes, so all 30 lines always
        // fit in the block.
        let mut pos = KEYWORDS_OFFSET;
        for slot in &self.keywords.slots {
            if let Some(ref name) = *slot {
                out[pos..pos + name.len()].copy_from_slice(name.as_bytes());
                pos += name.len();
            }
            out[pos..pos + 2].copy_from_slice(b"\r\n");
            pos += 2;
        }

        out
    }
}

/// The fixed-width flags and UID portion of a record line.
///
/// This is the only part of a record that is ever rewritten in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusField {
    pub user_flags: u32,
    pub sys_flags: SysFlags,
    pub uid: u32,
}

impl StatusField {
    pub fn encode(&self) -> [u8; STATUS_FIELD_LEN] {
        let mut out = [0u8; STATUS_FIELD_LEN];
        put_hex(&mut out[0..8], self.user_flags);
        put_hex(&mut out[8..12], self.sys_flags.bits().into());
        out[12] = b'-';
        put_hex(&mut out[13..21], self.uid);
        out
    }

    /// Decode a status field. `offset` is only used for error reporting.
    pub fn decode(src: &[u8], offset: u64) -> Result<Self, Error> {
        let err = |reason| Error::CorruptRecord { offset, reason };

        if STATUS_FIELD_LEN != src.len() {
            return Err(err("bad status field width"));
        }
        if b'-' != src[12] {
            return Err(err("missing UID separator"));
        }

        let user_flags =
            parse_hex(&src[0..8]).ok_or_else(|| err("bad user flags"))?;
        let sys_flags =
            parse_hex(&src[8..12]).ok_or_else(|| err("bad system flags"))?;
        let uid = parse_hex(&src[13..21]).ok_or_else(|| err("bad UID"))?;

        Ok(StatusField {
            user_flags,
            sys_flags: SysFlags::from_bits_truncate(sys_flags as u16),
            uid,
        })
    }
}

/// A fully decoded record line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLine {
    pub internal_date: DateTime<FixedOffset>,
    pub size: u64,
    pub status: StatusField,
}

impl RecordLine {
    /// Return the length of the record line (including CRLF) at the start of
    /// `buf`, or `None` if `buf` does not contain a complete line.
    pub fn find_end(buf: &[u8]) -> Option<usize> {
        memchr::memmem::find(buf, b"\r\n").map(|ix| ix + 2)
    }

    /// Decode `line`, which must be exactly one record line including its
    /// CRLF. `offset` is only used for error reporting.
    pub fn decode(line: &[u8], offset: u64) -> Result<Self, Error> {
        let err = |reason| Error::CorruptRecord { offset, reason };

        let body = line
            .strip_suffix(b"\r\n")
            .ok_or_else(|| err("unterminated record line"))?;
        if body.len() <= STATUS_FIELD_LEN {
            return Err(err("record line too short"));
        }

        let (front, status) = body.split_at(body.len() - STATUS_FIELD_LEN);
        let front = front
            .strip_suffix(b";")
            .ok_or_else(|| err("missing ';' before status"))?;
        let comma = memchr::memrchr(b',', front)
            .ok_or_else(|| err("missing ',' before size"))?;
        let (date, size) = (&front[..comma], &front[comma + 1..]);

        if size.is_empty()
            || size.len() > 19
            || !size.iter().all(u8::is_ascii_digit)
        {
            return Err(err("bad message size"));
        }
        let size = str::from_utf8(size)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| err("bad message size"))?;

        let internal_date = str::from_utf8(date)
            .ok()
            .and_then(|d| {
                DateTime::parse_from_str(d.trim_start(), DATE_FORMAT_IN).ok()
            })
            .ok_or_else(|| err("bad internal date"))?;

        Ok(RecordLine {
            internal_date,
            size,
            status: StatusField::decode(status, offset)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{},{};",
            self.internal_date.format(DATE_FORMAT_OUT),
            self.size
        )
        .into_bytes();
        out.extend_from_slice(&self.status.encode());
        out.extend_from_slice(b"\r\n");
        out
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn put_hex(dst: &mut [u8], mut value: u32) {
    for b in dst.iter_mut().rev() {
        *b = HEX_DIGITS[(value & 0xF) as usize];
        value >>= 4;
    }
}

fn parse_hex(src: &[u8]) -> Option<u32> {
    if src.is_empty() || src.len() > 8 || !src.iter().all(u8::is_ascii_hexdigit)
    {
        return None;
    }

    str::from_utf8(src)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
}
