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

use std::mem;

use chrono::prelude::*;

use super::codec::SysFlags;
use super::flags::FlagChange;
use super::stream::MbxStream;
use crate::support::error::Error;
use crate::support::file_ops;

/// How much of the message is read at a time when looking for the end of
/// the header.
const HEADER_SCAN_CHUNK: usize = 16 * 1024;

impl MbxStream {
    /// Return the message header, including the blank line which ends it.
    pub fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>, Error> {
        let result = self.fetch_header_impl(msgno);
        self.fatal_check(result)
    }

    /// Return the message body.
    ///
    /// Unless `peek` is set, this also sets `\Seen` on the message.
    pub fn fetch_text(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error> {
        let result = self.fetch_text_impl(msgno, peek);
        self.fatal_check(result)
    }

    /// Return the whole message. `peek` is as for `fetch_text()`.
    pub fn fetch_message(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error> {
        let result = self.fetch_message_impl(msgno, peek);
        self.fatal_check(result)
    }

    pub fn internal_date(
        &self,
        msgno: u32,
    ) -> Result<DateTime<FixedOffset>, Error> {
        Ok(self.entry(msgno)?.internal_date)
    }

    pub fn size(&self, msgno: u32) -> Result<u64, Error> {
        Ok(self.entry(msgno)?.size)
    }

    fn fetch_header_impl(&mut self, msgno: u32) -> Result<Vec<u8>, Error> {
        let ix = self.index_of(msgno)?;
        let header_size = self.header_size(ix)?;
        self.read_data(ix, 0, header_size)
    }

    fn fetch_text_impl(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error> {
        let ix = self.index_of(msgno)?;
        let header_size = self.header_size(ix)?;
        let text =
            self.read_data(ix, header_size, self.messages[ix].size - header_size)?;
        if !peek {
            self.mark_seen(ix)?;
        }
        Ok(text)
    }

    fn fetch_message_impl(
        &mut self,
        msgno: u32,
        peek: bool,
    ) -> Result<Vec<u8>, Error> {
        let ix = self.index_of(msgno)?;
        let data = self.read_message_data(ix)?;
        if !peek {
            self.mark_seen(ix)?;
        }
        Ok(data)
    }

    fn index_of(&self, msgno: u32) -> Result<usize, Error> {
        self.entry(msgno)?;
        Ok((msgno - 1) as usize)
    }

    fn mark_seen(&mut self, ix: usize) -> Result<(), Error> {
        if self.read_only
            || self.messages[ix].sys_flags.contains(SysFlags::SEEN)
        {
            return Ok(());
        }

        self.note_foreign_writes()?;
        if self.update_status(ix, FlagChange::set(SysFlags::SEEN, 0))? {
            self.sync_status()?;
        }
        Ok(())
    }

    /// Read the whole of the message at `ix`.
    pub(super) fn read_message_data(&self, ix: usize) -> Result<Vec<u8>, Error> {
        self.read_data(ix, 0, self.messages[ix].size)
    }

    fn read_data(&self, ix: usize, start: u64, len: u64) -> Result<Vec<u8>, Error> {
        let m = &self.messages[ix];
        let mut data = vec![0u8; len as usize];
        let n =
            file_ops::read_full_at(&self.file, &mut data, m.data_offset() + start)?;
        if n != data.len() {
            return Err(Error::TruncatedMessage { offset: m.offset });
        }
        Ok(data)
    }

    /// Find the size of the message header, which ends with the first empty
    /// line. A message without one is all header.
    fn header_size(&mut self, ix: usize) -> Result<u64, Error> {
        if let Some(size) = self.messages[ix].header_size {
            return Ok(size);
        }

        let (offset, size) =
            (self.messages[ix].data_offset(), self.messages[ix].size);
        let mut buf = mem::take(&mut self.buf);
        let mut scanned = 0u64;
        let mut found = None;
        while found.is_none() && scanned < size {
            // Back up a little so a CRLFCRLF split across chunks is seen
            let start = scanned.saturating_sub(3);
            let len = (size - start).min(HEADER_SCAN_CHUNK as u64) as usize;
            buf.resize(len, 0);
            let n = file_ops::read_full_at(&self.file, &mut buf, offset + start)?;
            if n != len {
                self.buf = buf;
                return Err(Error::TruncatedMessage {
                    offset: self.messages[ix].offset,
                });
            }

            found = memchr::memmem::find(&buf, b"\r\n\r\n")
                .map(|pos| start + pos as u64 + 4);
            scanned = start + len as u64;
        }
        self.buf = buf;

        let header_size = found.unwrap_or(size);
        self.messages[ix].header_size = Some(header_size);
        Ok(header_size)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;
    use crate::model::*;

    #[test]
    fn fetch_parts() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\nFrom: x@y\r\n\r\nbody\r\nmore\r\n", &[]);
        setup.append(b"Subject: headers only\r\n", &[]);

        let mut stream = setup.open_rw();
        assert_eq!(
            b"Subject: one\r\nFrom: x@y\r\n\r\n".to_vec(),
            stream.fetch_header(1).unwrap()
        );
        assert_eq!(b"body\r\nmore\r\n".to_vec(), stream.fetch_text(1, true).unwrap());
        assert_eq!(
            b"Subject: headers only\r\n".to_vec(),
            stream.fetch_header(2).unwrap()
        );
        assert_eq!(Vec::<u8>::new(), stream.fetch_text(2, true).unwrap());
        assert!(stream.fetch_flags(1).unwrap().is_empty());

        assert_eq!(
            b"Subject: headers only\r\n".to_vec(),
            stream.fetch_message(2, false).unwrap()
        );
        assert_eq!(vec![Flag::Seen], stream.fetch_flags(2).unwrap());
        assert!(stream.fetch_flags(1).unwrap().is_empty());

        assert_matches!(
            Err(crate::support::error::Error::NoSuchMessage),
            stream.fetch_header(3)
        );
        assert_matches!(
            Err(crate::support::error::Error::NoSuchMessage),
            stream.fetch_header(0)
        );
    }

    #[test]
    fn header_split_across_chunks() {
        let setup = Setup::new();
        let mut message = b"X-Pad: ".to_vec();
        message.resize(super::HEADER_SCAN_CHUNK - 2, b'a');
        message.extend_from_slice(b"\r\n\r\nbody\r\n");
        setup.append(&message, &[]);

        let mut stream = setup.open_ro();
        assert_eq!(b"body\r\n".to_vec(), stream.fetch_text(1, false).unwrap());
        // Read-only streams never mark anything seen
        assert!(stream.fetch_flags(1).unwrap().is_empty());
    }
}
