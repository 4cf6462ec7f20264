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
use std::io;
use std::time::Instant;

use log::{debug, error, info, warn};

use super::append::write_batch;
use super::flags::define_keywords;
use super::stream::MbxStream;
use crate::support::critical::Critical;
use crate::support::error::Error;
use crate::sysinbox::SystemInbox;

impl MbxStream {
    pub(super) fn snarf_eligible(&self) -> bool {
        self.inbox
            && !self.read_only
            && self.env.system_inbox.is_some()
            && self
                .last_snarf
                .map_or(true, |t| t.elapsed() >= self.env.snarf_interval())
    }

    /// Snarf, logging and swallowing any failure that does not make the
    /// mailbox itself suspect.
    pub(super) fn try_snarf(&mut self) -> Result<(), Error> {
        match self.snarf() {
            Ok(_) => Ok(()),
            Err(e) if e.is_format_error() => Err(e),
            Err(e) => {
                warn!("{} Failed to import new mail: {}", self.log_prefix, e);
                Ok(())
            }
        }
    }

    /// Move any messages in the system inbox into this mailbox.
    ///
    /// Returns the number of messages imported. The system inbox is only
    /// drained after the imported messages are safely on disk, so a failure
    /// at any point leaves every message in at least one of the two files.
    pub fn snarf(&mut self) -> Result<usize, Error> {
        self.ensure_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        // Only import onto a file we have fully parsed, so that the new
        // records are the only unparsed ones. If it has grown, the caller
        // parses and we try again next time.
        if self.file.metadata()?.len() != self.file_size {
            return Ok(0);
        }
        self.last_snarf = Some(Instant::now());

        let source = match self.env.system_inbox {
            Some(ref path) => path.clone(),
            None => return Ok(0),
        };
        match fs::metadata(&source) {
            Ok(md) if md.len() > 0 => (),
            Ok(_) => return Ok(0),
            Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let permission = self.permission()?;
        if self.file.metadata()?.len() != self.file_size {
            return Ok(0);
        }

        let mut inbox = SystemInbox::open(&source)?;
        let messages = inbox.read_messages()?;
        if messages.is_empty() {
            debug!("{} Nothing to import from {}", self.log_prefix, source.display());
            return Ok(0);
        }

        {
            let _critical = Critical::enter();
            self.header = self.read_header()?;
            if define_keywords(
                &self.log_prefix,
                &mut self.header,
                messages.iter().flat_map(|m| m.flags.iter()),
            ) {
                self.write_header()?;
            }

            write_batch(
                &self.log_prefix,
                &self.env,
                &self.file,
                &self.header,
                self.file_size,
                &messages,
            )?;

            if let Err(e) = inbox.remove_consumed(&self.env) {
                // The messages are safe here; the worst case is that they
                // are imported again.
                error!(
                    "{} Imported messages but failed to drain {}: {}",
                    self.log_prefix,
                    source.display(),
                    e
                );
            }
        }
        drop(inbox);

        info!(
            "{} Imported {} messages from {}",
            self.log_prefix,
            messages.len(),
            source.display()
        );

        self.parse(&permission)?;
        Ok(messages.len())
    }
}
