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

use log::{info, warn};

use super::codec::*;
use super::stream::MbxStream;
use crate::model::{Flag, Selector};
use crate::support::error::Error;
use crate::support::file_ops;

/// Map a system flag to its status field bit.
pub fn sys_flag(flag: &Flag) -> Option<SysFlags> {
    match *flag {
        Flag::Answered => Some(SysFlags::ANSWERED),
        Flag::Deleted => Some(SysFlags::DELETED),
        Flag::Draft => Some(SysFlags::DRAFT),
        Flag::Flagged => Some(SysFlags::FLAGGED),
        Flag::Seen => Some(SysFlags::SEEN),
        Flag::Keyword(_) => None,
    }
}

/// Convert status field bits back to flags.
pub fn flags_of(
    sys_flags: SysFlags,
    user_flags: u32,
    keywords: &Keywords,
) -> Vec<Flag> {
    let mut flags = Vec::new();
    for &(bit, ref flag) in &[
        (SysFlags::ANSWERED, Flag::Answered),
        (SysFlags::DELETED, Flag::Deleted),
        (SysFlags::DRAFT, Flag::Draft),
        (SysFlags::FLAGGED, Flag::Flagged),
        (SysFlags::SEEN, Flag::Seen),
    ] {
        if sys_flags.contains(bit) {
            flags.push(flag.clone());
        }
    }

    flags.extend(
        keywords
            .names_in(user_flags)
            .into_iter()
            .map(|kw| Flag::Keyword(kw.to_owned())),
    );
    flags
}

/// Define every keyword in `flags` which is not yet in `header`.
///
/// Keywords which cannot be defined because the table is full are skipped with
/// a warning. Returns whether `header` changed.
pub(super) fn define_keywords<'a>(
    log_prefix: &str,
    header: &mut Header,
    flags: impl IntoIterator<Item = &'a Flag>,
) -> bool {
    let mut dirty = false;
    for flag in flags {
        if let Flag::Keyword(ref kw) = *flag {
            if header.keywords.find(kw).is_some() {
                continue;
            }

            match header.keywords.define(kw) {
                Some(slot) => {
                    info!("{} Defined keyword {} in slot {}", log_prefix, kw, slot);
                    dirty = true;
                }
                None => warn!(
                    "{} Ignoring keyword {}: {}",
                    log_prefix,
                    kw,
                    if header.keywords.is_full() {
                        "keyword table full"
                    } else {
                        "not a valid keyword"
                    }
                ),
            }
        }
    }
    dirty
}

/// Compute the status bits for `flags`, ignoring undefined keywords.
pub(super) fn masks_for<'a>(
    header: &Header,
    flags: impl IntoIterator<Item = &'a Flag>,
) -> (SysFlags, u32) {
    let mut sys = SysFlags::empty();
    let mut user = 0u32;
    for flag in flags {
        match (sys_flag(flag), flag) {
            (Some(bit), _) => sys |= bit,
            (None, &Flag::Keyword(ref kw)) => {
                if let Some(slot) = header.keywords.find(kw) {
                    user |= 1 << slot;
                }
            }
            (None, _) => (),
        }
    }
    (sys, user)
}

/// Flags to add to and remove from a status field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct FlagChange {
    set_sys: SysFlags,
    clear_sys: SysFlags,
    set_user: u32,
    clear_user: u32,
}

impl FlagChange {
    pub(super) fn set(sys_flags: SysFlags, user_flags: u32) -> Self {
        FlagChange {
            set_sys: sys_flags,
            clear_sys: SysFlags::empty(),
            set_user: user_flags,
            clear_user: 0,
        }
    }

    pub(super) fn clear(sys_flags: SysFlags, user_flags: u32) -> Self {
        FlagChange {
            set_sys: SysFlags::empty(),
            clear_sys: sys_flags,
            set_user: 0,
            clear_user: user_flags,
        }
    }

    fn apply(&self, status: &StatusField) -> (SysFlags, u32) {
        (
            (status.sys_flags | self.set_sys) - self.clear_sys,
            (status.user_flags | self.set_user) & !self.clear_user,
        )
    }
}

impl MbxStream {
    /// Add `flags` to every selected message.
    ///
    /// Returns the sequence numbers of the messages that changed.
    pub fn set_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error> {
        let result = self.store(selector, flags, true);
        self.fatal_check(result)
    }

    /// Remove `flags` from every selected message.
    pub fn clear_flags(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
    ) -> Result<Vec<u32>, Error> {
        let result = self.store(selector, flags, false);
        self.fatal_check(result)
    }

    /// Return the current flags of `msgno`.
    pub fn fetch_flags(&mut self, msgno: u32) -> Result<Vec<Flag>, Error> {
        self.entry(msgno)?;
        let ix = (msgno - 1) as usize;
        if !self.messages[ix].valid {
            let status = self.read_status(ix)?;
            let m = &mut self.messages[ix];
            m.sys_flags = status.sys_flags - SysFlags::EXPUNGED;
            m.user_flags = status.user_flags;
            m.valid = true;
        }

        let m = &self.messages[ix];
        Ok(flags_of(m.sys_flags, m.user_flags, &self.header.keywords))
    }

    fn store(
        &mut self,
        selector: &Selector,
        flags: &[Flag],
        set: bool,
    ) -> Result<Vec<u32>, Error> {
        self.ensure_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let msgnos = self.resolve(selector)?;

        self.note_foreign_writes()?;

        if set
            && flags.iter().any(|f| match *f {
                Flag::Keyword(ref kw) => self.header.keywords.find(kw).is_none(),
                _ => false,
            })
        {
            let permission = self.permission()?;
            // The table on disk is authoritative
            self.header.keywords = self.read_header()?.keywords;
            if define_keywords(&self.log_prefix, &mut self.header, flags) {
                self.write_header()?;
                file_ops::sync(&self.log_prefix, &self.env, &self.file)?;
            }
            drop(permission);
        }

        let (sys, user) = masks_for(&self.header, flags);
        let change = if set {
            FlagChange::set(sys, user)
        } else {
            FlagChange::clear(sys, user)
        };
        let mut changed = Vec::new();
        for msgno in msgnos {
            if self.update_status((msgno - 1) as usize, change)? {
                changed.push(msgno);
            }
        }

        if !changed.is_empty() {
            self.sync_status()?;
        }
        Ok(changed)
    }

    /// Apply `change` to the status field of the message at `ix`.
    ///
    /// The change is applied to what is on disk rather than to the cache,
    /// since another process may have changed other flags of the same
    /// message. If another process has hidden the record, nothing is
    /// written, the cache entry is marked stale, and `false` is returned.
    /// Otherwise returns whether the message's flags changed.
    ///
    /// The caller must `sync_status()` afterwards.
    pub(super) fn update_status(
        &mut self,
        ix: usize,
        change: FlagChange,
    ) -> Result<bool, Error> {
        if self.read_only {
            return Ok(false);
        }

        let on_disk = self.read_status(ix)?;
        if on_disk.sys_flags.contains(SysFlags::EXPUNGED) {
            self.messages[ix].valid = false;
            self.flagcheck = true;
            return Ok(false);
        }

        let (sys_flags, user_flags) = change.apply(&on_disk);
        let m = &self.messages[ix];
        let status = StatusField {
            user_flags,
            sys_flags,
            uid: m.uid,
        };
        let write = (sys_flags, user_flags)
            != (on_disk.sys_flags, on_disk.user_flags);
        if write {
            file_ops::write_all_at(
                &self.log_prefix,
                &self.env,
                &self.file,
                &status.encode(),
                m.status_offset(),
            )?;
        }

        let m = &mut self.messages[ix];
        let cache_changed =
            (sys_flags, user_flags) != (m.sys_flags, m.user_flags);
        m.sys_flags = sys_flags;
        m.user_flags = user_flags;
        m.valid = true;
        Ok(write || cache_changed)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;
    use super::*;
    use crate::model::*;

    fn keyword(kw: &str) -> Flag {
        Flag::Keyword(kw.to_owned())
    }

    #[test]
    fn flags_persist_and_propagate() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        setup.append(b"Subject: two\r\n\r\nbody\r\n", &[Flag::Seen]);

        let mut a = setup.open_rw();
        let mut b = setup.open_rw();

        assert_eq!(
            vec![1, 2],
            a.set_flags(&Selector::all(), &[Flag::Seen, keyword("$Junk")])
                .unwrap()
        );
        assert_eq!(vec![Flag::Seen, keyword("$Junk")], a.fetch_flags(1).unwrap());
        // Message 2 only gained the keyword
        assert_eq!(vec![Flag::Seen, keyword("$Junk")], a.fetch_flags(2).unwrap());

        // Writes within one clock tick leave the mtime unchanged, so force
        // the refresh instead of relying on ping() noticing.
        let poll = b.check().unwrap();
        assert_eq!(vec![1, 2], poll.fetch);
        assert_eq!(vec![Flag::Seen, keyword("$junk")], b.fetch_flags(1).unwrap());

        assert_eq!(
            vec![2],
            b.clear_flags(&Selector::msgnos(SeqSet::just(2)), &[Flag::Seen])
                .unwrap()
        );
        let poll = a.check().unwrap();
        assert_eq!(vec![2], poll.fetch);
        assert_eq!(vec![keyword("$Junk")], a.fetch_flags(2).unwrap());

        drop(a);
        drop(b);
        let mut c = setup.open_ro();
        assert_eq!(vec![Flag::Seen, keyword("$Junk")], c.fetch_flags(1).unwrap());
    }

    #[test]
    fn stores_from_stale_stream_keep_foreign_changes() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);

        let mut a = setup.open_rw();
        let mut b = setup.open_rw();

        b.set_flags(&Selector::all(), &[Flag::Seen]).unwrap();
        // a has not looked at the file since b changed it
        assert_eq!(
            vec![1],
            a.set_flags(&Selector::all(), &[Flag::Flagged]).unwrap()
        );
        assert_eq!(vec![Flag::Flagged, Flag::Seen], a.fetch_flags(1).unwrap());

        // b does not know about \Flagged, but can still remove it
        assert_eq!(
            vec![1],
            b.clear_flags(&Selector::all(), &[Flag::Flagged]).unwrap()
        );
        a.set_flags(&Selector::all(), &[Flag::Answered]).unwrap();

        let mut c = setup.open_ro();
        assert_eq!(vec![Flag::Answered, Flag::Seen], c.fetch_flags(1).unwrap());
    }

    #[test]
    fn read_only_rejects_store() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let mut stream = setup.open_ro();
        assert_matches!(
            Err(Error::ReadOnly),
            stream.set_flags(&Selector::all(), &[Flag::Seen])
        );
    }

    #[test]
    fn out_of_range_sequence_rejected() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let mut stream = setup.open_rw();
        assert_matches!(
            Err(Error::BadSequence),
            stream.set_flags(&Selector::msgnos(SeqSet::just(2)), &[Flag::Seen])
        );
        // Unmatched UIDs are just ignored
        assert_eq!(
            Vec::<u32>::new(),
            stream
                .set_flags(&Selector::uids(SeqSet::just(99)), &[Flag::Seen])
                .unwrap()
        );
    }

    #[test]
    fn full_keyword_table_ignores_new_keywords() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let mut stream = setup.open_rw();

        let all: Vec<Flag> =
            (0..NUSERFLAGS).map(|i| keyword(&format!("kw{}", i))).collect();
        stream.set_flags(&Selector::all(), &all).unwrap();
        assert_eq!(NUSERFLAGS, stream.fetch_flags(1).unwrap().len());

        assert_eq!(
            Vec::<u32>::new(),
            stream.set_flags(&Selector::all(), &[keyword("extra")]).unwrap()
        );
        assert!(!stream.fetch_flags(1).unwrap().contains(&keyword("extra")));

        // Other flags in the same request still apply
        assert_eq!(
            vec![1],
            stream
                .set_flags(&Selector::all(), &[keyword("extra"), Flag::Flagged])
                .unwrap()
        );
    }

    #[test]
    fn keywords_defined_elsewhere_are_reused() {
        let setup = Setup::new();
        setup.append(b"Subject: one\r\n\r\nbody\r\n", &[]);
        let mut a = setup.open_rw();
        let mut b = setup.open_rw();

        a.set_flags(&Selector::all(), &[keyword("alpha")]).unwrap();
        // b has not seen alpha yet, and must not define it a second time
        b.set_flags(&Selector::all(), &[keyword("beta"), keyword("ALPHA")])
            .unwrap();

        let header = b.read_header().unwrap();
        assert_eq!(2, header.keywords.len());
        assert_eq!(Some(0), header.keywords.find("alpha"));
        assert_eq!(Some(1), header.keywords.find("beta"));
    }
}
