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

//! Constants from `sysexits.h`
//!
//! The `mbx` tool follows the sendmail/procmail conventions for exit codes so
//! that it can be driven from delivery scripts.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}

impl From<&Error> for Sysexit {
    fn from(e: &Error) -> Self {
        match *e {
            _ if e.is_format_error() => EX_DATAERR,
            Error::NxMailbox => EX_NOINPUT,
            Error::MailboxExists => EX_CANTCREAT,
            // Whoever has it open will go away eventually
            Error::MailboxInUse | Error::LockUnavailable(_) => EX_TEMPFAIL,
            Error::ReadOnly | Error::LockSecurity(_) => EX_NOPERM,
            Error::NoSuchMessage
            | Error::BadSequence
            | Error::NxFlag
            | Error::UnsafeName => EX_USAGE,
            Error::Io(_) => EX_IOERR,
            Error::Nix(_) => EX_OSERR,
            _ => EX_SOFTWARE,
        }
    }
}
