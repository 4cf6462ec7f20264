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

//! Critical sections.
//!
//! Operations that rewrite large parts of a mailbox (compaction, snarfing,
//! appends) run inside a `Critical` guard. While the guard is alive, the
//! signals a mail server typically uses for autologout or shutdown are
//! blocked on the calling thread; they are delivered once the guard drops.
//!
//! This is advisory. It keeps a well-behaved caller from tearing down the
//! process half way through a rewrite, but does nothing against a crash or
//! `SIGKILL`.

use log::warn;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

const DEFERRED_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGALRM,
];

/// Marks a critical section for as long as it is alive.
///
/// Guards nest; each restores the mask that was in effect when it was
/// created.
pub struct Critical {
    previous: Option<SigSet>,
}

impl Critical {
    pub fn enter() -> Self {
        let mut block = SigSet::empty();
        for &sig in DEFERRED_SIGNALS {
            block.add(sig);
        }

        let mut previous = SigSet::empty();
        match pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&block),
            Some(&mut previous),
        ) {
            Ok(()) => Critical {
                previous: Some(previous),
            },
            Err(e) => {
                warn!("Failed to enter critical section: {}", e);
                Critical { previous: None }
            }
        }
    }
}

impl Drop for Critical {
    fn drop(&mut self) {
        if let Some(ref previous) = self.previous {
            if let Err(e) =
                pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(previous), None)
            {
                warn!("Failed to leave critical section: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn current_mask() -> SigSet {
        let mut mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut mask)).unwrap();
        mask
    }

    #[test]
    fn critical_blocks_and_restores() {
        assert!(!current_mask().contains(Signal::SIGTERM));
        {
            let _outer = Critical::enter();
            assert!(current_mask().contains(Signal::SIGTERM));
            {
                let _inner = Critical::enter();
                assert!(current_mask().contains(Signal::SIGHUP));
            }
            // Still blocked after the inner section ends
            assert!(current_mask().contains(Signal::SIGTERM));
        }
        assert!(!current_mask().contains(Signal::SIGTERM));
    }
}
