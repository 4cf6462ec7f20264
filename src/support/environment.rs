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

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Name of the environment variable which overrides `lock_protection`.
///
/// The value is an octal permission mode, e.g. `0600`.
pub const LOCK_PROTECTION_VAR: &str = "MBX_LOCK_PROTECTION";

/// Everything the storage engine needs to know about the process it runs in.
///
/// There are no process-wide statics in the engine; each driver and every
/// stream it opens carries a shared reference to one of these.
///
/// This deserialises from a TOML table (all keys optional), so an embedding
/// server can make it a section of its own configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Environment {
    /// Directory in which parse/append permission lock files are created.
    pub lock_dir: PathBuf,
    /// Permission mode for newly created lock files.
    ///
    /// This is deliberately permissive by default, since every process that
    /// might open a shared mailbox must be able to lock it.
    pub lock_protection: u32,
    /// Permission mode for newly created mailboxes.
    pub mailbox_protection: u32,
    /// The user's system inbox (spool file), if snarfing is desired.
    pub system_inbox: Option<PathBuf>,
    /// Minimum number of seconds between two snarf attempts.
    pub snarf_interval_secs: u64,
    /// Seconds to wait before retrying a write that failed in a way that
    /// risks losing data (out of space, over quota).
    pub disk_error_backoff_secs: u64,
    /// How many times such a write is retried before giving up.
    pub disk_error_retries: u32,
}

impl Default for Environment {
    fn default() -> Self {
        Environment {
            lock_dir: "/tmp".into(),
            lock_protection: 0o666,
            mailbox_protection: 0o600,
            system_inbox: None,
            snarf_interval_secs: 30,
            disk_error_backoff_secs: 5,
            disk_error_retries: 12,
        }
    }
}

impl Environment {
    /// Parse an environment from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Return an environment for the user running this process.
    ///
    /// The system inbox is taken from `$MAIL` if set, and otherwise is the
    /// conventional spool file under `/var/mail`.
    pub fn for_current_user() -> Self {
        let mut this = Environment::default();
        this.system_inbox = match env::var_os("MAIL") {
            Some(mail) => Some(mail.into()),
            None => match nix::unistd::User::from_uid(nix::unistd::getuid()) {
                Ok(Some(user)) => {
                    Some(PathBuf::from("/var/mail").join(user.name))
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to look up passwd entry: {}", e);
                    None
                }
            },
        };
        this.apply_env_overrides();
        this
    }

    /// Apply overrides from process environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env::var_os(LOCK_PROTECTION_VAR) {
            match value
                .to_str()
                .and_then(|v| u32::from_str_radix(v, 8).ok())
                .filter(|&mode| mode <= 0o7777)
            {
                Some(mode) => self.lock_protection = mode,
                None => warn!(
                    "Ignoring bad {} value {:?}",
                    LOCK_PROTECTION_VAR, value
                ),
            }
        }
    }

    pub fn snarf_interval(&self) -> Duration {
        Duration::from_secs(self.snarf_interval_secs)
    }

    pub fn disk_error_backoff(&self) -> Duration {
        Duration::from_secs(self.disk_error_backoff_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_partial_toml() {
        let env = Environment::from_toml(
            "lock_dir = \"/var/lock/mbx\"\n\
             lock_protection = 384\n\
             system_inbox = \"/var/mail/zim\"\n",
        )
        .unwrap();

        assert_eq!(PathBuf::from("/var/lock/mbx"), env.lock_dir);
        assert_eq!(0o600, env.lock_protection);
        assert_eq!(Some(PathBuf::from("/var/mail/zim")), env.system_inbox);
        // Unspecified values keep their defaults
        assert_eq!(0o600, env.mailbox_protection);
        assert_eq!(Duration::from_secs(30), env.snarf_interval());
    }
}
