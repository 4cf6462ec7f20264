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
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::LevelFilter;
use structopt::StructOpt;

use mbxstore::driver::{MailboxDriver, MailboxStream};
use mbxstore::mbx::{MbxDriver, MbxStream};
use mbxstore::model::*;
use mbxstore::support::environment::Environment;
use mbxstore::support::error::Error;
use mbxstore::support::sysexits::*;

/// Inspect and maintain MBX mailboxes.
///
/// Every command is safe to run while other processes (such as an IMAP
/// server) have the mailbox open; commands that need the mailbox to
/// themselves fail with EX_TEMPFAIL instead of waiting.
#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// A TOML file of engine settings (lock_dir, lock_protection,
    /// mailbox_protection, system_inbox, ...).
    /// [default: built-in settings for the current user]
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log debugging information to standard error.
    #[structopt(long, short)]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Create a new, empty mailbox.
    Create(PathArg),
    /// Show summary information about a mailbox.
    Info(PathArg),
    /// List the messages in a mailbox.
    List(PathArg),
    /// Append messages to a mailbox.
    ///
    /// All inputs are appended as one batch: if any cannot be read or
    /// written, none are added.
    ///
    /// If the first line of an input ends with a UNIX line ending, all line
    /// feeds in that input are converted to DOS line endings. Otherwise the
    /// input is stored bit-for-bit.
    Append(AppendSubcommand),
    /// Permanently remove messages marked \Deleted.
    Expunge(PathArg),
    /// Resynchronise with the file and reclaim space from hidden messages.
    Check(PathArg),
    /// Import new mail from the system inbox into a mailbox.
    Snarf(PathArg),
    /// Delete a mailbox which nobody has open.
    Delete(PathArg),
    /// Rename a mailbox which nobody has open.
    Rename(RenameSubcommand),
}

#[derive(StructOpt)]
struct PathArg {
    /// The mailbox file.
    #[structopt(parse(from_os_str))]
    path: PathBuf,
}

#[derive(StructOpt)]
struct AppendSubcommand {
    /// Add this IMAP flag (e.g., '\Flagged') or keyword to the appended
    /// message(s). Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    flag: Vec<Flag>,

    /// The mailbox file.
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// The messages to append. "-" will read from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    inputs: Vec<PathBuf>,
}

#[derive(StructOpt)]
struct RenameSubcommand {
    #[structopt(parse(from_os_str))]
    from: PathBuf,
    #[structopt(parse(from_os_str))]
    to: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    mbxstore::init_simple_log(if options.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });

    let driver = MbxDriver::new(load_environment(options.config.as_deref()));

    match options.cmd {
        Command::Create(arg) => {
            driver
                .create(&arg.path)
                .unwrap_or_else(|e| fail(&arg.path, e));
        }
        Command::Info(arg) => info(&driver, &arg.path),
        Command::List(arg) => list(&driver, &arg.path),
        Command::Append(cmd) => append(&driver, cmd),
        Command::Expunge(arg) => {
            let mut stream = open(&driver, &arg.path, false, false);
            let response =
                stream.expunge().unwrap_or_else(|e| fail(&arg.path, e));
            if response.compacted {
                println!(
                    "Expunged {} messages, reclaimed {} bytes",
                    response.expunge.len(),
                    response.reclaimed
                );
            } else {
                println!(
                    "Hid {} messages; the mailbox is in use elsewhere, so \
                     the space will be reclaimed later",
                    response.expunge.len()
                );
            }
            close(stream);
        }
        Command::Check(arg) => {
            let mut stream = open(&driver, &arg.path, false, false);
            let response = stream.check().unwrap_or_else(|e| fail(&arg.path, e));
            report_poll(&response);
            close(stream);
        }
        Command::Snarf(arg) => {
            let spool = match driver.env().system_inbox {
                Some(ref spool) => spool.clone(),
                None => die!(EX_CONFIG, "No system inbox configured"),
            };
            let before = fs::metadata(&spool).map_or(0, |md| md.len());
            let stream = open(&driver, &arg.path, false, true);
            println!(
                "{} messages in {} ({} bytes were waiting)",
                stream.count(),
                arg.path.display(),
                before
            );
            close(stream);
        }
        Command::Delete(arg) => {
            driver
                .delete(&arg.path)
                .unwrap_or_else(|e| fail(&arg.path, e));
        }
        Command::Rename(cmd) => {
            driver
                .rename(&cmd.from, &cmd.to)
                .unwrap_or_else(|e| fail(&cmd.from, e));
        }
    }
}

fn load_environment(path: Option<&Path>) -> Environment {
    let path = match path {
        Some(path) => path,
        None => return Environment::for_current_user(),
    };

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => die!(EX_CONFIG, "Error reading '{}': {}", path.display(), e),
    };

    let mut env = match Environment::from_toml(&text) {
        Ok(env) => env,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            path.display(),
            e
        ),
    };
    env.apply_env_overrides();
    env
}

fn fail(path: &Path, e: Error) -> ! {
    die!(Sysexit::from(&e), "{}: {}", path.display(), e)
}

fn open(
    driver: &MbxDriver,
    path: &Path,
    read_only: bool,
    inbox: bool,
) -> MbxStream {
    driver
        .open(path, OpenOptions { read_only, inbox })
        .unwrap_or_else(|e| fail(path, e))
}

fn close(stream: MbxStream) {
    let path = stream.path().to_owned();
    MailboxStream::close(stream, false).unwrap_or_else(|e| fail(&path, e));
}

fn info(driver: &MbxDriver, path: &Path) {
    let stream = open(driver, path, true, false);
    let status = stream.status();
    println!("Mailbox:     {}", path.display());
    println!("Messages:    {}", status.messages);
    println!("Unseen:      {}", status.unseen);
    println!("UIDVALIDITY: {}", status.uid_validity);
    println!("UIDNEXT:     {}", status.uid_next);
}

fn list(driver: &MbxDriver, path: &Path) {
    let mut stream = open(driver, path, true, false);
    for msgno in 1..=stream.count() as u32 {
        let uid = stream.uid_of(msgno).unwrap_or_else(|e| fail(path, e));
        let date = stream
            .internal_date(msgno)
            .unwrap_or_else(|e| fail(path, e));
        let size = stream.size(msgno).unwrap_or_else(|e| fail(path, e));
        let flags = stream
            .fetch_flags(msgno)
            .unwrap_or_else(|e| fail(path, e));
        let header = stream
            .fetch_header(msgno)
            .unwrap_or_else(|e| fail(path, e));

        let flags: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        println!(
            "{:>6} {:>8} {} {:>9} ({}) {}",
            msgno,
            uid,
            date.format("%Y-%m-%d %H:%M:%S %z"),
            size,
            flags.join(" "),
            subject_of(&header)
        );
    }
}

fn subject_of(header: &[u8]) -> String {
    String::from_utf8_lossy(header)
        .split("\r\n")
        .find(|line| {
            line.get(..8)
                .map_or(false, |name| name.eq_ignore_ascii_case("subject:"))
        })
        .map(|line| line[8..].trim().to_owned())
        .unwrap_or_default()
}

fn append(driver: &MbxDriver, cmd: AppendSubcommand) {
    let mut messages = Vec::with_capacity(cmd.inputs.len());
    for input in &cmd.inputs {
        let mut data = Vec::new();
        let result = if Path::new("-") == input {
            io::stdin().lock().read_to_end(&mut data)
        } else {
            fs::File::open(input).and_then(|mut f| f.read_to_end(&mut data))
        };
        if let Err(e) = result {
            die!(EX_NOINPUT, "{}: {}", input.display(), e);
        }

        messages.push(AppendMessage {
            flags: cmd.flag.clone(),
            internal_date: None,
            data: to_dos_line_endings(data),
        });
    }

    driver
        .append(&cmd.path, &messages)
        .unwrap_or_else(|e| fail(&cmd.path, e));
}

/// Convert to CRLF line endings if the first line ends with a bare LF.
fn to_dos_line_endings(data: Vec<u8>) -> Vec<u8> {
    match memchr::memchr(b'\n', &data) {
        Some(0) => (),
        Some(pos) if b'\r' != data[pos - 1] => (),
        _ => return data,
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    for &ch in &data {
        if b'\n' == ch {
            out.push(b'\r');
        }
        out.push(ch);
    }
    out
}

fn report_poll(response: &PollResponse) {
    for msgno in &response.expunge {
        println!("* {} EXPUNGE", msgno);
    }
    if let Some(exists) = response.exists {
        println!("* {} EXISTS", exists);
    }
    if let Some(recent) = response.recent {
        println!("* {} RECENT", recent);
    }
    for msgno in &response.fetch {
        println!("* {} FETCH (FLAGS)", msgno);
    }
}
