//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mboxidx.
//
// Mboxidx is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mboxidx is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mboxidx. If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use crate::check::collab::PartitionResolver;
use crate::index::lock::{locker_for, Locker};
use crate::support::diagnostic;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Create a new, empty mailbox.
    Create(CreateSubcommand),
    /// Append messages to a mailbox.
    Append(AppendSubcommand),
    /// Print the index header and every record of a mailbox.
    Dump(MailboxSubcommand),
    /// List the changes to a mailbox since a sync token.
    Changes(ChangesSubcommand),
    /// Check mailbox indices for consistency without changing anything.
    ///
    /// With no arguments, every mailbox on every partition is checked.
    Check(CheckSubcommand),
    /// Check mailbox indices and repair any inconsistencies found.
    ///
    /// Records which disagree with their messages are rewritten, damaged
    /// records are discarded, and messages missing from the index are added
    /// back to it. Every repaired record gets a fresh modseq, so clients
    /// syncing the mailbox will see the repair as a change.
    Reconstruct(CheckSubcommand),
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Create(ref mut c) => mem::take(&mut c.common),
            Command::Append(ref mut c) => mem::take(&mut c.common),
            Command::Dump(ref mut c) => mem::take(&mut c.common),
            Command::Changes(ref mut c) => mem::take(&mut c.common),
            Command::Check(ref mut c) | Command::Reconstruct(ref mut c) => {
                mem::take(&mut c.common)
            }
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `mboxidx.toml` etc
    /// [default: /etc/mboxidx or /usr/local/etc/mboxidx]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct CreateSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Create the mailbox on this partition instead of the default one.
    #[structopt(short, long)]
    pub(super) partition: Option<String>,

    /// The UID validity of the new mailbox [default: the current time]
    #[structopt(long)]
    pub(super) uidvalidity: Option<u32>,

    /// The name of the mailbox, with `.` separating hierarchy levels.
    pub(super) mailbox: String,
}

/// Append messages to a mailbox.
///
/// Each input is stored as one message under the next UID of the mailbox.
#[derive(StructOpt)]
pub(super) struct AppendSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Add this flag (e.g., '\Flagged') or keyword to the appended
    /// message(s). Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    pub(super) flag: Vec<crate::index::model::Flag>,

    /// The mailbox to append to.
    pub(super) mailbox: String,

    /// The files to append. "-" will read from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) inputs: Vec<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct MailboxSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    pub(super) mailbox: String,
}

#[derive(StructOpt)]
pub(super) struct ChangesSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// The sync token the client holds, in either the bare
    /// `<uidvalidity>-<modseq>` form or the URI form. Without a token, the
    /// full state of the mailbox is listed.
    #[structopt(short, long)]
    pub(super) token: Option<String>,

    /// Return at most about this many changes. More are returned if
    /// several changes share a modseq at the boundary.
    #[structopt(short, long)]
    pub(super) limit: Option<usize>,

    pub(super) mailbox: String,
}

#[derive(StructOpt)]
pub(super) struct CheckSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Only check this mailbox.
    #[structopt(short = "M", long, conflicts_with = "partition")]
    pub(super) mailbox: Option<String>,

    /// Only check the mailboxes on this partition.
    #[structopt(short = "P", long)]
    pub(super) partition: Option<String>,

    /// Only check mailboxes whose names match this pattern. `*` matches
    /// anything; `%` matches anything but the hierarchy separator.
    #[structopt(conflicts_with_all = &["mailbox", "partition"])]
    pub(super) pattern: Option<String>,
}

/// What every subcommand runs against.
pub(super) struct Context {
    pub(super) config: SystemConfig,
    pub(super) resolver: PartitionResolver,
    pub(super) locker: Arc<dyn Locker>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let matches = match Command::clap().get_matches_safe() {
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
    };

    let mut cmd = Command::from_clap(&matches);
    let common = cmd.common_options();
    let context = load_context(common);

    match cmd {
        Command::Create(cmd) => super::mailbox::create(context, cmd),
        Command::Append(cmd) => super::mailbox::append(context, cmd),
        Command::Dump(cmd) => super::mailbox::dump(context, cmd),
        Command::Changes(cmd) => super::mailbox::changes(context, cmd),
        Command::Check(cmd) => super::consistency::run(context, cmd, true),
        Command::Reconstruct(cmd) => {
            super::consistency::run(context, cmd, false)
        }
    }
}

fn load_context(common: CommonOptions) -> Context {
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/mboxidx/mboxidx.toml").is_file() {
            "/etc/mboxidx".to_owned().into()
        } else if Path::new("/usr/local/etc/mboxidx/mboxidx.toml").is_file() {
            "/usr/local/etc/mboxidx".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/mboxidx nor /usr/local/etc/mboxidx looks like\n\
                 the Mboxidx root; use --root=/path/to/mboxidx if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("mboxidx.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            system_config_path.display(),
            e
        );
    }

    let config: SystemConfig = match toml::from_slice(&system_config_toml) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            system_config_path.display(),
            e
        ),
    };

    if config.partitions.is_empty() {
        die!(
            EX_CONFIG,
            "'{}' does not define any partitions",
            system_config_path.display()
        );
    }

    if let Err(exit) = diagnostic::apply_diagnostics(&root, &config.diagnostic)
    {
        exit.exit();
    }

    init_logging(&root);

    Context {
        resolver: PartitionResolver::new(&root, &config),
        locker: locker_for(&config.locking),
        config,
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) =
            log4rs::init_file(&log_config_file, log_deserializers())
        {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_OSERR, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}

fn log_deserializers() -> log4rs::file::Deserializers {
    log4rs::file::Deserializers::new()
}
