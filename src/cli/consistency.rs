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

use super::main::{CheckSubcommand, Context};
use crate::check::collab::{Selection, SpoolContentStore};
use crate::check::reconstruct::Checker;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;

pub(super) fn run(context: Context, cmd: CheckSubcommand, dry_run: bool) {
    let tool = if dry_run { "check" } else { "reconstruct" };
    let selection = match (cmd.mailbox, cmd.partition, cmd.pattern) {
        (Some(mailbox), None, None) => Selection::Mailbox(mailbox),
        (None, Some(partition), None) => Selection::Partition(partition),
        (None, None, Some(pattern)) => Selection::Pattern(pattern),
        (None, None, None) => Selection::All,
        _ => die!(
            EX_USAGE,
            "{}: --mailbox, --partition and a pattern are exclusive",
            tool
        ),
    };

    let checker = Checker::new(
        Box::new(context.resolver),
        Box::new(SpoolContentStore),
        context.locker,
        context.config.check.user.clone(),
        LogPrefix::new(tool.to_owned()),
    );

    let batch = match checker.check_all(&selection, dry_run) {
        Ok(batch) => batch,
        Err(e) => die!(Sysexit::for_error(&e), "{}: {}", tool, e),
    };

    for report in &batch.reports {
        for finding in &report.findings {
            println!("{}: {}", report.mailbox, finding);
        }
        for change in &report.header_changes {
            println!("{}: header {}", report.mailbox, change);
        }
    }

    let mut status = EX_OK;
    for &(ref mailbox, ref e) in &batch.failures {
        eprintln!("{}: {}", mailbox, e);
        status = status.max(Sysexit::for_error(e));
    }

    if EX_OK == status
        && dry_run
        && batch.reports.iter().any(|r| !r.is_clean())
    {
        status = EX_DATAERR;
    }

    status.exit()
}
