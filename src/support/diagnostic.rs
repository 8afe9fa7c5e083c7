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

use std::os::unix::io::RawFd;
use std::path::Path;

use log::error;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use super::sysexits::*;
use super::system_config::DiagnosticConfig;

const STDERR: RawFd = 2;

/// Apply the diagnostic configuration.
///
/// On failure, an error message has already been logged, and the appropriate
/// exit code is returned.
pub fn apply_diagnostics(
    root: &Path,
    config: &DiagnosticConfig,
) -> Result<(), Sysexit> {
    if let Some(ref stderr_path) = config.stderr {
        redirect_stderr(&root.join(stderr_path))?;
    }

    Ok(())
}

fn redirect_stderr(stderr_path: &Path) -> Result<(), Sysexit> {
    let fd = nix::fcntl::open(
        stderr_path,
        OFlag::O_APPEND | OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP,
    )
    .map_err(|e| {
        error!(
            "failed to redirect stderr: open({}): {}",
            stderr_path.display(),
            e,
        );
        EX_CANTCREAT
    })?;

    // dup2 clears CLOEXEC on the new descriptor
    let result = nix::unistd::dup2(fd, STDERR);
    let _ = nix::unistd::close(fd);
    result.map(|_| ()).map_err(|e| {
        error!("failed to redirect stderr: dup2: {}", e);
        EX_OSERR
    })
}
