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

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Mboxidx.
///
/// This is stored in a file named `mboxidx.toml` under the system root, which
/// is typically `/usr/local/etc/mboxidx` or `/etc/mboxidx`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// The mail partitions, by name.
    ///
    /// Each value is the directory under which that partition's mailboxes
    /// live. Relative paths are resolved against the system root.
    pub partitions: BTreeMap<String, PathBuf>,

    /// The partition new mailboxes are created in when none is named.
    #[serde(default = "default_partition_name")]
    pub default_partition: String,

    #[serde(default)]
    pub locking: LockingConfig,

    #[serde(default)]
    pub check: CheckConfig,

    #[serde(default)]
    pub diagnostic: DiagnosticConfig,
}

fn default_partition_name() -> String {
    "default".to_owned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// `flock(2)` on a per-mailbox lock file. Coordinates between processes.
    File,
    /// A lock table private to this process.
    Process,
}

impl Default for LockBackend {
    fn default() -> Self {
        LockBackend::File
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LockingConfig {
    pub backend: LockBackend,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckConfig {
    /// The identity the checker presents to ACL checks.
    ///
    /// Dry runs need lookup and read rights; repairs need administer.
    pub user: String,
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            user: "cyrus".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticConfig {
    /// If set, redirect standard error to this file on startup.
    ///
    /// Relative paths are resolved against the system root.
    pub stderr: Option<PathBuf>,
}
