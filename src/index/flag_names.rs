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

//! The per-mailbox table of user flag names.
//!
//! Records store user flags as a 128-bit set; the table maps each bit
//! position to its name. It is stored as `cyrus.flags` next to the index, one
//! name per line, the line number being the bit position. An empty line marks
//! an unassigned position.

use std::fs;
use std::path::Path;

use super::model::{UserFlags, MAX_USER_FLAGS};
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::is_atom;

pub const FLAGS_FILE: &str = "cyrus.flags";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagNames {
    names: Vec<Option<String>>,
}

impl FlagNames {
    /// Load the table from the mailbox directory `dir`.
    ///
    /// A missing file is an empty table. Lines that are not valid flag names
    /// leave their position unassigned.
    pub fn load(dir: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(dir.join(FLAGS_FILE)).ignore_not_found()?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut names = text
            .lines()
            .take(MAX_USER_FLAGS)
            .map(|line| Some(line.to_owned()).filter(|n| is_atom(n)))
            .collect::<Vec<_>>();
        while let Some(None) = names.last() {
            names.pop();
        }
        FlagNames { names }
    }

    /// Atomically write the table into the mailbox directory `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let mut text = String::new();
        for name in &self.names {
            if let Some(ref name) = *name {
                text.push_str(name);
            }
            text.push('\n');
        }
        file_ops::spit(dir.join(FLAGS_FILE), true, 0o600, text.as_bytes())?;
        Ok(())
    }

    /// Look up the bit position of `name`, which is matched ASCII
    /// case-insensitively.
    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| {
            n.as_ref().map_or(false, |n| n.eq_ignore_ascii_case(name))
        })
    }

    pub fn name_of(&self, id: usize) -> Option<&str> {
        self.names.get(id).and_then(|n| n.as_deref())
    }

    /// Return the bit position of `name`, assigning the first free one if
    /// it is not yet known. The caller is responsible for `save`.
    pub fn intern(&mut self, name: &str) -> Result<usize, Error> {
        if !is_atom(name) {
            return Err(Error::UnsafeName);
        }

        if let Some(id) = self.id_of(name) {
            return Ok(id);
        }

        let id = match self.names.iter().position(Option::is_none) {
            Some(free) => free,
            None if self.names.len() < MAX_USER_FLAGS => {
                self.names.push(None);
                self.names.len() - 1
            }
            None => return Err(Error::FlagTableFull),
        };
        self.names[id] = Some(name.to_owned());
        Ok(id)
    }

    /// The set of bit positions that have a name.
    pub fn valid_mask(&self) -> UserFlags {
        let mut mask = UserFlags::default();
        for (id, name) in self.names.iter().enumerate() {
            if name.is_some() {
                mask.insert(id);
            }
        }
        mask
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_deref().map(|n| (id, n)))
    }
}
