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

//! What the consistency checker needs from the rest of the system: finding
//! mailboxes, deciding what a user may do to them, and reading the stored
//! messages an index describes.
//!
//! Each concern is a trait with a file system implementation over the
//! partition layout: mailbox `a.b.c` on a partition rooted at `P` lives in
//! directory `P/a/b/c`, which holds `cyrus.index`, an optional `cyrus.acl`,
//! and one file per message, named `<uid>.`.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use lazy_static::lazy_static;
use regex::Regex;

use crate::index::model::{Guid, IndexRecord, Uid};
use crate::index::store::{IndexStore, INDEX_FILE};
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};
use crate::support::safe_name::{is_safe_mailbox_name, HIERARCHY_SEPARATOR};
use crate::support::system_config::SystemConfig;

pub const ACL_FILE: &str = "cyrus.acl";

/// The identifier in an ACL that matches every user.
pub const ANYONE: &str = "anyone";

bitflags! {
    /// Rights a user may hold on a mailbox.
    pub struct Rights: u32 {
        const LOOKUP = 1 << 0;
        const READ = 1 << 1;
        const SEEN = 1 << 2;
        const WRITE = 1 << 3;
        const INSERT = 1 << 4;
        const POST = 1 << 5;
        const CREATE = 1 << 6;
        const DELETE_MAILBOX = 1 << 7;
        const DELETE_MESSAGE = 1 << 8;
        const EXPUNGE = 1 << 9;
        const ADMIN = 1 << 10;
    }
}

const RIGHT_LETTERS: &[(char, Rights)] = &[
    ('l', Rights::LOOKUP),
    ('r', Rights::READ),
    ('s', Rights::SEEN),
    ('w', Rights::WRITE),
    ('i', Rights::INSERT),
    ('p', Rights::POST),
    ('k', Rights::CREATE),
    ('x', Rights::DELETE_MAILBOX),
    ('t', Rights::DELETE_MESSAGE),
    ('e', Rights::EXPUNGE),
    ('a', Rights::ADMIN),
];

impl Rights {
    /// Parse a string of right letters. Unknown letters are ignored.
    ///
    /// The obsolete letters `c` and `d` stand for the rights they were split
    /// into (`kx` and `te` respectively).
    pub fn from_letters(letters: &str) -> Rights {
        let mut rights = Rights::empty();
        for ch in letters.chars() {
            match ch {
                'c' => rights |= Rights::CREATE | Rights::DELETE_MAILBOX,
                'd' => rights |= Rights::DELETE_MESSAGE | Rights::EXPUNGE,
                ch => {
                    if let Some(&(_, r)) =
                        RIGHT_LETTERS.iter().find(|&&(l, _)| l == ch)
                    {
                        rights |= r;
                    }
                }
            }
        }
        rights
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &(letter, right) in RIGHT_LETTERS {
            if self.contains(right) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

/// Compute the rights `user` holds under `acl`.
///
/// The ACL is a sequence of `identifier<TAB>rights<TAB>` pairs. An
/// identifier prefixed with `-` takes rights away; `anyone` matches every
/// user. Negative entries win over positive ones regardless of order.
pub fn rights_for(user: &str, acl: &str) -> Rights {
    let mut granted = Rights::empty();
    let mut denied = Rights::empty();

    let mut fields = acl.split('\t');
    while let Some(id) = fields.next() {
        let letters = fields.next().unwrap_or("");
        if id.is_empty() {
            continue;
        }

        let (negative, id) = if id.starts_with('-') {
            (true, &id[1..])
        } else {
            (false, id)
        };

        if id == user || id == ANYONE {
            let rights = Rights::from_letters(letters);
            if negative {
                denied |= rights;
            } else {
                granted |= rights;
            }
        }
    }

    granted - denied
}

/// A resolved mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxEntry {
    pub name: String,
    pub path: PathBuf,
    pub partition: String,
    /// The rights of the user the entry was looked up for.
    pub rights: Rights,
}

/// Which mailboxes a batch operation covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Mailbox(String),
    /// Names matching a pattern; `*` matches anything, `%` anything but the
    /// hierarchy separator.
    Pattern(String),
    Partition(String),
    All,
}

/// A compiled mailbox name pattern.
pub struct MailboxPattern(Regex);

impl MailboxPattern {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let mut rx = String::with_capacity(pattern.len() * 2 + 2);
        rx.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => rx.push_str(".*"),
                '%' => rx.push_str("[^.]*"),
                ch => rx.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4]))),
            }
        }
        rx.push('$');

        Regex::new(&rx).map(MailboxPattern).map_err(|_| Error::UnsafeName)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

pub trait MailboxResolver {
    /// Find mailbox `name` and the rights `user` has on it.
    fn lookup(&self, name: &str, user: &str) -> Result<MailboxEntry, Error>;

    /// The names of the mailboxes `selection` covers, sorted.
    ///
    /// A `Selection::Mailbox` is returned as-is, without checking that the
    /// mailbox exists.
    fn list(&self, selection: &Selection) -> Result<Vec<String>, Error>;
}

/// Resolves mailboxes within the partitions of the system configuration.
#[derive(Clone, Debug)]
pub struct PartitionResolver {
    partitions: BTreeMap<String, PathBuf>,
    default_partition: String,
}

impl PartitionResolver {
    /// Relative partition paths are taken relative to `root`.
    pub fn new(root: &Path, config: &SystemConfig) -> Self {
        PartitionResolver {
            partitions: config
                .partitions
                .iter()
                .map(|(name, path)| (name.clone(), root.join(path)))
                .collect(),
            default_partition: config.default_partition.clone(),
        }
    }

    fn mailbox_dir(partition_root: &Path, name: &str) -> PathBuf {
        let mut dir = partition_root.to_owned();
        dir.extend(name.split(HIERARCHY_SEPARATOR));
        dir
    }

    fn locate(&self, name: &str) -> Result<Option<(&str, PathBuf)>, Error> {
        if !is_safe_mailbox_name(name) {
            return Err(Error::UnsafeName);
        }

        Ok(self.partitions.iter().find_map(|(partition, root)| {
            let dir = Self::mailbox_dir(root, name);
            if dir.join(INDEX_FILE).is_file() {
                Some((partition.as_str(), dir))
            } else {
                None
            }
        }))
    }

    /// Create mailbox `name` with an empty index on `partition` (the default
    /// partition if `None`).
    pub fn create(
        &self,
        name: &str,
        partition: Option<&str>,
        uidvalidity: u32,
    ) -> Result<MailboxEntry, Error> {
        if self.locate(name)?.is_some() {
            return Err(Error::MailboxExists);
        }

        let partition = partition.unwrap_or(&self.default_partition);
        let root = self.partitions.get(partition).ok_or(Error::NxPartition)?;
        let dir = Self::mailbox_dir(root, name);
        fs::create_dir_all(&dir)?;
        IndexStore::create(&dir, uidvalidity)?;

        Ok(MailboxEntry {
            name: name.to_owned(),
            path: dir,
            partition: partition.to_owned(),
            rights: Rights::all(),
        })
    }

    /// Replace the ACL of the mailbox in `dir`.
    pub fn set_acl(dir: &Path, acl: &str) -> Result<(), Error> {
        file_ops::spit(dir.join(ACL_FILE), true, 0o600, acl.as_bytes())?;
        Ok(())
    }

    fn walk(
        dir: &Path,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), Error> {
        let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let component = match entry.file_name().into_string() {
                Ok(c) => c,
                Err(_) => continue,
            };
            let name = if prefix.is_empty() {
                component
            } else {
                format!("{}{}{}", prefix, HIERARCHY_SEPARATOR, component)
            };
            if !is_safe_mailbox_name(&name) {
                continue;
            }

            let path = entry.path();
            if path.join(INDEX_FILE).is_file() {
                out.push(name.clone());
            }
            Self::walk(&path, &name, out)?;
        }

        Ok(())
    }
}

impl MailboxResolver for PartitionResolver {
    fn lookup(&self, name: &str, user: &str) -> Result<MailboxEntry, Error> {
        let (partition, path) = self.locate(name)?.ok_or(Error::NxMailbox)?;

        // A mailbox without an ACL file is unrestricted. Any other failure
        // to read it concerns this mailbox alone.
        let rights = match fs::read_to_string(path.join(ACL_FILE)) {
            Ok(acl) => rights_for(user, &acl),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                Rights::all()
            }
            Err(e) => {
                return Err(Error::LookupFailed(format!("{}: {}", ACL_FILE, e)))
            }
        };

        Ok(MailboxEntry {
            name: name.to_owned(),
            path,
            partition: partition.to_owned(),
            rights,
        })
    }

    fn list(&self, selection: &Selection) -> Result<Vec<String>, Error> {
        let roots: Vec<&PathBuf> = match *selection {
            Selection::Mailbox(ref name) => return Ok(vec![name.clone()]),
            Selection::Partition(ref partition) => vec![self
                .partitions
                .get(partition)
                .ok_or(Error::NxPartition)?],
            Selection::Pattern(..) | Selection::All => {
                self.partitions.values().collect()
            }
        };

        let mut names = Vec::new();
        for root in roots.into_iter().filter(|r| r.is_dir()) {
            Self::walk(root, "", &mut names)?;
        }

        if let Selection::Pattern(ref pattern) = *selection {
            let pattern = MailboxPattern::new(pattern)?;
            names.retain(|n| pattern.matches(n));
        }

        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// The properties of a message the index records, derived from its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedMessage {
    pub size: u32,
    /// Bytes up to and including the blank line ending the header.
    pub header_size: u32,
    /// Lines in the body.
    pub content_lines: u32,
    pub guid: Guid,
}

impl ParsedMessage {
    /// Fails with `MessageTooLarge` if a size doesn't fit the index.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let header_size = header_end(data);
        Ok(ParsedMessage {
            size: index_size(data.len())?,
            header_size: index_size(header_size)?,
            content_lines: index_size(
                memchr::memchr_iter(b'\n', &data[header_size..]).count(),
            )?,
            guid: Guid::of(data),
        })
    }

    /// A fresh index record for this message under `uid`.
    pub fn to_record(&self, uid: Uid) -> IndexRecord {
        IndexRecord {
            uid,
            size: self.size,
            header_size: self.header_size,
            content_lines: self.content_lines,
            guid: self.guid,
            ..IndexRecord::default()
        }
    }
}

fn index_size(n: usize) -> Result<u32, Error> {
    u32::try_from(n).map_err(|_| Error::MessageTooLarge)
}

fn header_end(data: &[u8]) -> usize {
    let mut line_start = 0;
    for nl in memchr::memchr_iter(b'\n', data) {
        let line = &data[line_start..nl];
        if line.is_empty() || b"\r" == line {
            return nl + 1;
        }
        line_start = nl + 1;
    }

    data.len()
}

pub trait ContentStore {
    /// Read the message with the given UID, or `None` if it isn't stored.
    fn map_message(
        &self,
        mailbox: &MailboxEntry,
        uid: Uid,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// The UIDs of every stored message, ascending.
    fn list_uids(&self, mailbox: &MailboxEntry) -> Result<Vec<Uid>, Error>;

    fn store_message(
        &self,
        mailbox: &MailboxEntry,
        uid: Uid,
        data: &[u8],
    ) -> Result<(), Error>;

    fn rename_message(
        &self,
        mailbox: &MailboxEntry,
        from: Uid,
        to: Uid,
    ) -> Result<(), Error>;
}

lazy_static! {
    static ref MESSAGE_FILE: Regex = Regex::new("^([0-9]+)\\.$").unwrap();
}

/// Messages stored as `<uid>.` files in the mailbox directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpoolContentStore;

impl SpoolContentStore {
    pub fn message_path(mailbox: &MailboxEntry, uid: Uid) -> PathBuf {
        mailbox.path.join(format!("{}.", uid))
    }
}

impl ContentStore for SpoolContentStore {
    fn map_message(
        &self,
        mailbox: &MailboxEntry,
        uid: Uid,
    ) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(Self::message_path(mailbox, uid)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_uids(&self, mailbox: &MailboxEntry) -> Result<Vec<Uid>, Error> {
        let mut uids = Vec::new();
        let entries =
            fs::read_dir(&mailbox.path).on_not_found(Error::NxMailbox)?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let uid = name
                .to_str()
                .and_then(|n| MESSAGE_FILE.captures(n))
                .and_then(|c| c[1].parse::<u32>().ok())
                .filter(|&uid| 0 != uid);
            if let Some(uid) = uid {
                if entry.file_type()?.is_file() {
                    uids.push(Uid(uid));
                }
            }
        }

        uids.sort();
        Ok(uids)
    }

    fn store_message(
        &self,
        mailbox: &MailboxEntry,
        uid: Uid,
        data: &[u8],
    ) -> Result<(), Error> {
        file_ops::spit(Self::message_path(mailbox, uid), false, 0o600, data)
            .on_exists(Error::UidNotIncreasing)
    }

    fn rename_message(
        &self,
        mailbox: &MailboxEntry,
        from: Uid,
        to: Uid,
    ) -> Result<(), Error> {
        let to_path = Self::message_path(mailbox, to);
        if to_path.exists() {
            return Err(Error::UidNotIncreasing);
        }

        fs::rename(Self::message_path(mailbox, from), &to_path)?;
        file_ops::sync_dir(&mailbox.path)?;
        Ok(())
    }
}
