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

//! The in-memory model of one mailbox's index.
//!
//! An index is a header followed by a dense array of records, one per message
//! (or DAV resource) ever appended to the mailbox since its creation. Records
//! are addressed by their 1-based position (`Recno`) and carry the message's
//! `Uid`. Every mutation stamps the touched record with the next `Modseq`,
//! which is what lets clients ask "what changed since X".

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use lazy_static::lazy_static;
use regex::Regex;
use tiny_keccak::{Hasher, Sha3};

use super::codec;
use crate::support::error::Error;
use crate::support::safe_name::is_atom;

/// The minor version of the on-disk format this crate reads and writes.
pub const MINOR_VERSION: u32 = 12;

/// Header option: the index contains slots that could be compacted away.
pub const OPT_NEEDS_REPACK: u32 = 1 << 0;
/// Header option: some expunged messages still have their files on disk.
pub const OPT_NEEDS_UNLINK: u32 = 1 << 1;

/// Unique identifier of a message within one uidvalidity epoch.
///
/// UIDs are strictly increasing in record order. UID 0 marks a slot with no
/// backing message (a wiped or purged record).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub u32);

impl Uid {
    pub const NONE: Uid = Uid(0);

    pub fn is_none(self) -> bool {
        0 == self.0
    }

    pub fn next(self) -> Option<Uid> {
        self.0.checked_add(1).map(Uid)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A modification sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Modseq(pub u64);

impl Modseq {
    pub fn next(self) -> Option<Modseq> {
        self.0.checked_add(1).map(Modseq)
    }
}

impl fmt::Display for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 1-based position of a record within its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Recno(pub u32);

impl fmt::Display for Recno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// The system flags of a record.
    ///
    /// Any bit not named here is treated as corruption when decoding.
    #[derive(Default)]
    pub struct SystemFlags: u32 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const DRAFT = 1 << 3;
        const SEEN = 1 << 4;
        /// The message file has been removed from disk.
        const UNLINKED = 1 << 30;
        /// The record is logically deleted; its slot remains until purged.
        const EXPUNGED = 1 << 31;
    }
}

/// The number of user flags a record can carry.
pub const MAX_USER_FLAGS: usize = 128;

/// A 128-bit set of user flags, indexed by position in the mailbox's flag
/// name table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserFlags(pub [u32; 4]);

impl UserFlags {
    pub fn contains(&self, id: usize) -> bool {
        id < MAX_USER_FLAGS && 0 != self.0[id / 32] & (1 << (id % 32))
    }

    pub fn insert(&mut self, id: usize) {
        if id < MAX_USER_FLAGS {
            self.0[id / 32] |= 1 << (id % 32);
        }
    }

    pub fn remove(&mut self, id: usize) {
        if id < MAX_USER_FLAGS {
            self.0[id / 32] &= !(1 << (id % 32));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| 0 == w)
    }

    /// The flags of `self` that are also in `other`.
    pub fn intersection(&self, other: &UserFlags) -> UserFlags {
        let mut ret = *self;
        for (r, o) in ret.0.iter_mut().zip(other.0.iter()) {
            *r &= *o;
        }
        ret
    }

    /// The flags of `self` that are not in `other`.
    pub fn difference(&self, other: &UserFlags) -> UserFlags {
        let mut ret = *self;
        for (r, o) in ret.0.iter_mut().zip(other.0.iter()) {
            *r &= !*o;
        }
        ret
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_USER_FLAGS).filter(move |&id| self.contains(id))
    }
}

/// Content identifier of a message: the first 20 bytes of the SHA3-256 of its
/// raw bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 20]);

impl Guid {
    pub const NULL: Guid = Guid([0; 20]);

    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha3::v256();
        hasher.update(data);
        let mut hash = [0u8; 32];
        hasher.finalize(&mut hash);

        let mut guid = [0u8; 20];
        guid.copy_from_slice(&hash[..20]);
        Guid(guid)
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| 0 == b)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Guid as fmt::Display>::fmt(self, f)
    }
}

/// The header of an index.
///
/// The CRC is not part of the model; it is computed when encoding and
/// validated when decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexHeader {
    pub generation_no: u32,
    pub format: u32,
    pub minor_version: u32,
    pub start_offset: u32,
    pub record_size: u32,
    pub num_records: u32,
    pub last_appenddate: u32,
    pub last_uid: Uid,
    pub quota_mailbox_used: u64,
    pub pop3_last_login: u32,
    pub uidvalidity: u32,
    /// Number of non-expunged records with `\Deleted`.
    pub deleted: u32,
    /// Number of non-expunged records with `\Answered`.
    pub answered: u32,
    /// Number of non-expunged records with `\Flagged`.
    pub flagged: u32,
    pub options: u32,
    pub leaked_cache_records: u32,
    pub highestmodseq: Modseq,
    /// The purge horizon. Tokens older than this can no longer be answered
    /// incrementally.
    pub deletedmodseq: Modseq,
    /// Number of non-expunged records.
    pub exists: u32,
    /// `last_updated` of the oldest expunged record not yet unlinked, or 0.
    pub first_expunged: u32,
    pub last_repack_time: u32,
    pub header_file_crc: u32,
    /// XOR of `record_sync_crc` over all non-expunged records.
    pub sync_crc: u32,
    pub recentuid: Uid,
    pub recenttime: u32,
    /// Reserved words; zero in every header this crate creates.
    pub reserved: [u32; 3],
}

impl IndexHeader {
    /// The header of a freshly created, empty mailbox.
    pub fn new(uidvalidity: u32) -> Self {
        IndexHeader {
            minor_version: MINOR_VERSION,
            start_offset: codec::HEADER_SIZE as u32,
            record_size: codec::RECORD_SIZE as u32,
            uidvalidity,
            highestmodseq: Modseq(1),
            ..IndexHeader::default()
        }
    }

    /// Add `record` to the running counts.
    pub fn count_in(&mut self, record: &IndexRecord) {
        if record.is_expunged() {
            return;
        }

        self.exists += 1;
        self.quota_mailbox_used += u64::from(record.size);
        if record.system_flags.contains(SystemFlags::ANSWERED) {
            self.answered += 1;
        }
        if record.system_flags.contains(SystemFlags::FLAGGED) {
            self.flagged += 1;
        }
        if record.system_flags.contains(SystemFlags::DELETED) {
            self.deleted += 1;
        }
        self.sync_crc ^= codec::record_sync_crc(record);
    }

    /// Remove `record` from the running counts.
    ///
    /// Counts saturate at zero, so a header whose counts have drifted can
    /// still be updated; `recalc` brings it back in line.
    pub fn count_out(&mut self, record: &IndexRecord) {
        if record.is_expunged() {
            return;
        }

        self.exists = self.exists.saturating_sub(1);
        self.quota_mailbox_used =
            self.quota_mailbox_used.saturating_sub(u64::from(record.size));
        if record.system_flags.contains(SystemFlags::ANSWERED) {
            self.answered = self.answered.saturating_sub(1);
        }
        if record.system_flags.contains(SystemFlags::FLAGGED) {
            self.flagged = self.flagged.saturating_sub(1);
        }
        if record.system_flags.contains(SystemFlags::DELETED) {
            self.deleted = self.deleted.saturating_sub(1);
        }
        self.sync_crc ^= codec::record_sync_crc(record);
    }

    /// Note `record` if it is expunged and awaiting unlink.
    ///
    /// `first_expunged` and `OPT_NEEDS_UNLINK` are only ever raised here;
    /// slots that stop awaiting unlink are accounted for by the next full
    /// pass over the records.
    pub fn note_expunged(&mut self, record: &IndexRecord) {
        if !record.is_expunged() || record.is_unlinked() {
            return;
        }

        self.options |= OPT_NEEDS_UNLINK;
        if 0 == self.first_expunged
            || record.last_updated < self.first_expunged
        {
            self.first_expunged = record.last_updated;
        }
    }

    pub fn zero_counts(&mut self) {
        self.exists = 0;
        self.quota_mailbox_used = 0;
        self.answered = 0;
        self.flagged = 0;
        self.deleted = 0;
        self.sync_crc = 0;
        self.first_expunged = 0;
        self.options &= !OPT_NEEDS_UNLINK;
    }
}

/// One record of an index.
///
/// As with the header, the CRC is not part of the model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: Uid,
    pub internaldate: u32,
    pub sentdate: u32,
    pub size: u32,
    pub header_size: u32,
    pub gmtime: u32,
    pub cache_offset: u32,
    pub last_updated: u32,
    pub system_flags: SystemFlags,
    pub user_flags: UserFlags,
    pub content_lines: u32,
    pub cache_version: u32,
    pub guid: Guid,
    pub modseq: Modseq,
    pub cache_crc: u32,
}

impl IndexRecord {
    pub fn is_expunged(&self) -> bool {
        self.system_flags.contains(SystemFlags::EXPUNGED)
    }

    pub fn is_unlinked(&self) -> bool {
        self.system_flags.contains(SystemFlags::UNLINKED)
    }
}

/// A message flag, as named by users of the index.
///
/// `Display` produces the IMAP form of the flag; `FromStr` does the reverse
/// conversion and also understands non-standard casing of the system flags.
#[derive(Clone, PartialEq, Eq)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl Flag {
    /// The system flag bit this flag maps to, if it is a system flag.
    pub fn system_flag(&self) -> Option<SystemFlags> {
        match *self {
            Flag::Answered => Some(SystemFlags::ANSWERED),
            Flag::Deleted => Some(SystemFlags::DELETED),
            Flag::Draft => Some(SystemFlags::DRAFT),
            Flag::Flagged => Some(SystemFlags::FLAGGED),
            Flag::Seen => Some(SystemFlags::SEEN),
            Flag::Keyword(..) => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if is_atom(s) {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

/// The URI prefix under which sync tokens are exchanged with DAV clients.
pub const SYNC_TOKEN_URI_PREFIX: &str = "http://cyrusimap.org/ns/sync/";

lazy_static! {
    static ref SYNC_TOKEN: Regex = Regex::new("^([0-9]+)-([0-9]+)$").unwrap();
}

/// A client's position in a mailbox's change history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncToken {
    pub uidvalidity: u32,
    pub modseq: Modseq,
}

impl SyncToken {
    /// Render the token in the URI form used on the wire.
    pub fn to_uri(&self) -> String {
        format!("{}{}", SYNC_TOKEN_URI_PREFIX, self)
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.uidvalidity, self.modseq)
    }
}

impl FromStr for SyncToken {
    type Err = Error;

    /// Parse either the bare `<uidvalidity>-<modseq>` form or the URI form.
    fn from_str(s: &str) -> Result<Self, Error> {
        let bare = if s.starts_with(SYNC_TOKEN_URI_PREFIX) {
            &s[SYNC_TOKEN_URI_PREFIX.len()..]
        } else {
            s
        };

        let captures = SYNC_TOKEN.captures(bare).ok_or(Error::BadToken)?;
        let uidvalidity =
            captures[1].parse::<u32>().map_err(|_| Error::BadToken)?;
        let modseq = captures[2].parse::<u64>().map_err(|_| Error::BadToken)?;
        Ok(SyncToken {
            uidvalidity,
            modseq: Modseq(modseq),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_flags_bit_ops() {
        let mut flags = UserFlags::default();
        assert!(flags.is_empty());
        flags.insert(0);
        flags.insert(33);
        flags.insert(127);
        flags.insert(128);
        assert!(flags.contains(0));
        assert!(flags.contains(33));
        assert!(flags.contains(127));
        assert!(!flags.contains(128));
        assert_eq!(vec![0, 33, 127], flags.iter().collect::<Vec<_>>());

        let mut mask = UserFlags::default();
        mask.insert(33);
        assert_eq!(
            vec![33],
            flags.intersection(&mask).iter().collect::<Vec<_>>()
        );
        assert_eq!(
            vec![0, 127],
            flags.difference(&mask).iter().collect::<Vec<_>>()
        );

        flags.remove(33);
        assert!(!flags.contains(33));
    }

    #[test]
    fn guid_is_stable() {
        let a = Guid::of(b"Subject: hi\r\n\r\nbody\r\n");
        let b = Guid::of(b"Subject: hi\r\n\r\nbody\r\n");
        let c = Guid::of(b"Subject: ho\r\n\r\nbody\r\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_null());
        assert!(Guid::NULL.is_null());
        assert_eq!(40, a.to_string().len());
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\seen".parse::<Flag>().unwrap());
        assert_eq!(Flag::Answered, "\\ANSWERED".parse::<Flag>().unwrap());
        assert_eq!(
            Flag::Keyword("$Junk".to_owned()),
            "$Junk".parse::<Flag>().unwrap()
        );
        assert_matches!(Err(Error::UnsafeName), "\\Bogus".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "a b".parse::<Flag>());
        assert_eq!("\\Flagged", Flag::Flagged.to_string());
        assert_eq!(Some(SystemFlags::DRAFT), Flag::Draft.system_flag());
        assert_eq!(None, Flag::Keyword("x".to_owned()).system_flag());
    }

    #[test]
    fn sync_token_forms() {
        let token = SyncToken {
            uidvalidity: 1_600_000_000,
            modseq: Modseq(18_446_744_073_709_551_615),
        };
        assert_eq!("1600000000-18446744073709551615", token.to_string());
        assert_eq!(token, token.to_string().parse().unwrap());
        assert_eq!(
            "http://cyrusimap.org/ns/sync/1600000000-18446744073709551615",
            token.to_uri()
        );
        assert_eq!(token, token.to_uri().parse().unwrap());

        assert_matches!(Err(Error::BadToken), "".parse::<SyncToken>());
        assert_matches!(Err(Error::BadToken), "12".parse::<SyncToken>());
        assert_matches!(Err(Error::BadToken), "1-2-3".parse::<SyncToken>());
        assert_matches!(Err(Error::BadToken), "-1-2".parse::<SyncToken>());
        assert_matches!(
            Err(Error::BadToken),
            "4294967296-1".parse::<SyncToken>()
        );
        assert_matches!(
            Err(Error::BadToken),
            "http://example.com/1-2".parse::<SyncToken>()
        );
    }

    #[test]
    fn counts_ignore_expunged() {
        let mut header = IndexHeader::new(1);
        let mut record = IndexRecord {
            uid: Uid(1),
            size: 100,
            system_flags: SystemFlags::FLAGGED | SystemFlags::DELETED,
            modseq: Modseq(2),
            ..IndexRecord::default()
        };

        header.count_in(&record);
        assert_eq!(1, header.exists);
        assert_eq!(1, header.flagged);
        assert_eq!(1, header.deleted);
        assert_eq!(100, header.quota_mailbox_used);
        assert_ne!(0, header.sync_crc);

        header.count_out(&record);
        assert_eq!(0, header.exists);
        assert_eq!(0, header.sync_crc);

        record.system_flags |= SystemFlags::EXPUNGED;
        header.count_in(&record);
        assert_eq!(0, header.exists);
    }
}
