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

//! The index store of one mailbox.
//!
//! The index lives in `cyrus.index` in the mailbox directory: a header block
//! followed by `num_records` record blocks, laid out by `codec`. The store
//! reads blocks on demand with positioned I/O; nothing beyond the header is
//! cached, so a store stays valid across other writers' appends as long as
//! `refresh` is called after each lock acquisition.
//!
//! Every mutation writes the touched record, then the header, then syncs the
//! file before returning. Mutations are only permitted while the store is
//! mutable, which `IndexHandles` arranges to coincide with an exclusive lock.

use std::cmp;
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::codec::{self, Corruption, HEADER_SIZE, RECORD_SIZE};
use super::flag_names::FlagNames;
use super::model::*;
use crate::support::error::Error;
use crate::support::file_ops::{self, ErrorTransforms};

pub const INDEX_FILE: &str = "cyrus.index";

const DAY: u32 = 86400;

pub struct IndexStore {
    dir: PathBuf,
    file: fs::File,
    header: IndexHeader,
    flag_names: FlagNames,
    writable: bool,
    mutable: bool,
}

impl IndexStore {
    /// Create a fresh, empty index in the mailbox directory `dir`.
    ///
    /// Fails with `MailboxExists` if there already is one.
    pub fn create(dir: &Path, uidvalidity: u32) -> Result<(), Error> {
        let header = IndexHeader::new(uidvalidity);
        file_ops::spit(
            dir.join(INDEX_FILE),
            false,
            0o600,
            &codec::encode_header(&header),
        )
        .on_exists(Error::MailboxExists)
    }

    /// Open the index in the mailbox directory `dir`.
    ///
    /// If `writable` is true, the file is opened for writing and the store
    /// starts out mutable.
    pub fn open(dir: &Path, writable: bool) -> Result<Self, Error> {
        let mut store = Self::open_file(dir, writable)?;
        store.refresh()?;
        Ok(store)
    }

    /// Open an index whose header is damaged.
    ///
    /// The header fields are taken as they are found, except that the layout
    /// fields are forced to the supported layout and the record count is
    /// derived from the file size. Nothing is written; the caller is expected
    /// to recompute the header and `update_header`.
    pub fn open_salvaged(dir: &Path, writable: bool) -> Result<Self, Error> {
        let mut store = Self::open_file(dir, writable)?;
        let len = store.file.metadata()?.len();

        let mut block = [0u8; HEADER_SIZE];
        let mut header = if len >= HEADER_SIZE as u64 {
            store.file.read_exact_at(&mut block, 0)?;
            codec::decode_header_unchecked(&block)
                .map_err(Error::HeaderCorrupt)?
        } else {
            IndexHeader::new(0)
        };

        let fresh = IndexHeader::new(0);
        header.minor_version = fresh.minor_version;
        header.start_offset = fresh.start_offset;
        header.record_size = fresh.record_size;
        header.num_records = (len.saturating_sub(HEADER_SIZE as u64)
            / RECORD_SIZE as u64) as u32;
        header.deletedmodseq =
            cmp::min(header.deletedmodseq, header.highestmodseq);

        warn!(
            "{}: salvaged damaged index header ({} records)",
            store.dir.display(),
            header.num_records
        );
        store.header = header;
        store.flag_names = FlagNames::load(&store.dir)?;
        Ok(store)
    }

    fn open_file(dir: &Path, writable: bool) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(dir.join(INDEX_FILE))
            .on_not_found(Error::NxMailbox)?;

        Ok(IndexStore {
            dir: dir.to_owned(),
            file,
            header: IndexHeader::default(),
            flag_names: FlagNames::default(),
            writable,
            mutable: writable,
        })
    }

    /// Re-read the header and flag names from disk.
    pub fn refresh(&mut self) -> Result<(), Error> {
        let mut block = [0u8; HEADER_SIZE];
        self.file
            .read_exact_at(&mut block, 0)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    Error::HeaderCorrupt(Corruption::Truncated)
                }
                _ => Error::Io(e),
            })?;
        let header =
            codec::decode_header(&block).map_err(Error::HeaderCorrupt)?;

        let fresh = IndexHeader::new(0);
        if header.minor_version != fresh.minor_version
            || header.start_offset != fresh.start_offset
            || header.record_size != fresh.record_size
        {
            return Err(Error::HeaderCorrupt(Corruption::UnsupportedLayout));
        }

        if header.deletedmodseq > header.highestmodseq {
            return Err(Error::HeaderCorrupt(Corruption::ModseqInverted));
        }

        let needed = HEADER_SIZE as u64
            + u64::from(header.num_records) * RECORD_SIZE as u64;
        if self.file.metadata()?.len() < needed {
            return Err(Error::HeaderCorrupt(Corruption::Truncated));
        }

        self.header = header;
        self.flag_names = FlagNames::load(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn num_records(&self) -> u32 {
        self.header.num_records
    }

    pub fn flag_names(&self) -> &FlagNames {
        &self.flag_names
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub(super) fn set_mutable(&mut self, mutable: bool) {
        self.mutable = mutable && self.writable;
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.mutable {
            Ok(())
        } else {
            Err(Error::MailboxReadOnly)
        }
    }

    fn offset_of(recno: Recno) -> u64 {
        HEADER_SIZE as u64 + u64::from(recno.0 - 1) * RECORD_SIZE as u64
    }

    pub fn read_record(&self, recno: Recno) -> Result<IndexRecord, Error> {
        if 0 == recno.0 || recno.0 > self.header.num_records {
            return Err(Error::OutOfRange);
        }

        let mut block = [0u8; RECORD_SIZE];
        self.file.read_exact_at(&mut block, Self::offset_of(recno))?;
        codec::decode_record(&block).map_err(|reason| Error::CorruptRecord {
            recno: recno.0,
            reason,
        })
    }

    /// Iterate over every slot of the index, in record order.
    pub fn records(
        &self,
    ) -> impl Iterator<Item = (Recno, Result<IndexRecord, Error>)> + '_ {
        (1..=self.header.num_records)
            .map(move |r| (Recno(r), self.read_record(Recno(r))))
    }

    /// Find the record with the given UID.
    ///
    /// Purged and unknown UIDs yield `None`.
    pub fn find_record(
        &self,
        uid: Uid,
    ) -> Result<Option<(Recno, IndexRecord)>, Error> {
        if uid.is_none() {
            return Ok(None);
        }

        let (mut lo, mut hi) = (1u32, self.header.num_records);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let record = match self.read_record(Recno(mid)) {
                Ok(record) if !record.uid.is_none() => record,
                // Wiped and damaged slots carry no usable UID, so the
                // ordering can't be followed through them
                Ok(_) | Err(Error::CorruptRecord { .. }) => {
                    return self.find_record_linear(uid, lo, hi);
                }
                Err(e) => return Err(e),
            };

            match record.uid.cmp(&uid) {
                cmp::Ordering::Equal => return Ok(Some((Recno(mid), record))),
                cmp::Ordering::Less => lo = mid + 1,
                cmp::Ordering::Greater if mid > 1 => hi = mid - 1,
                cmp::Ordering::Greater => break,
            }
        }

        Ok(None)
    }

    fn find_record_linear(
        &self,
        uid: Uid,
        lo: u32,
        hi: u32,
    ) -> Result<Option<(Recno, IndexRecord)>, Error> {
        for recno in (lo..=hi).map(Recno) {
            match self.read_record(recno) {
                Ok(record) if record.uid == uid => {
                    return Ok(Some((recno, record)))
                }
                Ok(_) | Err(Error::CorruptRecord { .. }) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    fn write_record(
        &self,
        recno: Recno,
        record: &IndexRecord,
    ) -> Result<(), Error> {
        let block = codec::encode_record(record);
        self.file.write_all_at(&block, Self::offset_of(recno))?;
        Ok(())
    }

    /// Write `header` and sync the file, then adopt `header` as current.
    fn write_header(&mut self, header: IndexHeader) -> Result<(), Error> {
        self.file.write_all_at(&codec::encode_header(&header), 0)?;
        self.file.sync_data()?;
        self.header = header;
        Ok(())
    }

    /// Rewrite the current header to disk.
    pub fn commit_header(&mut self) -> Result<(), Error> {
        self.check_mutable()?;
        let header = self.header.clone();
        self.write_header(header)
    }

    /// Apply `f` to a copy of the header and commit the result.
    pub fn update_header(
        &mut self,
        f: impl FnOnce(&mut IndexHeader),
    ) -> Result<(), Error> {
        self.check_mutable()?;
        let mut header = self.header.clone();
        f(&mut header);
        self.write_header(header)
    }

    fn next_modseq(header: &mut IndexHeader) -> Result<Modseq, Error> {
        let modseq = header.highestmodseq.next().ok_or(Error::MailboxFull)?;
        header.highestmodseq = modseq;
        Ok(modseq)
    }

    /// Append `record` as a new slot at the end of the index.
    ///
    /// The record's UID must be greater than any UID the mailbox has seen.
    /// It is assigned a fresh modseq; a zero `internaldate` is taken to mean
    /// "now", and zero `gmtime`/`sentdate` are derived from `internaldate`.
    pub fn append_record(
        &mut self,
        mut record: IndexRecord,
    ) -> Result<(Recno, IndexRecord), Error> {
        self.check_mutable()?;
        if record.uid <= self.header.last_uid {
            return Err(Error::UidNotIncreasing);
        }

        let now = now();
        let mut header = self.header.clone();
        let recno =
            Recno(header.num_records.checked_add(1).ok_or(Error::MailboxFull)?);

        if 0 == record.internaldate {
            record.internaldate = now;
        }
        if 0 == record.gmtime {
            record.gmtime = record.internaldate;
        }
        if 0 == record.sentdate {
            record.sentdate = record.internaldate - record.internaldate % DAY;
        }
        record.modseq = Self::next_modseq(&mut header)?;
        record.last_updated = now;

        self.write_record(recno, &record)?;

        header.num_records = recno.0;
        header.last_uid = record.uid;
        header.last_appenddate = now;
        header.count_in(&record);
        header.note_expunged(&record);
        self.write_header(header)?;

        Ok((recno, record))
    }

    /// Replace the slot at `recno` with `new`, stamping it with a fresh
    /// modseq and keeping the header counts in step.
    fn restamp(
        &mut self,
        recno: Recno,
        old: Option<&IndexRecord>,
        mut new: IndexRecord,
    ) -> Result<IndexRecord, Error> {
        let mut header = self.header.clone();
        new.modseq = Self::next_modseq(&mut header)?;
        new.last_updated = now();

        if let Some(old) = old {
            header.count_out(old);
        }
        header.count_in(&new);
        header.note_expunged(&new);

        self.write_record(recno, &new)?;
        self.write_header(header)?;
        Ok(new)
    }

    /// Set the flags of the record at `recno`.
    ///
    /// The record gets a fresh modseq. Removing `EXPUNGED` from a record that
    /// has it fails with `Unexpunge`.
    pub fn update_flags(
        &mut self,
        recno: Recno,
        system_flags: SystemFlags,
        user_flags: UserFlags,
    ) -> Result<IndexRecord, Error> {
        self.check_mutable()?;
        let old = self.read_record(recno)?;
        if old.uid.is_none() {
            return Err(Error::ExpungedMessage);
        }
        if old.is_expunged() && !system_flags.contains(SystemFlags::EXPUNGED) {
            return Err(Error::Unexpunge);
        }

        let mut new = old.clone();
        new.system_flags = system_flags;
        new.user_flags = user_flags;
        self.restamp(recno, Some(&old), new)
    }

    /// Overwrite the record at `recno` wholesale, with a fresh modseq.
    ///
    /// This is the repair path; the old slot may be unreadable, in which case
    /// the header counts can't be adjusted and the caller should `recalc`.
    pub fn rewrite_record(
        &mut self,
        recno: Recno,
        record: IndexRecord,
    ) -> Result<IndexRecord, Error> {
        self.check_mutable()?;
        let old = match self.read_record(recno) {
            Ok(old) => Some(old),
            Err(Error::CorruptRecord { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(ref old) = old {
            if old.is_expunged() && !record.is_expunged() {
                return Err(Error::Unexpunge);
            }
        }

        self.restamp(recno, old.as_ref(), record)
    }

    /// Clear the slot at `recno`: UID 0, `EXPUNGED|UNLINKED`.
    ///
    /// With `restamp` the slot gets a fresh modseq; otherwise it keeps the
    /// modseq it had (0 if it was unreadable).
    pub fn wipe_record(
        &mut self,
        recno: Recno,
        restamp: bool,
    ) -> Result<(), Error> {
        self.check_mutable()?;
        let old = match self.read_record(recno) {
            Ok(old) => Some(old),
            Err(Error::CorruptRecord { .. }) => None,
            Err(e) => return Err(e),
        };

        let mut wiped = old.clone().unwrap_or_default();
        wiped.uid = Uid::NONE;
        wiped.system_flags |= SystemFlags::EXPUNGED | SystemFlags::UNLINKED;

        let mut header = self.header.clone();
        if let Some(ref old) = old {
            header.count_out(old);
        }
        if restamp {
            wiped.modseq = Self::next_modseq(&mut header)?;
            wiped.last_updated = now();
        }
        header.options |= OPT_NEEDS_REPACK;

        self.write_record(recno, &wiped)?;
        self.write_header(header)
    }

    /// Expunge every live record for which `decide` returns true.
    ///
    /// Each expunged record gets a fresh modseq. Unreadable records are
    /// skipped. Returns the number of records expunged.
    pub fn expunge(
        &mut self,
        mut decide: impl FnMut(&IndexRecord) -> bool,
    ) -> Result<u32, Error> {
        self.check_mutable()?;

        let mut count = 0;
        for recno in (1..=self.header.num_records).map(Recno) {
            let old = match self.read_record(recno) {
                Ok(old) => old,
                Err(e @ Error::CorruptRecord { .. }) => {
                    warn!("{}: expunge: {}", self.dir.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if old.uid.is_none() || old.is_expunged() || !decide(&old) {
                continue;
            }

            let mut new = old.clone();
            new.system_flags |= SystemFlags::EXPUNGED;
            self.restamp(recno, Some(&old), new)?;
            count += 1;
        }

        if count > 0 {
            info!("{}: expunged {} messages", self.dir.display(), count);
        }
        Ok(count)
    }

    /// Expunge every live record with `\Deleted`.
    pub fn expunge_deleted(&mut self) -> Result<u32, Error> {
        self.expunge(|r| r.system_flags.contains(SystemFlags::DELETED))
    }

    /// Mark expunged records last updated at or before `before` as
    /// `UNLINKED`.
    ///
    /// This does not change any modseq; clients already know these records
    /// are gone. Returns the number of records marked.
    pub fn expunge_cleanup(&mut self, before: u32) -> Result<u32, Error> {
        self.check_mutable()?;

        let mut header = self.header.clone();
        header.first_expunged = 0;
        header.options &= !OPT_NEEDS_UNLINK;

        let mut count = 0;
        for recno in (1..=header.num_records).map(Recno) {
            let mut record = match self.read_record(recno) {
                Ok(record) => record,
                Err(Error::CorruptRecord { .. }) => continue,
                Err(e) => return Err(e),
            };

            if record.is_expunged()
                && !record.is_unlinked()
                && record.last_updated <= before
            {
                record.system_flags |= SystemFlags::UNLINKED;
                self.write_record(recno, &record)?;
                count += 1;
            }

            header.note_expunged(&record);
        }

        if count > 0 {
            header.options |= OPT_NEEDS_REPACK;
        }
        self.write_header(header)?;
        Ok(count)
    }

    /// Permanently purge expunged records whose modseq is at most `horizon`
    /// and raise the purge horizon (`deletedmodseq`) to `horizon`.
    ///
    /// The horizon is never lowered and never exceeds `highestmodseq`.
    /// Returns the number of records purged.
    pub fn purge_expunged(&mut self, horizon: Modseq) -> Result<u32, Error> {
        self.check_mutable()?;

        let horizon = cmp::min(horizon, self.header.highestmodseq);
        if horizon <= self.header.deletedmodseq {
            return Ok(0);
        }

        let mut header = self.header.clone();
        header.first_expunged = 0;
        header.options &= !OPT_NEEDS_UNLINK;

        let mut count = 0;
        for recno in (1..=header.num_records).map(Recno) {
            let mut record = match self.read_record(recno) {
                Ok(record) => record,
                Err(Error::CorruptRecord { .. }) => continue,
                Err(e) => return Err(e),
            };

            if record.is_expunged()
                && !record.uid.is_none()
                && record.modseq <= horizon
            {
                record.uid = Uid::NONE;
                record.system_flags |= SystemFlags::UNLINKED;
                self.write_record(recno, &record)?;
                count += 1;
            }

            header.note_expunged(&record);
        }

        header.deletedmodseq = horizon;
        if count > 0 {
            header.options |= OPT_NEEDS_REPACK;
        }
        self.write_header(header)?;
        Ok(count)
    }

    /// Recompute the header's counts from the records and commit.
    ///
    /// Unreadable records are left out of the counts.
    pub fn recalc(&mut self) -> Result<(), Error> {
        self.check_mutable()?;
        let header = self.recalculated_header()?;
        self.write_header(header)
    }

    /// The current header with its counts recomputed from the records.
    pub fn recalculated_header(&self) -> Result<IndexHeader, Error> {
        let mut header = self.header.clone();
        header.zero_counts();
        for (_, record) in self.records() {
            match record {
                Ok(record) => {
                    header.count_in(&record);
                    header.note_expunged(&record);
                }
                Err(Error::CorruptRecord { .. }) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(header)
    }

    /// Intern a user flag name, persisting the flag table if it changed.
    pub fn intern_user_flag(&mut self, name: &str) -> Result<usize, Error> {
        self.check_mutable()?;
        let mut names = self.flag_names.clone();
        let id = names.intern(name)?;
        if names != self.flag_names {
            names.save(&self.dir)?;
            self.flag_names = names;
        }
        Ok(id)
    }
}

pub(crate) fn now() -> u32 {
    clamp_timestamp(chrono::Utc::now().timestamp())
}

/// Timestamps are stored as 32-bit unsigned seconds; saturate at either end.
fn clamp_timestamp(secs: i64) -> u32 {
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}
