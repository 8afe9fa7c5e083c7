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

//! Validation and repair of mailbox indices against the stored messages.
//!
//! A pass over one mailbox runs under the exclusive lock, in four steps:
//!
//! 1. Open the index, salvaging the header if it is damaged, and raise
//!    `highestmodseq` and `last_uid` to cover every record.
//! 2. Walk the records. Unreadable slots and UIDs out of order are wiped;
//!    each live record is cross-checked against its message.
//! 3. Index any message that no record accounts for.
//! 4. Recount the header from the records.
//!
//! A dry run opens the index read-only and goes through the same steps,
//! reporting what a repair would change without changing it.

use std::cmp;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::{error, info, warn};

use super::collab::{
    ContentStore, MailboxEntry, MailboxResolver, ParsedMessage, Rights,
    Selection,
};
use crate::index::codec::Corruption;
use crate::index::lock::Locker;
use crate::index::model::*;
use crate::index::store::{self, IndexStore};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// One inconsistency found in a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Finding {
    CorruptHeader(Corruption),
    CorruptRecord {
        recno: Recno,
        reason: Corruption,
    },
    /// The UID is not above that of the preceding record.
    UidOutOfOrder {
        recno: Recno,
        uid: Uid,
    },
    /// The record's modseq is above the header's `highestmodseq`.
    FutureModseq {
        recno: Recno,
        uid: Uid,
        modseq: Modseq,
    },
    /// The record is not unlinked, but its message is gone.
    MissingMessage {
        recno: Recno,
        uid: Uid,
    },
    /// The record disagrees with its message. Each field that differs is
    /// given as `(recorded, actual)`.
    Mismatch {
        recno: Recno,
        uid: Uid,
        size: Option<(u32, u32)>,
        header_size: Option<(u32, u32)>,
        guid: Option<(Guid, Guid)>,
    },
    /// User flags set on the record that have no name.
    UnknownUserFlags {
        recno: Recno,
        uid: Uid,
        flags: UserFlags,
    },
    /// A stored message no record accounts for, and the UID it is (or
    /// would be) indexed under.
    UnindexedMessage {
        uid: Uid,
        new_uid: Uid,
    },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Finding::CorruptHeader(reason) => {
                write!(f, "index header corrupt: {}", reason)
            }
            Finding::CorruptRecord { recno, reason } => {
                write!(f, "record {} corrupt: {}", recno, reason)
            }
            Finding::UidOutOfOrder { recno, uid } => {
                write!(f, "record {}: UID {} out of order", recno, uid)
            }
            Finding::FutureModseq { recno, uid, modseq } => write!(
                f,
                "record {} (UID {}): modseq {} above highestmodseq",
                recno, uid, modseq
            ),
            Finding::MissingMessage { recno, uid } => {
                write!(f, "record {} (UID {}): message missing", recno, uid)
            }
            Finding::Mismatch {
                recno,
                uid,
                size,
                header_size,
                guid,
            } => {
                write!(f, "record {} (UID {}):", recno, uid)?;
                if let Some((recorded, actual)) = size {
                    write!(f, " size {} != {}", recorded, actual)?;
                }
                if let Some((recorded, actual)) = header_size {
                    write!(f, " header size {} != {}", recorded, actual)?;
                }
                if let Some((recorded, actual)) = guid {
                    write!(f, " GUID {} != {}", recorded, actual)?;
                }
                Ok(())
            }
            Finding::UnknownUserFlags { recno, uid, flags } => {
                write!(f, "record {} (UID {}): unnamed flags", recno, uid)?;
                for id in flags.iter() {
                    write!(f, " {}", id)?;
                }
                Ok(())
            }
            Finding::UnindexedMessage { uid, new_uid } => {
                if uid == new_uid {
                    write!(f, "message {} not indexed", uid)
                } else {
                    write!(
                        f,
                        "message {} not indexed (becomes {})",
                        uid, new_uid
                    )
                }
            }
        }
    }
}

/// A header field whose stored value differs from the derived one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderChange {
    pub field: &'static str,
    pub old: u64,
    pub new: u64,
}

impl fmt::Display for HeaderChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.old, self.new)
    }
}

fn header_changes(old: &IndexHeader, new: &IndexHeader) -> Vec<HeaderChange> {
    let fields: [(&'static str, u64, u64); 10] = [
        (
            "uidvalidity",
            old.uidvalidity.into(),
            new.uidvalidity.into(),
        ),
        ("last_uid", old.last_uid.0.into(), new.last_uid.0.into()),
        ("highestmodseq", old.highestmodseq.0, new.highestmodseq.0),
        ("num_records", old.num_records.into(), new.num_records.into()),
        ("exists", old.exists.into(), new.exists.into()),
        ("answered", old.answered.into(), new.answered.into()),
        ("flagged", old.flagged.into(), new.flagged.into()),
        ("deleted", old.deleted.into(), new.deleted.into()),
        (
            "quota_mailbox_used",
            old.quota_mailbox_used,
            new.quota_mailbox_used,
        ),
        ("sync_crc", old.sync_crc.into(), new.sync_crc.into()),
    ];

    fields
        .iter()
        .filter(|&&(_, old, new)| old != new)
        .map(|&(field, old, new)| HeaderChange { field, old, new })
        .collect()
}

/// The outcome of checking one mailbox.
#[derive(Clone, Debug)]
pub struct Report {
    pub mailbox: String,
    pub dry_run: bool,
    pub findings: Vec<Finding>,
    pub header_changes: Vec<HeaderChange>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.header_changes.is_empty()
    }
}

/// The outcome of checking a selection of mailboxes.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub reports: Vec<Report>,
    /// Mailboxes that could not be checked at all.
    pub failures: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.reports.iter().all(Report::is_clean)
    }
}

pub struct Checker {
    resolver: Box<dyn MailboxResolver>,
    content: Box<dyn ContentStore>,
    locker: Arc<dyn Locker>,
    user: String,
    log_prefix: LogPrefix,
}

impl Checker {
    pub fn new(
        resolver: Box<dyn MailboxResolver>,
        content: Box<dyn ContentStore>,
        locker: Arc<dyn Locker>,
        user: String,
        log_prefix: LogPrefix,
    ) -> Self {
        log_prefix.set_user(user.clone());
        Checker {
            resolver,
            content,
            locker,
            user,
            log_prefix,
        }
    }

    /// Check mailbox `name`, repairing it unless `dry_run`.
    ///
    /// A dry run requires lookup and read rights on the mailbox, a repair
    /// requires administer. A user who can't see the mailbox at all is told
    /// it doesn't exist.
    pub fn reconstruct(
        &self,
        name: &str,
        dry_run: bool,
    ) -> Result<Report, Error> {
        let log_prefix = self.log_prefix.deep_clone();
        log_prefix.set_mailbox(name.to_owned());

        let entry = self.resolver.lookup(name, &self.user)?;
        let needed = if dry_run {
            Rights::LOOKUP | Rights::READ
        } else {
            Rights::ADMIN
        };
        if !entry.rights.contains(needed) {
            return Err(if entry.rights.contains(Rights::LOOKUP) {
                Error::PermissionDenied
            } else {
                Error::NxMailbox
            });
        }

        let _guard = self.locker.acquire_exclusive(&entry.name, &entry.path)?;
        let mut pass = Pass::open(&*self.content, &entry, !dry_run)?;
        pass.fix_header()?;
        let on_disk = pass.scan_records()?;
        pass.index_strays(on_disk)?;
        pass.recount()?;

        let report = Report {
            mailbox: name.to_owned(),
            dry_run,
            findings: pass.findings,
            header_changes: pass.header_changes,
        };

        for finding in &report.findings {
            warn!("{} {}", log_prefix, finding);
        }
        for change in &report.header_changes {
            warn!("{} header {}", log_prefix, change);
        }
        if report.is_clean() {
            info!("{} OK", log_prefix);
        } else if dry_run {
            info!(
                "{} {} problems found (not repaired)",
                log_prefix,
                report.findings.len() + report.header_changes.len()
            );
        } else {
            info!(
                "{} repaired {} problems",
                log_prefix,
                report.findings.len() + report.header_changes.len()
            );
        }

        Ok(report)
    }

    /// Check every mailbox in `selection`.
    ///
    /// Mailboxes that can't be checked are recorded in the report and the
    /// run moves on, unless the failure is a fault of the storage itself, in
    /// which case the run stops with that error.
    pub fn check_all(
        &self,
        selection: &Selection,
        dry_run: bool,
    ) -> Result<BatchReport, Error> {
        let mut batch = BatchReport::default();
        for name in self.resolver.list(selection)? {
            match self.reconstruct(&name, dry_run) {
                Ok(report) => batch.reports.push(report),
                Err(e) if e.is_fatal() => {
                    error!("{} {}: {}", self.log_prefix, name, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} {}: {}", self.log_prefix, name, e);
                    batch.failures.push((name, e));
                }
            }
        }

        Ok(batch)
    }
}

struct Pass<'a> {
    content: &'a dyn ContentStore,
    entry: &'a MailboxEntry,
    repair: bool,
    store: IndexStore,
    /// Whether the header on disk failed validation.
    salvaged: bool,
    /// The header after `fix_header`. A repair commits it; a dry run only
    /// compares against it.
    header: IndexHeader,
    findings: Vec<Finding>,
    header_changes: Vec<HeaderChange>,
}

impl<'a> Pass<'a> {
    fn open(
        content: &'a dyn ContentStore,
        entry: &'a MailboxEntry,
        repair: bool,
    ) -> Result<Self, Error> {
        let mut findings = Vec::new();
        let (store, salvaged) = match IndexStore::open(&entry.path, repair) {
            Ok(store) => (store, false),
            Err(Error::HeaderCorrupt(reason)) => {
                findings.push(Finding::CorruptHeader(reason));
                (IndexStore::open_salvaged(&entry.path, repair)?, true)
            }
            Err(e) => return Err(e),
        };

        Ok(Pass {
            content,
            entry,
            repair,
            header: store.header().clone(),
            store,
            salvaged,
            findings,
            header_changes: Vec::new(),
        })
    }

    /// The header as it stands, or would stand after a repair.
    fn current_header(&self) -> &IndexHeader {
        if self.repair {
            self.store.header()
        } else {
            &self.header
        }
    }

    fn fix_header(&mut self) -> Result<(), Error> {
        let mut max_modseq = Modseq(1);
        let mut max_uid = Uid::NONE;
        for (recno, record) in self.store.records() {
            let record = match record {
                Ok(record) => record,
                Err(Error::CorruptRecord { .. }) => continue,
                Err(e) => return Err(e),
            };

            if record.modseq > self.header.highestmodseq {
                self.findings.push(Finding::FutureModseq {
                    recno,
                    uid: record.uid,
                    modseq: record.modseq,
                });
            }
            max_modseq = cmp::max(max_modseq, record.modseq);
            max_uid = cmp::max(max_uid, record.uid);
        }

        let mut fixed = self.header.clone();
        if 0 == fixed.uidvalidity {
            fixed.uidvalidity = store::now();
        }
        fixed.highestmodseq = cmp::max(fixed.highestmodseq, max_modseq);
        fixed.last_uid = cmp::max(fixed.last_uid, max_uid);
        fixed.deletedmodseq =
            cmp::min(fixed.deletedmodseq, fixed.highestmodseq);

        self.header_changes
            .extend(header_changes(&self.header, &fixed));
        if self.repair && (self.salvaged || fixed != self.header) {
            let header = fixed.clone();
            self.store.update_header(move |h| *h = header)?;
        }
        self.header = fixed;
        Ok(())
    }

    /// Check every record, returning the UIDs of stored messages that no
    /// live record accounts for.
    fn scan_records(&mut self) -> Result<BTreeSet<Uid>, Error> {
        let mut on_disk = self
            .content
            .list_uids(self.entry)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        let named_flags = self.store.flag_names().valid_mask();
        let mut last_uid = Uid::NONE;

        for recno in (1..=self.store.num_records()).map(Recno) {
            let record = match self.store.read_record(recno) {
                Ok(record) => record,
                Err(Error::CorruptRecord { reason, .. }) => {
                    self.findings
                        .push(Finding::CorruptRecord { recno, reason });
                    self.wipe(recno)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if record.uid.is_none() {
                continue;
            }

            if record.uid <= last_uid {
                self.findings.push(Finding::UidOutOfOrder {
                    recno,
                    uid: record.uid,
                });
                self.wipe(recno)?;
                continue;
            }
            last_uid = record.uid;
            on_disk.remove(&record.uid);

            let mut fixed = record.clone();

            let unnamed = record.user_flags.difference(&named_flags);
            if !unnamed.is_empty() {
                self.findings.push(Finding::UnknownUserFlags {
                    recno,
                    uid: record.uid,
                    flags: unnamed,
                });
                fixed.user_flags = record.user_flags.intersection(&named_flags);
            }

            if !record.is_unlinked() {
                match self.content.map_message(self.entry, record.uid)? {
                    None => {
                        self.findings.push(Finding::MissingMessage {
                            recno,
                            uid: record.uid,
                        });
                        fixed.system_flags |=
                            SystemFlags::EXPUNGED | SystemFlags::UNLINKED;
                    }
                    Some(data) => {
                        self.cross_check(recno, &record, &data, &mut fixed)?
                    }
                }
            }

            if self.repair && fixed != record {
                self.store.rewrite_record(recno, fixed)?;
            }
        }

        Ok(on_disk)
    }

    fn cross_check(
        &mut self,
        recno: Recno,
        record: &IndexRecord,
        data: &[u8],
        fixed: &mut IndexRecord,
    ) -> Result<(), Error> {
        fn differ<T: PartialEq>(recorded: T, actual: T) -> Option<(T, T)> {
            if recorded != actual {
                Some((recorded, actual))
            } else {
                None
            }
        }

        let parsed = ParsedMessage::parse(data)?;
        let size = differ(record.size, parsed.size);
        let header_size = differ(record.header_size, parsed.header_size);
        let guid = differ(record.guid, parsed.guid);
        if size.is_none() && header_size.is_none() && guid.is_none() {
            return Ok(());
        }

        self.findings.push(Finding::Mismatch {
            recno,
            uid: record.uid,
            size,
            header_size,
            guid,
        });
        fixed.size = parsed.size;
        fixed.header_size = parsed.header_size;
        fixed.content_lines = parsed.content_lines;
        fixed.guid = parsed.guid;
        Ok(())
    }

    fn wipe(&mut self, recno: Recno) -> Result<(), Error> {
        if self.repair {
            self.store.wipe_record(recno, true)?;
        }
        Ok(())
    }

    /// Index the stored messages in `uids`.
    ///
    /// Messages above `last_uid` keep their UID; the rest are renumbered
    /// above everything else, since appends must keep UIDs increasing.
    fn index_strays(&mut self, uids: BTreeSet<Uid>) -> Result<(), Error> {
        let mut last_uid = self.current_header().last_uid;
        let (keep, renumber): (Vec<Uid>, Vec<Uid>) =
            uids.into_iter().partition(|&uid| uid > last_uid);

        for uid in keep.into_iter().chain(renumber) {
            let new_uid = if uid > last_uid {
                uid
            } else {
                last_uid.next().ok_or(Error::MailboxFull)?
            };

            let data = match self.content.map_message(self.entry, uid)? {
                Some(data) => data,
                None => continue,
            };

            self.findings
                .push(Finding::UnindexedMessage { uid, new_uid });
            if self.repair {
                let record = ParsedMessage::parse(&data)?.to_record(new_uid);
                if new_uid != uid {
                    self.content.rename_message(self.entry, uid, new_uid)?;
                }
                self.store.append_record(record)?;
            }
            last_uid = new_uid;
        }

        Ok(())
    }

    fn recount(&mut self) -> Result<(), Error> {
        let before = self.current_header().clone();
        let mut after = self.store.recalculated_header()?;
        if !self.repair {
            after.uidvalidity = before.uidvalidity;
            after.highestmodseq = before.highestmodseq;
            after.deletedmodseq = before.deletedmodseq;
            after.last_uid = before.last_uid;
        }

        self.header_changes.extend(header_changes(&before, &after));
        if self.repair && after != before {
            self.store.update_header(move |h| *h = after)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::check::collab::{PartitionResolver, SpoolContentStore, ACL_FILE};
    use crate::index::codec::{HEADER_SIZE, RECORD_SIZE};
    use crate::index::lock::ProcessLocks;
    use crate::index::store::INDEX_FILE;
    use crate::support::system_config::SystemConfig;

    struct Fixture {
        _root: TempDir,
        resolver: PartitionResolver,
    }

    impl Fixture {
        fn new() -> Self {
            crate::init_test_log();

            let root = TempDir::new().unwrap();
            fs::create_dir(root.path().join("spool")).unwrap();
            let config: SystemConfig =
                toml::from_str("[partitions]\ndefault = \"spool\"\n").unwrap();
            let resolver = PartitionResolver::new(root.path(), &config);
            Fixture {
                _root: root,
                resolver,
            }
        }

        fn checker(&self) -> Checker {
            self.checker_with(Box::new(SpoolContentStore))
        }

        fn checker_with(&self, content: Box<dyn ContentStore>) -> Checker {
            Checker::new(
                Box::new(self.resolver.clone()),
                content,
                Arc::new(ProcessLocks::default()),
                "cyrus".to_owned(),
                LogPrefix::new("check".to_owned()),
            )
        }

        fn mailbox(&self, name: &str, uids: &[u32]) -> MailboxEntry {
            let entry = self.resolver.create(name, None, 42).unwrap();
            for &uid in uids {
                deliver(&entry, uid);
            }
            entry
        }
    }

    fn message_data(uid: u32) -> Vec<u8> {
        format!(
            "From: a@example.com\r\nSubject: {}\r\n\r\nbody of {}\r\n",
            uid, uid
        )
        .into_bytes()
    }

    fn deliver(entry: &MailboxEntry, uid: u32) {
        let data = message_data(uid);
        SpoolContentStore
            .store_message(entry, Uid(uid), &data)
            .unwrap();
        IndexStore::open(&entry.path, true)
            .unwrap()
            .append_record(
                ParsedMessage::parse(&data).unwrap().to_record(Uid(uid)),
            )
            .unwrap();
    }

    fn message_path(entry: &MailboxEntry, uid: u32) -> PathBuf {
        SpoolContentStore::message_path(entry, Uid(uid))
    }

    fn open(entry: &MailboxEntry) -> IndexStore {
        IndexStore::open(&entry.path, true).unwrap()
    }

    fn flip_index_byte(entry: &MailboxEntry, offset: u64) {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(entry.path.join(INDEX_FILE))
            .unwrap();
        let mut byte = [0u8];
        file.read_exact_at(&mut byte, offset).unwrap();
        byte[0] ^= 1;
        file.write_all_at(&byte, offset).unwrap();
    }

    fn assert_clean(checker: &Checker, name: &str) {
        let report = checker.reconstruct(name, true).unwrap();
        assert!(report.is_clean(), "not clean: {:?}", report);
    }

    #[test]
    fn clean_mailbox() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2, 3]);
        let checker = fixture.checker();
        let highest = open(&entry).header().highestmodseq;

        assert_clean(&checker, "m");
        let report = checker.reconstruct("m", false).unwrap();
        assert!(report.is_clean(), "not clean: {:?}", report);
        assert!(!report.dry_run);
        assert_eq!(highest, open(&entry).header().highestmodseq);
    }

    #[test]
    fn size_mismatch_reported_then_repaired() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2, 3]);
        let checker = fixture.checker();

        let mut data = message_data(2);
        data.extend_from_slice(b"more body\r\n");
        fs::write(message_path(&entry, 2), &data).unwrap();

        let before = open(&entry);
        let old = before.read_record(Recno(2)).unwrap();
        let highest = before.header().highestmodseq;
        drop(before);

        let report = checker.reconstruct("m", true).unwrap();
        assert_eq!(1, report.findings.len());
        assert_matches!(
            Finding::Mismatch {
                recno: Recno(2),
                uid: Uid(2),
                size: Some(_),
                header_size: None,
                guid: Some(_),
            },
            &report.findings[0]
        );
        assert!(report.header_changes.is_empty());
        assert_eq!(old, open(&entry).read_record(Recno(2)).unwrap());

        let report = checker.reconstruct("m", false).unwrap();
        assert_eq!(1, report.findings.len());
        // Recounting reflects the new size, which the rewrite already
        // accounted for
        assert!(report.header_changes.is_empty());

        let after = open(&entry);
        let fixed = after.read_record(Recno(2)).unwrap();
        assert_eq!(data.len() as u32, fixed.size);
        assert_eq!(Guid::of(&data), fixed.guid);
        assert!(fixed.modseq > highest);
        assert_eq!(fixed.modseq, after.header().highestmodseq);

        assert_clean(&checker, "m");
    }

    #[test]
    fn missing_message_marked_unlinked() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2, 3]);
        let checker = fixture.checker();
        fs::remove_file(message_path(&entry, 1)).unwrap();

        let report = checker.reconstruct("m", true).unwrap();
        assert_eq!(
            vec![Finding::MissingMessage {
                recno: Recno(1),
                uid: Uid(1),
            }],
            report.findings
        );

        checker.reconstruct("m", false).unwrap();
        let store = open(&entry);
        let record = store.read_record(Recno(1)).unwrap();
        assert!(record.is_expunged());
        assert!(record.is_unlinked());
        assert_eq!(2, store.header().exists);

        assert_clean(&checker, "m");
    }

    #[test]
    fn stray_messages_indexed() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 3]);
        let checker = fixture.checker();
        fs::write(message_path(&entry, 2), message_data(2)).unwrap();
        fs::write(message_path(&entry, 9), message_data(9)).unwrap();

        let report = checker.reconstruct("m", true).unwrap();
        assert_eq!(
            vec![
                Finding::UnindexedMessage {
                    uid: Uid(9),
                    new_uid: Uid(9),
                },
                Finding::UnindexedMessage {
                    uid: Uid(2),
                    new_uid: Uid(10),
                },
            ],
            report.findings
        );
        assert!(message_path(&entry, 2).is_file());

        checker.reconstruct("m", false).unwrap();
        let store = open(&entry);
        assert_eq!(4, store.num_records());
        assert_eq!(Uid(10), store.header().last_uid);
        assert_eq!(4, store.header().exists);
        assert_eq!(Uid(9), store.read_record(Recno(3)).unwrap().uid);
        let renumbered = store.read_record(Recno(4)).unwrap();
        assert_eq!(Uid(10), renumbered.uid);
        assert_eq!(Guid::of(&message_data(2)), renumbered.guid);
        assert!(!message_path(&entry, 2).exists());
        assert!(message_path(&entry, 10).is_file());

        assert_clean(&checker, "m");
    }

    #[test]
    fn corrupt_record_wiped_and_message_recovered() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2, 3]);
        let checker = fixture.checker();
        flip_index_byte(&entry, (HEADER_SIZE + RECORD_SIZE + 10) as u64);

        let report = checker.reconstruct("m", true).unwrap();
        assert_matches!(
            Finding::CorruptRecord {
                recno: Recno(2),
                ..
            },
            &report.findings[0]
        );
        assert_eq!(
            Finding::UnindexedMessage {
                uid: Uid(2),
                new_uid: Uid(4),
            },
            report.findings[1]
        );
        assert_eq!(2, report.findings.len());
        assert!(report.header_changes.iter().any(|c| "exists" == c.field));

        checker.reconstruct("m", false).unwrap();
        let store = open(&entry);
        let wiped = store.read_record(Recno(2)).unwrap();
        assert!(wiped.uid.is_none());
        assert!(wiped.is_unlinked());
        assert_eq!(Uid(4), store.read_record(Recno(4)).unwrap().uid);
        assert_eq!(3, store.header().exists);

        assert_clean(&checker, "m");
    }

    #[test]
    fn out_of_order_uid_wiped() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2, 3]);
        let checker = fixture.checker();
        {
            let mut store = open(&entry);
            let mut record = store.read_record(Recno(3)).unwrap();
            record.uid = Uid(2);
            store.rewrite_record(Recno(3), record).unwrap();
        }

        let report = checker.reconstruct("m", true).unwrap();
        assert_eq!(
            Finding::UidOutOfOrder {
                recno: Recno(3),
                uid: Uid(2),
            },
            report.findings[0]
        );
        assert_eq!(
            Finding::UnindexedMessage {
                uid: Uid(3),
                new_uid: Uid(4),
            },
            report.findings[1]
        );

        checker.reconstruct("m", false).unwrap();
        let store = open(&entry);
        assert!(store.read_record(Recno(3)).unwrap().uid.is_none());
        assert_eq!(Uid(4), store.read_record(Recno(4)).unwrap().uid);
        assert_clean(&checker, "m");
    }

    #[test]
    fn unnamed_user_flags_cleared() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1]);
        let checker = fixture.checker();
        {
            let mut store = open(&entry);
            let named = store.intern_user_flag("$Important").unwrap();
            let mut flags = UserFlags::default();
            flags.insert(named);
            flags.insert(named + 3);
            store
                .update_flags(Recno(1), SystemFlags::SEEN, flags)
                .unwrap();
        }

        let report = checker.reconstruct("m", true).unwrap();
        let mut unnamed = UserFlags::default();
        unnamed.insert(3);
        assert_eq!(
            vec![Finding::UnknownUserFlags {
                recno: Recno(1),
                uid: Uid(1),
                flags: unnamed,
            }],
            report.findings
        );

        checker.reconstruct("m", false).unwrap();
        let record = open(&entry).read_record(Recno(1)).unwrap();
        assert!(record.user_flags.contains(0));
        assert!(!record.user_flags.contains(3));
        assert_eq!(SystemFlags::SEEN, record.system_flags);
        assert_clean(&checker, "m");
    }

    #[test]
    fn header_fields_raised_and_fixed_up() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2]);
        let checker = fixture.checker();
        open(&entry)
            .update_header(|h| {
                h.uidvalidity = 0;
                h.highestmodseq = Modseq(1);
                h.last_uid = Uid(1);
            })
            .unwrap();

        let report = checker.reconstruct("m", true).unwrap();
        assert_eq!(2, report.findings.len());
        assert!(report
            .findings
            .iter()
            .all(|f| matches!(*f, Finding::FutureModseq { .. })));
        let fields = report
            .header_changes
            .iter()
            .map(|c| c.field)
            .collect::<Vec<_>>();
        assert_eq!(vec!["uidvalidity", "last_uid", "highestmodseq"], fields);

        checker.reconstruct("m", false).unwrap();
        let store = open(&entry);
        let header = store.header();
        assert_ne!(0, header.uidvalidity);
        assert_eq!(Uid(2), header.last_uid);
        assert_eq!(
            store.read_record(Recno(2)).unwrap().modseq,
            header.highestmodseq
        );
        assert_clean(&checker, "m");
    }

    #[test]
    fn damaged_header_rebuilt() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1, 2]);
        let checker = fixture.checker();
        // Low byte of `exists`
        flip_index_byte(&entry, 87);
        assert_matches!(
            Err(Error::HeaderCorrupt(Corruption::BadCrc { .. })),
            IndexStore::open(&entry.path, false).map(|_| ())
        );

        let report = checker.reconstruct("m", true).unwrap();
        assert_matches!(
            Finding::CorruptHeader(Corruption::BadCrc { .. }),
            &report.findings[0]
        );
        assert_eq!(
            vec![HeaderChange {
                field: "exists",
                old: 3,
                new: 2,
            }],
            report.header_changes
        );

        checker.reconstruct("m", false).unwrap();
        let store = IndexStore::open(&entry.path, false).unwrap();
        assert_eq!(2, store.header().exists);
        assert_eq!(2, store.num_records());
        assert_clean(&checker, "m");
    }

    #[test]
    fn rights_enforced() {
        let fixture = Fixture::new();
        let entry = fixture.mailbox("m", &[1]);
        let checker = fixture.checker();

        PartitionResolver::set_acl(&entry.path, "cyrus\tlr\t").unwrap();
        checker.reconstruct("m", true).unwrap();
        assert_matches!(
            Err(Error::PermissionDenied),
            checker.reconstruct("m", false)
        );

        PartitionResolver::set_acl(&entry.path, "cyrus\tr\t").unwrap();
        assert_matches!(Err(Error::NxMailbox), checker.reconstruct("m", true));
        assert_matches!(
            Err(Error::NxMailbox),
            checker.reconstruct("m", false)
        );

        PartitionResolver::set_acl(&entry.path, "anyone\tlra\t").unwrap();
        checker.reconstruct("m", false).unwrap();
    }

    #[test]
    fn batch_continues_past_failures() {
        let fixture = Fixture::new();
        fixture.mailbox("user.a", &[1]);
        let b = fixture.mailbox("user.b", &[1]);
        let c = fixture.mailbox("user.c", &[1, 2]);
        fixture.mailbox("shared", &[]);
        let checker = fixture.checker();

        PartitionResolver::set_acl(&b.path, "someone\tlra\t").unwrap();
        fs::remove_file(message_path(&c, 2)).unwrap();

        let batch = checker.check_all(&Selection::All, true).unwrap();
        assert!(!batch.is_clean());
        assert_eq!(
            vec!["shared", "user.a", "user.c"],
            batch
                .reports
                .iter()
                .map(|r| r.mailbox.as_str())
                .collect::<Vec<_>>()
        );
        assert!(!batch.reports[2].is_clean());
        assert_eq!(1, batch.failures.len());
        assert_eq!("user.b", batch.failures[0].0);
        assert_matches!(Error::NxMailbox, &batch.failures[0].1);

        let batch = checker
            .check_all(&Selection::Pattern("user.%".to_owned()), false)
            .unwrap();
        assert_eq!(2, batch.reports.len());
        assert_eq!(1, batch.failures.len());

        let batch = checker
            .check_all(&Selection::Pattern("user.%".to_owned()), true)
            .unwrap();
        assert!(batch.reports.iter().all(Report::is_clean));

        let batch = checker
            .check_all(&Selection::Mailbox("nonexistent".to_owned()), true)
            .unwrap();
        assert!(batch.reports.is_empty());
        assert_matches!(Error::NxMailbox, &batch.failures[0].1);

        assert_matches!(
            Err(Error::NxPartition),
            checker.check_all(&Selection::Partition("nope".to_owned()), true)
        );
    }

    #[test]
    fn unreadable_acl_fails_only_its_mailbox() {
        let fixture = Fixture::new();
        fixture.mailbox("a", &[1]);
        let b = fixture.mailbox("b", &[1]);
        fixture.mailbox("c", &[1]);
        let checker = fixture.checker();

        fs::create_dir(b.path.join(ACL_FILE)).unwrap();

        let batch = checker.check_all(&Selection::All, true).unwrap();
        assert_eq!(
            vec!["a", "c"],
            batch
                .reports
                .iter()
                .map(|r| r.mailbox.as_str())
                .collect::<Vec<_>>()
        );
        assert!(batch.reports.iter().all(Report::is_clean));
        assert_eq!(1, batch.failures.len());
        assert_eq!("b", batch.failures[0].0);
        assert_matches!(Error::LookupFailed(..), &batch.failures[0].1);
    }

    struct BrokenStorage;

    impl ContentStore for BrokenStorage {
        fn map_message(
            &self,
            _: &MailboxEntry,
            _: Uid,
        ) -> Result<Option<Vec<u8>>, Error> {
            Err(Error::Io(io::Error::new(io::ErrorKind::Other, "EIO")))
        }

        fn list_uids(&self, mailbox: &MailboxEntry) -> Result<Vec<Uid>, Error> {
            SpoolContentStore.list_uids(mailbox)
        }

        fn store_message(
            &self,
            _: &MailboxEntry,
            _: Uid,
            _: &[u8],
        ) -> Result<(), Error> {
            Err(Error::MailboxReadOnly)
        }

        fn rename_message(
            &self,
            _: &MailboxEntry,
            _: Uid,
            _: Uid,
        ) -> Result<(), Error> {
            Err(Error::MailboxReadOnly)
        }
    }

    #[test]
    fn storage_fault_aborts_batch() {
        let fixture = Fixture::new();
        fixture.mailbox("a", &[1]);
        fixture.mailbox("b", &[1]);
        let checker = fixture.checker_with(Box::new(BrokenStorage));

        assert_matches!(
            Err(Error::Io(..)),
            checker.check_all(&Selection::All, true)
        );
    }
}
