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

//! Incremental synchronisation: "what changed since token X".
//!
//! A client holds a `SyncToken`, the `(uidvalidity, modseq)` high-water mark
//! of the last state it saw. The changes since then are exactly the records
//! whose modseq exceeds the token's; live ones are reported as changed and
//! expunged ones as removed. A client without a token, or with a token of
//! modseq 0, is doing an initial sync and is only told about live records.
//!
//! Expunged records whose modseq is at or below the mailbox's purge horizon
//! (`deletedmodseq`) may already have been wiped, so a token older than the
//! horizon can't be answered incrementally and the client must start over.

use std::cmp;

use log::warn;

use super::model::*;
use super::store::IndexStore;
use crate::support::error::Error;

/// The user flag marking a record superseded by a newer copy of the same
/// resource (the result of a PUT, COPY or MOVE over it). Superseded records
/// are never reported; the replacement is.
pub const SUPERSEDED_FLAG: &str = "DAV:unbind";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub recno: Recno,
    pub kind: ChangeKind,
    pub record: IndexRecord,
}

#[derive(Clone, Debug)]
pub struct ChangeSet {
    /// The changes, in record order.
    pub changes: Vec<Change>,
    /// The token the client should present next time.
    pub token: SyncToken,
    /// Whether more changes remain beyond `token`.
    pub truncated: bool,
    /// Records that could not be read and so were not considered.
    pub corrupt: Vec<Recno>,
}

/// The outcome of `stream_changes`: a `ChangeSet` without the changes.
#[derive(Clone, Debug)]
pub struct ChangeSummary {
    pub emitted: usize,
    pub token: SyncToken,
    pub truncated: bool,
    pub corrupt: Vec<Recno>,
}

/// Check that `token` can be answered incrementally from `header`.
pub fn validate_token(
    header: &IndexHeader,
    token: &SyncToken,
) -> Result<(), Error> {
    if token.uidvalidity != header.uidvalidity
        || token.modseq > header.highestmodseq
    {
        Err(Error::InvalidToken)
    } else if token.modseq < header.deletedmodseq {
        Err(Error::TokenTooOld)
    } else {
        Ok(())
    }
}

/// Compute the changes to `store` since `token`.
///
/// The caller must hold at least a shared lock on the mailbox. If `limit` is
/// given and more changes than that are pending, the earliest changes (by
/// modseq) are returned, plus any others sharing the modseq of the last one
/// so that the returned token never splits a modseq. The returned token is
/// never below `deletedmodseq`, so a batch may also run past `limit` up to
/// the purge horizon. A limit of 0 with changes pending fails with
/// `LimitTooSmall`.
pub fn compute_changes(
    store: &IndexStore,
    token: Option<&SyncToken>,
    limit: Option<usize>,
) -> Result<ChangeSet, Error> {
    let mut changes = Vec::new();
    let summary = stream_changes(store, token, limit, |c| changes.push(c))?;
    Ok(ChangeSet {
        changes,
        token: summary.token,
        truncated: summary.truncated,
        corrupt: summary.corrupt,
    })
}

/// Like `compute_changes`, but passes each change to `emit` instead of
/// collecting them.
pub fn stream_changes(
    store: &IndexStore,
    token: Option<&SyncToken>,
    limit: Option<usize>,
    mut emit: impl FnMut(Change),
) -> Result<ChangeSummary, Error> {
    let header = store.header();
    let token = token.filter(|t| Modseq(0) != t.modseq);
    if let Some(token) = token {
        validate_token(header, token)?;
    }

    let since = token.map_or(Modseq(0), |t| t.modseq);
    let superseded = store.flag_names().id_of(SUPERSEDED_FLAG);

    let mut selected = Vec::new();
    let mut corrupt = Vec::new();
    for (recno, record) in store.records() {
        let record = match record {
            Ok(record) => record,
            Err(e @ Error::CorruptRecord { .. }) => {
                warn!("{}: skipping {}", store.dir().display(), e);
                corrupt.push(recno);
                continue;
            }
            Err(e) => return Err(e),
        };

        if record.modseq <= since
            // Wiped slot; nothing a client could know it by
            || record.uid.is_none()
            || superseded.map_or(false, |id| record.user_flags.contains(id))
            || (token.is_none() && record.is_expunged())
        {
            continue;
        }

        selected.push((recno, record));
    }

    let mut new_modseq = header.highestmodseq;
    let mut truncated = false;
    match limit {
        Some(0) if !selected.is_empty() => return Err(Error::LimitTooSmall),
        Some(limit) if selected.len() > limit => {
            selected.sort_by_key(|&(recno, ref record)| (record.modseq, recno));
            // The token must be presentable again, so it can't fall below
            // the purge horizon
            let boundary =
                cmp::max(selected[limit - 1].1.modseq, header.deletedmodseq);
            let cut = selected
                .iter()
                .take_while(|&&(_, ref record)| record.modseq <= boundary)
                .count();

            if cut < selected.len() {
                truncated = true;
                new_modseq = boundary;
                selected.truncate(cut);
            }
            selected.sort_by_key(|&(recno, _)| recno);
        }
        _ => (),
    }

    let emitted = selected.len();
    for (recno, record) in selected {
        let kind = if record.is_expunged() {
            ChangeKind::Removed
        } else {
            ChangeKind::Changed
        };
        emit(Change {
            recno,
            kind,
            record,
        });
    }

    Ok(ChangeSummary {
        emitted,
        token: SyncToken {
            uidvalidity: header.uidvalidity,
            modseq: new_modseq,
        },
        truncated,
        corrupt,
    })
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::index::codec;
    use crate::index::store::INDEX_FILE;

    fn record(uid: u32, modseq: u64) -> IndexRecord {
        IndexRecord {
            uid: Uid(uid),
            modseq: Modseq(modseq),
            size: 10,
            ..IndexRecord::default()
        }
    }

    /// Write an index with exactly the given contents, bypassing the
    /// store's own modseq assignment.
    fn write_index(dir: &Path, header: IndexHeader, records: &[IndexRecord]) {
        let mut header = header;
        header.num_records = records.len() as u32;
        header.last_uid =
            records.iter().map(|r| r.uid).max().unwrap_or(Uid::NONE);
        for r in records {
            header.count_in(r);
        }

        let mut data = codec::encode_header(&header).to_vec();
        for r in records {
            data.extend_from_slice(&codec::encode_record(r));
        }
        fs::write(dir.join(INDEX_FILE), data).unwrap();
    }

    fn header(uidvalidity: u32, highest: u64, deleted: u64) -> IndexHeader {
        IndexHeader {
            highestmodseq: Modseq(highest),
            deletedmodseq: Modseq(deleted),
            ..IndexHeader::new(uidvalidity)
        }
    }

    fn token(uidvalidity: u32, modseq: u64) -> SyncToken {
        SyncToken {
            uidvalidity,
            modseq: Modseq(modseq),
        }
    }

    fn uids(changes: &[Change]) -> Vec<u32> {
        changes.iter().map(|c| c.record.uid.0).collect()
    }

    #[test]
    fn token_validation() {
        let h = header(5, 100, 50);
        assert_matches!(
            Err(Error::TokenTooOld),
            validate_token(&h, &token(5, 40))
        );
        assert_matches!(
            Err(Error::InvalidToken),
            validate_token(&h, &token(6, 60))
        );
        assert_matches!(
            Err(Error::InvalidToken),
            validate_token(&h, &token(5, 101))
        );
        validate_token(&h, &token(5, 50)).unwrap();
        validate_token(&h, &token(5, 100)).unwrap();

        let root = TempDir::new().unwrap();
        write_index(root.path(), h, &[record(1, 60)]);
        let store = IndexStore::open(root.path(), false).unwrap();
        let err = compute_changes(&store, Some(&token(5, 40)), None)
            .unwrap_err();
        assert!(err.requires_resync());
    }

    #[test]
    fn truncation_extends_over_boundary_ties() {
        let root = TempDir::new().unwrap();
        write_index(
            root.path(),
            header(5, 100, 50),
            &[
                record(1, 60),
                record(2, 95),
                record(3, 92),
                record(4, 91),
                record(5, 93),
                record(6, 92),
            ],
        );
        let store = IndexStore::open(root.path(), false).unwrap();

        let set =
            compute_changes(&store, Some(&token(5, 90)), Some(2)).unwrap();
        assert!(set.truncated);
        assert_eq!(token(5, 92), set.token);
        // Emitted in record order
        assert_eq!(vec![3, 4, 6], uids(&set.changes));

        let set = compute_changes(&store, Some(&set.token), Some(2)).unwrap();
        assert!(!set.truncated);
        assert_eq!(token(5, 100), set.token);
        assert_eq!(vec![2, 5], uids(&set.changes));

        let set = compute_changes(&store, Some(&set.token), Some(2)).unwrap();
        assert!(!set.truncated);
        assert!(set.changes.is_empty());
        assert_eq!(token(5, 100), set.token);
    }

    #[test]
    fn limit_zero() {
        let root = TempDir::new().unwrap();
        write_index(root.path(), header(5, 100, 50), &[record(1, 60)]);
        let store = IndexStore::open(root.path(), false).unwrap();

        assert_matches!(
            Err(Error::LimitTooSmall),
            compute_changes(&store, None, Some(0)).map(|s| s.changes)
        );

        let set =
            compute_changes(&store, Some(&token(5, 60)), Some(0)).unwrap();
        assert!(set.changes.is_empty());
        assert!(!set.truncated);
    }

    #[test]
    fn limit_covering_a_single_tie_group_is_not_truncated() {
        let root = TempDir::new().unwrap();
        write_index(
            root.path(),
            header(5, 70, 0),
            &[record(1, 70), record(2, 70), record(3, 70)],
        );
        let store = IndexStore::open(root.path(), false).unwrap();

        let set = compute_changes(&store, None, Some(1)).unwrap();
        assert!(!set.truncated);
        assert_eq!(vec![1, 2, 3], uids(&set.changes));
        assert_eq!(token(5, 70), set.token);
    }

    #[test]
    fn initial_and_incremental_selection() {
        let root = TempDir::new().unwrap();
        let mut expunged = record(2, 30);
        expunged.system_flags = SystemFlags::EXPUNGED;
        let mut superseded = record(3, 40);
        superseded.user_flags.insert(1);
        let mut wiped = record(0, 45);
        wiped.system_flags = SystemFlags::EXPUNGED | SystemFlags::UNLINKED;

        write_index(
            root.path(),
            header(5, 50, 0),
            &[record(1, 20), expunged, superseded, wiped, record(5, 50)],
        );
        fs::write(root.path().join("cyrus.flags"), "$Junk\nDAV:unbind\n")
            .unwrap();
        let store = IndexStore::open(root.path(), false).unwrap();

        let set = compute_changes(&store, None, None).unwrap();
        assert_eq!(vec![1, 5], uids(&set.changes));
        assert!(set.changes.iter().all(|c| ChangeKind::Changed == c.kind));
        assert_eq!(token(5, 50), set.token);

        let set = compute_changes(&store, Some(&token(5, 10)), None).unwrap();
        assert_eq!(vec![1, 2, 5], uids(&set.changes));
        assert_eq!(ChangeKind::Removed, set.changes[1].kind);
        assert_eq!(Recno(2), set.changes[1].recno);

        let set = compute_changes(&store, Some(&token(5, 20)), None).unwrap();
        assert_eq!(vec![2, 5], uids(&set.changes));
    }

    #[test]
    fn zero_token_is_an_initial_sync() {
        let root = TempDir::new().unwrap();
        let mut expunged = record(2, 30);
        expunged.system_flags = SystemFlags::EXPUNGED;
        write_index(
            root.path(),
            header(5, 50, 0),
            &[record(1, 20), expunged.clone()],
        );
        let store = IndexStore::open(root.path(), false).unwrap();

        let set = compute_changes(&store, Some(&token(5, 0)), None).unwrap();
        assert_eq!(vec![1], uids(&set.changes));
        assert_eq!(ChangeKind::Changed, set.changes[0].kind);
        assert_eq!(token(5, 50), set.token);

        // Past the purge horizon too, and whatever the uidvalidity
        write_index(
            root.path(),
            header(5, 50, 40),
            &[record(1, 20), expunged],
        );
        let store = IndexStore::open(root.path(), false).unwrap();
        let set = compute_changes(&store, Some(&token(5, 0)), None).unwrap();
        assert_eq!(vec![1], uids(&set.changes));
        let set = compute_changes(&store, Some(&token(6, 0)), None).unwrap();
        assert_eq!(vec![1], uids(&set.changes));
    }

    #[test]
    fn truncated_sync_after_purge_resumes() {
        let root = TempDir::new().unwrap();
        IndexStore::create(root.path(), 9).unwrap();
        let mut store = IndexStore::open(root.path(), true).unwrap();
        for uid in 1..=6 {
            store.append_record(record(uid, 0)).unwrap();
        }
        store.expunge(|r| Uid(2) == r.uid).unwrap();
        let horizon = store.header().highestmodseq;
        store.purge_expunged(horizon).unwrap();
        for uid in 7..=8 {
            store.append_record(record(uid, 0)).unwrap();
        }

        let set = compute_changes(&store, None, Some(2)).unwrap();
        assert!(set.truncated);
        assert_eq!(token(9, horizon.0), set.token);
        assert_eq!(vec![1, 3, 4, 5, 6], uids(&set.changes));
        validate_token(store.header(), &set.token).unwrap();

        let set = compute_changes(&store, Some(&set.token), Some(2)).unwrap();
        assert!(!set.truncated);
        assert_eq!(vec![7, 8], uids(&set.changes));
        assert_eq!(store.header().highestmodseq, set.token.modseq);
    }

    #[test]
    fn corrupt_records_reported_not_trusted() {
        let root = TempDir::new().unwrap();
        write_index(
            root.path(),
            header(5, 50, 0),
            &[record(1, 20), record(2, 30), record(3, 40)],
        );
        let path = root.path().join(INDEX_FILE);
        let mut data = fs::read(&path).unwrap();
        data[codec::HEADER_SIZE + codec::RECORD_SIZE + 5] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let store = IndexStore::open(root.path(), false).unwrap();
        let set = compute_changes(&store, None, None).unwrap();
        assert_eq!(vec![1, 3], uids(&set.changes));
        assert_eq!(vec![Recno(2)], set.corrupt);

        let mut streamed = Vec::new();
        let summary =
            stream_changes(&store, None, Some(1), |c| streamed.push(c))
                .unwrap();
        assert_eq!(1, summary.emitted);
        assert!(summary.truncated);
        assert_eq!(token(5, 20), summary.token);
        assert_eq!(vec![1], uids(&streamed));
        assert_eq!(vec![Recno(2)], summary.corrupt);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Append,
        Flag(u32),
        Expunge(u32),
        Purge,
        Sync(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Append),
            3 => any::<u32>().prop_map(Op::Flag),
            2 => any::<u32>().prop_map(Op::Expunge),
            1 => Just(Op::Purge),
            3 => (1..4usize).prop_map(Op::Sync),
        ]
    }

    /// What a client knows: uid -> flags.
    #[derive(Default)]
    struct Replica {
        token: Option<SyncToken>,
        messages: BTreeMap<u32, SystemFlags>,
    }

    impl Replica {
        /// Run one sync round, returning whether more is pending.
        fn sync(&mut self, store: &IndexStore, limit: usize) -> bool {
            let set =
                match compute_changes(store, self.token.as_ref(), Some(limit))
                {
                    Ok(set) => set,
                    Err(e) if e.requires_resync() => {
                        self.token = None;
                        self.messages.clear();
                        compute_changes(store, None, Some(limit)).unwrap()
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                };

            for change in set.changes {
                match change.kind {
                    ChangeKind::Changed => {
                        self.messages.insert(
                            change.record.uid.0,
                            change.record.system_flags,
                        );
                    }
                    ChangeKind::Removed => {
                        self.messages.remove(&change.record.uid.0);
                    }
                }
            }
            self.token = Some(set.token);
            set.truncated
        }
    }

    fn live(store: &IndexStore) -> BTreeMap<u32, SystemFlags> {
        store
            .records()
            .map(|(_, r)| r.unwrap())
            .filter(|r| !r.is_expunged() && !r.uid.is_none())
            .map(|r| (r.uid.0, r.system_flags))
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replica_converges(ops in prop::collection::vec(arb_op(), 1..60)) {
            let root = TempDir::new().unwrap();
            IndexStore::create(root.path(), 9).unwrap();
            let mut store = IndexStore::open(root.path(), true).unwrap();
            let mut replica = Replica::default();
            let mut next_uid = 0;

            for op in ops {
                let n = store.num_records();
                match op {
                    Op::Append => {
                        next_uid += 1;
                        store.append_record(record(next_uid, 0)).unwrap();
                    }
                    Op::Flag(_) | Op::Expunge(_) if 0 == n => (),
                    Op::Flag(r) => {
                        let recno = Recno(r % n + 1);
                        let rec = store.read_record(recno).unwrap();
                        if !rec.is_expunged() {
                            let flags = SystemFlags::from_bits_truncate(r)
                                - SystemFlags::EXPUNGED
                                - SystemFlags::UNLINKED;
                            store
                                .update_flags(recno, flags, rec.user_flags)
                                .unwrap();
                        }
                    }
                    Op::Expunge(r) => {
                        let uid = store.read_record(Recno(r % n + 1))
                            .unwrap()
                            .uid;
                        store.expunge(|rec| rec.uid == uid).unwrap();
                    }
                    Op::Purge => {
                        let highest = store.header().highestmodseq;
                        store.purge_expunged(highest).unwrap();
                    }
                    Op::Sync(limit) => {
                        replica.sync(&store, limit);
                    }
                }
            }

            let mut rounds = 0;
            while replica.sync(&store, 2) {
                rounds += 1;
                prop_assert!(rounds < 1000);
            }
            prop_assert_eq!(live(&store), replica.messages);
        }
    }
}
