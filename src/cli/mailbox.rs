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
use std::io::{self, Read};
use std::mem;
use std::path::Path;
use std::sync::Arc;

use log::info;

use super::main::{
    AppendSubcommand, ChangesSubcommand, Context, CreateSubcommand,
    MailboxSubcommand,
};
use crate::check::collab::{
    ContentStore, MailboxEntry, MailboxResolver, ParsedMessage, Rights,
    SpoolContentStore,
};
use crate::index::changes::{self, ChangeKind};
use crate::index::flag_names::FlagNames;
use crate::index::handles::IndexHandles;
use crate::index::model::*;
use crate::index::store::{self, IndexStore};
use crate::support::error::Error;
use crate::support::sysexits::*;

pub(super) fn create(context: Context, cmd: CreateSubcommand) {
    let uidvalidity = cmd.uidvalidity.unwrap_or_else(store::now);
    match context.resolver.create(
        &cmd.mailbox,
        cmd.partition.as_deref(),
        uidvalidity,
    ) {
        Ok(entry) => {
            info!(
                "create: {} on partition {} at {}",
                entry.name,
                entry.partition,
                entry.path.display()
            );
            println!("{}", entry.path.display());
        }
        Err(e) => die!(Sysexit::for_error(&e), "{}: {}", cmd.mailbox, e),
    }
}

pub(super) fn append(context: Context, mut cmd: AppendSubcommand) {
    let entry = open_mailbox(&context, &cmd.mailbox, Rights::INSERT);
    let mut handles = IndexHandles::new(Arc::clone(&context.locker));

    for input in mem::take(&mut cmd.inputs) {
        let data = match read_input(&input) {
            Ok(data) => data,
            Err(e) => die!(EX_NOINPUT, "{}: {}", input.display(), e),
        };

        match handles.with_exclusive_lock(&entry.name, &entry.path, |store| {
            append_one(store, &entry, &cmd.flag, &data)
        }) {
            Ok(uid) => {
                info!("append: {} UID {}", entry.name, uid);
                println!("{}: UID {}", input.display(), uid);
            }
            Err(e) => {
                die!(Sysexit::for_error(&e), "{}: {}", input.display(), e)
            }
        }
    }
}

fn read_input(input: &Path) -> io::Result<Vec<u8>> {
    if Path::new("-") == input {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;
        Ok(data)
    } else {
        fs::read(input)
    }
}

fn append_one(
    store: &mut IndexStore,
    entry: &MailboxEntry,
    flags: &[Flag],
    data: &[u8],
) -> Result<Uid, Error> {
    let uid = store.header().last_uid.next().ok_or(Error::MailboxFull)?;
    let mut record = ParsedMessage::parse(data)?.to_record(uid);
    for flag in flags {
        match flag.system_flag() {
            Some(system_flag) => record.system_flags |= system_flag,
            None => {
                let id = store.intern_user_flag(&flag.to_string())?;
                record.user_flags.insert(id);
            }
        }
    }

    // The message goes to disk before its record; reconstruct indexes
    // orphaned messages but cannot restore missing ones.
    SpoolContentStore.store_message(entry, uid, data)?;
    store.append_record(record)?;
    Ok(uid)
}

pub(super) fn dump(context: Context, cmd: MailboxSubcommand) {
    let entry = open_mailbox(&context, &cmd.mailbox, Rights::READ);
    let mut handles = IndexHandles::new(Arc::clone(&context.locker));

    if let Err(e) =
        handles.with_shared_lock(&entry.name, &entry.path, |store| {
            dump_store(store);
            Ok(())
        })
    {
        die!(Sysexit::for_error(&e), "{}: {}", entry.name, e);
    }
}

fn dump_store(store: &IndexStore) {
    let h = store.header();
    println!("uidvalidity:        {}", h.uidvalidity);
    println!("last uid:           {}", h.last_uid);
    println!("highest modseq:     {}", h.highestmodseq);
    println!("deleted modseq:     {}", h.deletedmodseq);
    println!("records:            {}", h.num_records);
    println!("exists:             {}", h.exists);
    println!("answered:           {}", h.answered);
    println!("flagged:            {}", h.flagged);
    println!("deleted:            {}", h.deleted);
    println!("quota used:         {}", h.quota_mailbox_used);
    println!("sync crc:           {:08x}", h.sync_crc);
    println!("options:            {:x}", h.options);
    println!();

    for (recno, record) in store.records() {
        match record {
            Ok(r) => println!(
                "{:>6} uid={} modseq={} size={} guid={} flags=({})",
                recno,
                r.uid,
                r.modseq,
                r.size,
                r.guid,
                format_flags(store.flag_names(), &r)
            ),
            Err(e) => println!("{:>6} {}", recno, e),
        }
    }
}

fn format_flags(names: &FlagNames, record: &IndexRecord) -> String {
    const SYSTEM: &[(SystemFlags, &str)] = &[
        (SystemFlags::ANSWERED, "\\Answered"),
        (SystemFlags::DELETED, "\\Deleted"),
        (SystemFlags::DRAFT, "\\Draft"),
        (SystemFlags::FLAGGED, "\\Flagged"),
        (SystemFlags::SEEN, "\\Seen"),
        (SystemFlags::EXPUNGED, "EXPUNGED"),
        (SystemFlags::UNLINKED, "UNLINKED"),
    ];

    let mut flags = SYSTEM
        .iter()
        .filter(|&&(bit, _)| record.system_flags.contains(bit))
        .map(|&(_, name)| name.to_owned())
        .collect::<Vec<_>>();
    flags.extend(record.user_flags.iter().map(|id| {
        names
            .name_of(id)
            .map_or_else(|| format!("#{}", id), str::to_owned)
    }));
    flags.join(" ")
}

pub(super) fn changes(context: Context, cmd: ChangesSubcommand) {
    let token = match cmd.token.as_ref().map(|t| t.parse::<SyncToken>()) {
        None => None,
        Some(Ok(token)) => Some(token),
        Some(Err(e)) => {
            die!(EX_USAGE, "{}: {}", cmd.token.as_deref().unwrap_or(""), e)
        }
    };

    let entry = open_mailbox(&context, &cmd.mailbox, Rights::READ);
    let mut handles = IndexHandles::new(Arc::clone(&context.locker));

    let result = handles.with_shared_lock(&entry.name, &entry.path, |store| {
        changes::stream_changes(store, token.as_ref(), cmd.limit, |change| {
            let kind = match change.kind {
                ChangeKind::Changed => "changed",
                ChangeKind::Removed => "removed",
            };
            println!(
                "{} uid={} modseq={}",
                kind, change.record.uid, change.record.modseq
            );
        })
    });

    match result {
        Ok(summary) => {
            for recno in &summary.corrupt {
                eprintln!("{}: record {} is corrupt", entry.name, recno);
            }
            println!("token {}", summary.token.to_uri());
            if summary.truncated {
                println!("truncated");
            }
        }
        Err(e) if e.requires_resync() => die!(
            EX_DATAERR,
            "{}: {}; discard the token and sync from scratch",
            entry.name,
            e
        ),
        Err(e) => die!(Sysexit::for_error(&e), "{}: {}", entry.name, e),
    }
}

/// Look up `name`, exiting unless the configured user has `needed` on it.
fn open_mailbox(context: &Context, name: &str, needed: Rights) -> MailboxEntry {
    let user = &context.config.check.user;
    let entry = match context.resolver.lookup(name, user) {
        Ok(entry) => entry,
        Err(e) => die!(Sysexit::for_error(&e), "{}: {}", name, e),
    };

    if !entry.rights.contains(Rights::LOOKUP) {
        die!(EX_NOINPUT, "{}: {}", name, Error::NxMailbox);
    }
    if !entry.rights.contains(needed) {
        die!(EX_NOPERM, "{}: {}", name, Error::PermissionDenied);
    }

    entry
}
