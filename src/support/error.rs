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

use std::io;

use thiserror::Error;

use crate::index::codec::Corruption;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox or flag name")]
    UnsafeName,
    #[error("Index header corrupt: {0}")]
    HeaderCorrupt(Corruption),
    #[error("Index record {recno} corrupt: {reason}")]
    CorruptRecord { recno: u32, reason: Corruption },
    #[error("Sync token does not belong to this mailbox state")]
    InvalidToken,
    #[error("Sync token predates the purge horizon")]
    TokenTooOld,
    #[error("Result limit too small to return any change")]
    LimitTooSmall,
    #[error("Lock is held by another holder")]
    WouldBlock,
    #[error("Unable to acquire lock: {0}")]
    LockFailed(String),
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Unable to look up mailbox: {0}")]
    LookupFailed(String),
    #[error("No such partition")]
    NxPartition,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Record number out of range")]
    OutOfRange,
    #[error("Record is expunged")]
    ExpungedMessage,
    #[error("Mailbox index is not open for writing")]
    MailboxReadOnly,
    #[error("UID not greater than the mailbox's last UID")]
    UidNotIncreasing,
    #[error("Expunged records cannot be restored")]
    Unexpunge,
    #[error("Too many distinct user flags")]
    FlagTableFull,
    #[error("Modseq space exhausted")]
    MailboxFull,
    #[error("Message too large to index")]
    MessageTooLarge,
    #[error("Invalid sync token syntax")]
    BadToken,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether the client holding a token must discard it and start over
    /// with an initial sync.
    pub fn requires_resync(&self) -> bool {
        matches!(
            *self,
            Error::InvalidToken | Error::TokenTooOld | Error::BadToken
        )
    }

    /// Whether this error signals a fault of the underlying storage rather
    /// than of one mailbox's data.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Io(..) | Error::Nix(..))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resync_classification() {
        assert!(Error::InvalidToken.requires_resync());
        assert!(Error::TokenTooOld.requires_resync());
        assert!(!Error::LimitTooSmall.requires_resync());
        assert!(!Error::WouldBlock.requires_resync());
    }

    #[test]
    fn fatal_classification() {
        let io = io::Error::new(io::ErrorKind::Other, "x");
        assert!(Error::Io(io).is_fatal());
        assert!(!Error::NxMailbox.is_fatal());
        assert!(!Error::PermissionDenied.is_fatal());
        assert!(!Error::LookupFailed("cyrus.acl".to_owned()).is_fatal());
        assert!(!Error::LockFailed("busy".to_owned()).is_fatal());
    }
}
