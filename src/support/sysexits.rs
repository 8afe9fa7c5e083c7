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

//! Constants from `sysexits.h`
//!
//! The command-line tools exit with these so that they compose with the
//! sendmail-era conventions other mail tooling expects.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_OK: Sysexit = Sysexit(0);
pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// The exit code a tool should use when an operation fails with `err`.
    pub fn for_error(err: &Error) -> Self {
        match *err {
            Error::UnsafeName
            | Error::BadToken
            | Error::OutOfRange
            | Error::UidNotIncreasing
            | Error::Unexpunge
            | Error::ExpungedMessage
            | Error::LimitTooSmall => EX_USAGE,

            Error::HeaderCorrupt(..)
            | Error::CorruptRecord { .. }
            | Error::InvalidToken
            | Error::TokenTooOld => EX_DATAERR,

            Error::NxMailbox | Error::NxPartition | Error::LookupFailed(..) => {
                EX_NOINPUT
            }
            Error::MailboxExists => EX_CANTCREAT,
            Error::PermissionDenied => EX_NOPERM,
            Error::WouldBlock | Error::LockFailed(..) => EX_TEMPFAIL,
            Error::MailboxReadOnly => EX_SOFTWARE,
            Error::FlagTableFull | Error::MailboxFull => EX_CANTCREAT,
            Error::MessageTooLarge => EX_DATAERR,
            Error::Io(..) => EX_IOERR,
            Error::Nix(..) => EX_OSERR,
        }
    }
}
