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

//! Shared/exclusive locking of mailbox indices.
//!
//! Any number of shared holders may coexist; an exclusive holder excludes
//! everyone else. There are no upgrades: a holder wanting exclusive access
//! releases and reacquires. Locks are released when their `LockGuard` is
//! dropped.
//!
//! Two backends implement `Locker`. `ProcessLocks` keeps a table in memory
//! and only coordinates threads of one process. `FileLocks` takes `flock(2)`
//! locks on a `cyrus.lock` file in the mailbox directory and so coordinates
//! with every other process working on the same spool.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use log::warn;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::support::error::Error;
use crate::support::system_config::{LockBackend, LockingConfig};

pub const LOCK_FILE: &str = "cyrus.lock";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lock backend.
///
/// `name` identifies the mailbox; `dir` is its directory, which backends
/// that need an on-disk presence use.
pub trait Locker: Send + Sync {
    /// Acquire a lock, blocking as long as necessary.
    fn lock(
        &self,
        name: &str,
        dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error>;

    /// Acquire a lock if that is possible without blocking, and fail with
    /// `Error::WouldBlock` otherwise.
    fn try_lock(
        &self,
        name: &str,
        dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error>;

    fn acquire_shared(
        &self,
        name: &str,
        dir: &Path,
    ) -> Result<LockGuard, Error> {
        self.lock(name, dir, LockMode::Shared)
    }

    fn acquire_exclusive(
        &self,
        name: &str,
        dir: &Path,
    ) -> Result<LockGuard, Error> {
        self.lock(name, dir, LockMode::Exclusive)
    }
}

/// Instantiate the backend selected by `config`.
pub fn locker_for(config: &LockingConfig) -> Arc<dyn Locker> {
    match config.backend {
        LockBackend::File => Arc::new(FileLocks),
        LockBackend::Process => Arc::new(ProcessLocks::default()),
    }
}

/// A held lock. Dropping it releases the lock.
pub struct LockGuard {
    mode: LockMode,
    release: Release,
}

enum Release {
    Process {
        table: Arc<LockTable>,
        name: String,
    },
    // flock locks go away when the descriptor is closed; the explicit unlock
    // just makes it independent of any descriptor sharing.
    File(fs::File),
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LockGuard({:?})", self.mode)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.release {
            Release::Process {
                ref table,
                ref name,
            } => table.release(name, self.mode),
            Release::File(ref file) => {
                if let Err(e) = flock(file.as_raw_fd(), FlockArg::Unlock) {
                    warn!("Failed to release lock: {}", e);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl LockState {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && 0 == self.readers,
        }
    }

    fn take(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.readers += 1,
            LockMode::Exclusive => self.writer = true,
        }
    }
}

#[derive(Default)]
struct LockTable {
    states: Mutex<HashMap<String, LockState>>,
    changed: Condvar,
}

impl LockTable {
    fn acquire(&self, name: &str, mode: LockMode, block: bool) -> bool {
        let mut states = self.states.lock().unwrap();
        loop {
            let state = states.entry(name.to_owned()).or_default();
            if state.admits(mode) {
                state.take(mode);
                return true;
            }

            if !block {
                return false;
            }

            states = self.changed.wait(states).unwrap();
        }
    }

    fn release(&self, name: &str, mode: LockMode) {
        let mut states = self.states.lock().unwrap();
        let idle = match states.get_mut(name) {
            None => return,
            Some(state) => {
                match mode {
                    LockMode::Shared => {
                        state.readers = state.readers.saturating_sub(1)
                    }
                    LockMode::Exclusive => state.writer = false,
                }
                !state.writer && 0 == state.readers
            }
        };

        if idle {
            states.remove(name);
        }
        drop(states);
        self.changed.notify_all();
    }
}

/// Locks coordinating the threads of this process only.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct ProcessLocks {
    table: Arc<LockTable>,
}

impl ProcessLocks {
    fn guard(&self, name: &str, mode: LockMode) -> LockGuard {
        LockGuard {
            mode,
            release: Release::Process {
                table: Arc::clone(&self.table),
                name: name.to_owned(),
            },
        }
    }
}

impl Locker for ProcessLocks {
    fn lock(
        &self,
        name: &str,
        _dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error> {
        self.table.acquire(name, mode, true);
        Ok(self.guard(name, mode))
    }

    fn try_lock(
        &self,
        name: &str,
        _dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error> {
        if self.table.acquire(name, mode, false) {
            Ok(self.guard(name, mode))
        } else {
            Err(Error::WouldBlock)
        }
    }
}

/// `flock(2)`-based locks on `<dir>/cyrus.lock`.
///
/// Every acquisition opens its own descriptor, so two holders in the same
/// process exclude each other exactly as two processes would.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileLocks;

impl FileLocks {
    fn acquire(
        &self,
        dir: &Path,
        mode: LockMode,
        block: bool,
    ) -> Result<LockGuard, Error> {
        let path = dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NxMailbox,
                _ => Error::LockFailed(format!("{}: {}", path.display(), e)),
            })?;

        let arg = match (mode, block) {
            (LockMode::Shared, true) => FlockArg::LockShared,
            (LockMode::Shared, false) => FlockArg::LockSharedNonblock,
            (LockMode::Exclusive, true) => FlockArg::LockExclusive,
            (LockMode::Exclusive, false) => FlockArg::LockExclusiveNonblock,
        };

        loop {
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => break,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(nix::Error::Sys(Errno::EAGAIN)) => {
                    return Err(Error::WouldBlock)
                }
                Err(e) => {
                    return Err(Error::LockFailed(format!(
                        "flock({}): {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Ok(LockGuard {
            mode,
            release: Release::File(file),
        })
    }
}

impl Locker for FileLocks {
    fn lock(
        &self,
        _name: &str,
        dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error> {
        self.acquire(dir, mode, true)
    }

    fn try_lock(
        &self,
        _name: &str,
        dir: &Path,
        mode: LockMode,
    ) -> Result<LockGuard, Error> {
        self.acquire(dir, mode, false)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn backends(dir: &Path) -> Vec<Arc<dyn Locker>> {
        fs::create_dir_all(dir).unwrap();
        vec![Arc::new(ProcessLocks::default()), Arc::new(FileLocks)]
    }

    #[test]
    fn shared_holders_coexist() {
        let root = TempDir::new().unwrap();
        for locker in backends(root.path()) {
            let a = locker.acquire_shared("mbox", root.path()).unwrap();
            let b = locker
                .try_lock("mbox", root.path(), LockMode::Shared)
                .unwrap();
            assert_eq!(LockMode::Shared, a.mode());
            assert_eq!(LockMode::Shared, b.mode());

            assert_matches!(
                Err(Error::WouldBlock),
                locker.try_lock("mbox", root.path(), LockMode::Exclusive)
            );

            drop(a);
            assert_matches!(
                Err(Error::WouldBlock),
                locker.try_lock("mbox", root.path(), LockMode::Exclusive)
            );
            drop(b);

            locker
                .try_lock("mbox", root.path(), LockMode::Exclusive)
                .unwrap();
        }
    }

    #[test]
    fn exclusive_excludes_everyone() {
        let root = TempDir::new().unwrap();
        for locker in backends(root.path()) {
            let x = locker.acquire_exclusive("mbox", root.path()).unwrap();
            assert_matches!(
                Err(Error::WouldBlock),
                locker.try_lock("mbox", root.path(), LockMode::Shared)
            );
            assert_matches!(
                Err(Error::WouldBlock),
                locker.try_lock("mbox", root.path(), LockMode::Exclusive)
            );
            drop(x);

            let s = locker.acquire_shared("mbox", root.path()).unwrap();
            drop(s);
        }
    }

    #[test]
    fn process_locks_are_per_mailbox() {
        let locks = ProcessLocks::default();
        let dir = Path::new("/nonexistent");
        let _a = locks.acquire_exclusive("a", dir).unwrap();
        let _b = locks.try_lock("b", dir, LockMode::Exclusive).unwrap();
        assert_matches!(
            Err(Error::WouldBlock),
            locks.try_lock("a", dir, LockMode::Shared)
        );
    }

    #[test]
    fn file_lock_on_missing_mailbox() {
        let root = TempDir::new().unwrap();
        assert_matches!(
            Err(Error::NxMailbox),
            FileLocks.acquire_shared("x", &root.path().join("x"))
        );
    }

    #[test]
    fn blocked_writer_proceeds_after_readers_leave() {
        let root = TempDir::new().unwrap();
        for locker in backends(root.path()) {
            let reader = locker.acquire_shared("mbox", root.path()).unwrap();
            let entered = Arc::new(AtomicU32::new(0));
            let barrier = Arc::new(Barrier::new(2));

            let writer = {
                let locker = Arc::clone(&locker);
                let entered = Arc::clone(&entered);
                let barrier = Arc::clone(&barrier);
                let dir = root.path().to_owned();
                thread::spawn(move || {
                    barrier.wait();
                    let _x = locker.acquire_exclusive("mbox", &dir).unwrap();
                    entered.store(1, Ordering::SeqCst);
                })
            };

            barrier.wait();
            thread::sleep(Duration::from_millis(50));
            assert_eq!(0, entered.load(Ordering::SeqCst));
            drop(reader);
            writer.join().unwrap();
            assert_eq!(1, entered.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn exclusive_holders_serialise() {
        let root = TempDir::new().unwrap();
        for locker in backends(root.path()) {
            let inside = Arc::new(AtomicU32::new(0));
            let threads = (0..4)
                .map(|_| {
                    let locker = Arc::clone(&locker);
                    let inside = Arc::clone(&inside);
                    let dir = root.path().to_owned();
                    thread::spawn(move || {
                        for _ in 0..20 {
                            let _x =
                                locker.acquire_exclusive("mbox", &dir).unwrap();
                            let others = inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(0, others);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().unwrap();
            }
        }
    }
}
