// Filesystem-change notification, abstracted behind a small capability so
// the segment buffer depends on a trait rather than a concrete OS backend.
// Backed by `notify`'s recommended (OS-native) watcher in production; an
// in-memory fake drives the same trait in tests.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    ClosedWrite,
}

#[derive(Debug, Clone)]
pub struct FsChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

pub trait FilesystemWatcher: Send + Sync {
    /// Block until the next filesystem change is observed, the watcher is
    /// stopped, or `timeout` elapses (all three return `None` on timeout,
    /// letting callers interleave periodic health checks).
    fn recv_timeout(&self, timeout: Duration) -> Option<FsChange>;
}

/// `notify`-backed watcher over a single directory, non-recursive.
pub struct NotifyWatcher {
    _watcher: notify::RecommendedWatcher,
    rx: Mutex<Receiver<FsChange>>,
}

impl NotifyWatcher {
    pub fn watch(dir: &Path) -> Result<Self, notify::Error> {
        let (tx, rx) = channel::<FsChange>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let kind = match event.kind {
                    notify::EventKind::Create(_) => ChangeKind::Created,
                    notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                        ChangeKind::ClosedWrite
                    }
                    notify::EventKind::Modify(_) => ChangeKind::ClosedWrite,
                    _ => return,
                };
                for path in event.paths {
                    let _ = tx.send(FsChange {
                        path,
                        kind,
                    });
                }
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            rx: Mutex::new(rx),
        })
    }
}

impl FilesystemWatcher for NotifyWatcher {
    fn recv_timeout(&self, timeout: Duration) -> Option<FsChange> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}

/// Deterministic in-memory watcher for tests: `push` queues a change that a
/// later `recv` call returns; `close` makes `recv` return `None`.
pub struct FakeWatcher {
    tx: Sender<FsChange>,
    rx: Mutex<Receiver<FsChange>>,
}

impl FakeWatcher {
    pub fn new() -> (Self, FakeWatcherHandle) {
        let (tx, rx) = channel();
        let handle = FakeWatcherHandle { tx: tx.clone() };
        (Self { tx, rx: Mutex::new(rx) }, handle)
    }
}

#[derive(Clone)]
pub struct FakeWatcherHandle {
    tx: Sender<FsChange>,
}

impl FakeWatcherHandle {
    pub fn push(&self, path: PathBuf, kind: ChangeKind) {
        let _ = self.tx.send(FsChange { path, kind });
    }
}

impl FilesystemWatcher for FakeWatcher {
    fn recv_timeout(&self, timeout: Duration) -> Option<FsChange> {
        self.rx.lock().unwrap().recv_timeout(timeout).ok()
    }
}
