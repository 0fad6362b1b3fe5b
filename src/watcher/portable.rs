//! Cross-platform backend on top of the `notify` crate.
//!
//! notify events are translated into [`RawChangeRecord`]s and run through the
//! same [`EventReconciler`] as the inotify backend. Cancellation travels on the
//! channel that carries the notifications.

use super::reconcile::{ChangeMask, EventReconciler, RawChangeRecord, Reconciled, WatchHandle};
use super::{Callbacks, DirectoryWatcher, WatcherEvent, check_directory};
use crate::error::WatcherError;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, info, warn};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

enum Message {
    Notify(notify::Result<Event>),
    Stop,
}

pub struct PortableWatcher {
    callbacks: Callbacks,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    directories: Mutex<HashMap<WatchHandle, PathBuf>>,
    reconciler: Mutex<EventReconciler>,
    stopped: Mutex<bool>,
    next_handle: AtomicI32,
    next_cookie: AtomicU32,
}

impl Default for PortableWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PortableWatcher {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            callbacks: Callbacks::default(),
            sender,
            receiver,
            watcher: Mutex::new(None),
            directories: Mutex::new(HashMap::new()),
            reconciler: Mutex::new(EventReconciler::new()),
            stopped: Mutex::new(false),
            next_handle: AtomicI32::new(1),
            // Synthetic cookies live in the upper half so they never collide with trackers.
            next_cookie: AtomicU32::new(1 << 31),
        }
    }

    fn fresh_cookie(&self) -> u32 {
        self.next_cookie.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_of_directory(&self, directory: &Path) -> Option<WatchHandle> {
        self.directories
            .lock()
            .iter()
            .find(|(_, dir)| dir.as_path() == directory)
            .map(|(handle, _)| *handle)
    }

    /// Converts one notify event into raw records, in emission order.
    pub(crate) fn translate(&self, event: &Event) -> Vec<RawChangeRecord> {
        let mut records = Vec::new();
        let tracker = event.attrs.tracker().map(|t| t as u32);

        let mut push = |path: &Path, mask: ChangeMask, cookie: u32| {
            if let Some(handle) = self.handle_of_directory(path) {
                // The watched directory itself went away.
                if mask.intersects(ChangeMask::DELETE) {
                    records.push(RawChangeRecord {
                        handle,
                        mask: ChangeMask::IGNORED,
                        cookie: 0,
                        name: String::new(),
                    });
                }
                return;
            }

            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return;
            };
            let Some(handle) = self.handle_of_directory(parent) else {
                return;
            };
            records.push(RawChangeRecord {
                handle,
                mask,
                cookie,
                name: name.to_string_lossy().into_owned(),
            });
        };

        match event.kind {
            EventKind::Create(kind) => {
                let mut mask = ChangeMask::CREATE;
                if kind == CreateKind::Folder {
                    mask = mask | ChangeMask::ISDIR;
                }
                for path in &event.paths {
                    push(path, mask, 0);
                }
            }
            EventKind::Remove(kind) => {
                let mut mask = ChangeMask::DELETE;
                if kind == RemoveKind::Folder {
                    mask = mask | ChangeMask::ISDIR;
                }
                for path in &event.paths {
                    push(path, mask, 0);
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in &event.paths {
                    push(path, ChangeMask::CLOSE_WRITE, 0);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                let cookie = tracker.unwrap_or_else(|| self.fresh_cookie());
                for path in &event.paths {
                    push(path, ChangeMask::MOVED_FROM, cookie);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let cookie = tracker.unwrap_or_else(|| self.fresh_cookie());
                for path in &event.paths {
                    push(path, ChangeMask::MOVED_TO, cookie);
                }
            }
            // Backends that report both halves with a tracker also emit this summary.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if tracker.is_none() => {
                if let [from, to] = event.paths.as_slice() {
                    let cookie = self.fresh_cookie();
                    push(from, ChangeMask::MOVED_FROM, cookie);
                    push(to, ChangeMask::MOVED_TO, cookie);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
                for path in &event.paths {
                    let mask = if path.exists() {
                        ChangeMask::CREATE
                    } else {
                        ChangeMask::DELETE
                    };
                    push(path, mask, 0);
                }
            }
            // Close-write is reported separately where the platform has it.
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) if !cfg!(target_os = "linux") => {
                for path in &event.paths {
                    push(path, ChangeMask::CLOSE_WRITE, 0);
                }
            }
            _ => {}
        }

        records
    }

    fn process(&self, event: &Event, queue: &mut VecDeque<WatcherEvent>) {
        for raw in self.translate(event) {
            let directory = self.directories.lock().get(&raw.handle).cloned();
            let Some(directory) = directory else {
                continue;
            };

            match self.reconciler.lock().process(&directory, &raw) {
                Reconciled::Event(event) => queue.push_back(event),
                Reconciled::Dropped => {}
                Reconciled::Invalidated => {
                    self.directories.lock().remove(&raw.handle);
                    *self.stopped.lock() = true;
                    self.callbacks.error(&format!(
                        "Directory {} was removed; stopping directory monitoring",
                        directory.display()
                    ));
                }
            }
        }
    }
}

impl DirectoryWatcher for PortableWatcher {
    fn init(&mut self) -> Result<(), WatcherError> {
        let mut slot = self.watcher.lock();
        if slot.is_none() {
            let sender = self.sender.clone();
            let watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = sender.send(Message::Notify(res));
                },
                Config::default(),
            )?;
            *slot = Some(watcher);
            debug!("notify watcher initialised");
        }
        Ok(())
    }

    fn watch(&self) {
        let mut queue = VecDeque::new();

        while !self.is_stopped() {
            let Ok(first) = self.receiver.recv() else {
                break;
            };

            let mut cancelled = false;
            for message in std::iter::once(first).chain(self.receiver.try_iter()) {
                match message {
                    Message::Stop => {
                        cancelled = true;
                        break;
                    }
                    Message::Notify(Ok(event)) => self.process(&event, &mut queue),
                    Message::Notify(Err(err)) => {
                        self.callbacks.error(&format!("notify error: {}", err));
                    }
                }
            }

            self.reconciler.lock().finish_batch();
            self.callbacks.dispatch(&mut queue);
            if cancelled {
                break;
            }
        }

        *self.stopped.lock() = true;
        debug!("notify watch loop exited");
    }

    fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            *stopped = true;
            let _ = self.sender.send(Message::Stop);
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    fn add_directory(&self, path: &Path) -> Result<(), WatcherError> {
        check_directory(path)?;
        let mut slot = self.watcher.lock();
        let watcher = slot.as_mut().ok_or(WatcherError::NotInitialized)?;

        // notify reports canonical paths on some platforms.
        let path = path.canonicalize().map_err(|source| WatcherError::AddWatch {
            path: path.to_path_buf(),
            source,
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.directories.lock().insert(handle, path.clone());
        info!("Watching: {}", path.display());
        Ok(())
    }

    fn remove_directory(&self, path: &Path) {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let Some(handle) = self.handle_of_directory(&path) else {
            return;
        };
        self.directories.lock().remove(&handle);

        if let Some(watcher) = self.watcher.lock().as_mut() {
            if let Err(err) = watcher.unwatch(&path) {
                warn!("Failed to remove watch for {}: {}", path.display(), err);
            }
        }
    }

    fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::EventAttributes;

    fn watcher_on(dir: &Path) -> PortableWatcher {
        let mut watcher = PortableWatcher::new();
        watcher.init().unwrap();
        watcher.add_directory(dir).unwrap();
        watcher
    }

    fn event(kind: EventKind, paths: Vec<PathBuf>, tracker: Option<usize>) -> Event {
        let mut attrs = EventAttributes::new();
        if let Some(tracker) = tracker {
            attrs.set_tracker(tracker);
        }
        Event { kind, paths, attrs }
    }

    #[test]
    fn rename_halves_reconcile_into_move() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_on(dir.path());
        let root = dir.path().canonicalize().unwrap();

        let mut queue = VecDeque::new();
        watcher.process(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                vec![root.join("a.glsl")],
                Some(3),
            ),
            &mut queue,
        );
        watcher.process(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                vec![root.join("main.glsl")],
                Some(3),
            ),
            &mut queue,
        );
        watcher.process(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                vec![root.join("a.glsl"), root.join("main.glsl")],
                Some(3),
            ),
            &mut queue,
        );

        assert_eq!(queue.len(), 1);
        let ev = &queue[0];
        assert_eq!(ev.kind, super::super::EventKind::Moved);
        assert_eq!(ev.old_name.as_deref(), Some("a.glsl"));
        assert_eq!(ev.name, "main.glsl");
    }

    #[test]
    fn untracked_both_rename_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_on(dir.path());
        let root = dir.path().canonicalize().unwrap();

        let records = watcher.translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![root.join("a.glsl"), root.join("b.glsl")],
            None,
        ));
        assert_eq!(records.len(), 2);
        assert!(records[0].mask.intersects(ChangeMask::MOVED_FROM));
        assert!(records[1].mask.intersects(ChangeMask::MOVED_TO));
        assert_eq!(records[0].cookie, records[1].cookie);
    }

    #[test]
    fn removing_watched_directory_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = watcher_on(dir.path());
        let root = dir.path().canonicalize().unwrap();

        let mut queue = VecDeque::new();
        watcher.process(
            &event(EventKind::Remove(RemoveKind::Folder), vec![root], None),
            &mut queue,
        );
        assert!(queue.is_empty());
        assert!(watcher.is_stopped());
    }

    #[test]
    fn events_outside_watched_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let watcher = watcher_on(dir.path());

        let records = watcher.translate(&event(
            EventKind::Create(CreateKind::File),
            vec![other.path().join("main.glsl")],
            None,
        ));
        assert!(records.is_empty());
    }

    #[test]
    fn stop_wakes_blocked_watch() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = std::sync::Arc::new(watcher_on(dir.path()));

        let thread = {
            let watcher = watcher.clone();
            std::thread::spawn(move || watcher.watch())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        watcher.stop();
        watcher.stop();
        thread.join().unwrap();
        assert!(watcher.is_stopped());
    }
}
