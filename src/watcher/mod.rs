//! Directory watching.
//!
//! A [`DirectoryWatcher`] turns raw OS change notifications into a filtered,
//! reconciled stream of [`WatcherEvent`]s and dispatches them, in arrival
//! order, to the handler registered for each [`EventKind`]. The blocking
//! [`DirectoryWatcher::watch`] loop runs on a dedicated thread and is woken up
//! by [`DirectoryWatcher::stop`] from any other thread.

#[cfg(target_os = "linux")]
pub mod inotify;
pub mod portable;
pub mod reconcile;

#[cfg(target_os = "linux")]
pub use inotify::InotifyWatcher;
pub use portable::PortableWatcher;
pub use reconcile::{ChangeMask, EventReconciler, RawChangeRecord, Reconciled, WatchHandle};

use crate::error::WatcherError;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of a reconciled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Deleted,
    Changed,
    Moved,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "Created",
            EventKind::Deleted => "Deleted",
            EventKind::Changed => "Changed",
            EventKind::Moved => "Moved",
        };
        f.write_str(name)
    }
}

/// A change observed inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub directory: PathBuf,
    pub name: String,
    /// Previous name, only set for [`EventKind::Moved`].
    pub old_name: Option<String>,
    pub kind: EventKind,
    pub is_dir: bool,
}

impl WatcherEvent {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

impl fmt::Display for WatcherEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File {}", self.kind)?;
        writeln!(f, "Name: {}", self.name)?;
        if let Some(old_name) = &self.old_name {
            writeln!(f, "Old Name: {}", old_name)?;
        }
        writeln!(f, "Is Dir: {}", self.is_dir)?;
        write!(f, "Dir: {}", self.directory.display())
    }
}

pub type EventCallback = Box<dyn Fn(&WatcherEvent) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Handlers shared by every backend.
#[derive(Default)]
pub struct Callbacks {
    handlers: HashMap<EventKind, EventCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    /// Registers `callback` for `kind`, replacing any previous handler.
    pub fn register(&mut self, kind: EventKind, callback: EventCallback) {
        if self.handlers.insert(kind, callback).is_some() {
            debug!("Replaced {} handler", kind);
        }
    }

    pub fn register_error(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub(crate) fn error(&self, message: &str) {
        if let Some(callback) = &self.on_error {
            callback(message);
        }
    }

    /// Dispatches every queued event in FIFO order.
    pub(crate) fn dispatch(&self, queue: &mut VecDeque<WatcherEvent>) {
        while let Some(event) = queue.pop_front() {
            if let Some(handler) = self.handlers.get(&event.kind) {
                handler(&event);
            }
        }
    }
}

/// Capability interface implemented by each notification backend.
///
/// Registration and [`init`](DirectoryWatcher::init) happen before the watcher
/// is shared; everything else takes `&self` and may be called from any thread
/// while [`watch`](DirectoryWatcher::watch) is running.
pub trait DirectoryWatcher: Send + Sync {
    /// Allocates the notification channel, multiplexer and cancellation channel.
    fn init(&mut self) -> Result<(), WatcherError>;

    /// Blocks the calling thread until [`stop`](DirectoryWatcher::stop) is
    /// called or the watch is invalidated.
    fn watch(&self);

    /// Idempotent. Wakes a blocked [`watch`](DirectoryWatcher::watch) once.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    fn add_directory(&self, path: &Path) -> Result<(), WatcherError>;

    fn remove_directory(&self, path: &Path);

    fn callbacks_mut(&mut self) -> &mut Callbacks;

    fn register_callback(&mut self, kind: EventKind, callback: EventCallback) {
        self.callbacks_mut().register(kind, callback);
    }

    fn register_error_callback(&mut self, callback: ErrorCallback) {
        self.callbacks_mut().register_error(callback);
    }
}

/// Which notification mechanism backs a [`DirectoryWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatcherBackend {
    /// inotify on Linux, the portable backend elsewhere.
    #[default]
    Auto,
    Inotify,
    Portable,
}

/// Creates an uninitialised watcher for the requested backend.
pub fn create_directory_watcher(
    backend: WatcherBackend,
) -> Result<Box<dyn DirectoryWatcher>, WatcherError> {
    match backend {
        WatcherBackend::Auto | WatcherBackend::Inotify => native_watcher(backend),
        WatcherBackend::Portable => Ok(Box::new(PortableWatcher::new())),
    }
}

#[cfg(target_os = "linux")]
fn native_watcher(_backend: WatcherBackend) -> Result<Box<dyn DirectoryWatcher>, WatcherError> {
    Ok(Box::new(InotifyWatcher::new()))
}

#[cfg(not(target_os = "linux"))]
fn native_watcher(backend: WatcherBackend) -> Result<Box<dyn DirectoryWatcher>, WatcherError> {
    match backend {
        WatcherBackend::Inotify => Err(WatcherError::Unsupported("inotify")),
        _ => Ok(Box::new(PortableWatcher::new())),
    }
}

/// Fails unless `path` exists and is a directory.
pub(crate) fn check_directory(path: &Path) -> Result<(), WatcherError> {
    if !path.exists() {
        return Err(WatcherError::MissingPath(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(WatcherError::NotADirectory(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: EventKind, name: &str) -> WatcherEvent {
        WatcherEvent {
            directory: PathBuf::from("/tmp/shaders"),
            name: name.to_string(),
            old_name: None,
            kind,
            is_dir: false,
        }
    }

    #[test]
    fn dispatch_drains_queue_in_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut callbacks = Callbacks::default();
        for kind in [EventKind::Created, EventKind::Changed] {
            let seen = seen.clone();
            callbacks.register(
                kind,
                Box::new(move |ev: &WatcherEvent| seen.lock().push(ev.name.clone())),
            );
        }

        let mut queue: VecDeque<_> = [
            event(EventKind::Created, "a"),
            event(EventKind::Deleted, "b"),
            event(EventKind::Changed, "c"),
        ]
        .into_iter()
        .collect();
        callbacks.dispatch(&mut queue);

        assert!(queue.is_empty());
        assert_eq!(*seen.lock(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn last_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut callbacks = Callbacks::default();
        let counter = first.clone();
        callbacks.register(
            EventKind::Changed,
            Box::new(move |_: &WatcherEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = second.clone();
        callbacks.register(
            EventKind::Changed,
            Box::new(move |_: &WatcherEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut queue = VecDeque::from([event(EventKind::Changed, "main.glsl")]);
        callbacks.dispatch(&mut queue);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn moved_event_display_includes_old_name() {
        let mut ev = event(EventKind::Moved, "main.glsl");
        ev.old_name = Some("main.glsl.tmp".into());
        let text = ev.to_string();
        assert!(text.starts_with("File Moved"));
        assert!(text.contains("Old Name: main.glsl.tmp"));
    }

    #[test]
    fn check_directory_rejects_files_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.glsl");
        std::fs::write(&file, "void main() {}").unwrap();

        assert!(check_directory(dir.path()).is_ok());
        assert!(matches!(
            check_directory(&file),
            Err(WatcherError::NotADirectory(_))
        ));
        assert!(matches!(
            check_directory(&dir.path().join("missing")),
            Err(WatcherError::MissingPath(_))
        ));
    }
}
