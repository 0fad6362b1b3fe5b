#![cfg(target_os = "linux")]

mod common;

use common::{RED, TIMEOUT, init_logging, wait_until};
use crossbeam_channel::{Receiver, unbounded};
use shader_sandbox::watcher::{
    DirectoryWatcher, EventKind, WatcherBackend, WatcherEvent, create_directory_watcher,
};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Running {
    watcher: Arc<dyn DirectoryWatcher>,
    thread: JoinHandle<()>,
    events: Receiver<WatcherEvent>,
    errors: Receiver<String>,
}

fn start(backend: WatcherBackend, dir: &Path) -> Running {
    let mut watcher = create_directory_watcher(backend).unwrap();

    let (event_tx, events) = unbounded();
    for kind in [
        EventKind::Created,
        EventKind::Deleted,
        EventKind::Changed,
        EventKind::Moved,
    ] {
        let event_tx = event_tx.clone();
        watcher.register_callback(
            kind,
            Box::new(move |event: &WatcherEvent| {
                let _ = event_tx.send(event.clone());
            }),
        );
    }

    let (error_tx, errors) = unbounded();
    watcher.register_error_callback(Box::new(move |message: &str| {
        let _ = error_tx.send(message.to_string());
    }));

    watcher.init().unwrap();
    watcher.add_directory(dir).unwrap();

    let watcher: Arc<dyn DirectoryWatcher> = Arc::from(watcher);
    let thread = {
        let watcher = watcher.clone();
        std::thread::spawn(move || watcher.watch())
    };

    Running {
        watcher,
        thread,
        events,
        errors,
    }
}

/// Receives events until one of `kind` named `name` arrives.
fn collect_until(events: &Receiver<WatcherEvent>, kind: EventKind, name: &str) -> Vec<WatcherEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(TIMEOUT)
            .unwrap_or_else(|_| panic!("no {kind} event for {name}; saw {seen:?}"));
        let done = event.kind == kind && event.name == name;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[test]
fn inotify_reports_reconciled_events_in_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let running = start(WatcherBackend::Inotify, dir.path());

    std::fs::write(dir.path().join("main.glsl"), RED).unwrap();
    std::fs::rename(dir.path().join("main.glsl"), dir.path().join("other.glsl")).unwrap();
    std::fs::write(dir.path().join(".main.glsl.swp"), "swap").unwrap();
    std::fs::write(dir.path().join("main.glsl~"), "backup").unwrap();
    std::fs::remove_file(dir.path().join("other.glsl")).unwrap();

    let seen: Vec<_> = collect_until(&running.events, EventKind::Deleted, "other.glsl")
        .into_iter()
        .map(|event| (event.kind, event.name, event.old_name))
        .collect();

    assert_eq!(
        seen,
        vec![
            (EventKind::Created, "main.glsl".to_string(), None),
            (EventKind::Changed, "main.glsl".to_string(), None),
            (
                EventKind::Moved,
                "other.glsl".to_string(),
                Some("main.glsl".to_string())
            ),
            (EventKind::Deleted, "other.glsl".to_string(), None),
        ]
    );

    running.watcher.stop();
    running.thread.join().unwrap();
    assert!(running.errors.try_recv().is_err());
}

#[test]
fn stop_wakes_an_idle_watch() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    for backend in [WatcherBackend::Inotify, WatcherBackend::Portable] {
        let running = start(backend, dir.path());
        std::thread::sleep(Duration::from_millis(50));

        running.watcher.stop();
        running.watcher.stop();
        assert!(wait_until(TIMEOUT, || running.thread.is_finished()));
        running.thread.join().unwrap();
        assert!(running.watcher.is_stopped());
    }
}

#[test]
fn deleting_the_watched_directory_stops_the_watch() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let watched = root.path().join("shaders");
    std::fs::create_dir(&watched).unwrap();
    let running = start(WatcherBackend::Inotify, &watched);

    std::fs::remove_dir_all(&watched).unwrap();

    let message = running.errors.recv_timeout(TIMEOUT).unwrap();
    assert!(message.contains("IN_IGNORED"), "unexpected error: {message}");
    assert!(wait_until(TIMEOUT, || running.thread.is_finished()));
    running.thread.join().unwrap();
    assert!(running.watcher.is_stopped());
}

#[test]
fn portable_backend_reports_close_write() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let running = start(WatcherBackend::Portable, dir.path());

    std::fs::write(dir.path().join("main.glsl"), RED).unwrap();
    let seen = collect_until(&running.events, EventKind::Changed, "main.glsl");
    assert!(seen.iter().all(|event| event.name == "main.glsl"));

    running.watcher.stop();
    running.thread.join().unwrap();
}

#[test]
fn removed_directory_is_no_longer_reported() {
    init_logging();
    let watched = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let running = start(WatcherBackend::Inotify, watched.path());
    running.watcher.add_directory(other.path()).unwrap();
    running.watcher.remove_directory(watched.path());

    std::fs::write(watched.path().join("ignored.glsl"), RED).unwrap();
    std::fs::write(other.path().join("seen.glsl"), RED).unwrap();

    let seen = collect_until(&running.events, EventKind::Changed, "seen.glsl");
    assert!(seen.iter().all(|event| event.name == "seen.glsl"));
    assert!(!running.watcher.is_stopped());

    running.watcher.stop();
    running.thread.join().unwrap();
    assert!(running.errors.try_recv().is_err());
}
