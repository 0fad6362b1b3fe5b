//! inotify + epoll backend with self-pipe cancellation.

use super::reconcile::{ChangeMask, EventReconciler, RawChangeRecord, Reconciled, WatchHandle};
use super::{Callbacks, DirectoryWatcher, check_directory};
use crate::error::WatcherError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const NOTIFY_TOKEN: u64 = 0;
const STOP_TOKEN: u64 = 1;

const EVENT_HEADER: usize = size_of::<libc::inotify_event>();
const NAME_MAX: usize = 255;
const BUFFER_LEN: usize = 16 * (EVENT_HEADER + NAME_MAX + 1);

#[repr(C, align(8))]
struct EventBuffer([u8; BUFFER_LEN]);

enum Wakeup {
    Readable,
    Cancelled,
    Interrupted,
}

/// Descriptors allocated by `init()`. Dropping closes all of them.
struct Channel {
    inotify: OwnedFd,
    epoll: OwnedFd,
    stop_read: OwnedFd,
    stop_write: OwnedFd,
}

impl Channel {
    fn open() -> Result<Self, WatcherError> {
        // SAFETY: plain syscalls; every returned descriptor is checked and owned immediately.
        let inotify = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if inotify == -1 {
            return Err(WatcherError::last_os("inotify_init1"));
        }
        let inotify = unsafe { OwnedFd::from_raw_fd(inotify) };

        let mut pipe = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == -1 {
            return Err(WatcherError::last_os("pipe2"));
        }
        let (stop_read, stop_write) =
            unsafe { (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1])) };

        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll == -1 {
            return Err(WatcherError::last_os("epoll_create1"));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let channel = Self {
            inotify,
            epoll,
            stop_read,
            stop_write,
        };
        channel.register(channel.inotify.as_raw_fd(), NOTIFY_TOKEN)?;
        channel.register(channel.stop_read.as_raw_fd(), STOP_TOKEN)?;
        Ok(channel)
    }

    fn register(&self, fd: libc::c_int, token: u64) -> Result<(), WatcherError> {
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: token,
        };
        let res =
            unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if res == -1 {
            return Err(WatcherError::last_os("epoll_ctl"));
        }
        Ok(())
    }

    fn wait(&self) -> io::Result<Wakeup> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                -1,
            )
        };
        if count == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wakeup::Interrupted);
            }
            return Err(err);
        }

        let cancelled = events[..count as usize].iter().any(|event| {
            let token = event.u64;
            token == STOP_TOKEN
        });
        Ok(if cancelled {
            Wakeup::Cancelled
        } else {
            Wakeup::Readable
        })
    }

    fn read(&self, buffer: &mut EventBuffer) -> io::Result<usize> {
        let len = unsafe {
            libc::read(
                self.inotify.as_raw_fd(),
                buffer.0.as_mut_ptr().cast(),
                buffer.0.len(),
            )
        };
        if len == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }

    fn signal_stop(&self) {
        let signal = [1u8, 0];
        let res = unsafe {
            libc::write(
                self.stop_write.as_raw_fd(),
                signal.as_ptr().cast(),
                signal.len(),
            )
        };
        if res == -1 {
            warn!(
                "Failed to signal watcher stop pipe: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Splits a buffer filled by `read(2)` on an inotify descriptor into records.
pub fn parse_records(bytes: &[u8]) -> Vec<RawChangeRecord> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset + EVENT_HEADER <= bytes.len() {
        // SAFETY: the range holds a full header; read_unaligned has no alignment requirement.
        let header: libc::inotify_event =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset).cast()) };

        let name_start = offset + EVENT_HEADER;
        let name_end = (name_start + header.len as usize).min(bytes.len());
        let padded = &bytes[name_start..name_end];
        let name_len = padded.iter().position(|b| *b == 0).unwrap_or(padded.len());

        records.push(RawChangeRecord {
            handle: WatchHandle(header.wd),
            mask: ChangeMask::from_bits(header.mask),
            cookie: header.cookie,
            name: String::from_utf8_lossy(&padded[..name_len]).into_owned(),
        });

        offset = name_start + header.len as usize;
    }

    records
}

/// Linux watcher built on inotify, multiplexed with a stop pipe through epoll.
pub struct InotifyWatcher {
    callbacks: Callbacks,
    channel: Option<Channel>,
    watches: Mutex<HashMap<WatchHandle, PathBuf>>,
    reconciler: Mutex<EventReconciler>,
    stopped: Mutex<bool>,
}

impl Default for InotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InotifyWatcher {
    pub fn new() -> Self {
        Self {
            callbacks: Callbacks::default(),
            channel: None,
            watches: Mutex::new(HashMap::new()),
            reconciler: Mutex::new(EventReconciler::new()),
            stopped: Mutex::new(false),
        }
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.watches.lock().values().cloned().collect()
    }

    fn mark_stopped(&self) {
        *self.stopped.lock() = true;
    }

    /// Reads until the descriptor would block; edge-triggered epoll will not
    /// report data that was left behind.
    fn drain(
        &self,
        channel: &Channel,
        buffer: &mut EventBuffer,
        queue: &mut VecDeque<super::WatcherEvent>,
    ) {
        loop {
            let len = match channel.read(buffer) {
                Ok(0) => break,
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.callbacks
                        .error(&format!("Failed to read inotify events: {}", err));
                    break;
                }
            };

            for raw in parse_records(&buffer.0[..len]) {
                self.handle_record(&raw, queue);
            }
        }
        self.reconciler.lock().finish_batch();
    }

    fn handle_record(&self, raw: &RawChangeRecord, queue: &mut VecDeque<super::WatcherEvent>) {
        if raw.mask.intersects(ChangeMask::Q_OVERFLOW) {
            self.callbacks
                .error("inotify event queue overflowed; some changes were lost");
            return;
        }

        let directory = self.watches.lock().get(&raw.handle).cloned();
        let Some(directory) = directory else {
            // Watches removed through remove_directory still deliver IN_IGNORED.
            return;
        };

        match self.reconciler.lock().process(&directory, raw) {
            Reconciled::Event(event) => queue.push_back(event),
            Reconciled::Dropped => {}
            Reconciled::Invalidated => {
                self.watches.lock().remove(&raw.handle);
                self.mark_stopped();
                self.callbacks.error(&format!(
                    "Directory {} got IN_IGNORED; stopping directory monitoring",
                    directory.display()
                ));
            }
        }
    }
}

impl DirectoryWatcher for InotifyWatcher {
    fn init(&mut self) -> Result<(), WatcherError> {
        if self.channel.is_none() {
            self.channel = Some(Channel::open()?);
            debug!("inotify watcher initialised");
        }
        Ok(())
    }

    fn watch(&self) {
        let Some(channel) = self.channel.as_ref() else {
            self.callbacks.error("watch() called before init()");
            return;
        };

        let mut buffer = Box::new(EventBuffer([0; BUFFER_LEN]));
        let mut queue = VecDeque::new();

        while !self.is_stopped() {
            match channel.wait() {
                Ok(Wakeup::Readable) => {}
                Ok(Wakeup::Interrupted) => continue,
                Ok(Wakeup::Cancelled) => break,
                Err(err) => {
                    self.callbacks.error(&format!("epoll_wait failed: {}", err));
                    break;
                }
            }

            self.drain(channel, &mut buffer, &mut queue);
            self.callbacks.dispatch(&mut queue);
        }

        self.mark_stopped();
        debug!("inotify watch loop exited");
    }

    fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            *stopped = true;
            if let Some(channel) = &self.channel {
                channel.signal_stop();
            }
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    fn add_directory(&self, path: &Path) -> Result<(), WatcherError> {
        let channel = self.channel.as_ref().ok_or(WatcherError::NotInitialized)?;
        check_directory(path)?;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            WatcherError::AddWatch {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
            }
        })?;

        let wd = unsafe {
            libc::inotify_add_watch(
                channel.inotify.as_raw_fd(),
                c_path.as_ptr(),
                ChangeMask::SUBSCRIBED.bits(),
            )
        };
        if wd == -1 {
            return Err(WatcherError::AddWatch {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        self.watches.lock().insert(WatchHandle(wd), path.to_path_buf());
        info!("Watching: {}", path.display());
        Ok(())
    }

    fn remove_directory(&self, path: &Path) {
        let handle = {
            let mut watches = self.watches.lock();
            let handle = watches
                .iter()
                .find(|(_, dir)| dir.as_path() == path)
                .map(|(handle, _)| *handle);
            if let Some(handle) = handle {
                watches.remove(&handle);
            }
            handle
        };

        let (Some(handle), Some(channel)) = (handle, self.channel.as_ref()) else {
            return;
        };
        if unsafe { libc::inotify_rm_watch(channel.inotify.as_raw_fd(), handle.0) } == -1 {
            warn!(
                "Failed to remove watch for {}: {}",
                path.display(),
                io::Error::last_os_error()
            );
        }
    }

    fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }
}
