//! Filtering and rename reconciliation shared by all watcher backends.

use super::{EventKind, WatcherEvent};
use log::debug;
use std::collections::HashMap;
use std::ops::BitOr;
use std::path::Path;

/// Change flags. Bit values match the Linux inotify ABI so inotify masks can be
/// used as-is; other backends translate into the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeMask(u32);

impl ChangeMask {
    pub const CLOSE_WRITE: Self = Self(0x0000_0008);
    pub const MOVED_FROM: Self = Self(0x0000_0040);
    pub const MOVED_TO: Self = Self(0x0000_0080);
    pub const CREATE: Self = Self(0x0000_0100);
    pub const DELETE: Self = Self(0x0000_0200);
    pub const DELETE_SELF: Self = Self(0x0000_0400);
    pub const Q_OVERFLOW: Self = Self(0x0000_4000);
    pub const IGNORED: Self = Self(0x0000_8000);
    pub const ISDIR: Self = Self(0x4000_0000);

    pub const MOVE: Self = Self(Self::MOVED_FROM.0 | Self::MOVED_TO.0);

    /// Everything a watch subscribes to.
    pub const SUBSCRIBED: Self = Self(
        Self::MOVE.0 | Self::CREATE.0 | Self::CLOSE_WRITE.0 | Self::DELETE.0 | Self::DELETE_SELF.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ChangeMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Backend specific identifier of one watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub i32);

/// One native change notification, before filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChangeRecord {
    pub handle: WatchHandle,
    pub mask: ChangeMask,
    pub cookie: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Event(WatcherEvent),
    Dropped,
    /// The watch behind this record is gone; the watcher must stop.
    Invalidated,
}

/// Editor swap and backup files.
pub fn is_hidden_or_backup(name: &str) -> bool {
    name.starts_with('.') || name.ends_with('~')
}

/// Pairs `MOVED_FROM`/`MOVED_TO` halves by cookie and drops noise.
///
/// A `MOVED_FROM` half with no partner (the file left the watched directory)
/// is forgotten once the batch after the one it arrived in has finished.
#[derive(Debug, Default)]
pub struct EventReconciler {
    pending_renames: HashMap<u32, (String, u64)>,
    batch: u64,
}

impl EventReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `MOVED_FROM` halves still waiting for their partner.
    pub fn pending_renames(&self) -> usize {
        self.pending_renames.len()
    }

    /// Ends the current read batch and drops halves left over from the
    /// previous one.
    pub fn finish_batch(&mut self) {
        let batch = self.batch;
        self.pending_renames.retain(|cookie, (name, seen)| {
            let keep = *seen >= batch;
            if !keep {
                debug!("{name} moved out of the watched directory (cookie {cookie})");
            }
            keep
        });
        self.batch += 1;
    }

    pub fn process(&mut self, directory: &Path, raw: &RawChangeRecord) -> Reconciled {
        if raw.mask.intersects(ChangeMask::IGNORED) {
            return Reconciled::Invalidated;
        }

        if raw.mask.intersects(ChangeMask::MOVED_FROM) {
            self.pending_renames
                .insert(raw.cookie, (raw.name.clone(), self.batch));
            return Reconciled::Dropped;
        }

        if is_hidden_or_backup(&raw.name) || !raw.mask.intersects(ChangeMask::SUBSCRIBED) {
            if raw.mask.intersects(ChangeMask::MOVED_TO) {
                self.pending_renames.remove(&raw.cookie);
            }
            return Reconciled::Dropped;
        }

        let (kind, old_name) = if raw.mask.intersects(ChangeMask::MOVED_TO) {
            match self.pending_renames.remove(&raw.cookie) {
                Some((old_name, _)) => (EventKind::Moved, Some(old_name)),
                None => (EventKind::Created, None),
            }
        } else if raw.mask.intersects(ChangeMask::CREATE) {
            (EventKind::Created, None)
        } else if raw.mask.intersects(ChangeMask::DELETE) {
            (EventKind::Deleted, None)
        } else if raw.mask.intersects(ChangeMask::CLOSE_WRITE) {
            (EventKind::Changed, None)
        } else {
            return Reconciled::Dropped;
        };

        Reconciled::Event(WatcherEvent {
            directory: directory.to_path_buf(),
            name: raw.name.clone(),
            old_name,
            kind,
            is_dir: raw.mask.intersects(ChangeMask::ISDIR),
        })
    }
}
