//! Kiln Watch
//!
//! Turns filesystem activity into [`ChangeSet`]s and feeds them to anything
//! [`Invalidatable`]. Changes are whole-file by default; files read at line
//! granularity are diffed so that edits outside a declared block can be
//! ignored by its readers.

mod change;
mod error;
mod tracker;
mod watcher;

pub use change::{ChangeSet, FileChange, LineRange, diff_lines};
pub use error::WatchError;
pub use tracker::{ChangeKind, ChangeTracker, Invalidatable, InvalidationTracker, SourceEvent};
pub use watcher::FsWatcher;
