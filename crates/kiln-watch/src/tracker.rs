use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{ChangeSet, FileChange, LineRange, diff_lines};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Modified,
  Removed,
}

/// One entry of the filesystem change feed. Paths are relative to the
/// workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
  pub path: PathBuf,
  pub kind: ChangeKind,
  /// Changed lines, when the producer already knows them.
  pub lines: Option<Vec<LineRange>>,
}

impl SourceEvent {
  pub fn created(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: ChangeKind::Created,
      lines: None,
    }
  }

  pub fn modified(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: ChangeKind::Modified,
      lines: None,
    }
  }

  pub fn removed(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: ChangeKind::Removed,
      lines: None,
    }
  }

  pub fn with_lines(mut self, lines: Vec<LineRange>) -> Self {
    self.lines = Some(lines);
    self
  }
}

/// Something that holds state derived from sources and can drop it.
pub trait Invalidatable: Send + Sync {
  /// Invalidate everything affected by `changes`. Returns how many entries
  /// were invalidated.
  fn invalidate(&self, changes: &ChangeSet) -> usize;
}

/// Turns raw change events into a [`ChangeSet`].
///
/// Files that some consumer reads at line granularity are remembered here so
/// their next change can be diffed against what was read.
pub struct ChangeTracker {
  root: PathBuf,
  snapshots: RwLock<HashMap<PathBuf, Arc<str>>>,
}

impl ChangeTracker {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      snapshots: RwLock::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Remember the content of `path` as last read.
  pub fn remember(&self, path: &Path, content: &str) {
    let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
    snapshots.insert(path.to_path_buf(), Arc::from(content));
  }

  pub fn forget(&self, path: &Path) {
    let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
    snapshots.remove(path);
  }

  pub fn is_tracked(&self, path: &Path) -> bool {
    let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
    snapshots.contains_key(path)
  }

  /// The change one event represents, or `None` if the content is unchanged.
  pub async fn change_for(&self, event: &SourceEvent) -> Option<FileChange> {
    if let Some(lines) = &event.lines {
      return Some(FileChange::Lines(lines.clone()));
    }
    if event.kind == ChangeKind::Removed {
      self.forget(&event.path);
      return Some(FileChange::Whole);
    }

    let previous = {
      let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
      snapshots.get(&event.path).cloned()
    };
    let Some(previous) = previous else {
      return Some(FileChange::Whole);
    };

    let current = match tokio::fs::read_to_string(self.root.join(&event.path)).await {
      Ok(current) => current,
      Err(e) => {
        debug!(path = %event.path.display(), error = %e, "changed file unreadable");
        self.forget(&event.path);
        return Some(FileChange::Whole);
      }
    };

    let ranges = diff_lines(&previous, &current);
    self.remember(&event.path, &current);
    if ranges.is_empty() {
      None
    } else {
      Some(FileChange::Lines(ranges))
    }
  }

  pub async fn change_set(&self, events: &[SourceEvent]) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for event in events {
      if let Some(change) = self.change_for(event).await {
        changes.add(event.path.clone(), change);
      }
    }
    changes
  }
}

/// Applies the change feed to an [`Invalidatable`] target.
pub struct InvalidationTracker {
  changes: Arc<ChangeTracker>,
  target: Arc<dyn Invalidatable>,
}

impl InvalidationTracker {
  pub fn new(changes: Arc<ChangeTracker>, target: Arc<dyn Invalidatable>) -> Self {
    Self { changes, target }
  }

  /// Apply one batch of events. Returns how many entries were invalidated.
  pub async fn apply(&self, events: &[SourceEvent]) -> usize {
    let changes = self.changes.change_set(events).await;
    if changes.is_empty() {
      return 0;
    }
    let invalidated = self.target.invalidate(&changes);
    info!(
      files = changes.len(),
      invalidated, "source changes applied"
    );
    invalidated
  }

  /// Consume events until the channel closes or `cancel` fires. Events that
  /// arrive together are applied as one batch.
  pub async fn run(self, mut events: mpsc::Receiver<SourceEvent>, cancel: CancellationToken) {
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          debug!("invalidation tracker cancelled");
          break;
        }
        event = events.recv() => {
          let Some(event) = event else {
            debug!("change feed closed");
            break;
          };
          let mut batch = vec![event];
          while let Ok(more) = events.try_recv() {
            batch.push(more);
          }
          self.apply(&batch).await;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[derive(Default)]
  struct Recorder {
    seen: Mutex<Vec<ChangeSet>>,
  }

  impl Invalidatable for Recorder {
    fn invalidate(&self, changes: &ChangeSet) -> usize {
      self.seen.lock().unwrap().push(changes.clone());
      changes.len()
    }
  }

  #[tokio::test]
  async fn test_untracked_file_changes_whole() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ChangeTracker::new(dir.path());
    let change = tracker.change_for(&SourceEvent::modified("a.txt")).await;
    assert_eq!(change, Some(FileChange::Whole));
  }

  #[tokio::test]
  async fn test_tracked_file_changes_by_line() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
    let tracker = ChangeTracker::new(dir.path());
    tracker.remember(Path::new("a.txt"), "one\ntwo\nthree\n");

    std::fs::write(dir.path().join("a.txt"), "one\nTWO\nthree\n").unwrap();
    let change = tracker.change_for(&SourceEvent::modified("a.txt")).await;
    assert_eq!(change, Some(FileChange::Lines(vec![LineRange::new(1, 2)])));

    // The snapshot moved forward, so a repeated event is a no-op.
    assert_eq!(tracker.change_for(&SourceEvent::modified("a.txt")).await, None);
  }

  #[tokio::test]
  async fn test_removal_forgets_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ChangeTracker::new(dir.path());
    tracker.remember(Path::new("a.txt"), "x\n");
    let change = tracker.change_for(&SourceEvent::removed("a.txt")).await;
    assert_eq!(change, Some(FileChange::Whole));
    assert!(!tracker.is_tracked(Path::new("a.txt")));
  }

  #[tokio::test]
  async fn test_run_batches_and_stops_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let tracker = InvalidationTracker::new(
      Arc::new(ChangeTracker::new(dir.path())),
      recorder.clone(),
    );

    let (tx, rx) = mpsc::channel(16);
    tx.send(SourceEvent::modified("a.txt")).await.unwrap();
    tx.send(SourceEvent::modified("b.txt").with_lines(vec![LineRange::new(3, 4)]))
      .await
      .unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(tracker.run(rx, cancel.clone()));
    while recorder.seen.lock().unwrap().is_empty() {
      tokio::task::yield_now().await;
    }
    cancel.cancel();
    handle.await.unwrap();

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 2);
  }
}
