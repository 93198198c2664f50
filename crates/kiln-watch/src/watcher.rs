use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebouncedEvent, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{ChangeKind, SourceEvent, WatchError};

/// Watches a workspace recursively and forwards debounced changes as
/// [`SourceEvent`]s with workspace-relative paths.
///
/// Watching stops when the watcher is dropped.
pub struct FsWatcher {
  _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
  root: PathBuf,
}

impl FsWatcher {
  pub fn start(
    root: &Path,
    debounce: Duration,
    sender: mpsc::Sender<SourceEvent>,
  ) -> Result<Self, WatchError> {
    let root = std::fs::canonicalize(root).map_err(|source| WatchError::Root {
      path: root.to_path_buf(),
      source,
    })?;
    let watched_root = root.clone();

    let mut debouncer = new_debouncer(
      debounce,
      None,
      move |result: Result<Vec<DebouncedEvent>, Vec<notify::Error>>| match result {
        Ok(events) => {
          for event in events {
            for source_event in translate(&watched_root, &event) {
              // The receiver may be gone during shutdown.
              if sender.blocking_send(source_event).is_err() {
                return;
              }
            }
          }
        }
        Err(errors) => {
          for error in errors {
            warn!(error = %error, "file watcher error");
          }
        }
      },
    )?;

    debouncer.watch(&root, RecursiveMode::Recursive)?;
    debug!(root = %root.display(), "file watcher started");

    Ok(Self {
      _debouncer: debouncer,
      root,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

fn translate(root: &Path, event: &DebouncedEvent) -> Vec<SourceEvent> {
  let kind = match event.kind {
    EventKind::Create(_) => ChangeKind::Created,
    // Renames show up as a name change on each side.
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
    EventKind::Remove(_) => ChangeKind::Removed,
    EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modified,
    EventKind::Access(_) => return Vec::new(),
  };

  event
    .paths
    .iter()
    .filter_map(|path| path.strip_prefix(root).ok())
    .filter(|relative| !relative.as_os_str().is_empty())
    .map(|relative| SourceEvent {
      path: relative.to_path_buf(),
      kind,
      lines: None,
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Instant;

  #[test]
  fn test_translate_strips_root_and_skips_access() {
    let root = Path::new("/ws");
    let modify = DebouncedEvent::new(
      notify::Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
        .add_path(PathBuf::from("/ws/src/lib.rs"))
        .add_path(PathBuf::from("/elsewhere/x")),
      Instant::now(),
    );
    assert_eq!(
      translate(root, &modify),
      vec![SourceEvent::modified("src/lib.rs")]
    );

    let access = DebouncedEvent::new(
      notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
        .add_path(PathBuf::from("/ws/src/lib.rs")),
      Instant::now(),
    );
    assert!(translate(root, &access).is_empty());
  }

  #[test]
  fn test_translate_maps_renames_to_removal_and_creation() {
    let root = Path::new("/ws");
    let from = DebouncedEvent::new(
      notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
        .add_path(PathBuf::from("/ws/src/old.rs")),
      Instant::now(),
    );
    let to = DebouncedEvent::new(
      notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
        .add_path(PathBuf::from("/ws/src/new.rs")),
      Instant::now(),
    );
    assert_eq!(translate(root, &from), vec![SourceEvent::removed("src/old.rs")]);
    assert_eq!(translate(root, &to), vec![SourceEvent::created("src/new.rs")]);
  }
}
