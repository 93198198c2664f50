use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A half-open range of zero-based line numbers, `[start, end)`.
///
/// `end == usize::MAX` means "through the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineRange {
  pub start: usize,
  pub end: usize,
}

impl LineRange {
  pub fn new(start: usize, end: usize) -> Self {
    Self {
      start,
      end: end.max(start),
    }
  }

  /// From `start` through the end of the file.
  pub fn to_end(start: usize) -> Self {
    Self {
      start,
      end: usize::MAX,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.start == self.end
  }

  pub fn contains(&self, line: usize) -> bool {
    self.start <= line && line < self.end
  }

  pub fn intersects(&self, other: &LineRange) -> bool {
    self.start < other.end && other.start < self.end
  }
}

impl fmt::Display for LineRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.end == usize::MAX {
      write!(f, "[{}, EOF)", self.start)
    } else {
      write!(f, "[{}, {})", self.start, self.end)
    }
  }
}

/// How a single file changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
  /// Anything may have changed.
  Whole,
  /// Only these lines changed, sorted and non-overlapping.
  Lines(Vec<LineRange>),
}

impl FileChange {
  /// Whether this change touches a dependency on `block`, or on the whole
  /// file when `block` is `None`.
  pub fn affects(&self, block: Option<&LineRange>) -> bool {
    match (self, block) {
      (FileChange::Whole, _) => true,
      (FileChange::Lines(ranges), None) => !ranges.is_empty(),
      (FileChange::Lines(ranges), Some(block)) => ranges.iter().any(|r| r.intersects(block)),
    }
  }

  fn merge(&mut self, other: FileChange) {
    match other {
      FileChange::Whole => *self = FileChange::Whole,
      FileChange::Lines(more) => {
        if let FileChange::Lines(ranges) = self {
          ranges.extend(more);
          *ranges = normalize(std::mem::take(ranges));
        }
      }
    }
  }
}

/// Sort ranges and coalesce overlapping or touching ones. Empty ranges are
/// dropped.
fn normalize(mut ranges: Vec<LineRange>) -> Vec<LineRange> {
  ranges.retain(|r| !r.is_empty());
  ranges.sort();
  let mut merged: Vec<LineRange> = Vec::with_capacity(ranges.len());
  for range in ranges {
    match merged.last_mut() {
      Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
      _ => merged.push(range),
    }
  }
  merged
}

/// The set of source changes observed since the last invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
  files: BTreeMap<PathBuf, FileChange>,
}

impl ChangeSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record that `path` changed entirely.
  pub fn whole(&mut self, path: impl Into<PathBuf>) {
    self.add(path, FileChange::Whole);
  }

  /// Record that `ranges` of `path` changed.
  pub fn lines(&mut self, path: impl Into<PathBuf>, ranges: Vec<LineRange>) {
    self.add(path, FileChange::Lines(ranges));
  }

  pub fn add(&mut self, path: impl Into<PathBuf>, change: FileChange) {
    let change = match change {
      FileChange::Lines(ranges) => {
        let ranges = normalize(ranges);
        if ranges.is_empty() {
          return;
        }
        FileChange::Lines(ranges)
      }
      whole => whole,
    };
    let path = path.into();
    match self.files.get_mut(&path) {
      Some(existing) => existing.merge(change),
      None => {
        self.files.insert(path, change);
      }
    }
  }

  pub fn extend(&mut self, other: ChangeSet) {
    for (path, change) in other.files {
      self.add(path, change);
    }
  }

  pub fn get(&self, path: &Path) -> Option<&FileChange> {
    self.files.get(path)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&Path, &FileChange)> {
    self.files.iter().map(|(path, change)| (path.as_path(), change))
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

/// Lines of `old` that differ in `new`, in `old`'s line numbering.
///
/// The common prefix and suffix are trimmed. If the differing middle keeps its
/// line count the result is exactly that block. If lines were inserted or
/// removed, every later line has moved, so the result runs to the end of the
/// file.
pub fn diff_lines(old: &str, new: &str) -> Vec<LineRange> {
  let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
  let new_lines: Vec<&str> = new.split_inclusive('\n').collect();

  let prefix = old_lines
    .iter()
    .zip(&new_lines)
    .take_while(|(a, b)| a == b)
    .count();
  let limit = old_lines.len().min(new_lines.len()) - prefix;
  let suffix = old_lines
    .iter()
    .rev()
    .zip(new_lines.iter().rev())
    .take(limit)
    .take_while(|(a, b)| a == b)
    .count();

  let old_middle = old_lines.len() - prefix - suffix;
  let new_middle = new_lines.len() - prefix - suffix;
  if old_middle == 0 && new_middle == 0 {
    Vec::new()
  } else if old_middle == new_middle {
    vec![LineRange::new(prefix, prefix + old_middle)]
  } else {
    vec![LineRange::to_end(prefix)]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn numbered(count: usize) -> String {
    (0..count).map(|i| format!("line {}\n", i)).collect()
  }

  #[test]
  fn test_identical_content_has_no_changes() {
    assert!(diff_lines("a\nb\n", "a\nb\n").is_empty());
  }

  #[test]
  fn test_in_place_edit_is_exact() {
    let old = numbered(30);
    let new = old.replace("line 25\n", "line twenty-five\n");
    assert_eq!(diff_lines(&old, &new), vec![LineRange::new(25, 26)]);
  }

  #[test]
  fn test_insertion_runs_to_end() {
    assert_eq!(
      diff_lines("a\nb\n", "a\nb\nc\n"),
      vec![LineRange::to_end(2)]
    );
    let old = numbered(30);
    let new = old.replace("line 3\n", "line 3\nextra\n");
    assert_eq!(diff_lines(&old, &new), vec![LineRange::to_end(4)]);
  }

  #[test]
  fn test_missing_trailing_newline_is_a_change() {
    assert_eq!(diff_lines("a\nb\n", "a\nb"), vec![LineRange::new(1, 2)]);
  }

  #[test]
  fn test_affects_respects_blocks() {
    let change = FileChange::Lines(vec![LineRange::new(25, 26)]);
    assert!(!change.affects(Some(&LineRange::new(10, 20))));
    assert!(change.affects(Some(&LineRange::new(20, 30))));
    assert!(change.affects(None));
    assert!(FileChange::Whole.affects(Some(&LineRange::new(0, 1))));
  }

  #[test]
  fn test_change_set_merges() {
    let mut set = ChangeSet::new();
    set.lines("a.rs", vec![LineRange::new(5, 8)]);
    set.lines("a.rs", vec![LineRange::new(1, 3), LineRange::new(7, 10)]);
    assert_eq!(
      set.get(Path::new("a.rs")),
      Some(&FileChange::Lines(vec![
        LineRange::new(1, 3),
        LineRange::new(5, 10)
      ]))
    );

    set.whole("a.rs");
    set.lines("a.rs", vec![LineRange::new(0, 1)]);
    assert_eq!(set.get(Path::new("a.rs")), Some(&FileChange::Whole));

    set.lines("b.rs", vec![]);
    assert_eq!(set.len(), 1);
  }
}
