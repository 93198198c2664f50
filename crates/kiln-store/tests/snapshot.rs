use std::path::PathBuf;

use bytes::Bytes;
use kiln_store::{Digest, Store};

#[tokio::test]
async fn test_snapshot_then_materialize_reproduces_files() {
  let workspace = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(workspace.path().join("src/nested")).unwrap();
  std::fs::create_dir_all(workspace.path().join("empty")).unwrap();
  std::fs::write(workspace.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
  std::fs::write(workspace.path().join("src/nested/mod.rs"), "// nested\n").unwrap();
  std::fs::write(workspace.path().join("README"), "hello\n").unwrap();

  let data = tempfile::tempdir().unwrap();
  let store = Store::open(data.path().join("store"));

  let (digest, tree) = store
    .snapshot_paths(workspace.path(), &[PathBuf::from(".")])
    .await
    .unwrap();
  assert_eq!(tree.len(), 3);
  assert!(tree.get("src/nested/mod.rs").is_some());
  assert!(tree.directories().any(|d| d == "empty"));

  let out = tempfile::tempdir().unwrap();
  store
    .materialize_directory(digest, out.path())
    .await
    .unwrap();
  assert_eq!(
    std::fs::read_to_string(out.path().join("src/lib.rs")).unwrap(),
    "pub fn f() {}\n"
  );
  assert!(out.path().join("empty").is_dir());

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(out.path().join("README"))
      .unwrap()
      .permissions()
      .mode();
    assert_eq!(mode & 0o777, 0o444);
  }
}

#[tokio::test]
async fn test_snapshot_is_stable_across_stores() {
  let workspace = tempfile::tempdir().unwrap();
  std::fs::write(workspace.path().join("a.txt"), "a\nb\n").unwrap();

  let first = Store::in_memory();
  let second = Store::in_memory();
  let (a, _) = first
    .snapshot_paths(workspace.path(), &[PathBuf::from("a.txt")])
    .await
    .unwrap();
  let (b, _) = second
    .snapshot_paths(workspace.path(), &[PathBuf::from("a.txt")])
    .await
    .unwrap();
  assert_eq!(a, b);
}

#[tokio::test]
async fn test_fs_store_persists_across_instances() {
  let data = tempfile::tempdir().unwrap();
  let digest = {
    let store = Store::open(data.path());
    store
      .store_bytes(Bytes::from_static(b"durable"))
      .await
      .unwrap()
  };

  let reopened = Store::open(data.path());
  assert_eq!(
    reopened.load_bytes_required(digest).await.unwrap(),
    &b"durable"[..]
  );
  assert!(
    reopened
      .load_bytes(Digest::of_bytes(b"never stored"))
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn test_snapshot_rejects_escaping_path() {
  let workspace = tempfile::tempdir().unwrap();
  let store = Store::in_memory();
  assert!(
    store
      .snapshot_paths(workspace.path(), &[PathBuf::from("../outside")])
      .await
      .is_err()
  );
}

#[cfg(unix)]
#[tokio::test]
async fn test_snapshot_skips_symlinks() {
  let workspace = tempfile::tempdir().unwrap();
  let outside = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(workspace.path().join("src")).unwrap();
  std::fs::write(workspace.path().join("src/lib.rs"), "lib\n").unwrap();
  std::fs::write(outside.path().join("secret"), "secret\n").unwrap();
  // A cycle back to the workspace root and a link leaving it.
  std::os::unix::fs::symlink("..", workspace.path().join("src/loop")).unwrap();
  std::os::unix::fs::symlink(outside.path(), workspace.path().join("src/elsewhere")).unwrap();
  std::os::unix::fs::symlink("lib.rs", workspace.path().join("src/alias.rs")).unwrap();

  let store = Store::in_memory();
  let (_, tree) = store
    .snapshot_paths(workspace.path(), &[PathBuf::from("src")])
    .await
    .unwrap();
  assert_eq!(tree.len(), 1);
  assert!(tree.get("src/lib.rs").is_some());
  assert!(tree.get("src/alias.rs").is_none());

  let (_, linked) = store
    .snapshot_paths(workspace.path(), &[PathBuf::from("src/elsewhere")])
    .await
    .unwrap();
  assert!(linked.is_empty());
}
