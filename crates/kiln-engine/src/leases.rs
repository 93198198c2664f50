use kiln_graph::{ExecutionEvent, ExecutionNotifier};
use kiln_store::Store;

use crate::intrinsics::referenced_digests;

/// Keeps the blobs referenced by memoized values alive in the store: a
/// completed node leases them and clearing the node releases them.
pub(crate) struct LeaseNotifier {
  store: Store,
}

impl LeaseNotifier {
  pub(crate) fn new(store: Store) -> Self {
    Self { store }
  }
}

impl ExecutionNotifier for LeaseNotifier {
  fn notify(&self, event: ExecutionEvent) {
    match event {
      ExecutionEvent::NodeCompleted { value, .. } => {
        for digest in referenced_digests(&value) {
          self.store.lease(digest);
        }
      }
      ExecutionEvent::NodeCleared {
        value: Some(value), ..
      } => {
        for digest in referenced_digests(&value) {
          self.store.release(digest);
        }
      }
      _ => {}
    }
  }
}
