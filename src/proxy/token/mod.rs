mod manager;
mod types;

pub use manager::{fallback_project_id, normalize_model, TokenManager};
pub use types::RoutedAccount;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

// Reload signal posted by components that mutate the store without holding a
// manager reference (the quota monitor). The manager drains it on the next
// selection.
static PENDING_RELOAD: OnceLock<AtomicBool> = OnceLock::new();

fn pending_reload() -> &'static AtomicBool {
    PENDING_RELOAD.get_or_init(|| AtomicBool::new(false))
}

pub fn trigger_reload() {
    pending_reload().store(true, Ordering::SeqCst);
}

pub(crate) fn take_reload_request() -> bool {
    pending_reload().swap(false, Ordering::SeqCst)
}
