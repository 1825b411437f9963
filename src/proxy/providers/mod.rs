mod local;

pub use local::{sync_local_accounts, LocalClient};
