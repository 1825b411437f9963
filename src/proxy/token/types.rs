use crate::models::{Provider, TokenData};

/// Per-request view of the selected account: identity plus token material
/// that is already refreshed and project-resolved.
#[derive(Debug, Clone)]
pub struct RoutedAccount {
    pub id: String,
    pub provider: Provider,
    pub email: String,
    pub token: TokenData,
}

impl RoutedAccount {
    pub fn is_local(&self) -> bool {
        self.provider.is_local()
    }
}
