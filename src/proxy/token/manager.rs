use super::RoutedAccount;
use crate::constants::{COOLDOWN_SECS, REFRESH_WINDOW_SECS};
use crate::error::AppResult;
use crate::models::{Account, Provider};
use crate::proxy::upstream::UpstreamClient;
use crate::store::AccountStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// In-memory routing layer. Holds a map of loaded accounts, applies
/// cooldowns and model filters, and hands out one ready-to-use account per
/// request via round-robin.
pub struct TokenManager {
    store: Arc<AccountStore>,
    upstream: Arc<UpstreamClient>,
    accounts: DashMap<String, Account>,
    cooldowns: DashMap<String, i64>, // email -> eligible-again timestamp
    rr_index: AtomicUsize,
}

impl TokenManager {
    pub fn new(store: Arc<AccountStore>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            store,
            upstream,
            accounts: DashMap::new(),
            cooldowns: DashMap::new(),
            rr_index: AtomicUsize::new(0),
        }
    }

    /// Bulk-load every account from the store into the in-memory map.
    pub fn load(&self) -> AppResult<usize> {
        let accounts = self.store.list()?;
        self.accounts.clear();
        for account in accounts {
            self.accounts.insert(account.id.clone(), account);
        }
        Ok(self.accounts.len())
    }

    pub fn count(&self) -> usize {
        self.accounts.len()
    }

    /// Apply a cooldown keyed by email. The account stays listable and
    /// refreshable; only selection is suppressed.
    pub fn mark_rate_limited(&self, email: &str) {
        let until = chrono::Utc::now().timestamp() + COOLDOWN_SECS;
        debug!("cooldown set for {} until {}", email, until);
        self.cooldowns.insert(email.to_string(), until);
    }

    pub fn reset_cooldown(&self, email: &str) {
        self.cooldowns.remove(email);
    }

    fn cooldown_until(&self, email: &str) -> i64 {
        self.cooldowns.get(email).map(|v| *v).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_cooldown(&self, email: &str, until: i64) {
        self.cooldowns.insert(email.to_string(), until);
    }

    /// Select the account serving this request, refreshing its token and
    /// resolving its project id as needed. Returns None when no candidate
    /// survives filtering.
    pub async fn get_next(&self, requested_model: Option<&str>) -> Option<RoutedAccount> {
        if self.accounts.is_empty() || super::take_reload_request() {
            if let Err(e) = self.load() {
                warn!("[W-TOKEN-LOAD] account load failed: {}", e);
            }
        }
        if self.accounts.is_empty() {
            return None;
        }

        let now = chrono::Utc::now().timestamp();
        let normalized = requested_model.map(normalize_model);

        // Stable rotation order regardless of last_used churn.
        let mut candidates: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        // A cooldown expiring exactly now no longer suppresses the account.
        candidates.retain(|a| self.cooldown_until(&a.email) <= now);
        if let Some(model) = &normalized {
            candidates.retain(|a| matches_model_filter(a, model));
            // Accounts that opted in to this model take priority over
            // unfiltered ones, so a user pin is always honoured.
            let explicit: Vec<Account> = candidates
                .iter()
                .filter(|a| !a.selected_models.is_empty())
                .cloned()
                .collect();
            if !explicit.is_empty() {
                candidates = explicit;
            }
        }
        if candidates.is_empty() {
            return None;
        }

        // Sovereignty rule: an explicitly activated local model preempts
        // rotation so the client is never silently routed to cloud.
        let mut chosen = match candidates.iter().find(|a| a.is_active && a.provider.is_local()) {
            Some(local) => local.clone(),
            None => {
                let idx = self.rr_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
                candidates[idx].clone()
            }
        };

        if !chosen.provider.is_local() {
            self.ensure_fresh(&mut chosen).await;
            self.ensure_project_id(&mut chosen).await;
        }

        chosen.update_last_used();
        if let Err(e) = self.store.update_last_used(&chosen.id) {
            warn!("[W-TOKEN-USAGE] last_used write failed for {}: {}", chosen.id, e);
        }
        let routed = RoutedAccount {
            id: chosen.id.clone(),
            provider: chosen.provider.clone(),
            email: chosen.email.clone(),
            token: chosen.token.clone(),
        };
        self.accounts.insert(chosen.id.clone(), chosen);
        Some(routed)
    }

    // Refresh failure degrades: the expiring token is returned anyway and
    // the proxy surfaces whatever the upstream says about it.
    async fn ensure_fresh(&self, account: &mut Account) {
        if !account.token.expires_within(REFRESH_WINDOW_SECS) {
            return;
        }
        match self.upstream.refresh_token(&account.token.refresh_token).await {
            Ok(refresh) => {
                let now = chrono::Utc::now().timestamp();
                account.token.access_token = refresh.access_token;
                account.token.expires_in = refresh.expires_in;
                account.token.expiry_timestamp = now + refresh.expires_in;
                if !refresh.token_type.is_empty() {
                    account.token.token_type = refresh.token_type;
                }
                if let Some(rt) = refresh.refresh_token {
                    account.token.refresh_token = rt;
                }
                if let Err(e) = self.store.update_token(&account.id, &account.token) {
                    warn!("[W-TOKEN-PERSIST] refreshed token not saved for {}: {}", account.email, e);
                }
                debug!("token refreshed for {}", account.email);
            }
            Err(e) => {
                warn!("[W-TOKEN-REFRESH] {} refresh failed, returning stale token: {}", account.email, e);
            }
        }
    }

    async fn ensure_project_id(&self, account: &mut Account) {
        if account.token.project_id.is_some() {
            return;
        }
        if !matches!(account.provider, Provider::Google | Provider::Anthropic) {
            return;
        }

        let project = match self.upstream.fetch_project_id(&account.token.access_token).await {
            Ok(p) => p,
            Err(e) => {
                let fallback = fallback_project_id(&account.email);
                warn!(
                    "[W-PROJECT-FALLBACK] discovery failed for {} ({}), using {}",
                    account.email, e, fallback
                );
                // Marked so the fallback is visible but not retried per request.
                account
                    .token
                    .extra
                    .insert("project_id_fallback".to_string(), serde_json::Value::Bool(true));
                fallback
            }
        };
        account.token.project_id = Some(project);
        if let Err(e) = self.store.update_token(&account.id, &account.token) {
            warn!("[W-TOKEN-PERSIST] project id not saved for {}: {}", account.email, e);
        }
    }
}

// Canonical form used on both sides of the filter: optional `models/`
// prefix stripped, case folded.
pub fn normalize_model(model: &str) -> String {
    model
        .strip_prefix("models/")
        .unwrap_or(model)
        .to_ascii_lowercase()
}

fn matches_model_filter(account: &Account, normalized_target: &str) -> bool {
    if account.selected_models.is_empty() {
        return true;
    }
    account
        .selected_models
        .iter()
        .any(|m| normalize_model(m) == normalized_target)
}

pub fn fallback_project_id(email: &str) -> String {
    let local_part = email.split('@').next().unwrap_or("user");
    format!("cloud-code-{}", local_part)
}
