use crate::constants::{
    MONITOR_MAX_CONCURRENT_POLLS, MONITOR_POLL_INTERVAL_SECS, MONITOR_REFRESH_WINDOW_SECS,
};
use crate::error::AppError;
use crate::models::{Account, AccountStatus};
use crate::proxy::upstream::UpstreamClient;
use crate::store::AccountStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const QUOTA_FETCH_ATTEMPTS: usize = 3;

// Scores below this mark the active account as critical.
const CRITICAL_SCORE: f32 = 10.0;
// A candidate must beat the active account by this margin to win a switch.
const HYSTERESIS_MARGIN: f32 = 5.0;

/// User-visible notification sink; the desktop shell provides the real one.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        info!("[notification] {}: {}", title, message);
    }
}

/// Health score, 0-100. Quota-less and broken accounts score zero; the rest
/// blend average remaining quota with a status bonus.
pub fn health_score(account: &Account) -> f32 {
    if account.quota.is_none()
        || matches!(account.status, AccountStatus::RateLimited | AccountStatus::Error)
    {
        return 0.0;
    }
    let avg = account.quota.as_ref().map(|q| q.avg_percentage()).unwrap_or(0.0);
    let bonus = match account.status {
        AccountStatus::Active => 40.0,
        AccountStatus::Refreshing => 20.0,
        _ => 0.0,
    };
    (0.6 * avg + bonus).clamp(0.0, 100.0)
}

/// The hysteresis guard: switching requires a clear margin, not a tie.
pub fn should_switch(active_score: f32, candidate_score: f32) -> bool {
    candidate_score > active_score + HYSTERESIS_MARGIN
}

/// Background poller keeping quota fresh and rotating away from unhealthy
/// active accounts. Writes go to the store; the token manager picks them up
/// through the reload signal.
pub struct QuotaMonitor {
    store: Arc<AccountStore>,
    upstream: Arc<UpstreamClient>,
    notifier: Arc<dyn Notifier>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl QuotaMonitor {
    pub fn new(
        store: Arc<AccountStore>,
        upstream: Arc<UpstreamClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            upstream,
            notifier,
            semaphore: Arc::new(Semaphore::new(MONITOR_MAX_CONCURRENT_POLLS)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(MONITOR_POLL_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = interval.tick() => monitor.force_poll().await,
                }
            }
            debug!("quota monitor loop stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One full pass: refresh every cloud account's quota under the
    /// concurrency bound, then evaluate the auto-switch.
    pub async fn force_poll(self: &Arc<Self>) {
        let accounts = match self.store.list() {
            Ok(a) => a,
            Err(e) => {
                warn!("[W-MONITOR-LIST] poll skipped: {}", e);
                return;
            }
        };

        let mut handles = Vec::new();
        for account in accounts.into_iter().filter(|a| !a.provider.is_local()) {
            let monitor = self.clone();
            let permit = self.semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else { break };
            handles.push(tokio::spawn(async move {
                monitor.poll_account(account).await;
                drop(permit);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.run_auto_switch().await;
        crate::proxy::token::trigger_reload();
    }

    // Per-account task. All failures end in a status write; the loop never
    // dies on one account.
    async fn poll_account(&self, mut account: Account) {
        let id = account.id.clone();
        let _ = self.store.update_status(&id, AccountStatus::Refreshing);

        let now = chrono::Utc::now().timestamp();
        if account.token.expiry_timestamp < now + MONITOR_REFRESH_WINDOW_SECS {
            match self.upstream.refresh_token(&account.token.refresh_token).await {
                Ok(refresh) => {
                    account.token.access_token = refresh.access_token;
                    account.token.expires_in = refresh.expires_in;
                    account.token.expiry_timestamp = now + refresh.expires_in;
                    if let Some(rt) = refresh.refresh_token {
                        account.token.refresh_token = rt;
                    }
                    if let Err(e) = self.store.update_token(&id, &account.token) {
                        warn!("[W-MONITOR-PERSIST] token write failed for {}: {}", account.email, e);
                    }
                }
                Err(e) => warn!("[W-MONITOR-REFRESH] {} refresh failed: {}", account.email, e),
            }
        }

        let mut attempt = 0usize;
        loop {
            match self
                .upstream
                .fetch_quota(&account.token.access_token, account.token.project_id.as_deref())
                .await
            {
                Ok(quota) => {
                    if let Err(e) = self.store.update_quota(&id, &quota) {
                        warn!("[W-MONITOR-PERSIST] quota write failed for {}: {}", account.email, e);
                    }
                    let _ = self.store.update_status(&id, AccountStatus::Active);
                    debug!("quota refreshed for {} ({} models)", account.email, quota.models.len());
                    return;
                }
                // 429-shaped: park the account, no retries.
                Err(AppError::RateLimited(e)) => {
                    warn!("[W-MONITOR-QUOTA] {} rate limited: {}", account.email, e);
                    let _ = self.store.update_status(&id, AccountStatus::RateLimited);
                    return;
                }
                Err(e) if attempt + 1 < QUOTA_FETCH_ATTEMPTS => {
                    attempt += 1;
                    let backoff_ms =
                        1_000u64 * 2u64.pow(attempt as u32) + rand::thread_rng().gen_range(0..500);
                    debug!(
                        "quota fetch for {} failed (attempt {}/{}): {}; retrying in {}ms",
                        account.email, attempt, QUOTA_FETCH_ATTEMPTS, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    warn!("[W-MONITOR-QUOTA] {} gave up: {}", account.email, e);
                    let _ = self.store.update_status(&id, AccountStatus::Error);
                    return;
                }
            }
        }
    }

    /// Promote the healthiest alternative when the active account is
    /// critical, guarded by hysteresis so scores drifting around the
    /// threshold cannot flap.
    pub async fn run_auto_switch(&self) {
        let enabled = self
            .store
            .get_setting("auto_switch_enabled", serde_json::json!(false))
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !enabled {
            return;
        }

        let accounts = match self.store.list() {
            Ok(a) => a,
            Err(_) => return,
        };
        let Some(active) = accounts.iter().find(|a| a.is_active) else {
            return;
        };

        let active_score = health_score(active);
        let critical = active_score < CRITICAL_SCORE
            || matches!(active.status, AccountStatus::RateLimited | AccountStatus::Error);
        if !critical {
            return;
        }

        let candidate = accounts
            .iter()
            .filter(|a| !a.is_active && a.status == AccountStatus::Active)
            .max_by(|a, b| {
                health_score(a)
                    .partial_cmp(&health_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        if let Some(candidate) = candidate {
            let candidate_score = health_score(candidate);
            if should_switch(active_score, candidate_score) {
                if let Err(e) = self.store.set_active(&candidate.id) {
                    warn!("[W-AUTO-SWITCH] activation failed for {}: {}", candidate.email, e);
                    return;
                }
                crate::proxy::token::trigger_reload();
                info!(
                    "auto-switch: {} (score {:.0}) -> {} (score {:.0})",
                    active.email, active_score, candidate.email, candidate_score
                );
                self.notifier.notify(
                    "Account switched",
                    &format!("Switched from {} to {}", active.email, candidate.email),
                );
            } else {
                debug!(
                    "auto-switch held: candidate {:.0} within margin of active {:.0}",
                    candidate_score, active_score
                );
            }
        }
    }
}
