//! Single-flight access token refresh.
//!
//! Every caller that needs a new access token, whether a request that got a
//! 401, the renewal timer, or session restore, goes through
//! [`RefreshCoordinator`]. At most one `/auth/refresh` call is in flight; all
//! callers that arrive meanwhile queue up and receive its outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::scheduler::{renewal_delay, SessionScheduler};
use super::store::TokenStore;
use super::token;
use crate::api::{ApiError, ApiResult};

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    /// Absent when the server keeps the existing refresh token valid
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair>;
}

type Waiter = oneshot::Sender<Option<String>>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<Waiter>,
    /// Bumped whenever the session ends; a refresh started under an older
    /// epoch must not write its tokens back
    epoch: u64,
}

/// Hands the refresh outcome to every queued caller when dropped, so the
/// queue is released even if the refresh task unwinds.
struct FanOut<'a> {
    coordinator: &'a RefreshCoordinator,
    outcome: Option<String>,
}

impl Drop for FanOut<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.coordinator.lock_state();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        debug!(waiters = waiters.len(), "Releasing refresh waiters");
        for waiter in waiters {
            let _ = waiter.send(self.outcome.clone());
        }
    }
}

pub struct RefreshCoordinator {
    store: Arc<TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    events: broadcast::Sender<SessionEvent>,
    scheduler: SessionScheduler,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            refresher,
            events,
            scheduler: SessionScheduler::new(),
            state: Mutex::new(RefreshState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_flight
    }

    /// Refresh the access token, joining a refresh already in flight.
    pub async fn refresh(self: &Arc<Self>) -> ApiResult<String> {
        self.single_flight(None).await
    }

    /// Obtain a replacement for `rejected_token`, which the server answered
    /// with 401.
    ///
    /// If the stored token already differs from the rejected one, a refresh
    /// finished while that request was on the wire and the stored token is
    /// returned without another refresh.
    pub async fn recover(self: &Arc<Self>, rejected_token: &str) -> ApiResult<String> {
        self.single_flight(Some(rejected_token)).await
    }

    async fn single_flight(self: &Arc<Self>, rejected_token: Option<&str>) -> ApiResult<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            if state.in_flight {
                debug!(queued = state.waiters.len() + 1, "Refresh in flight, queueing");
                state.waiters.push_back(tx);
            } else {
                if let Some(rejected) = rejected_token {
                    match self.store.access_token() {
                        Some(current) if current != rejected => return Ok(current),
                        // The session ended while the request was on the wire
                        None => return Err(ApiError::SessionExpired),
                        Some(_) => {}
                    }
                }
                state.in_flight = true;
                state.waiters.push_back(tx);

                // The refresh runs on its own task so that a dropped caller
                // cannot strand the queue.
                let this = Arc::clone(self);
                let epoch = state.epoch;
                tokio::spawn(async move { this.run_refresh(epoch).await });
            }
        }

        match rx.await {
            Ok(Some(access_token)) => Ok(access_token),
            _ => Err(ApiError::SessionExpired),
        }
    }

    async fn run_refresh(self: Arc<Self>, epoch: u64) {
        let mut fan_out = FanOut {
            coordinator: &*self,
            outcome: None,
        };

        match self.exchange(epoch).await {
            Ok(Some(access_token)) => {
                info!("Access token refreshed");
                fan_out.outcome = Some(access_token);
                drop(fan_out);
                let _ = self.events.send(SessionEvent::Refreshed);
                self.arm_renewal(epoch);
            }
            Ok(None) => {
                debug!("Session ended during refresh, discarding new tokens");
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                let ended = self.lock_state().epoch != epoch;
                if !ended {
                    self.expire_session();
                }
            }
        }
    }

    /// Trade the stored refresh token for a new pair. `Ok(None)` means the
    /// session ended while the call was in flight and nothing was stored.
    async fn exchange(&self, epoch: u64) -> ApiResult<Option<String>> {
        let refresh_token = self.store.refresh_token().ok_or(ApiError::NoSession)?;
        let pair = self.refresher.refresh(&refresh_token).await?;
        let refresh_token = pair.refresh_token.unwrap_or(refresh_token);

        // Checked and written under the state lock so an `end_session` cannot
        // slip in between
        let state = self.lock_state();
        if state.epoch != epoch {
            return Ok(None);
        }
        if !self.store.set_tokens(&pair.access_token, &refresh_token) {
            return Err(ApiError::StorageFailed);
        }
        Ok(Some(pair.access_token))
    }

    /// Arm the renewal timer from the stored access token's expiry.
    pub fn schedule_renewal(self: &Arc<Self>) {
        let epoch = self.lock_state().epoch;
        self.arm_renewal(epoch);
    }

    fn arm_renewal(self: &Arc<Self>, epoch: u64) {
        let state = self.lock_state();
        if state.epoch != epoch {
            return;
        }
        let Some(access_token) = self.store.access_token() else {
            self.scheduler.cancel();
            return;
        };

        let delay = renewal_delay(token::expires_in_seconds(&access_token));
        let this = Arc::clone(self);
        self.scheduler.arm(delay, async move {
            debug!("Renewal timer fired");
            // Failure has already cleared the session and notified subscribers
            let _ = this.refresh().await;
        });
    }

    /// End the session because it can no longer be renewed.
    pub fn expire_session(&self) {
        self.end_session();
        let _ = self.events.send(SessionEvent::Expired);
    }

    /// Clear stored state and stop renewal without emitting an event.
    /// A refresh still in flight is discarded when it completes.
    pub fn end_session(&self) {
        self.lock_state().epoch += 1;
        self.scheduler.cancel();
        self.store.clear();
    }
}
