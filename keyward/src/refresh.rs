//! Proactive background renewal of access tokens

use std::time::Duration;

use keyward_clock::{Clock, DurationSecs, System, UnixTime};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AcquireError, RedirectAttempt, RedirectGuard, Scopes, TokenProvider};

/// Timing of the background refresh cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
    /// How long before expiry a token is renewed
    pub lead_time: DurationSecs,
    /// How long to wait when there is no account or renewal failed
    pub fallback_interval: DurationSecs,
    /// The shortest wait between two cycles
    pub min_delay: DurationSecs,
}

impl Default for RefreshConfig {
    /// Renews 60 seconds before expiry, retries after 60 seconds, and never
    /// waits less than 5 seconds.
    fn default() -> Self {
        Self {
            lead_time: DurationSecs(60),
            fallback_interval: DurationSecs(60),
            min_delay: DurationSecs(5),
        }
    }
}

/// When the next refresh cycle runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextCycle {
    /// At a point in wall-clock time
    At(UnixTime),
    /// After a fixed delay
    After(Duration),
}

impl RefreshConfig {
    /// Computes the next cycle for a token expiring at `expires_on`
    ///
    /// Without a known expiry, the fallback interval applies. Otherwise the
    /// cycle runs `lead_time` before expiry, but no earlier than `min_delay`
    /// from `now`.
    pub fn next_cycle(&self, expires_on: Option<UnixTime>, now: UnixTime) -> NextCycle {
        match expires_on {
            Some(expiry) => NextCycle::At((expiry - self.lead_time).max(now + self.min_delay)),
            None => NextCycle::After(self.fallback_interval.into()),
        }
    }
}

/// Why the refresh task stopped
#[derive(Debug)]
pub enum RefreshExit {
    /// The task was torn down
    Cancelled,
    /// Renewal required interaction; a redirect was attempted and refreshing stopped
    InteractionRequired(RedirectAttempt),
}

enum Cycle {
    Reschedule(NextCycle),
    Stop(RedirectAttempt),
}

/// Periodically renews tokens shortly before they expire
#[derive(Debug)]
pub struct RefreshScheduler<C = System> {
    provider: TokenProvider,
    guard: RedirectGuard,
    scopes: Scopes,
    config: RefreshConfig,
    clock: C,
}

impl RefreshScheduler<System> {
    /// Constructs a scheduler renewing tokens for `scopes`
    pub fn new(provider: TokenProvider, guard: RedirectGuard, scopes: Scopes) -> Self {
        Self {
            provider,
            guard,
            scopes,
            config: RefreshConfig::default(),
            clock: System,
        }
    }
}

impl<C> RefreshScheduler<C> {
    /// Replaces the default timing
    #[must_use]
    pub fn with_config(mut self, config: RefreshConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> RefreshScheduler<D> {
        RefreshScheduler {
            provider: self.provider,
            guard: self.guard,
            scopes: self.scopes,
            config: self.config,
            clock,
        }
    }
}

impl<C> RefreshScheduler<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Starts the refresh cycle in the background
    ///
    /// The first cycle runs immediately. Dropping or cancelling the returned
    /// handle stops the cycle.
    pub fn spawn(self) -> RefreshHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(cancel.clone()));
        RefreshHandle {
            cancel,
            join: Some(join),
        }
    }

    async fn run(self, cancel: CancellationToken) -> RefreshExit {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                cycle = self.run_cycle() => match cycle {
                    Cycle::Reschedule(next) => next,
                    Cycle::Stop(attempt) => {
                        tracing::info!(?attempt, "halting token refreshes");
                        return RefreshExit::InteractionRequired(attempt);
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wait_for(next) => {}
            }
        }

        tracing::debug!("token refresh cancelled");
        RefreshExit::Cancelled
    }

    async fn run_cycle(&self) -> Cycle {
        if self.provider.accounts().is_empty() {
            tracing::debug!("no account yet, deferring refresh");
            return Cycle::Reschedule(self.config.next_cycle(None, self.clock.now()));
        }

        tracing::debug!(scopes = %self.scopes, "running silent token cycle");
        match self.provider.acquire_silently(&self.scopes).await {
            Ok(token) => {
                let now = self.clock.now();
                let next = self.config.next_cycle(Some(token.expires_on()), now);
                tracing::debug!(
                    expiry = token.expires_on().0,
                    until_expired = token.until_expired_at(now).0,
                    ?next,
                    "silent renewal succeeded"
                );
                Cycle::Reschedule(next)
            }
            Err(AcquireError::InteractionRequired { code }) => {
                tracing::info!(%code, "silent renewal requires interaction");
                Cycle::Stop(
                    self.guard
                        .redirect_to_login(&self.provider, &self.scopes)
                        .await,
                )
            }
            Err(error) => {
                let next = self.config.next_cycle(None, self.clock.now());
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    ?next,
                    "silent renewal failed, will retry"
                );
                Cycle::Reschedule(next)
            }
        }
    }

    async fn wait_for(&self, next: NextCycle) {
        match next {
            NextCycle::After(d) => tokio::time::sleep(d).await,
            NextCycle::At(t) => {
                // The timer does not advance while the host is suspended, so wake up
                // periodically and compare against the clock instead of sleeping once.
                const HEARTBEAT: DurationSecs = DurationSecs(30);
                loop {
                    let now = self.clock.now();
                    if now >= t {
                        tracing::trace!("refresh due");
                        break;
                    }

                    let until_due = t - now;
                    let delay = until_due.min(HEARTBEAT);
                    tracing::trace!(
                        delay = delay.0,
                        until_due = until_due.0,
                        "refresh not yet due, sleeping…"
                    );
                    tokio::time::sleep(delay.into()).await;
                }
            }
        }
    }
}

/// A handle to a running refresh cycle
///
/// Dropping the handle cancels the cycle.
#[derive(Debug)]
pub struct RefreshHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<RefreshExit>>,
}

impl RefreshHandle {
    /// Cancels any pending refresh
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the refresh task has stopped
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the refresh task to stop
    ///
    /// Returns `None` if the task panicked.
    pub async fn join(mut self) -> Option<RefreshExit> {
        let join = self.join.take()?;
        match join.await {
            Ok(exit) => Some(exit),
            Err(err) => {
                if err.is_panic() {
                    tracing::error!("token refresh panicked!");
                } else if err.is_cancelled() {
                    tracing::info!("token refresh was aborted");
                }
                None
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
