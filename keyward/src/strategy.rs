//! Ordered fallback between token acquisition strategies

use std::fmt;

use crate::{
    provider::{Account, AuthenticationResult},
    AcquireError, Scopes, TokenProvider,
};

/// A way of obtaining a token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Renew from the cached session without user interaction
    Silent,
    /// Ask the user through a popup window
    Popup,
}

/// When a failed step should hand over to the next one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fallthrough {
    /// Continue after any failure
    OnAnyFailure,
    /// Continue only when the failure says interaction is required
    OnInteractionRequired,
}

#[derive(Clone, Copy, Debug)]
struct Step {
    strategy: Strategy,
    fallthrough: Fallthrough,
}

/// An ordered list of strategies tried one after another
#[derive(Clone, Debug, Default)]
pub struct AcquisitionChain {
    steps: Vec<Step>,
}

/// The outcome of a single failed step
#[derive(Clone, Debug)]
pub struct StepFailure {
    /// The strategy that was tried
    pub strategy: Strategy,
    /// Why it failed
    pub error: AcquireError,
}

/// Every strategy in the chain failed, or the chain stopped early
#[derive(Clone, Debug)]
pub struct ChainFailure {
    attempts: Vec<StepFailure>,
}

impl ChainFailure {
    /// The failed steps, in the order they were tried
    pub fn attempts(&self) -> &[StepFailure] {
        &self.attempts
    }
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return f.write_str("no acquisition strategy configured");
        }

        for (idx, attempt) in self.attempts.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{:?}: {}", attempt.strategy, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChainFailure {}

impl AcquisitionChain {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a strategy to the chain
    ///
    /// `fallthrough` decides whether a failure of this step moves on to the
    /// next step or ends the chain. It has no effect on the last step.
    #[must_use]
    pub fn then(mut self, strategy: Strategy, fallthrough: Fallthrough) -> Self {
        self.steps.push(Step {
            strategy,
            fallthrough,
        });
        self
    }

    /// Silent acquisition, falling back to a popup on any failure
    pub fn silent_then_popup() -> Self {
        Self::new()
            .then(Strategy::Silent, Fallthrough::OnAnyFailure)
            .then(Strategy::Popup, Fallthrough::OnAnyFailure)
    }

    /// Silent acquisition, falling back to a popup only when interaction is required
    pub fn silent_then_popup_on_interaction() -> Self {
        Self::new()
            .then(Strategy::Silent, Fallthrough::OnInteractionRequired)
            .then(Strategy::Popup, Fallthrough::OnAnyFailure)
    }

    /// Runs the chain, returning the first successful result
    pub async fn run(
        &self,
        provider: &TokenProvider,
        scopes: &Scopes,
        account: &Account,
    ) -> Result<AuthenticationResult, ChainFailure> {
        let mut attempts = Vec::new();

        for step in &self.steps {
            let result = match step.strategy {
                Strategy::Silent => provider
                    .acquire_silently_for(scopes, account)
                    .await
                    .map(AuthenticationResult::from),
                Strategy::Popup => provider.acquire_with_popup(scopes).await,
            };

            match result {
                Ok(result) => {
                    tracing::debug!(strategy = ?step.strategy, "token acquired");
                    return Ok(result);
                }
                Err(error) => {
                    let proceed = match step.fallthrough {
                        Fallthrough::OnAnyFailure => true,
                        Fallthrough::OnInteractionRequired => error.is_interaction_required(),
                    };

                    if error.is_interaction_required() {
                        tracing::info!(strategy = ?step.strategy, "interaction required");
                    } else {
                        tracing::debug!(
                            strategy = ?step.strategy,
                            error = (&error as &dyn std::error::Error),
                            "acquisition step failed"
                        );
                    }

                    attempts.push(StepFailure {
                        strategy: step.strategy,
                        error,
                    });

                    if !proceed {
                        break;
                    }
                }
            }
        }

        Err(ChainFailure { attempts })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        provider::{InMemoryIdentityProvider, ProviderError},
        ClaimsSet,
    };

    fn ada() -> Account {
        Account::new("ada", "ada@example.com")
    }

    fn setup() -> (Arc<InMemoryIdentityProvider>, TokenProvider) {
        let identity = Arc::new(
            InMemoryIdentityProvider::new()
                .with_cached_account(ada(), ClaimsSet::new())
                .with_popup_account(ada(), ClaimsSet::new()),
        );
        let provider = TokenProvider::new(identity.clone());
        (identity, provider)
    }

    #[tokio::test]
    async fn silent_success_skips_the_popup() {
        let (identity, provider) = setup();

        let result = AcquisitionChain::silent_then_popup()
            .run(&provider, &Scopes::openid_defaults(), &ada())
            .await
            .unwrap();

        assert!(result.access_token.is_some());
        assert_eq!(identity.popup_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_falls_through_when_allowed() {
        let (identity, provider) = setup();
        identity.fail_next_silent(ProviderError::Transient("timeout".into()));

        let result = AcquisitionChain::silent_then_popup()
            .run(&provider, &Scopes::openid_defaults(), &ada())
            .await;

        assert!(result.is_ok());
        assert_eq!(identity.popup_calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_stops_an_interaction_only_chain() {
        let (identity, provider) = setup();
        identity.fail_next_silent(ProviderError::Transient("timeout".into()));

        let failure = AcquisitionChain::silent_then_popup_on_interaction()
            .run(&provider, &Scopes::openid_defaults(), &ada())
            .await
            .unwrap_err();

        assert_eq!(failure.attempts().len(), 1);
        assert_eq!(failure.attempts()[0].strategy, Strategy::Silent);
        assert_eq!(identity.popup_calls(), 0);
    }

    #[tokio::test]
    async fn reports_every_failed_step() {
        let (identity, provider) = setup();
        identity.fail_next_silent(ProviderError::interaction_required("login_required"));
        identity.fail_next_popup(ProviderError::Transient("popup blocked".into()));

        let failure = AcquisitionChain::silent_then_popup_on_interaction()
            .run(&provider, &Scopes::openid_defaults(), &ada())
            .await
            .unwrap_err();

        let strategies: Vec<_> = failure.attempts().iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, vec![Strategy::Silent, Strategy::Popup]);
        assert!(failure.to_string().starts_with("Silent: user interaction required"));
    }
}
