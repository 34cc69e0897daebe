//! Middleware to automatically attach session access tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`], include the [`AccessTokenMiddleware`]
//! in the middleware stack to obtain a token from a [`TokenProvider`] just
//! before each outbound request is sent.
//!
//! If the API rejects the token with `401 Unauthorized`, the request is sent
//! once more with a freshly acquired token. A second rejection is handed back
//! to the caller. Whenever the provider reports that the user must sign in
//! again, the middleware starts the shared, guarded sign-in redirect and
//! fails the request rather than sending it without credentials.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use std::sync::Arc;
//!
//! use keyward::{provider::InMemoryIdentityProvider, RedirectGuard, Scopes, TokenProvider};
//! use keyward_reqwest::{AccessTokenMiddleware, OriginMatch};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let provider = TokenProvider::new(Arc::new(InMemoryIdentityProvider::new()));
//! let api = "https://api.example.com".parse().unwrap();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(
//!         AccessTokenMiddleware::new(
//!             provider,
//!             RedirectGuard::new(),
//!             Scopes::single("api://backend/access_as_user"),
//!         )
//!         .with_predicate(OriginMatch::new(&api)),
//!     )
//!     .build();
//! # drop(client);
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, time::Duration};

use bytes::{BufMut, BytesMut};
use keyward::{AcquireError, AuthConfig, RedirectAttempt, RedirectGuard, Scopes, TokenProvider};
use keyward_clock::Clock;
use predicates::{constant::BooleanPredicate, prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{ClientWithMiddleware, Middleware, Next, Result};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::{Origin, Url};

/// How long a request to the protected API may take
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A middleware that injects an access token into outgoing requests
#[derive(Clone, Debug)]
pub struct AccessTokenMiddleware<P> {
    provider: TokenProvider,
    guard: RedirectGuard,
    scopes: Scopes,
    predicate: P,
}

/// The middleware could not authorize a request, so it was not sent
#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// A sign-in redirect is already underway
    #[error("a sign-in redirect is already in progress")]
    RedirectInProgress,
    /// The user must sign in again
    #[error("user interaction required, {}", describe_redirect(.0))]
    InteractionRequired(RedirectAttempt),
    /// The token could not be obtained
    #[error("unable to acquire an access token")]
    Acquire(#[source] AcquireError),
    /// The token cannot be carried in a header
    #[error("access token contains bytes not valid in a header")]
    InvalidToken,
}

fn describe_redirect(attempt: &RedirectAttempt) -> &'static str {
    match attempt {
        RedirectAttempt::Issued => "redirecting to sign in",
        RedirectAttempt::AlreadyInProgress => "sign-in redirect already underway",
        RedirectAttempt::Failed(_) => "sign-in redirect could not be started",
    }
}

impl AccessTokenMiddleware<BooleanPredicate> {
    /// Construct a new middleware acquiring tokens for `scopes`
    ///
    /// By default, this middleware attaches a token to every request. To
    /// limit which requests receive a token, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: TokenProvider, guard: RedirectGuard, scopes: Scopes) -> Self {
        Self {
            provider,
            guard,
            scopes,
            predicate: predicate::always(),
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<P> {
        AccessTokenMiddleware {
            provider: self.provider,
            guard: self.guard,
            scopes: self.scopes,
            predicate,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    async fn authorize(&self) -> std::result::Result<header::HeaderValue, AuthorizationError> {
        if self.guard.is_engaged() {
            tracing::debug!("sign-in redirect in progress, not sending request");
            return Err(AuthorizationError::RedirectInProgress);
        }

        let token = match self.provider.acquire_silently(&self.scopes).await {
            Ok(token) => token,
            Err(error) if error.is_interaction_required() => {
                let attempt = self
                    .guard
                    .redirect_to_login(&self.provider, &self.scopes)
                    .await;
                return Err(AuthorizationError::InteractionRequired(attempt));
            }
            Err(error) => return Err(AuthorizationError::Acquire(error)),
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            let now = keyward_clock::System.now();

            tracing::trace!(
                token.status = ?token.token_status_at(now),
                token.expiry = token.expires_on().0,
                token.until_expired = token.until_expired_at(now).0,
                "obtained access token"
            );
        }

        let access_token = token.access_token().as_str();
        let mut header_value = BytesMut::with_capacity(access_token.len() + 7);
        header_value.put_slice(b"Bearer ");
        header_value.put_slice(access_token.as_bytes());
        let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
            .map_err(|_| AuthorizationError::InvalidToken)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let replay = req.try_clone();

        let authorization = self
            .authorize()
            .await
            .map_err(reqwest_middleware::Error::middleware)?;
        req.headers_mut()
            .insert(header::AUTHORIZATION, authorization);

        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            tracing::debug!("access token rejected, but request body cannot be replayed");
            return Ok(response);
        };

        tracing::info!(url = %replay.url(), "access token rejected, retrying with a fresh token");
        let authorization = self
            .authorize()
            .await
            .map_err(reqwest_middleware::Error::middleware)?;
        replay
            .headers_mut()
            .insert(header::AUTHORIZATION, authorization);

        next.run(replay, extensions).await
    }
}

/// Only attach an access token if the request is sent to the given origin
///
/// Scheme, host and port must all match.
#[derive(Clone, Debug)]
pub struct OriginMatch {
    origin: Origin,
}

impl OriginMatch {
    /// Construct a new predicate matching the origin of `url`
    pub fn new(url: &Url) -> Self {
        Self {
            origin: url.origin(),
        }
    }
}

impl Predicate<Request> for OriginMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().origin() == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result == expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for OriginMatch {}
impl fmt::Display for OriginMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("origin == ")?;
        f.write_str(&self.origin.ascii_serialization())
    }
}

/// A failed call to the protected API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The path could not be resolved against the base URL
    #[error("invalid API path")]
    Path(#[from] url::ParseError),
    /// The request could not be sent or was not authorized
    #[error("network error")]
    Request(#[from] reqwest_middleware::Error),
    /// The API answered with a non-success status
    #[error("API error {}", .0.as_u16())]
    Status(StatusCode),
    /// The response body was not the expected JSON
    #[error("unreadable API response")]
    Body(#[source] reqwest::Error),
    /// The HTTP client could not be constructed
    #[error("unable to build HTTP client")]
    Client(#[source] reqwest::Error),
}

impl ApiError {
    /// The reason the middleware refused to send the request, if that is why it failed
    pub fn authorization(&self) -> Option<&AuthorizationError> {
        match self {
            Self::Request(reqwest_middleware::Error::Middleware(err)) => err.downcast_ref(),
            _ => None,
        }
    }
}

/// An HTTP client for the protected API that authorizes every call
#[derive(Clone, Debug)]
pub struct AuthenticatedHttpClient {
    client: ClientWithMiddleware,
    base_url: Url,
}

impl AuthenticatedHttpClient {
    /// Constructs a client for the API named in `config`
    ///
    /// Requests time out after [`REQUEST_TIMEOUT`]. Tokens are only attached
    /// to requests sent to the API's origin.
    pub fn new(
        provider: TokenProvider,
        guard: RedirectGuard,
        config: &AuthConfig,
    ) -> std::result::Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;

        let middleware = AccessTokenMiddleware::new(provider, guard, config.api_scopes())
            .with_predicate(OriginMatch::new(&config.api_base_url));

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(middleware)
            .build();

        Ok(Self::from_client(client, config.api_base_url.clone()))
    }

    /// Wraps a client that already carries an [`AccessTokenMiddleware`]
    pub fn from_client(client: ClientWithMiddleware, base_url: Url) -> Self {
        Self { client, base_url }
    }

    /// The base URL that request paths are resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches and deserializes a JSON document
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, ApiError> {
        let url = self.base_url.join(path)?;

        let response = self
            .client
            .get(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), %url, "API returned an error status");
            return Err(ApiError::Status(status));
        }

        response.json().await.map_err(ApiError::Body)
    }

    /// Fetches the signed-in user's profile
    pub async fn profile(&self) -> std::result::Result<serde_json::Value, ApiError> {
        self.get_json("/api/profile").await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use keyward::{
        provider::{Account, InMemoryIdentityProvider, Prompt, ProviderError},
        ClaimsSet,
    };
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use serde_json::{json, Value};

    use super::*;

    const API: &str = "https://api.example.com";
    const API_SCOPE: &str = "api://backend/access_as_user";

    type Hook = Box<dyn Fn(usize) + Send + Sync>;

    /// Stands in for the API, answering with scripted statuses
    struct Backend {
        statuses: Mutex<Vec<StatusCode>>,
        seen: Mutex<Vec<Option<String>>>,
        calls: AtomicUsize,
        on_request: Option<Hook>,
    }

    impl Backend {
        fn answering(statuses: &[StatusCode]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                on_request: None,
            }
        }

        fn on_request(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
            self.on_request = Some(Box::new(hook));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Acquire)
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Backend {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .map(|v| v.to_str().expect("authorization header was not valid UTF-8").to_owned());
            self.seen.lock().unwrap().push(authorization);
            let call = self.calls.fetch_add(1, Ordering::AcqRel);

            if let Some(hook) = &self.on_request {
                hook(call);
            }

            let status = self.statuses.lock().unwrap().pop().unwrap_or(StatusCode::OK);
            Ok(http::Response::builder()
                .status(status)
                .body(r#"{"displayName":"Ada"}"#)
                .unwrap()
                .into())
        }
    }

    fn ada() -> Account {
        Account::new("ada", "ada@example.com")
    }

    struct Fixture {
        identity: Arc<InMemoryIdentityProvider>,
        guard: RedirectGuard,
        backend: Arc<Backend>,
        client: AuthenticatedHttpClient,
    }

    fn fixture(backend: Backend) -> Fixture {
        let identity =
            Arc::new(InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()));
        let guard = RedirectGuard::new();
        let backend = Arc::new(backend);
        let base_url: Url = API.parse().unwrap();

        let middleware = AccessTokenMiddleware::new(
            TokenProvider::new(identity.clone()),
            guard.clone(),
            Scopes::single(API_SCOPE),
        )
        .with_predicate(OriginMatch::new(&base_url));

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(backend.clone())
            .build();

        Fixture {
            identity,
            guard,
            backend,
            client: AuthenticatedHttpClient::from_client(client, base_url),
        }
    }

    fn is_bearer(authorization: &Option<String>) -> bool {
        authorization
            .as_deref()
            .map_or(false, |v| v.starts_with("Bearer in-memory-ada-"))
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_attaches_access_token() {
            let f = fixture(Backend::answering(&[StatusCode::OK]));

            let profile = f.client.profile().await.unwrap();

            assert_eq!(profile, json!({ "displayName": "Ada" }));
            assert_eq!(f.backend.calls(), 1);
            assert!(is_bearer(&f.backend.seen()[0]));
        }

        #[tokio::test]
        async fn non_success_status_is_an_api_error() {
            let f = fixture(Backend::answering(&[StatusCode::INTERNAL_SERVER_ERROR]));

            let err = f.client.profile().await.unwrap_err();

            assert!(matches!(err, ApiError::Status(s) if s == StatusCode::INTERNAL_SERVER_ERROR));
            assert_eq!(err.to_string(), "API error 500");
        }

        #[tokio::test]
        async fn requests_to_other_origins_are_sent_without_a_token() {
            let f = fixture(Backend::answering(&[StatusCode::OK]));

            let result = f
                .client
                .get_json::<Value>("https://elsewhere.example.com/status")
                .await;

            assert!(result.is_ok());
            assert_eq!(f.backend.seen(), vec![None]);
            assert_eq!(f.identity.silent_calls(), 0);
        }
    }

    mod when_request_already_contains_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_replace_it() {
            let backend = Arc::new(Backend::answering(&[StatusCode::OK]));
            let identity = Arc::new(
                InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()),
            );
            let client = ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(
                    TokenProvider::new(identity.clone()),
                    RedirectGuard::new(),
                    Scopes::single(API_SCOPE),
                ))
                .with_arc(backend.clone())
                .build();

            let resp = client
                .get(API)
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.seen(), vec![Some("Bearer overridden!".to_owned())]);
            assert_eq!(identity.silent_calls(), 0);
        }
    }

    mod when_the_token_is_rejected {
        use super::*;

        #[tokio::test]
        async fn request_is_retried_once_with_a_fresh_token() {
            let f = fixture(Backend::answering(&[StatusCode::UNAUTHORIZED, StatusCode::OK]));

            let profile = f.client.profile().await;

            assert!(profile.is_ok());
            let seen = f.backend.seen();
            assert_eq!(seen.len(), 2);
            assert!(seen.iter().all(is_bearer));
            assert_ne!(seen[0], seen[1]);
            assert_eq!(f.identity.silent_calls(), 2);
        }

        #[tokio::test]
        async fn a_second_rejection_is_returned_to_the_caller() {
            let f = fixture(Backend::answering(&[
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
                StatusCode::OK,
            ]));

            let err = f.client.profile().await.unwrap_err();

            assert!(matches!(err, ApiError::Status(s) if s == StatusCode::UNAUTHORIZED));
            assert_eq!(f.backend.calls(), 2);
            assert_eq!(f.identity.silent_calls(), 2);
        }

        #[tokio::test]
        async fn interaction_required_on_reacquire_redirects_and_fails() {
            let identity =
                Arc::new(InMemoryIdentityProvider::new().with_cached_account(ada(), ClaimsSet::new()));
            let hook_identity = identity.clone();
            let backend = Arc::new(
                Backend::answering(&[StatusCode::UNAUTHORIZED]).on_request(move |_| {
                    hook_identity.fail_next_silent(ProviderError::interaction_required("login_required"));
                }),
            );
            let guard = RedirectGuard::new();
            let client = ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(
                    TokenProvider::new(identity.clone()),
                    guard.clone(),
                    Scopes::single(API_SCOPE),
                ))
                .with_arc(backend.clone())
                .build();
            let client = AuthenticatedHttpClient::from_client(client, API.parse().unwrap());

            let err = client.profile().await.unwrap_err();

            assert!(matches!(
                err.authorization(),
                Some(AuthorizationError::InteractionRequired(RedirectAttempt::Issued))
            ));
            assert_eq!(backend.calls(), 1);
            assert_eq!(identity.redirect_requests().len(), 1);
            assert!(guard.is_engaged());
        }
    }

    mod when_interaction_is_required {
        use super::*;

        #[tokio::test]
        async fn request_is_not_sent_and_a_single_redirect_starts() {
            let f = fixture(Backend::answering(&[StatusCode::OK]));
            f.identity
                .fail_next_silent(ProviderError::interaction_required("consent_required"));
            f.identity
                .fail_next_silent(ProviderError::interaction_required("consent_required"));

            let first = f.client.profile().await.unwrap_err();
            let second = f.client.profile().await.unwrap_err();

            assert!(matches!(
                first.authorization(),
                Some(AuthorizationError::InteractionRequired(RedirectAttempt::Issued))
            ));
            assert!(matches!(
                second.authorization(),
                Some(AuthorizationError::RedirectInProgress)
            ));
            assert_eq!(f.backend.calls(), 0);

            let redirects = f.identity.redirect_requests();
            assert_eq!(redirects.len(), 1);
            assert_eq!(redirects[0].prompt, Prompt::SelectAccount);
            assert_eq!(redirects[0].scopes, Scopes::single(API_SCOPE));
        }

        #[tokio::test]
        async fn transient_failures_do_not_redirect() {
            let f = fixture(Backend::answering(&[StatusCode::OK]));
            f.identity
                .fail_next_silent(ProviderError::Transient("timeout".into()));

            let err = f.client.profile().await.unwrap_err();

            assert!(matches!(
                err.authorization(),
                Some(AuthorizationError::Acquire(AcquireError::Transient(_)))
            ));
            assert_eq!(f.backend.calls(), 0);
            assert!(!f.guard.is_engaged());
            assert!(f.identity.redirect_requests().is_empty());
        }
    }

    mod origin_match_predicate {
        use super::*;

        fn request(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        fn predicate() -> OriginMatch {
            OriginMatch::new(&API.parse().unwrap())
        }

        #[test]
        fn matches_when_request_has_same_origin() {
            let binding = predicate();
            let result = dbg!(binding.find_case(true, &request("https://api.example.com/api/profile")));
            assert!(result.is_some())
        }

        #[test]
        fn does_not_match_a_different_scheme() {
            assert!(!predicate().eval(&request("http://api.example.com/api/profile")));
        }

        #[test]
        fn does_not_match_a_different_port() {
            assert!(!predicate().eval(&request("https://api.example.com:8443/api/profile")));
        }

        #[test]
        fn displays_the_origin() {
            assert_eq!(predicate().to_string(), "origin == https://api.example.com");
        }
    }
}
