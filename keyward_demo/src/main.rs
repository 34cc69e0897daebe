use std::{sync::Arc, time::Duration};

use clap::Parser;
use keyward::{
    provider::{Account, InMemoryIdentityProvider},
    AuthConfig, ClaimsSet, ClientId, RedirectGuard, RefreshConfig, RefreshScheduler, Scope,
    Scopes, SessionCoordinator, SessionStatus, TokenProvider,
};
use keyward_clock::DurationSecs;
use keyward_reqwest::AuthenticatedHttpClient;
use tokio::time;
use url::Url;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Opts {
    /// The application (client) ID of the registration
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The authority, including the tenant
    #[arg(long, env, default_value = "https://login.microsoftonline.com/common")]
    authority: Url,

    /// The redirect URI registered for the application
    #[arg(long, env, default_value = "http://localhost:5173/")]
    redirect_uri: Url,

    /// The scope identifying the protected API
    #[arg(short = 's', long, env)]
    api_scope: Scope,

    /// The base URL of the protected API
    #[arg(short = 'u', long, env, default_value = "http://localhost:3000")]
    api_base_url: Url,

    /// The URL the application was launched with, possibly carrying a login hint
    #[arg(long, env)]
    page_url: Option<Url>,

    /// A username with a cached session at the identity provider
    #[arg(short, long, env)]
    account: Option<String>,

    /// Roles granted to the cached account
    #[arg(long, env, value_delimiter = ',')]
    roles: Vec<String>,

    /// Lifetime of issued access tokens, in seconds
    #[arg(long, env, default_value_t = 300)]
    token_lifetime: u64,

    /// How long before expiry a token is renewed, in seconds
    #[arg(long, env, default_value_t = 60)]
    refresh_lead_time: u64,
}

impl Opts {
    fn auth_config(&self) -> color_eyre::Result<AuthConfig> {
        let config = AuthConfig {
            client_id: self.client_id.clone(),
            authority: self.authority.clone(),
            redirect_uri: self.redirect_uri.clone(),
            api_scope: self.api_scope.clone(),
            api_base_url: self.api_base_url.clone(),
            login_scopes: Scopes::openid_defaults(),
        };
        config.validate()?;
        Ok(config)
    }

    fn identity_provider(&self) -> InMemoryIdentityProvider {
        let identity = InMemoryIdentityProvider::new()
            .with_token_lifetime(DurationSecs(self.token_lifetime));

        match &self.account {
            Some(username) => {
                let claims = ClaimsSet::new()
                    .with("preferred_username", username.as_str())
                    .with("roles", self.roles.clone());
                let account = Account::new(username.as_str(), username.as_str());
                identity
                    .with_cached_account(account.clone(), claims.clone())
                    .with_popup_account(account, claims)
            }
            None => identity,
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = opts.auth_config()?;

    let provider = TokenProvider::new(Arc::new(opts.identity_provider()));
    let guard = RedirectGuard::new();

    let mut coordinator = SessionCoordinator::new(provider.clone(), guard.clone(), &config);
    if let Some(page_url) = opts.page_url.clone() {
        coordinator = coordinator.with_page_url(page_url);
    }
    let coordinator = Arc::new(coordinator);

    let mut watcher = coordinator.subscribe();
    tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let status = watcher.state().status();
            tracing::info!(?status, "session changed");
        }
    });

    coordinator.initialize().await;

    if coordinator.status() == SessionStatus::ReadyNoSession && opts.account.is_some() {
        coordinator.login().await;
    }

    match coordinator.account() {
        Some(account) => tracing::info!(
            account = account.display_name(),
            roles = ?coordinator.roles(),
            claims = ?coordinator.claims(),
            "signed in"
        ),
        None => tracing::warn!("nobody is signed in"),
    }

    let refresh = RefreshScheduler::new(provider.clone(), guard.clone(), config.api_scopes())
        .with_config(RefreshConfig {
            lead_time: DurationSecs(opts.refresh_lead_time),
            ..RefreshConfig::default()
        })
        .spawn();

    let response = coordinator.fetch_profile().await;
    match response.data() {
        Some(profile) => tracing::info!(%profile, "profile fetched through the coordinator"),
        None => tracing::warn!(
            error = %response.error().map(ToString::to_string).unwrap_or_default(),
            "profile unavailable through the coordinator"
        ),
    }

    let api = AuthenticatedHttpClient::new(provider, guard, &config)?;
    match api.profile().await {
        Ok(profile) => tracing::info!(%profile, "profile fetched through the API client"),
        Err(error) => tracing::warn!(
            error = (&error as &dyn std::error::Error),
            "profile unavailable through the API client"
        ),
    }

    let mut interval = time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                if refresh.is_finished() {
                    tracing::warn!("token refresh stopped, sign in again to resume");
                }
                tracing::debug!(status = ?coordinator.status(), "session heartbeat");
            }
        }
    }

    tracing::info!("shutting down");
    refresh.cancel();
    coordinator.shutdown();
    if let Some(exit) = refresh.join().await {
        tracing::debug!(?exit, "token refresh finished");
    }

    Ok(())
}
