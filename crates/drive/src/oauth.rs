use crate::auth::{ClientSecrets, StoredToken, TokenCache};
use crate::callback::CallbackListener;
use crate::error::{DriveError, DriveResult};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use oauth2::basic::{BasicClient, BasicTokenResponse, BasicTokenType};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
pub const STATE_BYTES: usize = 16;

pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn open_in_browser(url: &str) {
    if let Err(e) = open::that_detached(url) {
        tracing::warn!("Error opening URL in browser: {e}");
    }
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> DriveResult<String>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> DriveResult<StoredToken>;

    async fn refresh(&self, token: &StoredToken) -> DriveResult<StoredToken>;
}

pub struct OAuthClient {
    secrets: ClientSecrets,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(secrets: ClientSecrets) -> Self {
        Self {
            secrets,
            scopes: vec![DRIVE_SCOPE.to_string()],
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    fn client(&self, redirect_uri: Option<&str>) -> DriveResult<BasicClient> {
        let auth_url = AuthUrl::new(self.secrets.auth_url.clone())
            .map_err(|e| DriveError::Config(format!("invalid auth_uri: {e}")))?;
        let token_url = TokenUrl::new(self.secrets.token_url.clone())
            .map_err(|e| DriveError::Config(format!("invalid token_uri: {e}")))?;
        let mut client = BasicClient::new(
            ClientId::new(self.secrets.client_id.clone()),
            Some(ClientSecret::new(self.secrets.client_secret.clone())),
            auth_url,
            Some(token_url),
        );
        if let Some(uri) = redirect_uri {
            let redirect = RedirectUrl::new(uri.to_string())
                .map_err(|e| DriveError::Config(format!("invalid redirect uri {uri}: {e}")))?;
            client = client.set_redirect_uri(redirect);
        }
        Ok(client)
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> DriveResult<String> {
        let state = state.to_string();
        let (url, _) = self
            .client(Some(redirect_uri))?
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline")
            .url();
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> DriveResult<StoredToken> {
        let response = self
            .client(Some(redirect_uri))?
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                DriveError::Authorization(format!("Unable to retrieve token from web: {e}"))
            })?;
        Ok(stored_token(&response))
    }

    async fn refresh(&self, token: &StoredToken) -> DriveResult<StoredToken> {
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or_else(|| DriveError::Authorization("token has no refresh token".to_string()))?;
        let response = self
            .client(None)?
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(async_http_client)
            .await
            .map_err(|e| DriveError::Authorization(format!("Unable to refresh token: {e}")))?;

        let mut fresh = stored_token(&response);
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = token.refresh_token.clone();
        }
        Ok(fresh)
    }
}

fn stored_token(response: &BasicTokenResponse) -> StoredToken {
    let token_type = match response.token_type() {
        BasicTokenType::Bearer => "Bearer".to_string(),
        BasicTokenType::Mac => "MAC".to_string(),
        BasicTokenType::Extension(other) => other.clone(),
    };
    StoredToken {
        access_token: response.access_token().secret().clone(),
        token_type,
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expiry: response
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d),
    }
}

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub redirect_host: String,
    pub redirect_port: u16,
    pub callback_path: String,
    pub timeout: Duration,
    pub open_browser: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            redirect_host: "localhost".to_string(),
            redirect_port: 8000,
            callback_path: "/auth/google/callback".to_string(),
            timeout: Duration::from_secs(300),
            open_browser: true,
        }
    }
}

impl FlowSettings {
    pub fn redirect_uri(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.redirect_host, port, self.callback_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingRedirect,
    CodeReceived,
    Exchanged,
    Failed,
}

pub struct PendingAuthorization {
    pub auth_url: String,
    pub redirect_uri: String,
    listener: CallbackListener,
}

impl PendingAuthorization {
    pub fn listener_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

pub struct AuthorizationFlow<'a> {
    endpoint: &'a dyn TokenEndpoint,
    settings: FlowSettings,
    state: FlowState,
}

impl<'a> AuthorizationFlow<'a> {
    pub fn new(endpoint: &'a dyn TokenEndpoint, settings: FlowSettings) -> Self {
        Self {
            endpoint,
            settings,
            state: FlowState::Idle,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub async fn run(&mut self) -> DriveResult<StoredToken> {
        let pending = self.start().await?;
        if self.settings.open_browser {
            open_in_browser(&pending.auth_url);
        }
        println!(
            "Go to the following link in your browser to authorize access:\n{}",
            pending.auth_url
        );
        self.finish(pending).await
    }

    /// Binds the callback listener and builds the authorization URL.
    pub async fn start(&mut self) -> DriveResult<PendingAuthorization> {
        let oauth_state = generate_state();
        tracing::debug!("Generated oauth state");

        let listener = match CallbackListener::bind(
            self.settings.redirect_port,
            self.settings.callback_path.clone(),
            oauth_state.clone(),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => return Err(self.fail(e)),
        };
        self.transition(FlowState::AwaitingRedirect);

        // Port 0 binds an ephemeral port, advertise the real one.
        let redirect_uri = self.settings.redirect_uri(listener.local_addr().port());
        let auth_url = match self.endpoint.authorize_url(&oauth_state, &redirect_uri) {
            Ok(url) => url,
            Err(e) => return Err(self.fail(e)),
        };

        Ok(PendingAuthorization {
            auth_url,
            redirect_uri,
            listener,
        })
    }

    pub async fn finish(&mut self, pending: PendingAuthorization) -> DriveResult<StoredToken> {
        let PendingAuthorization {
            redirect_uri,
            listener,
            ..
        } = pending;

        let code = match listener.wait_for_code(self.settings.timeout).await {
            Ok(code) => code,
            Err(e) => return Err(self.fail(e)),
        };
        self.transition(FlowState::CodeReceived);

        match self.endpoint.exchange_code(&code, &redirect_uri).await {
            Ok(token) => {
                self.transition(FlowState::Exchanged);
                Ok(token)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn transition(&mut self, next: FlowState) {
        tracing::debug!(from = ?self.state, to = ?next, "Authorization flow transition");
        self.state = next;
    }

    fn fail(&mut self, error: DriveError) -> DriveError {
        self.transition(FlowState::Failed);
        match error {
            DriveError::Authorization(_) | DriveError::Timeout(_) | DriveError::Config(_) => error,
            other => DriveError::Authorization(other.to_string()),
        }
    }
}

/// Returns a usable token: the cached one, a refreshed one, or one obtained
/// through the browser flow. New tokens are written back to the cache.
pub async fn load_or_authorize(
    endpoint: &dyn TokenEndpoint,
    cache: &TokenCache,
    settings: FlowSettings,
) -> DriveResult<StoredToken> {
    if let Some(token) = cache.load() {
        if !token.is_expired() {
            return Ok(token);
        }
        if token.refresh_token.is_some() {
            match endpoint.refresh(&token).await {
                Ok(fresh) => {
                    tracing::info!("Refreshed expired access token");
                    cache.save(&fresh)?;
                    return Ok(fresh);
                }
                Err(e) => tracing::warn!("Token refresh failed, re-authorizing: {e}"),
            }
        }
    }

    tracing::info!("Request token from server.");
    let token = AuthorizationFlow::new(endpoint, settings).run().await?;
    cache.save(&token)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    struct FakeEndpoint {
        fail_exchange: bool,
        exchanges: AtomicU32,
        refreshes: AtomicU32,
    }

    impl FakeEndpoint {
        fn new() -> Self {
            Self {
                fail_exchange: false,
                exchanges: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        fn authorize_url(&self, state: &str, redirect_uri: &str) -> DriveResult<String> {
            let url = Url::parse_with_params(
                "https://accounts.example.com/auth",
                &[("state", state), ("redirect_uri", redirect_uri)],
            )
            .unwrap();
            Ok(url.to_string())
        }

        async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> DriveResult<StoredToken> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail_exchange {
                return Err(DriveError::Authorization("invalid_grant".to_string()));
            }
            Ok(StoredToken {
                access_token: format!("access-for-{code}"),
                token_type: "Bearer".to_string(),
                refresh_token: Some("refresh".to_string()),
                expiry: None,
            })
        }

        async fn refresh(&self, token: &StoredToken) -> DriveResult<StoredToken> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(StoredToken {
                access_token: "refreshed".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: token.refresh_token.clone(),
                expiry: Some(Utc::now() + chrono::Duration::hours(1)),
            })
        }
    }

    fn test_settings() -> FlowSettings {
        FlowSettings {
            redirect_host: "127.0.0.1".to_string(),
            redirect_port: 0,
            timeout: Duration::from_secs(5),
            open_browser: false,
            ..FlowSettings::default()
        }
    }

    fn query_param(url: &str, key: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn states_are_unique_and_carry_enough_entropy() {
        let states: HashSet<String> = (0..1000).map(|_| generate_state()).collect();
        assert_eq!(states.len(), 1000);
        for state in &states {
            let decoded = URL_SAFE_NO_PAD.decode(state).unwrap();
            assert!(decoded.len() >= 16);
            assert!(state
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn authorize_url_requests_offline_access() {
        let secrets = ClientSecrets {
            client_id: "client-1".to_string(),
            client_secret: "secret".to_string(),
            auth_url: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            redirect_uris: Vec::new(),
        };
        let url = OAuthClient::new(secrets)
            .authorize_url("abc123", "http://localhost:8000/auth/google/callback")
            .unwrap();

        assert_eq!(query_param(&url, "state"), "abc123");
        assert_eq!(query_param(&url, "access_type"), "offline");
        assert_eq!(query_param(&url, "client_id"), "client-1");
        assert_eq!(query_param(&url, "response_type"), "code");
        assert_eq!(query_param(&url, "scope"), DRIVE_SCOPE);
        assert_eq!(
            query_param(&url, "redirect_uri"),
            "http://localhost:8000/auth/google/callback"
        );
    }

    #[tokio::test]
    async fn exchange_code_posts_to_token_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded("code".into(), "XYZ".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-1","token_type":"Bearer","expires_in":3599,"refresh_token":"rt-1"}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(ClientSecrets {
            client_id: "client-1".to_string(),
            client_secret: "secret".to_string(),
            auth_url: format!("{}/auth", server.url()),
            token_url: format!("{}/token", server.url()),
            redirect_uris: Vec::new(),
        });
        let token = client
            .exchange_code("XYZ", "http://localhost:8000/auth/google/callback")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert!(!token.is_expired());
    }

    #[tokio::test]
    async fn flow_delivers_callback_code_to_exchange() {
        let endpoint = FakeEndpoint::new();
        let mut flow = AuthorizationFlow::new(&endpoint, test_settings());
        assert_eq!(flow.state(), FlowState::Idle);

        let pending = flow.start().await.unwrap();
        assert_eq!(flow.state(), FlowState::AwaitingRedirect);
        assert_eq!(
            query_param(&pending.auth_url, "redirect_uri"),
            pending.redirect_uri
        );

        let state = query_param(&pending.auth_url, "state");
        let callback = format!("{}?state={state}&code=XYZ", pending.redirect_uri);
        let response = reqwest::get(callback).await.unwrap();
        assert_eq!(response.status(), 200);

        let token = flow.finish(pending).await.unwrap();
        assert_eq!(token.access_token, "access-for-XYZ");
        assert_eq!(flow.state(), FlowState::Exchanged);
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forged_callback_never_reaches_exchange() {
        let endpoint = FakeEndpoint::new();
        let mut flow = AuthorizationFlow::new(
            &endpoint,
            FlowSettings {
                timeout: Duration::from_millis(300),
                ..test_settings()
            },
        );

        let pending = flow.start().await.unwrap();
        let callback = format!("{}?state=wrong&code=XYZ", pending.redirect_uri);
        let response = reqwest::get(callback).await.unwrap();
        assert_eq!(response.status(), 500);

        let err = flow.finish(pending).await.unwrap_err();
        assert!(matches!(err, DriveError::Timeout(_)));
        assert_eq!(flow.state(), FlowState::Failed);
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_exchange_fails_the_flow() {
        let endpoint = FakeEndpoint {
            fail_exchange: true,
            ..FakeEndpoint::new()
        };
        let mut flow = AuthorizationFlow::new(&endpoint, test_settings());

        let pending = flow.start().await.unwrap();
        let state = query_param(&pending.auth_url, "state");
        reqwest::get(format!("{}?state={state}&code=XYZ", pending.redirect_uri))
            .await
            .unwrap();

        let err = flow.finish(pending).await.unwrap_err();
        assert!(matches!(err, DriveError::Authorization(_)));
        assert_eq!(flow.state(), FlowState::Failed);
    }

    #[tokio::test]
    async fn cached_token_skips_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("token.json"));
        let cached = StoredToken {
            access_token: "cached".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expiry: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        cache.save(&cached).unwrap();

        let endpoint = FakeEndpoint::new();
        let token = load_or_authorize(&endpoint, &cache, test_settings())
            .await
            .unwrap();

        assert_eq!(token, cached);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("token.json"));
        cache
            .save(&StoredToken {
                access_token: "stale".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: Some("rt".to_string()),
                expiry: Some(Utc::now() - chrono::Duration::hours(1)),
            })
            .unwrap();

        let endpoint = FakeEndpoint::new();
        let token = load_or_authorize(&endpoint, &cache, test_settings())
            .await
            .unwrap();

        assert_eq!(token.access_token, "refreshed");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
        assert_eq!(cache.load(), Some(token));
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }
}
