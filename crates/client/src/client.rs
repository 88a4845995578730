//! Authenticated request pipeline.
//!
//! Every call gets the current access token attached. A 401 on a non-auth endpoint triggers
//! one shared refresh through the [`RefreshGate`]; the call is then replayed once with the new
//! token. When recovery is impossible the session is terminated.

use std::sync::Arc;

use calibra_core::session::{CredentialPair, LogoutReason, SessionEvent};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, Result};
use crate::refresh::{RefreshFailure, RefreshGate, RefreshTicket};
use crate::session::{LoginSurface, NoopLoginSurface};
use crate::transport::{ApiRequest, ApiResponse, Delivery, HttpTransport, Transport};

const UNAUTHORIZED: u16 = 401;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    gate: RefreshGate,
    login_surface: Arc<dyn LoginSurface>,
}

/// Cheap to clone; clones share credentials and the refresh gate.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<CredentialStore>,
    login_surface: Option<Arc<dyn LoginSurface>>,
}

impl ApiClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn login_surface(mut self, login_surface: Arc<dyn LoginSurface>) -> Self {
        self.login_surface = Some(login_surface);
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };
        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                credentials: self.credentials.unwrap_or_default(),
                gate: RefreshGate::new(),
                login_surface: self
                    .login_surface
                    .unwrap_or_else(|| Arc::new(NoopLoginSurface)),
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            transport: None,
            credentials: None,
            login_surface: None,
        }
    }

    /// HTTP client over `credentials` with default settings otherwise.
    pub fn connect(config: ClientConfig, credentials: CredentialStore) -> Result<Self> {
        Self::builder(config).credentials(credentials).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.gate.is_refreshing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.credentials.subscribe()
    }

    /// Sends a request through the pipeline and returns the raw response.
    ///
    /// Non-2xx answers other than a recoverable 401 are returned as responses, not errors.
    /// [`Delivery::BestEffort`] requests run on their own task and complete even if the
    /// returned future is dropped.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        if request.retried {
            return Err(ClientError::invalid_request(format!(
                "{} {} is already marked as retried",
                request.method, request.path
            )));
        }

        match request.delivery {
            Delivery::Standard => self.dispatch(request).await,
            Delivery::BestEffort => {
                let client = self.clone();
                tokio::spawn(async move { client.dispatch(request).await })
                    .await
                    .map_err(|err| {
                        ClientError::cancelled(format!("best-effort request task: {}", err))
                    })?
            }
        }
    }

    /// Sends a request and parses a successful JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.send(request).await?.into_result()?.json()
    }

    async fn dispatch(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        let sent_token = self.inner.credentials.access_token();
        let response = self
            .inner
            .transport
            .execute(&request, sent_token.as_deref())
            .await?;

        if response.status != UNAUTHORIZED
            || request.retried
            || self.inner.config.is_auth_endpoint(&request.path)
        {
            return Ok(response);
        }

        request.retried = true;
        let token = self
            .recover_authorization(sent_token.as_deref(), &response)
            .await?;
        debug!("[Auth] Replaying {} {}", request.method, request.path);
        self.inner.transport.execute(&request, Some(&token)).await
    }

    /// Produces a usable access token after `rejected` came back with a 401.
    async fn recover_authorization(
        &self,
        sent_token: Option<&str>,
        rejected: &ApiResponse,
    ) -> Result<String> {
        let lease = match self.inner.gate.begin_refresh() {
            RefreshTicket::Waiter(outcome) => {
                return match outcome.await {
                    Ok(Ok(token)) => Ok(token),
                    Ok(Err(failure)) => Err(ClientError::Refresh(failure)),
                    Err(_) => Err(ClientError::cancelled("token refresh dropped")),
                };
            }
            RefreshTicket::Initiator(lease) => lease,
        };

        // Rejected with a token that a finished refresh already replaced.
        if let Some(current) = self.inner.credentials.access_token() {
            if sent_token != Some(current.as_str()) {
                debug!("[Auth] Token changed since the request was sent, replaying");
                lease.complete_refresh(&current);
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.inner.credentials.refresh_token() else {
            warn!("[Auth] Access token rejected and no refresh token available");
            lease.fail_refresh(RefreshFailure::new(
                Some(UNAUTHORIZED),
                "no refresh token available",
            ));
            self.terminate_session(LogoutReason::TokenExpired, Some(rejected));
            return Err(ClientError::SessionTerminated(LogoutReason::TokenExpired));
        };

        match self.refresh_credentials(&refresh_token).await {
            Ok(pair) => {
                info!("[Auth] Access token refreshed");
                self.inner.credentials.replace(&pair);
                self.inner
                    .credentials
                    .publish(SessionEvent::TokenRefreshed { pair: pair.clone() });
                lease.complete_refresh(&pair.access_token);
                Ok(pair.access_token)
            }
            Err(err) => {
                error!("[Auth] Token refresh failed: {}", err);
                let failure = RefreshFailure::new(err.status_code(), err.to_string());
                lease.fail_refresh(failure.clone());
                self.terminate_session(LogoutReason::RefreshFailed, Some(rejected));
                Err(ClientError::Refresh(failure))
            }
        }
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// POST /auth/refresh
    async fn refresh_credentials(&self, refresh_token: &str) -> Result<CredentialPair> {
        let request = ApiRequest::post(self.inner.config.refresh_path.as_str())
            .json(json!({ "refresh_token": refresh_token }));
        let response = self
            .inner
            .transport
            .execute(&request, None)
            .await?
            .into_result()?;
        let tokens: TokenResponse = response.json()?;
        Ok(CredentialPair::new(
            tokens.access_token,
            tokens
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
        ))
    }

    /// Sign in and store the returned pair.
    ///
    /// POST /auth/login
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialPair> {
        let request = ApiRequest::post(self.inner.config.login_path.as_str())
            .json(json!({ "username": username, "password": password }));
        let response = self
            .inner
            .transport
            .execute(&request, None)
            .await?
            .into_result()?;
        let tokens: TokenResponse = response.json()?;
        let refresh_token = tokens
            .refresh_token
            .ok_or_else(|| ClientError::auth("login response has no refresh token"))?;
        let pair = CredentialPair::new(tokens.access_token, refresh_token);
        self.inner.credentials.replace(&pair);
        self.inner.credentials.set_username(username);
        info!("[Auth] Signed in as {}", username);
        Ok(pair)
    }

    pub fn logout(&self) {
        self.terminate_session(LogoutReason::UserLogout, None);
    }

    /// Where to go after the next login, if a terminated request asked for it.
    pub fn take_redirect_path(&self) -> Option<String> {
        self.inner.credentials.take_redirect_path()
    }

    fn terminate_session(&self, reason: LogoutReason, response: Option<&ApiResponse>) {
        if let Some(record_id) = response.and_then(ApiResponse::redirect_record_id) {
            let path = self.inner.config.redirect_path_for(record_id);
            debug!("[Auth] Saving post-login redirect {}", path);
            self.inner.credentials.set_redirect_path(&path);
        }

        if self.inner.credentials.clear() {
            warn!("[Auth] Session terminated: {}", reason);
            self.inner
                .credentials
                .publish(SessionEvent::LoggedOut { reason });
        }

        if !self.inner.login_surface.is_active() {
            self.inner.login_surface.redirect_to_login();
        }
    }
}
