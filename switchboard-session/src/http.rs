//! HTTP clients for the identity provider and tenant management service

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use switchboard_config::IdentityConfig;
use switchboard_rbac::{Tenant, TenantId};

use crate::credential::{BearerToken, Credential};
use crate::error::{IdentityError, IdentityResult};
use crate::provider::{IdentityProvider, TenantService};
use crate::wire::{
    CreateTenantRequest, LoginResponse, MoveTenantRequest, RefreshResponse, SwitchTenantResponse, TenantPatch,
};

/// Error code sent with a 403 for a suspended tenant
pub const CODE_TENANT_SUSPENDED: &str = "TENANT_SUSPENDED";

/// Error code sent when the credential has expired
pub const CODE_TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";

/// Non-standard status some gateways use for expired sessions
const STATUS_SESSION_EXPIRED: u16 = 419;

/// Error body returned by both services
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Map a failed response onto an [`IdentityError`].
///
/// `login_route` distinguishes a rejected password from a rejected credential.
pub fn classify(status: u16, body: &ErrorBody, login_route: bool, retry_after_secs: Option<u64>) -> IdentityError {
    let code = body.code.as_deref();
    let message = body.message.clone().unwrap_or_default();

    if code == Some(CODE_TOKEN_EXPIRED) || status == STATUS_SESSION_EXPIRED {
        return IdentityError::ExpiredCredential;
    }
    if code == Some(CODE_TENANT_SUSPENDED) {
        return IdentityError::TenantSuspended;
    }

    match status {
        401 if login_route => IdentityError::InvalidCredentials,
        401 => IdentityError::Unauthorized,
        403 => IdentityError::Forbidden(message),
        404 => IdentityError::NotFound(message),
        429 => IdentityError::RateLimited { retry_after_secs },
        502..=504 => IdentityError::ServiceUnavailable,
        _ => IdentityError::Unexpected { status, message },
    }
}

fn transport_error(err: reqwest::Error) -> IdentityError {
    if err.is_decode() {
        IdentityError::InvalidResponse(err.to_string())
    } else {
        IdentityError::Network(err.to_string())
    }
}

/// Shared request plumbing
#[derive(Debug, Clone)]
struct ApiClient {
    client: Client,
    config: IdentityConfig,
}

impl ApiClient {
    fn new(config: IdentityConfig) -> IdentityResult<Self> {
        debug!(base_url = %config.base_url, timeout_secs = config.timeout.as_secs(), "Creating identity API client");
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(transport_error)?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        self.config.endpoint(path)
    }

    fn tenant_url(&self, tenant_id: &TenantId, suffix: &str) -> String {
        self.url(&format!("{}/{}{}", self.config.tenants_path, tenant_id, suffix))
    }

    fn authed(&self, request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        request.bearer_auth(credential.token.expose())
    }

    async fn execute(&self, request: RequestBuilder, login_route: bool) -> IdentityResult<reqwest::Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        let err = classify(status.as_u16(), &body, login_route, retry_after_secs);
        warn!(status = status.as_u16(), code = ?body.code, "Identity service request failed");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, login_route: bool) -> IdentityResult<T> {
        let response = self.execute(request, login_route).await?;
        response.json::<T>().await.map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }

    async fn send_empty(&self, request: RequestBuilder) -> IdentityResult<()> {
        let response = self.execute(request, false).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        // Body is ignored; only the status matters
        let _ = response.bytes().await;
        Ok(())
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// [`IdentityProvider`] speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    api: ApiClient,
}

impl HttpIdentityProvider {
    pub fn new(config: IdentityConfig) -> IdentityResult<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn login(&self, principal: &str, secret: &SecretString) -> IdentityResult<LoginResponse> {
        debug!(principal = %principal, "Logging in");
        let body = LoginRequest {
            email: principal,
            password: secret.expose_secret().as_str(),
        };
        let request = self.api.client.post(self.api.url(&self.api.config.login_path)).json(&body);
        self.api.send_json(request, true).await
    }

    async fn current_session(&self, credential: &Credential) -> IdentityResult<LoginResponse> {
        let request = self
            .api
            .authed(self.api.client.get(self.api.url(&self.api.config.session_path)), credential);
        self.api.send_json(request, false).await
    }

    async fn refresh(&self, credential: &Credential) -> IdentityResult<BearerToken> {
        let request = self
            .api
            .authed(self.api.client.post(self.api.url(&self.api.config.refresh_path)), credential);
        let response: RefreshResponse = self.api.send_json(request, false).await?;
        Ok(response.token)
    }

    async fn logout(&self, credential: &Credential) -> IdentityResult<()> {
        let request = self
            .api
            .authed(self.api.client.post(self.api.url(&self.api.config.logout_path)), credential);
        self.api.send_empty(request).await
    }
}

/// [`TenantService`] speaking JSON over HTTP
#[derive(Debug, Clone)]
pub struct HttpTenantService {
    api: ApiClient,
}

impl HttpTenantService {
    pub fn new(config: IdentityConfig) -> IdentityResult<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }
}

#[async_trait]
impl TenantService for HttpTenantService {
    async fn switch_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
    ) -> IdentityResult<SwitchTenantResponse> {
        let url = self.api.tenant_url(tenant_id, "/switch");
        let request = self.api.authed(self.api.client.post(url), credential);
        self.api.send_json(request, false).await
    }

    async fn create_tenant(
        &self,
        credential: &Credential,
        request: &CreateTenantRequest,
    ) -> IdentityResult<Tenant> {
        let url = self.api.url(&self.api.config.tenants_path);
        let request = self.api.authed(self.api.client.post(url), credential).json(request);
        self.api.send_json(request, false).await
    }

    async fn update_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        patch: &TenantPatch,
    ) -> IdentityResult<Tenant> {
        let url = self.api.tenant_url(tenant_id, "");
        let request = self.api.authed(self.api.client.patch(url), credential).json(patch);
        self.api.send_json(request, false).await
    }

    async fn delete_tenant(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<()> {
        let url = self.api.tenant_url(tenant_id, "");
        let request = self.api.authed(self.api.client.delete(url), credential);
        self.api.send_empty(request).await
    }

    async fn move_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        new_parent: Option<&TenantId>,
    ) -> IdentityResult<Vec<Tenant>> {
        let url = self.api.tenant_url(tenant_id, "/move");
        let body = MoveTenantRequest {
            new_parent_id: new_parent.cloned(),
        };
        let request = self.api.authed(self.api.client.post(url), credential).json(&body);
        self.api.send_json(request, false).await
    }

    async fn list_sub_tenants(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<Vec<Tenant>> {
        let url = self.api.tenant_url(tenant_id, "/children");
        let request = self.api.authed(self.api.client.get(url), credential);
        self.api.send_json(request, false).await
    }

    async fn hierarchy(&self, credential: &Credential, root: &TenantId) -> IdentityResult<Vec<Tenant>> {
        let url = self.api.tenant_url(root, "/hierarchy");
        let request = self.api.authed(self.api.client.get(url), credential);
        self.api.send_json(request, false).await
    }
}
