//! HTTP client for the remote form authority.

use std::future::Future;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the capture-time idempotency key so the server can
/// deduplicate redelivery after an interrupted sync run.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote API error: {0}")]
    Api(String),
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// A form definition as served by the remote authority.
#[derive(Debug, Clone)]
pub struct RemoteForm {
    pub form_id: String,
    pub project_id: String,
    pub version: String,
    /// Serialized definition, opaque past this boundary
    pub definition: serde_json::Value,
}

/// Operations the sync engine consumes from the remote form server.
///
/// Futures are `Send` so the engine can run inside a spawned observer task.
pub trait FormsRemote {
    /// Current version of a form; idempotent and side-effect-free.
    fn fetch_form_version(
        &self,
        form_id: &str,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    /// Full form definition, used to refresh the offline snapshot cache.
    fn fetch_form(&self, form_id: &str) -> impl Future<Output = RemoteResult<RemoteForm>> + Send;

    /// Authenticated submission path.
    fn submit_private(
        &self,
        form_id: &str,
        payload: &[u8],
        idempotency_key: Uuid,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Anonymous submission path.
    fn submit_public(
        &self,
        form_id: &str,
        payload: &[u8],
        idempotency_key: Uuid,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}

/// reqwest-backed client for the form server's HTTP API
#[derive(Clone)]
pub struct HttpFormsRemote {
    endpoint: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

impl HttpFormsRemote {
    pub fn new(endpoint: impl Into<String>) -> RemoteResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        Ok(Self {
            endpoint,
            api_token: None,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Attach the bearer token used by the private submission path
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.api_token = (!token.trim().is_empty()).then(|| token.trim().to_string());
        self
    }

    fn form_url(&self, form_id: &str, suffix: &str) -> String {
        format!("{}/forms/{form_id}{suffix}", self.endpoint)
    }

    async fn submit(
        &self,
        url: String,
        payload: &[u8],
        idempotency_key: Uuid,
        authenticated: bool,
    ) -> RemoteResult<()> {
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .body(payload.to_vec());

        if authenticated {
            let token = self.api_token.as_ref().ok_or_else(|| {
                RemoteError::InvalidConfiguration(
                    "API token is required for private submissions".to_string(),
                )
            })?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(parse_api_error(status, &body)));
        }

        Ok(())
    }
}

impl FormsRemote for HttpFormsRemote {
    async fn fetch_form_version(&self, form_id: &str) -> RemoteResult<String> {
        let response = self
            .client
            .get(self.form_url(form_id, "/version"))
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(parse_api_error(status, &body)));
        }

        let payload = response.json::<FormVersionResponse>().await?;
        let version = payload.version.trim().to_string();
        if version.is_empty() {
            return Err(RemoteError::InvalidPayload(
                "response did not include a form version".to_string(),
            ));
        }
        Ok(version)
    }

    async fn fetch_form(&self, form_id: &str) -> RemoteResult<RemoteForm> {
        let response = self
            .client
            .get(self.form_url(form_id, ""))
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(parse_api_error(status, &body)));
        }

        let payload = response.json::<FormResponse>().await?;
        payload.try_into()
    }

    async fn submit_private(
        &self,
        form_id: &str,
        payload: &[u8],
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        self.submit(
            self.form_url(form_id, "/submissions"),
            payload,
            idempotency_key,
            true,
        )
        .await
    }

    async fn submit_public(
        &self,
        form_id: &str,
        payload: &[u8],
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        self.submit(
            self.form_url(form_id, "/submissions/public"),
            payload,
            idempotency_key,
            false,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct FormVersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct FormResponse {
    id: String,
    project_id: String,
    version: String,
    definition: serde_json::Value,
}

impl TryFrom<FormResponse> for RemoteForm {
    type Error = RemoteError;

    fn try_from(value: FormResponse) -> RemoteResult<Self> {
        let form_id = value.id.trim().to_string();
        if form_id.is_empty() {
            return Err(RemoteError::InvalidPayload(
                "response did not include a form id".to_string(),
            ));
        }

        Ok(Self {
            form_id,
            project_id: value.project_id,
            version: value.version,
            definition: value.definition,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> RemoteResult<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(RemoteError::InvalidConfiguration(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}
