//! HTTP clients bound to one server endpoint
//!
//! [`HttpClient`] is the request/response client: callers await the result.
//! [`AsyncHttpClient`] dispatches the same requests on the runtime and hands
//! the outcome to a completion callback.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request URL {0}")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded with {status}")]
    Status { status: StatusCode, body: Vec<u8> },
}

impl HttpError {
    /// Status code of a non-success response, if the server answered at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Request(e) => e.status(),
            HttpError::InvalidUrl(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Username and password for basic auth
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct BasicAuth {
    pub(crate) username: String,
    pub(crate) password: String,
}

/// Transport options shared by both client flavours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    auth: Option<BasicAuth>,
}

impl HttpClient {
    pub(crate) fn new(
        base_url: &str,
        auth: Option<BasicAuth>,
        options: &HttpOptions,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_basic_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Absolute URLs pass through, anything else is appended to the base URL
    pub fn url_for(&self, path: &str) -> Result<Url, HttpError> {
        let full = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&full).map_err(|_| HttpError::InvalidUrl(full))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, HttpError> {
        let url = self.url_for(path)?;
        let mut request = self.client.request(method, url);

        // Add basic auth if configured
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        Ok(request)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<HttpResponse, HttpError> {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(%status, bytes = body.len(), "HTTP response");

        if !status.is_success() {
            return Err(HttpError::Status { status, body });
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, HttpError> {
        debug!(base = %self.base_url, path, "GET");
        let request = self.request(Method::GET, path)?;
        self.execute(request).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: impl Into<String>,
        content_type: &str,
    ) -> Result<HttpResponse, HttpError> {
        debug!(base = %self.base_url, path, content_type, "POST");
        let request = self
            .request(Method::POST, path)?
            .header(CONTENT_TYPE, content_type)
            .body(body.into());
        self.execute(request).await
    }
}

/// Callback-style client: requests run on a spawned task
#[derive(Clone)]
pub struct AsyncHttpClient {
    inner: HttpClient,
}

impl AsyncHttpClient {
    pub(crate) fn new(inner: HttpClient) -> Self {
        Self { inner }
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    pub fn has_basic_auth(&self) -> bool {
        self.inner.has_basic_auth()
    }

    pub fn get<F>(&self, path: &str, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<HttpResponse, HttpError>) + Send + 'static,
    {
        let client = self.inner.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            on_complete(client.get(&path).await);
        })
    }

    pub fn post<F>(
        &self,
        path: &str,
        body: impl Into<String>,
        content_type: &str,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<HttpResponse, HttpError>) + Send + 'static,
    {
        let client = self.inner.clone();
        let path = path.to_string();
        let body = body.into();
        let content_type = content_type.to_string();
        tokio::spawn(async move {
            on_complete(client.post(&path, body, &content_type).await);
        })
    }
}
