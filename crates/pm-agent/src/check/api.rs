//! Control API client
//!
//! Thin typed wrapper over the HTTPS endpoints the check manager needs.
//! Every request carries the token auth headers; responses are JSON.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pm_core::config::ApiConfig;

use super::bundle::{cid_path, Broker, CheckBundle};

const AUTH_TOKEN_HEADER: &str = "X-Circonus-Auth-Token";
const APP_NAME_HEADER: &str = "X-Circonus-App-Name";

/// Control API errors
#[derive(Error, Debug)]
pub enum ApiError {
    /// No token key configured
    #[error("API Token is required")]
    TokenRequired,

    /// Token key or app name is not a valid header value
    #[error("invalid API credential: {0}")]
    InvalidCredential(String),

    /// Base URL did not parse
    #[error("invalid API URL: {0}")]
    Url(#[from] url::ParseError),

    /// Transport-level failure
    #[error("API request: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response
    #[error("API returned {status} for {path}: {body}")]
    Status {
        status: StatusCode,
        path: String,
        body: String,
    },

    /// Response body did not decode
    #[error("decoding API response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct CaCert {
    contents: String,
}

/// Authenticated control API client
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    headers: HeaderMap,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client from configuration
    ///
    /// Fails when the token key is missing or the base URL is invalid.
    pub fn new(cfg: &ApiConfig) -> Result<Self, ApiError> {
        if cfg.token.key.is_empty() {
            return Err(ApiError::TokenRequired);
        }

        let mut base = Url::parse(&cfg.url)?;
        // relative-path joins below need a trailing slash
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTH_TOKEN_HEADER,
            HeaderValue::from_str(&cfg.token.key)
                .map_err(|e| ApiError::InvalidCredential(e.to_string()))?,
        );
        headers.insert(
            APP_NAME_HEADER,
            HeaderValue::from_str(&cfg.token.app)
                .map_err(|e| ApiError::InvalidCredential(e.to_string()))?,
        );

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { base, headers, http })
    }

    async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.base.join(path)?;
        let mut req = self
            .http
            .request(method, url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                path: path.to_string(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    /// `GET /check_bundle/<cid>`
    pub async fn fetch_check_bundle(&self, cid: &str) -> Result<CheckBundle, ApiError> {
        self.get(&cid_path("check_bundle", cid)).await
    }

    /// `GET /check_bundle?search=<criteria>`
    pub async fn search_check_bundles(&self, criteria: &str) -> Result<Vec<CheckBundle>, ApiError> {
        let path = format!(
            "check_bundle?search={}",
            url::form_urlencoded::byte_serialize(criteria.as_bytes()).collect::<String>()
        );
        self.get(&path).await
    }

    /// `POST /check_bundle`
    pub async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle, ApiError> {
        self.request(Method::POST, "check_bundle", Some(bundle)).await
    }

    /// `PUT /check_bundle/<cid>`
    pub async fn update_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle, ApiError> {
        self.request(Method::PUT, &cid_path("check_bundle", &bundle.cid), Some(bundle))
            .await
    }

    /// `GET /broker/<cid>`
    pub async fn fetch_broker(&self, cid: &str) -> Result<Broker, ApiError> {
        self.get(&cid_path("broker", cid)).await
    }

    /// `GET /pki/ca.crt`: broker CA certificate, PEM
    pub async fn fetch_ca(&self) -> Result<String, ApiError> {
        let ca: CaCert = self.get("pki/ca.crt").await?;
        Ok(ca.contents)
    }
}
