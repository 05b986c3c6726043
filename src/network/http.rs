//! reqwest implementation of `ServerApi`
//!
//! Requests to the main server carry `Authorization: Bearer <token>`. A 401
//! triggers one token refresh through `POST /refresh` and a single retry.

use super::key_files::{local_file_name, select_google_files, KeyFile};
use super::{CallbackRequest, ChaffEndpoint, KeyServerType, ServerApi};
use crate::config::ServerSettings;
use crate::error::ApiError;
use crate::metrics::Metric;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const CHAFF_HEADER: &str = "X-Chaff";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Metrics,
    Exposures,
    DataFiles,
    Callback,
    Settings,
    Refresh,
    Verify,
    Certificate,
    Publish,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

pub struct HttpServerApi {
    client: Client,
    settings: ServerSettings,
    auth_token: RwLock<Option<String>>,
}

impl HttpServerApi {
    pub fn new(settings: ServerSettings) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;
        let auth_token = RwLock::new(settings.auth_token.clone());

        Ok(Self {
            client,
            settings,
            auth_token,
        })
    }

    fn server_url(&self) -> Result<&str, ApiError> {
        self.settings
            .server_url
            .as_deref()
            .ok_or(ApiError::NotConfigured("server url"))
    }

    fn key_server_url(&self) -> Result<&str, ApiError> {
        self.settings
            .key_server_url
            .as_deref()
            .ok_or(ApiError::NotConfigured("key server url"))
    }

    /// Explicit publish server, or `https://<key server domain>/v1`
    fn publish_server_url(&self) -> Result<String, ApiError> {
        if let Some(url) = self.settings.publish_server_url.as_deref() {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
        derive_publish_url(self.key_server_url()?)
    }

    fn url(&self, endpoint: Endpoint) -> Result<String, ApiError> {
        let google = self.settings.key_server_type == KeyServerType::GoogleRefServer;
        let url = match endpoint {
            Endpoint::Metrics => format!("{}/metrics", self.server_url()?),
            Endpoint::Exposures if google => format!("{}/v1/index.txt", self.key_server_url()?),
            Endpoint::Exposures => format!("{}/exposures", self.server_url()?),
            Endpoint::DataFiles if google => format!("{}/", self.key_server_url()?),
            Endpoint::DataFiles => format!("{}/data/", self.server_url()?),
            Endpoint::Callback => format!("{}/callback", self.server_url()?),
            Endpoint::Settings => format!("{}/settings/exposures", self.server_url()?),
            Endpoint::Refresh => format!("{}/refresh", self.server_url()?),
            Endpoint::Verify if google => format!("{}/verify", self.server_url()?),
            Endpoint::Verify => format!("{}/exposures/verify", self.server_url()?),
            Endpoint::Certificate => format!("{}/certificate", self.server_url()?),
            Endpoint::Publish if google => format!("{}/publish", self.publish_server_url()?),
            Endpoint::Publish => format!("{}/exposures", self.server_url()?),
        };
        Ok(url)
    }

    /// Send a request with the bearer token, refreshing once on 401
    async fn send_authorized<F>(&self, endpoint: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.auth_token.read().await.clone();
        let response = with_bearer(build(&self.client), token.as_deref()).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED || self.settings.refresh_token.is_none() {
            return check_status(endpoint, response);
        }

        log::info!("🔑 Access token rejected by {}, refreshing", endpoint);
        let token = self.refresh_auth_token().await?;
        let response = with_bearer(build(&self.client), Some(&token)).send().await?;
        check_status(endpoint, response)
    }

    async fn refresh_auth_token(&self) -> Result<String, ApiError> {
        let url = self.url(Endpoint::Refresh)?;
        let response = with_bearer(
            self.client.post(&url),
            self.settings.refresh_token.as_deref(),
        )
        .send()
        .await?;

        let refreshed: RefreshResponse = check_status("refresh", response)?.json().await?;
        *self.auth_token.write().await = Some(refreshed.token.clone());
        Ok(refreshed.token)
    }
}

fn with_bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn check_status(endpoint: &str, response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status {
            endpoint: endpoint.to_string(),
            status: response.status().as_u16(),
        })
    }
}

/// Publish server for Google-style deployments: drop the first host label
pub fn derive_publish_url(key_server_url: &str) -> Result<String, ApiError> {
    let parsed =
        Url::parse(key_server_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", key_server_url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ApiError::InvalidUrl(format!("{}: no host", key_server_url)))?;

    let domain = match host.split_once('.') {
        Some((_, rest)) if rest.contains('.') => rest,
        _ => host,
    };
    Ok(format!("https://{}/v1", domain))
}

#[async_trait]
impl ServerApi for HttpServerApi {
    fn key_server_type(&self) -> KeyServerType {
        self.settings.key_server_type
    }

    async fn fetch_settings(&self) -> Result<String, ApiError> {
        let url = self.url(Endpoint::Settings)?;
        let version = self.settings.app_version.clone();
        let response = self
            .send_authorized("settings", |client| {
                client
                    .get(&url)
                    .query(&[("version", version.as_str()), ("os", std::env::consts::OS)])
            })
            .await?;
        Ok(response.text().await?)
    }

    async fn list_key_files(&self, since: i64, limit: usize) -> Result<Vec<KeyFile>, ApiError> {
        let url = self.url(Endpoint::Exposures)?;

        match self.settings.key_server_type {
            KeyServerType::NearForm => {
                let version = self.settings.app_version.clone();
                let since = since.to_string();
                let limit = limit.to_string();
                let response = self
                    .send_authorized("exposures", |client| {
                        client.get(&url).query(&[
                            ("since", since.as_str()),
                            ("limit", limit.as_str()),
                            ("version", version.as_str()),
                            ("os", std::env::consts::OS),
                        ])
                    })
                    .await?;
                Ok(response.json().await?)
            }
            KeyServerType::GoogleRefServer => {
                let response = self.client.get(&url).send().await?;
                let index = check_status("index", response)?.text().await?;
                Ok(select_google_files(&index, since, limit))
            }
        }
    }

    async fn download_key_file(&self, file: &KeyFile, dir: &Path) -> Result<PathBuf, ApiError> {
        let base = self.url(Endpoint::DataFiles)?;
        let url = format!("{}{}", base, file.path.trim_start_matches('/'));

        let response = match self.settings.key_server_type {
            KeyServerType::NearForm => {
                self.send_authorized("data", |client| client.get(&url)).await?
            }
            KeyServerType::GoogleRefServer => {
                check_status("data", self.client.get(&url).send().await?)?
            }
        };

        let bytes = response.bytes().await?;
        let local = dir.join(local_file_name(file));
        tokio::fs::write(&local, &bytes).await?;

        log::debug!("   ├─ Downloaded {} ({} bytes)", file.path, bytes.len());
        Ok(local)
    }

    async fn post_metric(&self, metric: &Metric) -> Result<(), ApiError> {
        let url = self.url(Endpoint::Metrics)?;
        self.send_authorized("metrics", |client| client.post(&url).json(metric))
            .await?;
        Ok(())
    }

    async fn post_callback(&self, request: &CallbackRequest) -> Result<(), ApiError> {
        let url = self.url(Endpoint::Callback)?;
        self.send_authorized("callback", |client| client.post(&url).json(request))
            .await?;
        Ok(())
    }

    async fn post_chaff(&self, endpoint: ChaffEndpoint, body: &Value) -> Result<(), ApiError> {
        let (name, url) = match endpoint {
            ChaffEndpoint::Verify => ("verify", self.url(Endpoint::Verify)?),
            ChaffEndpoint::Certificate => ("certificate", self.url(Endpoint::Certificate)?),
            ChaffEndpoint::Publish => ("publish", self.url(Endpoint::Publish)?),
        };

        let response = self
            .client
            .post(&url)
            .header(CHAFF_HEADER, "chaff")
            .json(body)
            .send()
            .await?;
        check_status(name, response)?;
        Ok(())
    }
}
