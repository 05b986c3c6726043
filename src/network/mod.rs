//! Server interface: settings, key files, metrics, callbacks and chaff
//!
//! The pipeline only depends on the `ServerApi` trait. `HttpServerApi` is
//! the reqwest implementation used by the runtime.

pub mod http;
pub mod key_files;

use crate::error::ApiError;
use crate::metrics::Metric;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use http::HttpServerApi;
pub use key_files::KeyFile;

/// Key server flavour, which decides listing format and endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyServerType {
    /// JSON file list from `/exposures`, files under `/data/`
    NearForm,
    /// Google reference server, `v1/index.txt` listing
    GoogleRefServer,
}

impl FromStr for KeyServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearform" => Ok(KeyServerType::NearForm),
            "google" | "googlerefserver" => Ok(KeyServerType::GoogleRefServer),
            other => Err(format!("unknown key server type: {}", other)),
        }
    }
}

/// Decoy request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaffEndpoint {
    Verify,
    Certificate,
    Publish,
}

/// Body of `POST /callback`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub mobile: String,
    /// Epoch millis of the contact day
    pub close_contact_date: i64,
    pub days_since_exposure: i64,
    pub payload: Value,
}

#[async_trait]
pub trait ServerApi: Send + Sync {
    fn key_server_type(&self) -> KeyServerType;

    /// Raw settings document (`{"exposureConfig": "..."}`)
    async fn fetch_settings(&self) -> Result<String, ApiError>;

    /// Key files newer than `since`, at most `limit`
    async fn list_key_files(&self, since: i64, limit: usize) -> Result<Vec<KeyFile>, ApiError>;

    /// Download one key file into `dir`, returning the local path
    async fn download_key_file(&self, file: &KeyFile, dir: &Path) -> Result<PathBuf, ApiError>;

    async fn post_metric(&self, metric: &Metric) -> Result<(), ApiError>;

    async fn post_callback(&self, request: &CallbackRequest) -> Result<(), ApiError>;

    /// Send a decoy request, marked with the `X-Chaff` header
    async fn post_chaff(&self, endpoint: ChaffEndpoint, body: &Value) -> Result<(), ApiError>;
}
