use std::time::{Duration, SystemTime};

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

#[derive(Debug, Error)]
pub enum DropboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        summary: Option<String>,
        body: String,
        retry_after: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Add,
    Overwrite,
}

/// Client for the subset of the Dropbox API v2 used by the backup engine.
///
/// A client carries a single bearer token and request timeout; build a new
/// one whenever the credential changes instead of mutating a shared value.
#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DropboxError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            token: token.into(),
        })
    }

    pub async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc(
            "/2/files/list_folder",
            &ListFolderArg {
                path,
                recursive,
                include_deleted: false,
            },
        )
        .await
    }

    pub async fn list_folder_continue(
        &self,
        cursor: &str,
    ) -> Result<ListFolderResult, DropboxError> {
        self.rpc("/2/files/list_folder/continue", &CursorArg { cursor })
            .await
    }

    /// Uploads `body` to `path` and returns the confirmed display path.
    pub async fn upload(
        &self,
        path: &str,
        body: impl Into<Body>,
        mode: WriteMode,
    ) -> Result<String, DropboxError> {
        let url = self.content_url.join("/2/files/upload")?;
        let arg = serde_json::to_string(&UploadArg {
            path,
            mode,
            autorename: false,
            mute: true,
        })?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", header_safe_json(&arg))
            .body(body)
            .send()
            .await?;
        let metadata: FileMetadata = Self::handle_response(response).await?;
        Ok(metadata.path_display.unwrap_or(metadata.path_lower))
    }

    pub async fn delete(&self, path: &str) -> Result<(), DropboxError> {
        let _: serde::de::IgnoredAny = self.rpc("/2/files/delete_v2", &PathArg { path }).await?;
        Ok(())
    }

    pub async fn get_current_account(&self) -> Result<Account, DropboxError> {
        self.rpc_no_arg("/2/users/get_current_account").await
    }

    pub async fn get_space_usage(&self) -> Result<SpaceUsage, DropboxError> {
        self.rpc_no_arg("/2/users/get_space_usage").await
    }

    async fn rpc<A: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        arg: &A,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn rpc_no_arg<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, DropboxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .body("null")
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DropboxError> {
        if response.status().is_success() {
            let bytes = response.bytes().await?;
            Ok(serde_json::from_slice(&bytes)?)
        } else {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let summary = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .map(|parsed| parsed.error_summary);
            Err(DropboxError::Api {
                status,
                summary,
                body,
                retry_after,
            })
        }
    }
}

impl DropboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DropboxError::Api { status, .. } => Some(classify_api_status(*status)),
            DropboxError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            DropboxError::Api { summary, .. } => summary.as_deref(),
            _ => None,
        }
    }

    /// True for `path/not_found` and `path_lookup/not_found` style failures.
    pub fn is_not_found(&self) -> bool {
        self.summary()
            .is_some_and(|summary| summary.contains("/not_found"))
    }

    pub fn is_conflict(&self) -> bool {
        self.summary()
            .is_some_and(|summary| summary.contains("/conflict"))
    }

    /// The remote refuses this particular path, whatever the account state:
    /// `path/disallowed_name`, `path/malformed_path` and their lookup forms.
    /// Quota and write-throttling errors are not path rejections.
    pub fn is_rejected_path(&self) -> bool {
        self.summary().is_some_and(|summary| {
            REJECTED_PATH_REASONS
                .iter()
                .any(|reason| summary.contains(reason))
        })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        let DropboxError::Api {
            retry_after: Some(value),
            ..
        } = self
        else {
            return None;
        };
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(seconds);
        }
        let at = httpdate::parse_http_date(value).ok()?;
        Some(
            at.duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        )
    }
}

const REJECTED_PATH_REASONS: &[&str] = &["/disallowed_name", "/malformed_path"];

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Escapes every non-ASCII character as `\uXXXX` so the JSON argument is a
/// valid HTTP header value.
pub fn header_safe_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[derive(Debug, Serialize)]
struct ListFolderArg<'a> {
    path: &'a str,
    recursive: bool,
    include_deleted: bool,
}

#[derive(Debug, Serialize)]
struct CursorArg<'a> {
    cursor: &'a str,
}

#[derive(Debug, Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: WriteMode,
    autorename: bool,
    mute: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error_summary: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub path_lower: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FolderMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeletedMetadata {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Account {
    pub account_id: String,
    pub name: AccountName,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AccountName {
    pub display_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocation: SpaceAllocation,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpaceAllocation {
    #[serde(default)]
    pub allocated: u64,
}
