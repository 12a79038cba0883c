use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response, multipart};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_USER_AGENT, WikiConfig, normalize_space_url};
use crate::error::SyncError;
use crate::memo::page_url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePageSummary {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub id: i64,
    pub name: String,
}

/// Capability the sync engines need from the remote wiki.
///
/// Transport failures surface as [`SyncError::Transport`] and unknown
/// pages/attachments as [`SyncError::NotFound`]; nothing is retried here.
pub trait RemoteWiki {
    fn list_pages(&mut self, project_key: &str) -> Result<Vec<RemotePageSummary>>;
    fn get_page(&mut self, page_id: i64) -> Result<RemotePage>;
    fn list_attachments(&mut self, page_id: i64) -> Result<Vec<RemoteAttachment>>;
    fn get_attachment(&mut self, page_id: i64, attachment: &RemoteAttachment) -> Result<Vec<u8>>;
    fn update_page(&mut self, page_id: i64, name: &str, content: &str) -> Result<()>;
    fn upload_attachment(&mut self, page_id: i64, filename: &str, bytes: Vec<u8>) -> Result<()>;
    /// Browser URL recorded in memos for `page_id`.
    fn page_url(&self, page_id: i64) -> String;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct BacklogClientConfig {
    pub space_url: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub rate_limit_ms: u64,
}

impl BacklogClientConfig {
    /// Resolve client settings: flag > env > config. A missing space URL or
    /// API key is a configuration error.
    pub fn from_config(
        config: &WikiConfig,
        space_url_flag: Option<&str>,
        api_key_flag: Option<&str>,
    ) -> Result<Self> {
        let space_url = space_url_flag
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(normalize_space_url)
            .or_else(|| config.space_url())
            .ok_or_else(|| {
                SyncError::Configuration(
                    "Backlog space URL is not set (--url, BACKLOG_SPACE_URL or remote.space_url)"
                        .to_string(),
                )
            })?;
        let api_key = api_key_flag
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .or_else(|| config.api_key())
            .ok_or_else(|| {
                SyncError::Configuration(
                    "Backlog API key is not set (--api-key or BACKLOG_API_KEY)".to_string(),
                )
            })?;
        Ok(Self {
            space_url,
            api_key,
            user_agent: config.user_agent(),
            timeout_ms: 30_000,
            upload_timeout_ms: 60_000,
            rate_limit_ms: 200,
        })
    }

    pub fn new(space_url: &str, api_key: &str) -> Self {
        Self {
            space_url: normalize_space_url(space_url),
            api_key: api_key.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            upload_timeout_ms: 60_000,
            rate_limit_ms: 200,
        }
    }
}

pub struct BacklogClient {
    client: Client,
    config: BacklogClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl BacklogClient {
    pub fn new(config: BacklogClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Backlog HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/api/v2/{}", self.config.space_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|error| {
            SyncError::Configuration(format!("invalid Backlog endpoint {raw}: {error}"))
        })?;
        url.query_pairs_mut().append_pair("apiKey", &self.config.api_key);
        Ok(url)
    }

    fn send(&mut self, request: RequestBuilder, what: &str) -> Result<Response> {
        self.apply_rate_limit();
        let response = request
            .send()
            .map_err(|error| SyncError::Transport(format!("{what}: {error}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        let detail = backlog_error_message(&body).unwrap_or_else(|| status.to_string());
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("{what}: {detail}")).into());
        }
        Err(SyncError::Transport(format!("{what}: HTTP {status}: {detail}")).into())
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&mut self, path: &str, what: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let request = self.client.get(url);
        let response = self.send(request, what)?;
        response
            .json::<T>()
            .map_err(|error| SyncError::Transport(format!("{what}: invalid JSON response: {error}")))
            .map_err(Into::into)
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl RemoteWiki for BacklogClient {
    fn list_pages(&mut self, project_key: &str) -> Result<Vec<RemotePageSummary>> {
        let mut url = self.endpoint("wikis")?;
        url.query_pairs_mut().append_pair("projectIdOrKey", project_key);
        let request = self.client.get(url);
        let response = self.send(request, &format!("list wikis for {project_key}"))?;
        response
            .json::<Vec<RemotePageSummary>>()
            .map_err(|error| SyncError::Transport(format!("invalid wiki list response: {error}")))
            .map_err(Into::into)
    }

    fn get_page(&mut self, page_id: i64) -> Result<RemotePage> {
        self.get_json(&format!("wikis/{page_id}"), &format!("get wiki {page_id}"))
    }

    fn list_attachments(&mut self, page_id: i64) -> Result<Vec<RemoteAttachment>> {
        self.get_json(
            &format!("wikis/{page_id}/attachments"),
            &format!("list attachments of wiki {page_id}"),
        )
    }

    fn get_attachment(&mut self, page_id: i64, attachment: &RemoteAttachment) -> Result<Vec<u8>> {
        let url = self.endpoint(&format!("wikis/{page_id}/attachments/{}", attachment.id))?;
        let request = self.client.get(url);
        let what = format!("download {} from wiki {page_id}", attachment.name);
        let response = self.send(request, &what)?;
        let bytes = response
            .bytes()
            .map_err(|error| SyncError::Transport(format!("{what}: {error}")))?;
        Ok(bytes.to_vec())
    }

    fn update_page(&mut self, page_id: i64, name: &str, content: &str) -> Result<()> {
        let url = self.endpoint(&format!("wikis/{page_id}"))?;
        let request = self
            .client
            .patch(url)
            .form(&[("name", name), ("content", content)]);
        self.send(request, &format!("update wiki {page_id}"))?;
        Ok(())
    }

    fn upload_attachment(&mut self, page_id: i64, filename: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.endpoint("space/attachment")?;
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|error| SyncError::Transport(format!("invalid upload part: {error}")))?;
        let form = multipart::Form::new().part("file", part);
        let request = self
            .client
            .post(url)
            .timeout(Duration::from_millis(self.config.upload_timeout_ms))
            .multipart(form);
        let what = format!("upload {filename}");
        let uploaded: UploadedAttachment = self
            .send(request, &what)?
            .json()
            .map_err(|error| SyncError::Transport(format!("{what}: invalid JSON response: {error}")))?;

        let url = self.endpoint(&format!("wikis/{page_id}/attachments"))?;
        let request = self
            .client
            .post(url)
            .form(&[("attachmentId[]", uploaded.id.to_string())]);
        self.send(request, &format!("attach {filename} to wiki {page_id}"))?;
        Ok(())
    }

    fn page_url(&self, page_id: i64) -> String {
        page_url(&self.config.space_url, page_id)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct UploadedAttachment {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct BacklogErrorResponse {
    #[serde(default)]
    errors: Vec<BacklogErrorItem>,
}

#[derive(Debug, Deserialize)]
struct BacklogErrorItem {
    #[serde(default)]
    message: String,
}

fn backlog_error_message(body: &str) -> Option<String> {
    let parsed: BacklogErrorResponse = serde_json::from_str(body).ok()?;
    let messages: Vec<String> = parsed
        .errors
        .into_iter()
        .map(|item| item.message)
        .filter(|message| !message.is_empty())
        .collect();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}
