//! CTFd REST API client
//!
//! Endpoints used:
//! - `GET  /api/v1/challenges` and `/api/v1/challenges/{id}`
//! - `GET  /api/v1/hints/{id}`, `POST /api/v1/unlocks`
//! - `POST /api/v1/challenges/attempt`
//! - file downloads relative to the instance root

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::{ChallengeSummary, PlatformGateway, Verdict};
use crate::challenge::{ChallengeData, ChallengeId, HintRef};
use crate::config::PlatformConfig;
use crate::error::{classify_status, PlatformError};

/// CTFd wraps every payload in `{"success": bool, "data": ...}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    data: Option<T>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ListedChallenge {
    id: u64,
    name: String,
    category: Option<String>,
    #[serde(default)]
    solved_by_me: bool,
}

#[derive(Debug, Deserialize)]
struct ChallengeDetail {
    id: u64,
    name: String,
    category: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    hints: Vec<HintDetail>,
}

#[derive(Debug, Deserialize)]
struct HintDetail {
    id: u64,
    #[serde(default)]
    cost: u64,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttemptResult {
    status: String,
    #[serde(default)]
    message: String,
}

pub struct CtfdClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl CtfdClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    pub fn from_config(config: &PlatformConfig) -> Result<Self, PlatformError> {
        if config.url.is_empty() {
            return Err(PlatformError::Permanent("platform.url is not set".into()));
        }
        Self::new(
            &config.url,
            &config.token,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!(
            "{}/api/v1/{}",
            self.base_url,
            endpoint.trim_start_matches('/')
        );
        self.client
            .request(method, url)
            .header("Authorization", format!("Token {}", self.token))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, PlatformError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(
                status.as_u16(),
                format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
            ));
        }

        let envelope: Envelope<T> = resp.json().await?;
        if envelope.success == Some(false) {
            return Err(PlatformError::Permanent(format!(
                "request rejected: {}",
                envelope.errors.unwrap_or_default()
            )));
        }
        envelope
            .data
            .ok_or_else(|| PlatformError::Permanent("response without data".into()))
    }

    fn file_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl PlatformGateway for CtfdClient {
    async fn list_challenges(&self) -> Result<Vec<ChallengeSummary>, PlatformError> {
        let listed: Vec<ListedChallenge> =
            self.send(self.request(Method::GET, "challenges")).await?;
        Ok(listed
            .into_iter()
            .map(|c| ChallengeSummary {
                id: ChallengeId(c.id),
                name: c.name,
                category: c.category,
                solved: c.solved_by_me,
            })
            .collect())
    }

    async fn fetch_challenge(&self, id: ChallengeId) -> Result<ChallengeData, PlatformError> {
        let detail: ChallengeDetail = self
            .send(self.request(Method::GET, &format!("challenges/{}", id)))
            .await?;
        debug!(
            "Fetched challenge {} ({} files, {} hints)",
            detail.id,
            detail.files.len(),
            detail.hints.len()
        );
        Ok(ChallengeData {
            id: ChallengeId(detail.id),
            name: detail.name,
            category: detail.category,
            text: detail.description,
            hints: detail
                .hints
                .into_iter()
                .map(|h| HintRef {
                    id: h.id,
                    cost: h.cost,
                    content: h.content,
                })
                .collect(),
            files: detail.files,
        })
    }

    async fn hint_content(
        &self,
        hint_id: u64,
        unlock: bool,
    ) -> Result<Option<String>, PlatformError> {
        if unlock {
            info!("Unlocking hint {}", hint_id);
            let _: serde_json::Value = self
                .send(
                    self.request(Method::POST, "unlocks")
                        .json(&json!({ "target": hint_id, "type": "hints" })),
                )
                .await?;
        }
        let hint: HintDetail = self
            .send(self.request(Method::GET, &format!("hints/{}", hint_id)))
            .await?;
        Ok(hint.content.filter(|c| !c.trim().is_empty()))
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        let resp = self
            .client
            .get(self.file_url(url))
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(
                status.as_u16(),
                format!("download {}: HTTP {}", url, status),
            ));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn submit_answer(
        &self,
        id: ChallengeId,
        answer: &str,
    ) -> Result<Verdict, PlatformError> {
        let result: AttemptResult = self
            .send(
                self.request(Method::POST, "challenges/attempt")
                    .json(&json!({ "challenge_id": id.0, "submission": answer })),
            )
            .await?;
        info!("Submission for challenge {}: {} ({})", id, result.status, result.message);

        Ok(match result.status.as_str() {
            "correct" => Verdict::Correct,
            "incorrect" => Verdict::Incorrect,
            "already_solved" => Verdict::AlreadySolved,
            other => Verdict::Error(format!("{}: {}", other, result.message)),
        })
    }
}

/// Last path segment of a CTFd file URL, without query string
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .filter(|s| *s != "." && *s != "..")
        .map(String::from)
        .unwrap_or_else(|| "unknown_file".to_string())
}
