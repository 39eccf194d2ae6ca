//! Detector service client
//!
//! The classification call is a black-box HTTP operation: one item in, one
//! verdict out. The client absorbs the detector's latency profile with a
//! per-call deadline and bounded exponential-backoff retries, and reports
//! failures as an enumerated kind so the dispatcher can distinguish the one
//! retryable case (timeout) without inspecting error text.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Work descriptor as persisted in checkpoints and carried through dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// Uploaded payload; bytes are staged on disk under the batch directory
    File { name: String },
    /// Textual reference (URL or path) the detector fetches itself
    Reference { url: String },
}

impl WorkItem {
    /// Identifier used in progress events and result records
    pub fn label(&self) -> &str {
        match self {
            WorkItem::File { name } => name,
            WorkItem::Reference { url } => url,
        }
    }
}

/// One classification request, payload already in hand
#[derive(Debug, Clone)]
pub enum ClassifyRequest {
    Payload { name: String, data: Vec<u8> },
    Reference { url: String },
}

impl ClassifyRequest {
    pub fn label(&self) -> &str {
        match self {
            ClassifyRequest::Payload { name, .. } => name,
            ClassifyRequest::Reference { url } => url,
        }
    }
}

/// Detected region, four non-negative pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// Why a classification call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed or unreadable item; never retried
    Input,
    /// Deadline exceeded; the only kind eligible for the retry pass
    Timeout,
    /// Definitive remote failure; recorded as final immediately
    Remote,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Input => write!(f, "input"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Remote => write!(f, "remote"),
        }
    }
}

/// Classification outcome
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The detector answered with a verdict
    Verdict(Verdict),
    /// The call itself failed
    Failure { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Outcome::Failure {
                kind: FailureKind::Timeout,
                ..
            }
        )
    }
}

/// Verdict returned by the detector
#[derive(Debug, Clone)]
pub struct Verdict {
    pub valid: bool,
    pub confidence: Option<f64>,
    pub detector: Option<String>,
    pub region: Option<Region>,
    pub error: Option<String>,
}

/// Final per-item record, written exactly once per item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub item: String,
    pub valid: bool,
    pub confidence: Option<f64>,
    pub detector: Option<String>,
    pub region: Option<Region>,
    pub error: Option<String>,
}

impl ItemResult {
    /// Record for an item that never produced a verdict
    pub fn failed(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            valid: false,
            confidence: None,
            detector: None,
            region: None,
            error: Some(error.into()),
        }
    }

    pub fn from_verdict(item: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            item: item.into(),
            valid: verdict.valid,
            confidence: verdict.confidence,
            detector: verdict.detector,
            region: verdict.region,
            error: verdict.error,
        }
    }
}

/// Classification seam; the dispatcher only ever talks to this trait
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// Submit one item, retrying internally up to `attempts` times.
    /// Never returns `FailureKind::Timeout` unless every attempt timed out.
    async fn classify(&self, request: &ClassifyRequest, attempts: u32) -> Outcome;
}

/// Detector wire response
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[allow(dead_code)]
    item: Option<String>,
    valid: bool,
    confidence: Option<f64>,
    detector: Option<String>,
    region: Option<Region>,
    error: Option<String>,
    #[serde(default)]
    timed_out: bool,
}

/// HTTP client for the detector service
pub struct DetectorClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl DetectorClient {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("markscan/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    async fn post_once(&self, request: &ClassifyRequest) -> Result<Outcome, reqwest::Error> {
        let url = format!("{}/detect", self.base_url);
        let response = match request {
            ClassifyRequest::Payload { name, data } => {
                let part = reqwest::multipart::Part::bytes(data.clone()).file_name(name.clone());
                let form = reqwest::multipart::Form::new().part("file", part);
                self.http_client.post(&url).multipart(form).send().await?
            }
            ClassifyRequest::Reference { url: reference } => {
                self.http_client
                    .post(&url)
                    .form(&[("reference", reference.as_str())])
                    .send()
                    .await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(Outcome::failure(
                FailureKind::Remote,
                format!("detector returned {}: {}", status, body),
            ));
        }

        let record: DetectResponse = response.json().await?;
        if record.timed_out {
            return Ok(Outcome::failure(
                FailureKind::Timeout,
                record
                    .error
                    .unwrap_or_else(|| "detector reported timeout".to_string()),
            ));
        }

        Ok(Outcome::Verdict(Verdict {
            valid: record.valid,
            confidence: record.confidence,
            detector: record.detector,
            region: record.region,
            error: record.error,
        }))
    }
}

#[async_trait::async_trait]
impl Classifier for DetectorClient {
    async fn classify(&self, request: &ClassifyRequest, attempts: u32) -> Outcome {
        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            match self.post_once(request).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    tracing::warn!(
                        item = %request.label(),
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Detector request failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    } else {
                        let kind = if e.is_timeout() {
                            FailureKind::Timeout
                        } else {
                            FailureKind::Remote
                        };
                        return Outcome::failure(
                            kind,
                            format!("detector unavailable after {} attempts: {}", attempts, e),
                        );
                    }
                }
            }
        }
        unreachable!("attempt loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_label() {
        let file = WorkItem::File {
            name: "scan.png".to_string(),
        };
        let reference = WorkItem::Reference {
            url: "https://example.com/a.jpg".to_string(),
        };
        assert_eq!(file.label(), "scan.png");
        assert_eq!(reference.label(), "https://example.com/a.jpg");
    }

    #[test]
    fn test_work_item_checkpoint_roundtrip() {
        let item = WorkItem::Reference {
            url: "https://example.com/a.jpg".to_string(),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"kind\":\"reference\""));
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_detect_response_timeout_flag() {
        let json = "{\"valid\":false,\"error\":\"deadline\",\"timed_out\":true}";
        let record: DetectResponse = serde_json::from_str(json).unwrap();
        assert!(record.timed_out);
        assert_eq!(record.error.as_deref(), Some("deadline"));
    }

    #[test]
    fn test_outcome_is_timeout_only_for_timeout_kind() {
        assert!(Outcome::failure(FailureKind::Timeout, "slow").is_timeout());
        assert!(!Outcome::failure(FailureKind::Remote, "500").is_timeout());
        assert!(!Outcome::failure(FailureKind::Input, "empty").is_timeout());
    }
}
