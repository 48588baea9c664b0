//! Inference Client: HTTP multipart calls to the external inference
//! endpoint, with confidence/class post-filtering and typed error
//! classification for the retry policy above it.

use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Detection {
    pub class: String,
    pub confidence: f64,
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InferenceFailure {
    Timeout,
    Http5xx,
    Http4xx,
    DecodeError,
}

impl std::fmt::Display for InferenceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InferenceFailure::Timeout => "inference request timed out",
            InferenceFailure::Http5xx => "inference endpoint returned a server error",
            InferenceFailure::Http4xx => "inference endpoint rejected the request",
            InferenceFailure::DecodeError => "could not decode inference response",
        };
        f.write_str(s)
    }
}

impl InferenceFailure {
    pub fn retryable(&self) -> bool {
        matches!(self, InferenceFailure::Timeout | InferenceFailure::Http5xx)
    }
}

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    retries: u32,
    confidence_threshold: f64,
    enabled_classes: Vec<String>,
}

impl InferenceClient {
    pub fn new(
        endpoint: String,
        timeout: Duration,
        retries: u32,
        confidence_threshold: f64,
        enabled_classes: Vec<String>,
    ) -> Self {
        InferenceClient {
            http: reqwest::Client::new(),
            endpoint,
            timeout,
            retries,
            confidence_threshold,
            enabled_classes,
        }
    }

    /// Runs `infer_once` up to `1 + retries` times, stopping early on a
    /// non-retryable failure.
    pub async fn infer(&self, frame: bytes::Bytes) -> Result<Vec<Detection>, InferenceFailure> {
        let mut attempt = 0;
        loop {
            match self.infer_once(frame.clone()).await {
                Ok(detections) => return Ok(self.post_filter(detections)),
                Err(e) if attempt < self.retries && e.retryable() => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn infer_once(&self, frame: bytes::Bytes) -> Result<Vec<Detection>, InferenceFailure> {
        let part = reqwest::multipart::Part::bytes(frame.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|_| InferenceFailure::DecodeError)?;
        let form = reqwest::multipart::Form::new().part("frame", part);

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { InferenceFailure::Timeout } else { InferenceFailure::Http5xx })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(InferenceFailure::Http5xx);
        }
        if status.is_client_error() {
            return Err(InferenceFailure::Http4xx);
        }
        let parsed: InferenceResponse = response.json().await.map_err(|_| InferenceFailure::DecodeError)?;
        Ok(parsed.detections)
    }

    fn post_filter(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .filter(|d| self.enabled_classes.is_empty() || self.enabled_classes.iter().any(|c| c == &d.class))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(confidence_threshold: f64, enabled_classes: Vec<String>) -> InferenceClient {
        InferenceClient::new(
            "http://unused.invalid".to_string(),
            Duration::from_secs(1),
            0,
            confidence_threshold,
            enabled_classes,
        )
    }

    #[test]
    fn post_filter_drops_low_confidence() {
        let c = client(0.5, vec![]);
        let out = c.post_filter(vec![
            Detection { class: "person".into(), confidence: 0.9, bbox: None },
            Detection { class: "person".into(), confidence: 0.2, bbox: None },
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn post_filter_applies_class_allow_list() {
        let c = client(0.0, vec!["person".to_string()]);
        let out = c.post_filter(vec![
            Detection { class: "person".into(), confidence: 0.9, bbox: None },
            Detection { class: "vehicle".into(), confidence: 0.9, bbox: None },
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class, "person");
    }

    #[test]
    fn failure_retryability_matches_classification() {
        assert!(InferenceFailure::Timeout.retryable());
        assert!(InferenceFailure::Http5xx.retryable());
        assert!(!InferenceFailure::Http4xx.retryable());
        assert!(!InferenceFailure::DecodeError.retryable());
    }
}
