//! Google Gemini description engine.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::engine::{DescribeRequest, DescriptionEngine};
use crate::error::InvocationError;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons meaning the model refused the content.
const REJECTING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
    "IMAGE_SAFETY",
];

/// Gemini `generateContent` engine with inline media.
pub struct GeminiEngine {
    api_key: String,
    model: String,
    language: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiEngine {
    pub fn new(api_key: String, model: String, language: String) -> Self {
        Self {
            api_key,
            model,
            language,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the engine at another endpoint (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn system_instruction(&self) -> String {
        format!(
            "You are an audio description and accessibility assistant for blind and \
             low-vision people. Always answer in {}. Write plain text only: no markdown, \
             no headings, no bullet lists, no emoji.",
            self.language
        )
    }

    fn build_body(&self, req: &DescribeRequest<'_>) -> Value {
        let base64_data = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, req.data);

        let mut prompt = req.mode.prompt().to_string();
        if let Some(caption) = req.caption.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str("\n\nThe sender added this note, take it into account: ");
            prompt.push_str(caption);
        }

        json!({
            "system_instruction": {
                "parts": [{ "text": self.system_instruction() }]
            },
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": req.mime_type,
                            "data": base64_data
                        }
                    },
                    { "text": prompt }
                ]
            }]
        })
    }
}

#[async_trait]
impl DescriptionEngine for GeminiEngine {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn describe(&self, req: DescribeRequest<'_>) -> Result<String, InvocationError> {
        let body = self.build_body(&req);

        let resp = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .timeout(req.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        let json: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                InvocationError::Timeout
            } else {
                InvocationError::EngineUnavailable {
                    transient: status.is_server_error() || status.is_success(),
                    detail: format!("unreadable response ({status}): {e}"),
                }
            }
        })?;

        if !status.is_success() {
            return Err(classify_http_error(status, &json));
        }

        extract_text(&json)
    }
}

fn map_transport_error(e: reqwest::Error) -> InvocationError {
    if e.is_timeout() {
        InvocationError::Timeout
    } else if e.is_builder() {
        InvocationError::MalformedRequest(e.to_string())
    } else {
        InvocationError::EngineUnavailable {
            transient: true,
            detail: e.to_string(),
        }
    }
}

/// Map a non-success HTTP response to an invocation error.
pub(crate) fn classify_http_error(status: StatusCode, body: &Value) -> InvocationError {
    let message = body
        .pointer("/error/message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error")
        .to_string();

    match status {
        StatusCode::TOO_MANY_REQUESTS if daily_quota_exceeded(body) => {
            InvocationError::QuotaExhausted
        }
        StatusCode::TOO_MANY_REQUESTS => InvocationError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => InvocationError::Timeout,
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::NOT_FOUND => {
            InvocationError::MalformedRequest(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InvocationError::EngineUnavailable {
            transient: false,
            detail: message,
        },
        s if s.is_server_error() => InvocationError::EngineUnavailable {
            transient: true,
            detail: message,
        },
        s => InvocationError::EngineUnavailable {
            transient: false,
            detail: format!("HTTP {s}: {message}"),
        },
    }
}

/// Whether a 429 names a per-day quota among its violations.
///
/// Per-minute limits carry the same "exceeded your current quota" message,
/// so only the structured `quotaId` tells the two apart.
fn daily_quota_exceeded(body: &Value) -> bool {
    body.pointer("/error/details")
        .and_then(|d| d.as_array())
        .into_iter()
        .flatten()
        .filter_map(|detail| detail.get("violations").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|violation| violation.get("quotaId").and_then(|q| q.as_str()))
        .any(|quota_id| quota_id.contains("PerDay"))
}

/// Pull the generated text out of a successful response.
pub(crate) fn extract_text(body: &Value) -> Result<String, InvocationError> {
    if let Some(reason) = body
        .pointer("/promptFeedback/blockReason")
        .and_then(|r| r.as_str())
    {
        return Err(InvocationError::ContentRejected(reason.to_string()));
    }

    let candidate = body
        .pointer("/candidates/0")
        .ok_or_else(|| InvocationError::ContentRejected("no candidates returned".into()))?;

    let text = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = candidate
        .get("finishReason")
        .and_then(|r| r.as_str())
        .unwrap_or("");
    if text.trim().is_empty() && REJECTING_FINISH_REASONS.contains(&finish_reason) {
        return Err(InvocationError::ContentRejected(finish_reason.to_string()));
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use amelie_types::MediaKind;

    use crate::mode::DescriptionMode;

    fn engine() -> GeminiEngine {
        GeminiEngine::new("key".into(), "gemini-test".into(), "Portuguese".into())
    }

    #[test]
    fn test_build_body() {
        let req = DescribeRequest {
            data: b"abc",
            mime_type: "image/png",
            kind: MediaKind::Image,
            mode: DescriptionMode::ExhaustiveImage,
            caption: Some("  what colour is the car?  "),
            timeout: Duration::from_secs(5),
        };
        let body = engine().build_body(&req);
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[0]["inline_data"]["data"], "YWJj");
        let prompt = parts[1]["text"].as_str().unwrap();
        assert!(prompt.starts_with(DescriptionMode::ExhaustiveImage.prompt()));
        assert!(prompt.ends_with("what colour is the car?"));
        let system = body["system_instruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(system.contains("Portuguese"));
    }

    #[test]
    fn test_build_body_without_caption() {
        let req = DescribeRequest {
            data: b"",
            mime_type: "audio/ogg",
            kind: MediaKind::Audio,
            mode: DescriptionMode::AudioTranscription,
            caption: Some("   "),
            timeout: Duration::from_secs(5),
        };
        let body = engine().build_body(&req);
        assert_eq!(
            body["contents"][0]["parts"][1]["text"],
            DescriptionMode::AudioTranscription.prompt()
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let e = engine().with_base_url("http://localhost:9000/v1/");
        assert_eq!(e.base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "A cat " }, { "text": "on a sofa." }] },
                "finishReason": "STOP"
            }]
        });
        assert_eq!(extract_text(&body).unwrap(), "A cat on a sofa.");
    }

    #[test]
    fn test_extract_text_blocked_prompt() {
        let body = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert_eq!(
            extract_text(&body).unwrap_err(),
            InvocationError::ContentRejected("SAFETY".into())
        );
    }

    #[test]
    fn test_extract_text_safety_finish() {
        let body = json!({ "candidates": [{ "finishReason": "PROHIBITED_CONTENT" }] });
        assert!(matches!(
            extract_text(&body),
            Err(InvocationError::ContentRejected(_))
        ));
    }

    #[test]
    fn test_extract_text_no_candidates() {
        assert!(matches!(
            extract_text(&json!({})),
            Err(InvocationError::ContentRejected(_))
        ));
    }

    #[test]
    fn test_classify_http_errors() {
        let body = |msg: &str| json!({ "error": { "message": msg } });

        assert_eq!(
            classify_http_error(StatusCode::TOO_MANY_REQUESTS, &body("Resource exhausted")),
            InvocationError::RateLimited
        );
        assert_eq!(
            classify_http_error(
                StatusCode::TOO_MANY_REQUESTS,
                &body("You exceeded your current quota, please check your plan and billing details")
            ),
            InvocationError::RateLimited
        );
        assert!(matches!(
            classify_http_error(StatusCode::BAD_REQUEST, &body("Unsupported MIME type")),
            InvocationError::MalformedRequest(m) if m == "Unsupported MIME type"
        ));
        assert!(matches!(
            classify_http_error(StatusCode::SERVICE_UNAVAILABLE, &body("overloaded")),
            InvocationError::EngineUnavailable { transient: true, .. }
        ));
        assert!(matches!(
            classify_http_error(StatusCode::FORBIDDEN, &body("API key not valid")),
            InvocationError::EngineUnavailable { transient: false, .. }
        ));
        assert_eq!(
            classify_http_error(StatusCode::GATEWAY_TIMEOUT, &json!({})),
            InvocationError::Timeout
        );
    }

    fn quota_body(quota_id: &str) -> Value {
        json!({
            "error": {
                "code": 429,
                "message": "You exceeded your current quota, please check your plan and billing details. For more information on this error, head to: https://ai.google.dev/gemini-api/docs/rate-limits.",
                "status": "RESOURCE_EXHAUSTED",
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                        "violations": [{
                            "quotaMetric": "generativelanguage.googleapis.com/generate_content_free_tier_requests",
                            "quotaId": quota_id
                        }]
                    },
                    { "@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "17s" }
                ]
            }
        })
    }

    #[test]
    fn test_per_minute_limit_is_retryable() {
        let err = classify_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            &quota_body("GenerateRequestsPerMinutePerProjectPerModel-FreeTier"),
        );
        assert_eq!(err, InvocationError::RateLimited);
        assert!(err.is_transient());
    }

    #[test]
    fn test_per_day_quota_is_exhausted() {
        let err = classify_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            &quota_body("GenerateRequestsPerDayPerProjectPerModel-FreeTier"),
        );
        assert_eq!(err, InvocationError::QuotaExhausted);
        assert!(!err.is_transient());
    }
}
