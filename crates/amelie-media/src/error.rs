//! Error taxonomy of the media pipeline and the notices shown to users.

use serde::Serialize;

/// Why an inbound payload could not be turned into a media event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("unsupported media type: {mime}")]
    UnsupportedMedia { mime: String },
    #[error("payload is missing or empty")]
    EmptyPayload,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },
}

/// Failure reported by the description engine or the invoker around it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("description engine timed out")]
    Timeout,
    #[error("description engine rate limited the request")]
    RateLimited,
    #[error("content rejected by the description engine: {0}")]
    ContentRejected(String),
    #[error("description engine quota exhausted")]
    QuotaExhausted,
    #[error("malformed description request: {0}")]
    MalformedRequest(String),
    #[error("description engine unavailable: {detail}")]
    EngineUnavailable { transient: bool, detail: String },
}

impl InvocationError {
    /// Whether the single retry may be spent on this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            InvocationError::Timeout | InvocationError::RateLimited => true,
            InvocationError::EngineUnavailable { transient, .. } => *transient,
            InvocationError::ContentRejected(_)
            | InvocationError::QuotaExhausted
            | InvocationError::MalformedRequest(_) => false,
        }
    }
}

/// Ephemeral storage failures.
#[derive(Debug, thiserror::Error)]
pub enum EphemeralError {
    #[error("failed to acquire ephemeral storage: {0}")]
    AcquireFailed(#[source] std::io::Error),
    #[error("ephemeral handle already released")]
    AlreadyReleased,
}

/// Any reason a pipeline run ends in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Storage(#[from] EphemeralError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("conversation is no longer reachable")]
    Cancelled,
    #[error("reply delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Flat, copyable error category recorded in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedMedia,
    EmptyPayload,
    PayloadTooLarge,
    AcquireFailed,
    AlreadyReleased,
    Timeout,
    RateLimited,
    ContentRejected,
    QuotaExhausted,
    MalformedRequest,
    EngineUnavailable,
    Cancelled,
    DeliveryFailed,
}

const NOTICE_UNSUPPORTED: &str = "This type of file is not supported. Please send a photo, \
    video, audio message or document (PDF or text).";
const NOTICE_EMPTY: &str =
    "The file arrived empty, so there is nothing to describe. Please send it again.";
const NOTICE_STORAGE: &str =
    "I could not prepare your file for processing. Please try again in a moment.";
const NOTICE_BUSY: &str = "The description service is busy right now. I tried again but it \
    did not respond in time. Please try again in a few moments.";
const NOTICE_REJECTED: &str =
    "The description service declined to process this content, so I cannot describe it.";
const NOTICE_UNAVAILABLE: &str = "Sorry, a technical problem prevents me from describing \
    files right now. Please try again later.";

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Classification(e) => match e {
                ClassificationError::UnsupportedMedia { .. } => ErrorKind::UnsupportedMedia,
                ClassificationError::EmptyPayload => ErrorKind::EmptyPayload,
                ClassificationError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            },
            PipelineError::Storage(e) => match e {
                EphemeralError::AcquireFailed(_) => ErrorKind::AcquireFailed,
                EphemeralError::AlreadyReleased => ErrorKind::AlreadyReleased,
            },
            PipelineError::Invocation(e) => match e {
                InvocationError::Timeout => ErrorKind::Timeout,
                InvocationError::RateLimited => ErrorKind::RateLimited,
                InvocationError::ContentRejected(_) => ErrorKind::ContentRejected,
                InvocationError::QuotaExhausted => ErrorKind::QuotaExhausted,
                InvocationError::MalformedRequest(_) => ErrorKind::MalformedRequest,
                InvocationError::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            },
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::DeliveryFailed(_) => ErrorKind::DeliveryFailed,
        }
    }

    /// Plain-language notice for the user, or `None` when nothing is sent.
    ///
    /// Never includes engine or system error text.
    pub fn user_notice(&self) -> Option<String> {
        let notice = match self {
            PipelineError::Classification(ClassificationError::PayloadTooLarge {
                limit, ..
            }) => {
                return Some(format!(
                    "This file is too large for me to process. The limit is {} MB.",
                    limit / (1024 * 1024)
                ));
            }
            PipelineError::Classification(ClassificationError::UnsupportedMedia { .. }) => {
                NOTICE_UNSUPPORTED
            }
            PipelineError::Classification(ClassificationError::EmptyPayload) => NOTICE_EMPTY,
            PipelineError::Storage(_) => NOTICE_STORAGE,
            PipelineError::Invocation(e) if e.is_transient() => NOTICE_BUSY,
            PipelineError::Invocation(InvocationError::ContentRejected(_)) => NOTICE_REJECTED,
            PipelineError::Invocation(_) => NOTICE_UNAVAILABLE,
            PipelineError::Cancelled | PipelineError::DeliveryFailed(_) => return None,
        };
        Some(notice.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(InvocationError::Timeout.is_transient());
        assert!(InvocationError::RateLimited.is_transient());
        assert!(InvocationError::EngineUnavailable {
            transient: true,
            detail: "503".into()
        }
        .is_transient());
        assert!(!InvocationError::EngineUnavailable {
            transient: false,
            detail: "403".into()
        }
        .is_transient());
        assert!(!InvocationError::ContentRejected("SAFETY".into()).is_transient());
        assert!(!InvocationError::QuotaExhausted.is_transient());
        assert!(!InvocationError::MalformedRequest("bad".into()).is_transient());
    }

    #[test]
    fn test_notice_never_leaks_detail() {
        let err = PipelineError::from(InvocationError::ContentRejected(
            "blockReason=OTHER internal-id-123".into(),
        ));
        let notice = err.user_notice().unwrap();
        assert!(!notice.contains("internal-id-123"));
        assert_eq!(err.kind(), ErrorKind::ContentRejected);

        let err = PipelineError::from(InvocationError::EngineUnavailable {
            transient: false,
            detail: "API key not valid".into(),
        });
        assert!(!err.user_notice().unwrap().contains("API key"));
    }

    #[test]
    fn test_too_large_notice_mentions_limit() {
        let err = PipelineError::from(ClassificationError::PayloadTooLarge {
            size: 30 * 1024 * 1024,
            limit: 20 * 1024 * 1024,
        });
        assert!(err.user_notice().unwrap().contains("20 MB"));
    }

    #[test]
    fn test_cancelled_sends_nothing() {
        assert!(PipelineError::Cancelled.user_notice().is_none());
        assert_eq!(PipelineError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_busy_notice_for_transient_failures() {
        let busy = PipelineError::from(InvocationError::Timeout)
            .user_notice()
            .unwrap();
        let rate = PipelineError::from(InvocationError::RateLimited)
            .user_notice()
            .unwrap();
        assert_eq!(busy, rate);
    }
}
