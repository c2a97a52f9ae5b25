//! Description engine port.

use std::time::Duration;

use async_trait::async_trait;

use amelie_types::MediaKind;

use crate::error::InvocationError;
use crate::mode::DescriptionMode;

/// One self-contained engine call. Carries no session or history.
#[derive(Debug, Clone, Copy)]
pub struct DescribeRequest<'a> {
    pub data: &'a [u8],
    pub mime_type: &'a str,
    pub kind: MediaKind,
    pub mode: DescriptionMode,
    /// Text the sender attached to this media, if any.
    pub caption: Option<&'a str>,
    pub timeout: Duration,
}

/// An opaque multimodal model that turns media into text.
#[async_trait]
pub trait DescriptionEngine: Send + Sync {
    /// Engine identifier.
    fn id(&self) -> &str;
    /// Describe the media. Must not retain any reference to the request.
    async fn describe(&self, req: DescribeRequest<'_>) -> Result<String, InvocationError>;
}
