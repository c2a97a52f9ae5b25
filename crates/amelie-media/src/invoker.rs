//! Description invoker: one engine call per event, with a single bounded
//! retry for transient failures.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use amelie_types::MediaKind;

use crate::engine::{DescribeRequest, DescriptionEngine};
use crate::ephemeral::ScopedHandle;
use crate::error::{EphemeralError, InvocationError};
use crate::mode::DescriptionMode;

/// First attempt plus at most one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Single-use request derived from a classified event.
#[derive(Debug, Clone, Copy)]
pub struct DescriptionRequest<'a> {
    pub kind: MediaKind,
    pub mode: DescriptionMode,
    pub mime_type: &'a str,
    pub caption: Option<&'a str>,
    pub payload: &'a ScopedHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionResult {
    Success { raw_text: String },
    Failure { error: InvocationError },
}

/// Result of an invocation plus the number of engine calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub result: DescriptionResult,
    pub attempts: u32,
}

/// Timing policy of the invoker.
#[derive(Debug, Clone, Copy)]
pub struct InvokerPolicy {
    /// Bound on each engine call.
    pub timeout: Duration,
    /// Pause before the retry.
    pub retry_delay: Duration,
}

impl Default for InvokerPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Wraps a [`DescriptionEngine`] with timeout and retry policy.
#[derive(Clone)]
pub struct DescriptionInvoker {
    engine: Arc<dyn DescriptionEngine>,
    policy: InvokerPolicy,
}

impl DescriptionInvoker {
    pub fn new(engine: Arc<dyn DescriptionEngine>, policy: InvokerPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn engine_id(&self) -> &str {
        self.engine.id()
    }

    /// Invoke the engine for `request`.
    ///
    /// Engine failures are reported inside the returned [`Invocation`]; only a
    /// payload that can no longer be read from storage is an `Err`.
    pub async fn invoke(
        &self,
        request: &DescriptionRequest<'_>,
    ) -> Result<Invocation, EphemeralError> {
        let data = request.payload.read().await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let call = self.engine.describe(DescribeRequest {
                data: &data,
                mime_type: request.mime_type,
                kind: request.kind,
                mode: request.mode,
                caption: request.caption,
                timeout: self.policy.timeout,
            });

            let outcome = match tokio::time::timeout(self.policy.timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InvocationError::Timeout),
            };

            match outcome {
                Ok(raw_text) => {
                    debug!(engine = self.engine.id(), attempts, "Engine call succeeded");
                    return Ok(Invocation {
                        result: DescriptionResult::Success { raw_text },
                        attempts,
                    });
                }
                Err(error) if error.is_transient() && attempts < MAX_ATTEMPTS => {
                    warn!(
                        engine = self.engine.id(),
                        attempt = attempts,
                        "Transient engine failure, retrying: {error}"
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(error) => {
                    warn!(engine = self.engine.id(), attempts, "Engine call failed: {error}");
                    return Ok(Invocation {
                        result: DescriptionResult::Failure { error },
                        attempts,
                    });
                }
            }
        }
    }
}
