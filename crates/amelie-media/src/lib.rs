//! amelie-media: the media description pipeline.
//!
//! Classifies inbound media, resolves the description mode from the
//! conversation's settings, holds the payload in ephemeral storage, invokes
//! the description engine and delivers a screen-reader-friendly reply.

pub mod classify;
pub mod engine;
pub mod ephemeral;
pub mod error;
pub mod gemini;
pub mod invoker;
pub mod mode;
pub mod pipeline;
pub mod sanitize;

pub use classify::{ClassifierLimits, MediaEvent, RawInboundMessage, classify};
pub use engine::{DescribeRequest, DescriptionEngine};
pub use ephemeral::{EphemeralStore, ReleaseObserver, ScopedHandle};
pub use error::{
    ClassificationError, EphemeralError, ErrorKind, InvocationError, PipelineError,
};
pub use gemini::GeminiEngine;
pub use invoker::{DescriptionInvoker, DescriptionResult, Invocation, InvokerPolicy};
pub use mode::DescriptionMode;
pub use pipeline::{
    ConfigSource, MediaPipeline, PipelineOutcome, PipelineSettings, ReplySink, Stage, Terminal,
};
pub use sanitize::{SanitizedReply, sanitize};
