//! Ambient trace context
//!
//! The bus stamps outgoing messages with the trace of whatever task publishes
//! them. [`TaskLocalTraceContext`] reads that trace from a tokio task-local set
//! by [`with_trace`]; other propagation schemes implement [`TraceContext`].

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::message::{Message, new_id};

tokio::task_local! {
    static CURRENT_TRACE: TraceInfo;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceInfo {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            parent_span_id: None,
        }
    }

    /// A new span in the same trace whose parent is this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// The trace carried by a received message, if it has one.
    ///
    /// A message without a span id still continues its trace under a fresh span.
    pub fn from_message(message: &Message) -> Option<Self> {
        let trace_id = message.trace_id.clone()?;
        Some(Self {
            trace_id,
            span_id: message.span_id.clone().unwrap_or_else(new_id),
            parent_span_id: message.parent_span_id.clone(),
        })
    }
}

pub trait TraceContext: Send + Sync {
    fn current_trace(&self) -> Option<TraceInfo>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalTraceContext;

impl TraceContext for TaskLocalTraceContext {
    fn current_trace(&self) -> Option<TraceInfo> {
        CURRENT_TRACE.try_with(Clone::clone).ok()
    }
}

/// Run `fut` with `info` as its ambient trace.
pub async fn with_trace<F>(info: TraceInfo, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TRACE.scope(info, fut).await
}

/// The ambient trace of the current task, if any.
pub fn current_trace() -> Option<TraceInfo> {
    TaskLocalTraceContext.current_trace()
}
