//! Run events and the two protocols derived from them.
//!
//! The executor records every transition as an `ExecutionEvent` in an
//! append-only log. An `EventHub` translates each event into:
//!
//! - the **stream** protocol (`run_start`, `iteration_start`, `tool_start`,
//!   `token`, `run_end`) for live, token-level rendering, and
//! - the **semantic** protocol (`thinking`, `action`, `sources`,
//!   `artifact`, `done`) for hosts that only want user-facing milestones.
//!
//! Delivery is fire-and-forget over `tokio::sync::broadcast`: sending never
//! blocks the loop, missing or slow subscribers lose events, and nothing is
//! replayed. Both subscriptions end after `run_end`.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use stepwise_core::request::ReasoningProfile;
use stepwise_core::tool::FailureKind;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// A user-visible product of a run (slide deck, image, document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// e.g. "slides", "image"
    pub kind: String,

    /// URL, path or id where the artifact lives
    pub reference: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A document or record a tool result was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    ForcedFinish,
    Failed,
    Cancelled,
}

/// Internal event log entry. Ordering is causal emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStart {
        run_id: String,
        provider: String,
        model: String,
        profile: ReasoningProfile,
        depth: u32,
    },
    IterationStart {
        iteration: u32,
    },
    ToolStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
        /// Loop-control tools (finish, think, ...) rather than real actions
        control: bool,
    },
    ToolEnd {
        call_id: String,
        name: String,
        success: bool,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureKind>,
    },
    Token {
        content: String,
    },
    Thinking {
        kind: String,
        content: String,
    },
    Artifact {
        artifact: Artifact,
    },
    Sources {
        sources: Vec<Source>,
    },
    RunEnd {
        status: RunStatus,
        iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::IterationStart { .. } => "iteration_start",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Token { .. } => "token",
            Self::Thinking { .. } => "thinking",
            Self::Artifact { .. } => "artifact",
            Self::Sources { .. } => "sources",
            Self::RunEnd { .. } => "run_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunEnd { .. })
    }
}

/// Low-level protocol for live incremental rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RunStart {
        run_id: String,
        provider: String,
        model: String,
    },
    IterationStart {
        iteration: u32,
    },
    ToolStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Token {
        content: String,
    },
    RunEnd {
        status: RunStatus,
        iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StreamEvent {
    /// Translate an internal event; `None` when the protocol has no counterpart.
    pub fn from_execution(event: &ExecutionEvent) -> Option<Self> {
        match event {
            ExecutionEvent::RunStart {
                run_id,
                provider,
                model,
                ..
            } => Some(Self::RunStart {
                run_id: run_id.clone(),
                provider: provider.clone(),
                model: model.clone(),
            }),
            ExecutionEvent::IterationStart { iteration } => Some(Self::IterationStart {
                iteration: *iteration,
            }),
            ExecutionEvent::ToolStart {
                call_id,
                name,
                arguments,
                ..
            } => Some(Self::ToolStart {
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            ExecutionEvent::Token { content } => Some(Self::Token {
                content: content.clone(),
            }),
            ExecutionEvent::RunEnd {
                status,
                iterations,
                answer,
                error,
            } => Some(Self::RunEnd {
                status: *status,
                iterations: *iterations,
                answer: answer.clone(),
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// Milestone protocol for host integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SemanticEvent {
    Thinking {
        kind: String,
        content: String,
    },
    Action {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    Sources {
        sources: Vec<Source>,
    },
    Artifact {
        artifact: Artifact,
    },
    Done {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SemanticEvent {
    /// Translate an internal event; `None` when the protocol has no counterpart.
    pub fn from_execution(event: &ExecutionEvent) -> Option<Self> {
        match event {
            ExecutionEvent::Thinking { kind, content } => Some(Self::Thinking {
                kind: kind.clone(),
                content: content.clone(),
            }),
            ExecutionEvent::ToolStart {
                call_id,
                name,
                arguments,
                control: false,
            } => Some(Self::Action {
                call_id: call_id.clone(),
                tool: name.clone(),
                arguments: arguments.clone(),
            }),
            ExecutionEvent::Sources { sources } => Some(Self::Sources {
                sources: sources.clone(),
            }),
            ExecutionEvent::Artifact { artifact } => Some(Self::Artifact {
                artifact: artifact.clone(),
            }),
            ExecutionEvent::RunEnd {
                status,
                answer,
                error,
                ..
            } => Some(Self::Done {
                status: *status,
                answer: answer.clone(),
                error: error.clone(),
            }),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Action { .. } => "action",
            Self::Sources { .. } => "sources",
            Self::Artifact { .. } => "artifact",
            Self::Done { .. } => "done",
        }
    }
}

/// Rejection of an event emitted after the run ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("run already ended; dropped {event_type} event")]
    Closed { event_type: &'static str },
}

/// Per-run event log plus the two protocol channels.
pub struct EventHub {
    stream_tx: Option<broadcast::Sender<StreamEvent>>,
    semantic_tx: Option<broadcast::Sender<SemanticEvent>>,
    log: Vec<ExecutionEvent>,
}

impl EventHub {
    /// Create a hub whose channels buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (stream_tx, _) = broadcast::channel(capacity);
        let (semantic_tx, _) = broadcast::channel(capacity);
        Self {
            stream_tx: Some(stream_tx),
            semantic_tx: Some(semantic_tx),
            log: Vec::new(),
        }
    }

    /// Subscribe to the stream protocol. Only events emitted after this call are seen.
    pub fn subscribe_stream(&self) -> EventSubscription<StreamEvent> {
        EventSubscription::from_sender(self.stream_tx.as_ref())
    }

    /// Subscribe to the semantic protocol. Only events emitted after this call are seen.
    pub fn subscribe_semantic(&self) -> EventSubscription<SemanticEvent> {
        EventSubscription::from_sender(self.semantic_tx.as_ref())
    }

    /// Record an event and publish its protocol translations.
    ///
    /// Publishing never fails the caller: a send without receivers is not an
    /// error. The only rejection is an event after `run_end`.
    pub fn emit(&mut self, event: ExecutionEvent) -> Result<(), EmitError> {
        if self.is_closed() {
            return Err(EmitError::Closed {
                event_type: event.event_type(),
            });
        }

        if let (Some(tx), Some(translated)) = (&self.stream_tx, StreamEvent::from_execution(&event)) {
            if tx.send(translated).is_err() {
                debug!(event = event.event_type(), "No stream subscribers");
            }
        }
        if let (Some(tx), Some(translated)) =
            (&self.semantic_tx, SemanticEvent::from_execution(&event))
        {
            if tx.send(translated).is_err() {
                debug!(event = event.event_type(), "No semantic subscribers");
            }
        }

        let terminal = event.is_terminal();
        self.log.push(event);
        if terminal {
            self.close();
        }
        Ok(())
    }

    /// Drop the senders so every subscription finishes.
    pub fn close(&mut self) {
        self.stream_tx = None;
        self.semantic_tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.stream_tx.is_none()
    }

    /// Everything emitted so far, in order.
    pub fn log(&self) -> &[ExecutionEvent] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.log)
    }
}

/// A lazy, finite, ordered sequence of one protocol's events.
///
/// Lagging subscribers skip what they missed and keep going.
pub struct EventSubscription<T> {
    inner: Pin<Box<dyn Stream<Item = T> + Send>>,
}

impl<T: Clone + Send + 'static> EventSubscription<T> {
    fn from_sender(sender: Option<&broadcast::Sender<T>>) -> Self {
        let rx = match sender {
            Some(tx) => tx.subscribe(),
            // Already closed: hand out a receiver whose sender is gone.
            None => broadcast::channel(1).1,
        };
        let inner = BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged; events dropped");
                None
            }
        });
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<T> Stream for EventSubscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.as_mut().poll_next(cx)
    }
}
