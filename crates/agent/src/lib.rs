//! The adaptive execution engine — the heart of Stepwise.
//!
//! A run follows an **Observe → Decide → Act** cycle:
//!
//! 1. **Classify** the request into a reasoning profile (temperature,
//!    iteration budget, whether delegation is allowed)
//! 2. **Ask** the provider for the next step
//! 3. **Validate** each requested tool call: does the tool exist, can the
//!    arguments be repaired to fit its schema, is the model looping
//! 4. **Execute** valid calls and let the tool's handler decide whether the
//!    run continues
//! 5. **Observe**: results go back into the transcript, and two event
//!    protocols report progress to whoever is listening
//!
//! The loop ends on a final answer, when the budget is spent
//! (`forced_finish`), or on a provider failure, cancellation or timeout.

pub mod classifier;
pub mod error;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod prompts;
pub mod router;
pub mod scripted;
pub mod state;
pub mod validators;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use classifier::ComplexityClassifier;
pub use error::{RunError, RunFailure};
pub use events::{
    Artifact, EmitError, EventHub, EventSubscription, ExecutionEvent, RunStatus, SemanticEvent,
    Source, StreamEvent,
};
pub use executor::{AdaptiveExecutor, RunHandle, RunOutcome, RunReport};
pub use handlers::{
    Continuation, DelegationOutcome, Delegator, HandlerContext, HandlerOutcome, HandlerRegistry,
    ReasoningKind, SideEffect, ToolHandler,
};
pub use prompts::PromptBook;
pub use router::ProviderRouter;
pub use state::{IterationState, RunState, StateError};
pub use validators::{LoopDetector, LoopVerdict, ToolCatalog};
