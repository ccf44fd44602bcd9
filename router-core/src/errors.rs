use crate::types::Key;
use thiserror::Error;

/// Recoverable routing failures (§7). The router swallows `TopologyUnknown`
/// at its own boundary (see `DispatchOutcome`); `FetchTimeout` is the only
/// variant that ever reaches a caller of `fetch_created_topics`.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no leader known for partition")]
    TopologyUnknown,
    #[error("outgoing transport refused the message")]
    TransportBackpressure,
    #[error("bootstrap topology fetch did not complete within the deadline")]
    FetchTimeout,
}

/// Structural invariant violations raised by `BpmnEventSubscriptionBehavior`.
/// These are bugs, not user errors — the enclosing stream processor is
/// expected to suspend and alert rather than recover in place (§7).
#[derive(Debug, Error)]
pub enum SubscriptionBehaviorError {
    #[error("no event trigger found for scope {scope_key} (expected one while starting workflow {workflow_key})")]
    NoTriggeredEvent { scope_key: Key, workflow_key: Key },

    #[error("no workflow found for key {workflow_key}")]
    NoWorkflow { workflow_key: Key },

    #[error("event trigger for scope {scope_key} targets boundary event '{target_element_id}', which is not declared on element '{element_id}'")]
    UnknownBoundaryEvent {
        scope_key: Key,
        element_id: String,
        target_element_id: String,
    },
}

/// The kind of recoverable failure `subscribe_to_events` can report (§7, §9:
/// "encode as a sum result type, reserve exceptions for structural
/// invariants").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchEventFailureKind {
    ExtractValueError,
    CorrelationKeyError,
    ExpressionError,
    MessageNameError,
}

impl std::fmt::Display for CatchEventFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CatchEventFailureKind::ExtractValueError => "EXTRACT_VALUE_ERROR",
            CatchEventFailureKind::CorrelationKeyError => "CORRELATION_KEY_ERROR",
            CatchEventFailureKind::ExpressionError => "EXPRESSION_ERROR",
            CatchEventFailureKind::MessageNameError => "MESSAGE_NAME_ERROR",
        };
        f.write_str(s)
    }
}

/// Non-exceptional failure result of `subscribe_to_events`. Carries the
/// scope at which the caller should publish an incident (§7 propagation
/// policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchEventFailure {
    pub kind: CatchEventFailureKind,
    pub message: String,
    pub scope_key: Key,
}

impl std::fmt::Display for CatchEventFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (scope {})", self.kind, self.message, self.scope_key)
    }
}

impl std::error::Error for CatchEventFailure {}

/// Raised by an `ExpressionEvaluator` when it cannot produce a value at all
/// (as opposed to producing one the router then rejects). Propagates as the
/// element instance key rather than the variables-scope key (§4.2).
#[derive(Debug, Error)]
#[error("expression evaluation failed: {message}")]
pub struct EvaluationException {
    pub message: String,
}
