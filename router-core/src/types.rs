use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// One shard of the replicated event log. Each partition has exactly one
/// leader at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 64-bit identifier minted by a `KeyGenerator`. Unique within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u64);

impl Key {
    pub const NONE: Key = Key(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BPMN element kinds this core needs to distinguish. Not exhaustive of the
/// BPMN spec — only what the subscription/event behavior dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BpmnElementType {
    Process,
    StartEvent,
    ServiceTask,
    ReceiveTask,
    BoundaryEvent,
    IntermediateCatchEvent,
    EventBasedGateway,
    EventSubProcess,
    SequenceFlow,
}

/// Immutable once deployed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_key: Key,
    pub bpmn_process_id: String,
    pub version: i32,
    pub root_element_id: String,
    pub element_type: BpmnElementType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementInstanceState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

/// A live execution node of a workflow instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    /// The flow-scope (parent) instance key. `Key::NONE` for the process root.
    pub parent_key: Key,
    pub element_id: String,
    pub element_type: BpmnElementType,
    pub state: ElementInstanceState,
    pub active_token_count: u32,
    /// `Key::NONE` if this scope is not interrupted. Once set to a non-NONE
    /// value it must never change to a *different* non-NONE value over the
    /// instance's lifetime (§8 invariant).
    pub interrupting_event_key: Key,
}

impl ElementInstance {
    pub fn new(key: Key, parent_key: Key, element_id: impl Into<String>, element_type: BpmnElementType) -> Self {
        Self {
            key,
            parent_key,
            element_id: element_id.into(),
            element_type,
            state: ElementInstanceState::Activating,
            active_token_count: 0,
            interrupting_event_key: Key::NONE,
        }
    }

    /// A scope is interrupted iff `interrupting_event_key > 0` (§3 invariant).
    pub fn is_interrupted(&self) -> bool {
        !self.interrupting_event_key.is_none()
    }

    /// §4.2 "interrupted" scope predicate: ready to publish a deferred
    /// interrupting event-sub-process activation.
    pub fn is_ready_for_interrupting_publish(&self) -> bool {
        self.active_token_count == 2 && self.is_interrupted() && self.state == ElementInstanceState::Activated
    }
}

/// A pending event waiting to be injected into its event scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub scope_key: Key,
    /// Unique within the scope; triggers are consumed in ascending order.
    pub event_key: Key,
    pub target_element_id: String,
    pub variables: Bytes,
}

/// Distinguishes a staged ELEMENT_ACTIVATING publication from other kinds of
/// deferral this store may one day need to support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferredPurpose {
    ActivatingEvent,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    ElementActivating,
    ElementTerminating,
    ElementCompleting,
}

/// The payload of an ELEMENT_ACTIVATING record, staged or published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementActivatingRecord {
    pub element_id: String,
    pub bpmn_element_type: BpmnElementType,
    pub flow_scope_key: Key,
    pub workflow_key: Key,
    pub version: i32,
    pub bpmn_process_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowRecord {
    ElementActivating(ElementActivatingRecord),
}

/// A record staged under a scope, to be appended to the log only when the
/// scope reaches a specific state. Owned by its parent scope; discarded when
/// that scope terminates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRecord {
    pub owner_scope_key: Key,
    pub child_instance_key: Key,
    pub intent: Intent,
    pub purpose: DeferredPurpose,
    pub record: WorkflowRecord,
}

/// The five wire records of the subscription protocol (§3, §6).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionCommand {
    OpenMessageSubscription {
        subscription_partition_id: PartitionId,
        workflow_instance_partition_id: PartitionId,
        workflow_instance_key: Key,
        activity_instance_key: Key,
        message_name: Bytes,
        correlation_key: Bytes,
    },
    OpenedMessageSubscription {
        subscription_partition_id: PartitionId,
        workflow_instance_partition_id: PartitionId,
        workflow_instance_key: Key,
        activity_instance_key: Key,
        message_name: Bytes,
    },
    CorrelateWorkflowInstanceSubscription {
        subscription_partition_id: PartitionId,
        workflow_instance_partition_id: PartitionId,
        workflow_instance_key: Key,
        activity_instance_key: Key,
        message_name: Bytes,
        payload: Bytes,
    },
    CloseMessageSubscription {
        subscription_partition_id: PartitionId,
        workflow_instance_partition_id: PartitionId,
        workflow_instance_key: Key,
        activity_instance_key: Key,
        message_name: Bytes,
    },
    RejectCorrelateMessageSubscription {
        subscription_partition_id: PartitionId,
        workflow_instance_partition_id: PartitionId,
        workflow_instance_key: Key,
        activity_instance_key: Key,
        message_name: Bytes,
        correlation_key: Bytes,
    },
}

/// Subscription-api and management-api addresses of a partition's current
/// leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub subscription_api: SocketAddr,
    pub management_api: SocketAddr,
}

/// Opaque handle returned by `TransportClient::register_remote_address`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemoteAddress(pub SocketAddr);

/// A persisted, queryable trail of recoverable subscription failures —
/// modeled on the teacher's `Incident` type, scoped to this core's needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionIncident {
    pub scope_key: Key,
    pub kind: String,
    pub message: String,
}
