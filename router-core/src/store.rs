use crate::errors::CatchEventFailureKind;
use crate::types::{
    DeferredPurpose, DeferredRecord, ElementInstance, EventTrigger, Intent, Key, Workflow,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// `getWorkflowByKey(key) -> Workflow | none` (§6). The BPMN model loader
/// that populates this store is an external collaborator (§1 non-goal).
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow_by_key(&self, key: Key) -> Result<Option<Workflow>>;
}

/// §6: `peekEventTrigger`, `deleteTrigger`. `create_event_trigger` is the
/// producer-side operation this core's callers (the correlation side of the
/// engine) use to enqueue a trigger — not itself named as a router/behavior
/// operation in §4, but required for §3's ordering invariant to be testable
/// without reaching into storage internals.
#[async_trait]
pub trait EventScopeStore: Send + Sync {
    /// Earliest outstanding trigger for `scope_key`, ordered by event key.
    async fn peek_event_trigger(&self, scope_key: Key) -> Result<Option<EventTrigger>>;

    async fn delete_trigger(&self, scope_key: Key, event_key: Key) -> Result<()>;

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<()>;

    /// Removes every pending trigger owned by `scope_key`. Used by
    /// `unsubscribe_from_events` (§4.2, idempotent).
    async fn delete_all_triggers(&self, scope_key: Key) -> Result<()>;
}

/// §6: `newInstance`, `storeRecord`, `getDeferredRecords`, plus the
/// supplemental operations SPEC_FULL.md adds (incident recording, child
/// enumeration for interrupting event-sub-process termination).
#[async_trait]
pub trait ElementInstanceStore: Send + Sync {
    async fn get_instance(&self, key: Key) -> Result<Option<ElementInstance>>;

    async fn new_instance(&self, instance: ElementInstance) -> Result<()>;

    async fn update_instance(&self, instance: ElementInstance) -> Result<()>;

    /// Stages a record under `parent_key`, indexed by `child_key` and
    /// `intent` (§4.2 "deferred → publish handoff").
    async fn store_record(
        &self,
        child_key: Key,
        parent_key: Key,
        record: crate::types::WorkflowRecord,
        intent: Intent,
        purpose: DeferredPurpose,
    ) -> Result<()>;

    async fn get_deferred_records(&self, scope_key: Key) -> Result<Vec<DeferredRecord>>;

    async fn delete_deferred_record(&self, scope_key: Key, child_key: Key, intent: Intent) -> Result<()>;

    /// Discards every deferred record owned by `scope_key` — called when the
    /// scope terminates without publishing them (§3 ownership rule).
    async fn discard_deferred_records(&self, scope_key: Key) -> Result<()>;

    async fn children_of(&self, scope_key: Key) -> Result<Vec<ElementInstance>>;

    /// Publishes an incident for a recoverable `subscribe_to_events` failure
    /// (§7 propagation policy).
    async fn record_incident(&self, scope_key: Key, kind: CatchEventFailureKind, message: String) -> Result<()>;
}

/// `setTemporaryVariables(elementInstanceKey, bytes)` (§6).
#[async_trait]
pub trait VariablesStore: Send + Sync {
    async fn set_temporary_variables(&self, element_instance_key: Key, variables: Bytes) -> Result<()>;

    async fn get_temporary_variables(&self, element_instance_key: Key) -> Result<Option<Bytes>>;
}

/// `nextKey() -> u64`, strictly monotonic per partition (§6).
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self) -> Key;
}

/// Appends follow-up records to the local partition's log stream (§2, §6).
/// Deliberately synchronous: the owning partition is single-threaded
/// cooperative (§5) and appends never yield mid-operation.
pub trait StreamWriter: Send + Sync {
    fn append_new_event(&self, key: Key, intent: Intent, record: crate::types::WorkflowRecord);

    fn append_follow_up_event(&self, key: Key, intent: Intent, record: crate::types::WorkflowRecord);
}
