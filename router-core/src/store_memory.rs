use crate::errors::CatchEventFailureKind;
use crate::store::{ElementInstanceStore, EventScopeStore, KeyGenerator, StreamWriter, VariablesStore, WorkflowStore};
use crate::types::{
    DeferredPurpose, DeferredRecord, ElementInstance, EventTrigger, Intent, Key, SubscriptionIncident, Workflow,
    WorkflowRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

struct Inner {
    workflows: HashMap<Key, Workflow>,
    instances: HashMap<Key, ElementInstance>,
    /// Triggers keyed by (scope_key, event_key) — the `BTreeMap` inner
    /// ordering gives `peek_event_trigger` its ascending-event-key semantics
    /// for free (§3, §8).
    triggers: HashMap<Key, BTreeMap<Key, EventTrigger>>,
    deferred: HashMap<Key, Vec<DeferredRecord>>,
    variables: HashMap<Key, Bytes>,
    incidents: HashMap<Key, Vec<SubscriptionIncident>>,
}

/// In-memory implementation of the five store traits, used by the test
/// suite and suitable for a single-node demo server — the teacher's
/// `MemoryStore` convention (`store_memory.rs`).
pub struct MemoryStores {
    inner: RwLock<Inner>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                workflows: HashMap::new(),
                instances: HashMap::new(),
                triggers: HashMap::new(),
                deferred: HashMap::new(),
                variables: HashMap::new(),
                incidents: HashMap::new(),
            }),
        }
    }

    /// Test/bootstrap helper — the BPMN model loader (out of scope) would
    /// call the equivalent of this in a real deployment.
    pub async fn deploy_workflow(&self, workflow: Workflow) {
        self.inner.write().await.workflows.insert(workflow.workflow_key, workflow);
    }

    pub async fn incidents_for(&self, scope_key: Key) -> Vec<SubscriptionIncident> {
        self.inner
            .read()
            .await
            .incidents
            .get(&scope_key)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStores {
    async fn get_workflow_by_key(&self, key: Key) -> Result<Option<Workflow>> {
        Ok(self.inner.read().await.workflows.get(&key).cloned())
    }
}

#[async_trait]
impl EventScopeStore for MemoryStores {
    async fn peek_event_trigger(&self, scope_key: Key) -> Result<Option<EventTrigger>> {
        let r = self.inner.read().await;
        Ok(r.triggers
            .get(&scope_key)
            .and_then(|by_event| by_event.values().next().cloned()))
    }

    async fn delete_trigger(&self, scope_key: Key, event_key: Key) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(by_event) = w.triggers.get_mut(&scope_key) {
            by_event.remove(&event_key);
        }
        Ok(())
    }

    async fn create_event_trigger(&self, trigger: EventTrigger) -> Result<()> {
        let mut w = self.inner.write().await;
        w.triggers
            .entry(trigger.scope_key)
            .or_default()
            .insert(trigger.event_key, trigger);
        Ok(())
    }

    async fn delete_all_triggers(&self, scope_key: Key) -> Result<()> {
        self.inner.write().await.triggers.remove(&scope_key);
        Ok(())
    }
}

#[async_trait]
impl ElementInstanceStore for MemoryStores {
    async fn get_instance(&self, key: Key) -> Result<Option<ElementInstance>> {
        Ok(self.inner.read().await.instances.get(&key).cloned())
    }

    async fn new_instance(&self, instance: ElementInstance) -> Result<()> {
        self.inner.write().await.instances.insert(instance.key, instance);
        Ok(())
    }

    async fn update_instance(&self, instance: ElementInstance) -> Result<()> {
        self.inner.write().await.instances.insert(instance.key, instance);
        Ok(())
    }

    async fn store_record(
        &self,
        child_key: Key,
        parent_key: Key,
        record: WorkflowRecord,
        intent: Intent,
        purpose: DeferredPurpose,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.deferred.entry(parent_key).or_default().push(DeferredRecord {
            owner_scope_key: parent_key,
            child_instance_key: child_key,
            intent,
            purpose,
            record,
        });
        Ok(())
    }

    async fn get_deferred_records(&self, scope_key: Key) -> Result<Vec<DeferredRecord>> {
        Ok(self.inner.read().await.deferred.get(&scope_key).cloned().unwrap_or_default())
    }

    async fn delete_deferred_record(&self, scope_key: Key, child_key: Key, intent: Intent) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(records) = w.deferred.get_mut(&scope_key) {
            records.retain(|r| !(r.child_instance_key == child_key && r.intent == intent));
        }
        Ok(())
    }

    async fn discard_deferred_records(&self, scope_key: Key) -> Result<()> {
        self.inner.write().await.deferred.remove(&scope_key);
        Ok(())
    }

    async fn children_of(&self, scope_key: Key) -> Result<Vec<ElementInstance>> {
        Ok(self
            .inner
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.parent_key == scope_key)
            .cloned()
            .collect())
    }

    async fn record_incident(&self, scope_key: Key, kind: CatchEventFailureKind, message: String) -> Result<()> {
        let mut w = self.inner.write().await;
        w.incidents.entry(scope_key).or_default().push(SubscriptionIncident {
            scope_key,
            kind: kind.to_string(),
            message,
        });
        Ok(())
    }
}

#[async_trait]
impl VariablesStore for MemoryStores {
    async fn set_temporary_variables(&self, element_instance_key: Key, variables: Bytes) -> Result<()> {
        self.inner.write().await.variables.insert(element_instance_key, variables);
        Ok(())
    }

    async fn get_temporary_variables(&self, element_instance_key: Key) -> Result<Option<Bytes>> {
        Ok(self.inner.read().await.variables.get(&element_instance_key).cloned())
    }
}

/// Strictly monotonic per partition (§6). A single `AtomicU64` is enough
/// since the owning partition is single-threaded cooperative (§5) — this
/// still uses atomics rather than a `Cell` so the generator can be shared
/// behind an `Arc` without extra synchronization at the call site.
pub struct AtomicKeyGenerator {
    next: AtomicU64,
}

impl AtomicKeyGenerator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first) }
    }
}

impl Default for AtomicKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for AtomicKeyGenerator {
    fn next_key(&self) -> Key {
        Key(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Captures appended records for inspection by tests and by a local demo
/// server. A real deployment's `StreamWriter` appends to the partition's
/// replicated log instead (§2 non-goal: "the log-stream replication layer").
#[derive(Default)]
pub struct InMemoryStreamWriter {
    new_events: std::sync::Mutex<Vec<(Key, Intent, WorkflowRecord)>>,
    follow_up_events: std::sync::Mutex<Vec<(Key, Intent, WorkflowRecord)>>,
}

impl InMemoryStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_events(&self) -> Vec<(Key, Intent, WorkflowRecord)> {
        self.new_events.lock().unwrap().clone()
    }

    pub fn follow_up_events(&self) -> Vec<(Key, Intent, WorkflowRecord)> {
        self.follow_up_events.lock().unwrap().clone()
    }
}

impl StreamWriter for InMemoryStreamWriter {
    fn append_new_event(&self, key: Key, intent: Intent, record: WorkflowRecord) {
        self.new_events.lock().unwrap().push((key, intent, record));
    }

    fn append_follow_up_event(&self, key: Key, intent: Intent, record: WorkflowRecord) {
        self.follow_up_events.lock().unwrap().push((key, intent, record));
    }
}
