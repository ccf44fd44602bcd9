use crate::catch_event::{BpmnElementContext, CatchEventBehavior, CatchEventSpec};
use crate::errors::SubscriptionBehaviorError;
use crate::store::{ElementInstanceStore, EventScopeStore, KeyGenerator, StreamWriter, VariablesStore, WorkflowStore};
use crate::types::{
    BpmnElementType, DeferredPurpose, ElementActivatingRecord, ElementInstance, ElementInstanceState, Intent, Key,
    WorkflowRecord,
};
use std::sync::Arc;

/// One boundary event declared on an activity: the element id it attaches
/// as, the catch element it activates, and whether it interrupts the
/// activity it is attached to (§4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundaryEventSpec {
    pub target_element_id: String,
    pub interrupting: bool,
}

/// The declared boundary events of a receive task or other interruptible
/// activity, keyed for lookup by the id an `EventTrigger` names.
#[derive(Clone, Debug, Default)]
pub struct ActivityElement {
    pub element_id: String,
    pub boundary_events: Vec<BoundaryEventSpec>,
}

impl ActivityElement {
    fn boundary_event(&self, target_element_id: &str) -> Option<&BoundaryEventSpec> {
        self.boundary_events.iter().find(|b| b.target_element_id == target_element_id)
    }
}

/// One outgoing sequence flow of an event-based gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceFlowTarget {
    pub target_element_id: String,
    pub target_element_type: BpmnElementType,
}

#[derive(Clone, Debug, Default)]
pub struct EventBasedGatewayElement {
    pub element_id: String,
    pub outgoing: Vec<SequenceFlowTarget>,
}

/// The declared start event of an event sub-process: whether it interrupts
/// its flow scope when triggered.
#[derive(Clone, Debug)]
pub struct EventSubProcessStartEvent {
    pub element_id: String,
    pub interrupting: bool,
}

/// The per-instance state-machine layer: binds `EventTrigger`s to scopes and
/// emits activating records (§2, §4.2). Holds its collaborators as trait
/// objects so the owning partition actor can construct one instance per
/// partition and share it across calls without generic parameters leaking
/// into every call site.
pub struct BpmnEventSubscriptionBehavior {
    workflow_store: Arc<dyn WorkflowStore>,
    event_scope_store: Arc<dyn EventScopeStore>,
    element_instance_store: Arc<dyn ElementInstanceStore>,
    variables_store: Arc<dyn VariablesStore>,
    key_generator: Arc<dyn KeyGenerator>,
    stream_writer: Arc<dyn StreamWriter>,
    catch_event_behavior: Arc<dyn CatchEventBehavior>,
}

impl BpmnEventSubscriptionBehavior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_store: Arc<dyn WorkflowStore>,
        event_scope_store: Arc<dyn EventScopeStore>,
        element_instance_store: Arc<dyn ElementInstanceStore>,
        variables_store: Arc<dyn VariablesStore>,
        key_generator: Arc<dyn KeyGenerator>,
        stream_writer: Arc<dyn StreamWriter>,
        catch_event_behavior: Arc<dyn CatchEventBehavior>,
    ) -> Self {
        Self {
            workflow_store,
            event_scope_store,
            element_instance_store,
            variables_store,
            key_generator,
            stream_writer,
            catch_event_behavior,
        }
    }

    /// Installs subscriptions for `events` by delegating to
    /// `CatchEventBehavior`. Either-result, never an exception at this
    /// boundary (§4.2, §7). A failure is also recorded as an incident at the
    /// scope the failure names, before being returned to the caller.
    pub async fn subscribe_to_events(
        &self,
        events: &[CatchEventSpec],
        context: &BpmnElementContext,
    ) -> Result<(), crate::errors::CatchEventFailure> {
        if let Err(failure) = self.catch_event_behavior.subscribe_catch_events(events, context).await {
            if let Err(err) = self
                .element_instance_store
                .record_incident(failure.scope_key, failure.kind, failure.message.clone())
                .await
            {
                tracing::warn!(scope = %failure.scope_key, %err, "failed to record subscription incident");
            }
            return Err(failure);
        }
        Ok(())
    }

    /// Removes all pending subscriptions owned by the scope. Idempotent
    /// (§8: "subscribe followed by unsubscribe leaves state unchanged").
    pub async fn unsubscribe_from_events(&self, context: &BpmnElementContext) -> anyhow::Result<()> {
        self.event_scope_store.delete_all_triggers(context.element_instance_key).await?;
        self.catch_event_behavior.unsubscribe_catch_events(context).await;
        Ok(())
    }

    /// Matches the peeked trigger against `receive_task`'s declared boundary
    /// events; follows boundary-event semantics on a match, otherwise
    /// completes the task itself (the trigger matched its own message).
    pub async fn trigger_boundary_or_intermediate_event(
        &self,
        receive_task: &ActivityElement,
        context: &BpmnElementContext,
    ) -> Result<(), SubscriptionBehaviorError> {
        let Some(trigger) = self.event_scope_store.peek_event_trigger(context.element_instance_key).await? else {
            return Ok(());
        };

        if receive_task.boundary_event(&trigger.target_element_id).is_some() {
            self.trigger_boundary_event(receive_task, context).await
        } else {
            self.complete_via_trigger(context, trigger).await
        }
    }

    /// Consumes the trigger and transitions the element to COMPLETING.
    pub async fn trigger_intermediate_event(&self, context: &BpmnElementContext) -> Result<(), SubscriptionBehaviorError> {
        let Some(trigger) = self.event_scope_store.peek_event_trigger(context.element_instance_key).await? else {
            return Ok(());
        };
        self.complete_via_trigger(context, trigger).await
    }

    async fn complete_via_trigger(
        &self,
        context: &BpmnElementContext,
        trigger: crate::types::EventTrigger,
    ) -> Result<(), SubscriptionBehaviorError> {
        let mut instance = self.require_instance(context.element_instance_key).await?;
        instance.state = ElementInstanceState::Completing;
        self.element_instance_store.update_instance(instance).await?;
        self.finish_trigger_consumption(context.element_instance_key, &trigger, context.element_instance_key)
            .await?;
        tracing::debug!(element = %context.element_instance_key, "completed via intermediate event trigger");
        Ok(())
    }

    /// Defers (interrupting) or immediately publishes (non-interrupting) the
    /// activation of the activity's matched boundary event (§4.2).
    pub async fn trigger_boundary_event(
        &self,
        activity: &ActivityElement,
        context: &BpmnElementContext,
    ) -> Result<(), SubscriptionBehaviorError> {
        let Some(trigger) = self.event_scope_store.peek_event_trigger(context.element_instance_key).await? else {
            return Ok(());
        };

        let boundary = activity
            .boundary_event(&trigger.target_element_id)
            .ok_or_else(|| SubscriptionBehaviorError::UnknownBoundaryEvent {
                scope_key: context.element_instance_key,
                element_id: activity.element_id.clone(),
                target_element_id: trigger.target_element_id.clone(),
            })?
            .clone();

        let boundary_instance_key = self.key_generator.next_key();
        let record = WorkflowRecord::ElementActivating(ElementActivatingRecord {
            element_id: boundary.target_element_id.clone(),
            bpmn_element_type: BpmnElementType::BoundaryEvent,
            flow_scope_key: context.flow_scope_key,
            workflow_key: context.workflow_key,
            version: 0,
            bpmn_process_id: context.bpmn_process_id.clone(),
        });

        if boundary.interrupting {
            self.element_instance_store
                .store_record(
                    boundary_instance_key,
                    context.flow_scope_key,
                    record,
                    Intent::ElementActivating,
                    DeferredPurpose::ActivatingEvent,
                )
                .await?;

            let mut activity_instance = self.require_instance(context.element_instance_key).await?;
            activity_instance.state = ElementInstanceState::Terminating;
            activity_instance.interrupting_event_key = boundary_instance_key;
            self.element_instance_store.update_instance(activity_instance).await?;
            tracing::debug!(activity = %activity.element_id, boundary = %boundary_instance_key, "deferred interrupting boundary event, activity terminating");
        } else {
            self.publish_new_child(boundary_instance_key, context.flow_scope_key, record).await?;
            self.increment_active_token_count(context.flow_scope_key).await?;
            tracing::debug!(activity = %activity.element_id, boundary = %boundary_instance_key, "published non-interrupting boundary event");
        }

        self.finish_trigger_consumption(context.element_instance_key, &trigger, boundary_instance_key)
            .await?;
        Ok(())
    }

    /// Publishes the deferred boundary-event activation staged by
    /// `trigger_boundary_event` once the activity's termination and child
    /// cleanup have completed.
    pub async fn publish_triggered_boundary_event(&self, context: &BpmnElementContext) -> Result<(), SubscriptionBehaviorError> {
        let instance = self.require_instance(context.element_instance_key).await?;
        if !instance.is_interrupted() {
            return Ok(());
        }
        let boundary_instance_key = instance.interrupting_event_key;

        let Some(deferred) = self.find_deferred(context.flow_scope_key, boundary_instance_key, Intent::ElementActivating).await? else {
            return Ok(());
        };

        self.publish_new_child(boundary_instance_key, context.flow_scope_key, deferred.record).await?;
        self.increment_active_token_count(context.flow_scope_key).await?;
        self.element_instance_store
            .delete_deferred_record(context.flow_scope_key, boundary_instance_key, Intent::ElementActivating)
            .await?;
        tracing::debug!(boundary = %boundary_instance_key, "published deferred boundary event activation");
        Ok(())
    }

    /// Defers the activation of the sequence-flow target the trigger
    /// selected, transitions the gateway to COMPLETING.
    pub async fn trigger_event_based_gateway(
        &self,
        gateway: &EventBasedGatewayElement,
        context: &BpmnElementContext,
    ) -> Result<(), SubscriptionBehaviorError> {
        let Some(trigger) = self.event_scope_store.peek_event_trigger(context.element_instance_key).await? else {
            return Ok(());
        };

        let Some(target) = gateway.outgoing.iter().find(|t| t.target_element_id == trigger.target_element_id) else {
            tracing::warn!(gateway = %gateway.element_id, target = %trigger.target_element_id, "event-based gateway trigger matched no outgoing flow, discarding");
            return Ok(());
        };

        let target_instance_key = self.key_generator.next_key();
        let record = WorkflowRecord::ElementActivating(ElementActivatingRecord {
            element_id: target.target_element_id.clone(),
            bpmn_element_type: target.target_element_type,
            flow_scope_key: context.element_instance_key,
            workflow_key: context.workflow_key,
            version: 0,
            bpmn_process_id: context.bpmn_process_id.clone(),
        });
        self.element_instance_store
            .store_record(
                target_instance_key,
                context.element_instance_key,
                record,
                Intent::ElementActivating,
                DeferredPurpose::ActivatingEvent,
            )
            .await?;

        let mut gateway_instance = self.require_instance(context.element_instance_key).await?;
        gateway_instance.state = ElementInstanceState::Completing;
        self.element_instance_store.update_instance(gateway_instance).await?;

        self.finish_trigger_consumption(context.element_instance_key, &trigger, target_instance_key)
            .await?;
        tracing::debug!(gateway = %gateway.element_id, target = %target.target_element_id, "event-based gateway selected branch, deferred activation");
        Ok(())
    }

    /// Publishes the deferred branch activation selected by
    /// `trigger_event_based_gateway`.
    pub async fn publish_triggered_event_based_gateway(&self, context: &BpmnElementContext) -> Result<(), SubscriptionBehaviorError> {
        let deferred = self
            .element_instance_store
            .get_deferred_records(context.element_instance_key)
            .await?
            .into_iter()
            .find(|d| d.intent == Intent::ElementActivating);
        let Some(deferred) = deferred else {
            return Ok(());
        };

        self.publish_new_child(deferred.child_instance_key, context.element_instance_key, deferred.record)
            .await?;
        self.element_instance_store
            .delete_deferred_record(context.element_instance_key, deferred.child_instance_key, Intent::ElementActivating)
            .await?;
        tracing::debug!(gateway = %context.element_instance_key, child = %deferred.child_instance_key, "published event-based gateway activation");
        Ok(())
    }

    /// Mints the workflow instance: writes the top-level process activation,
    /// defers the triggered start event's activation, attaches temporary
    /// variables, and deletes the trigger keyed by `workflowKey` (§4.2).
    pub async fn trigger_start_event(&self, context: &BpmnElementContext) -> Result<Key, SubscriptionBehaviorError> {
        let trigger = self
            .event_scope_store
            .peek_event_trigger(context.workflow_key)
            .await?
            .ok_or(SubscriptionBehaviorError::NoTriggeredEvent {
                scope_key: context.workflow_key,
                workflow_key: context.workflow_key,
            })?;

        let workflow = self
            .workflow_store
            .get_workflow_by_key(context.workflow_key)
            .await?
            .ok_or(SubscriptionBehaviorError::NoWorkflow {
                workflow_key: context.workflow_key,
            })?;

        let workflow_instance_key = self.key_generator.next_key();
        let start_event_instance_key = self.key_generator.next_key();

        self.stream_writer.append_new_event(
            workflow_instance_key,
            Intent::ElementActivating,
            WorkflowRecord::ElementActivating(ElementActivatingRecord {
                element_id: workflow.root_element_id.clone(),
                bpmn_element_type: workflow.element_type,
                flow_scope_key: Key::NONE,
                workflow_key: workflow.workflow_key,
                version: workflow.version,
                bpmn_process_id: workflow.bpmn_process_id.clone(),
            }),
        );
        self.element_instance_store
            .new_instance(ElementInstance::new(
                workflow_instance_key,
                Key::NONE,
                workflow.root_element_id.clone(),
                workflow.element_type,
            ))
            .await?;

        self.element_instance_store
            .store_record(
                start_event_instance_key,
                workflow_instance_key,
                WorkflowRecord::ElementActivating(ElementActivatingRecord {
                    element_id: trigger.target_element_id.clone(),
                    bpmn_element_type: BpmnElementType::StartEvent,
                    flow_scope_key: workflow_instance_key,
                    workflow_key: workflow.workflow_key,
                    version: workflow.version,
                    bpmn_process_id: workflow.bpmn_process_id.clone(),
                }),
                Intent::ElementActivating,
                DeferredPurpose::ActivatingEvent,
            )
            .await?;

        self.finish_trigger_consumption(context.workflow_key, &trigger, start_event_instance_key)
            .await?;
        tracing::debug!(%workflow_instance_key, %start_event_instance_key, "triggered workflow start event");
        Ok(workflow_instance_key)
    }

    /// Publishes the deferred start-event activation minted by
    /// `trigger_start_event`, creating the child element instance and
    /// spawning a token in the process instance scope. `false` when no
    /// deferred start event exists — a legal state during scope teardown.
    pub async fn publish_triggered_start_event(&self, context: &BpmnElementContext) -> Result<bool, SubscriptionBehaviorError> {
        let deferred = self
            .element_instance_store
            .get_deferred_records(context.element_instance_key)
            .await?
            .into_iter()
            .find(|d| d.intent == Intent::ElementActivating && matches!(d.purpose, DeferredPurpose::ActivatingEvent));
        let Some(deferred) = deferred else {
            return Ok(false);
        };

        self.publish_new_child(deferred.child_instance_key, context.element_instance_key, deferred.record)
            .await?;
        self.increment_active_token_count(context.element_instance_key).await?;
        self.element_instance_store
            .delete_deferred_record(context.element_instance_key, deferred.child_instance_key, Intent::ElementActivating)
            .await?;
        tracing::debug!(instance = %context.element_instance_key, start_event = %deferred.child_instance_key, "published triggered start event");
        Ok(true)
    }

    /// Operates on the flow-scope context (not the child). Discards
    /// immediately once the flow scope's `interruptingEventKey` is set.
    pub async fn trigger_event_sub_process(
        &self,
        start_event: &EventSubProcessStartEvent,
        context: &BpmnElementContext,
    ) -> Result<(), SubscriptionBehaviorError> {
        let flow_context = context.with_flow_scope_as_element();
        let mut flow_scope = self.require_instance(flow_context.element_instance_key).await?;
        if flow_scope.is_interrupted() {
            tracing::debug!(flow_scope = %flow_context.element_instance_key, "flow scope already interrupted, discarding event-sub-process trigger");
            return Ok(());
        }

        let Some(trigger) = self.event_scope_store.peek_event_trigger(flow_context.element_instance_key).await? else {
            return Ok(());
        };

        let event_instance_key = self.key_generator.next_key();
        let record = WorkflowRecord::ElementActivating(ElementActivatingRecord {
            element_id: start_event.element_id.clone(),
            bpmn_element_type: BpmnElementType::EventSubProcess,
            flow_scope_key: flow_context.element_instance_key,
            workflow_key: flow_context.workflow_key,
            version: 0,
            bpmn_process_id: flow_context.bpmn_process_id.clone(),
        });

        if start_event.interrupting {
            self.unsubscribe_from_events(&flow_context).await?;

            let children = self.element_instance_store.children_of(flow_context.element_instance_key).await?;
            let active_children: Vec<_> = children
                .into_iter()
                .filter(|c| !matches!(c.state, ElementInstanceState::Terminating | ElementInstanceState::Terminated))
                .collect();

            for mut child in active_children.iter().cloned() {
                child.state = ElementInstanceState::Terminating;
                self.element_instance_store.update_instance(child).await?;
            }

            if active_children.is_empty() {
                self.publish_new_child(event_instance_key, flow_context.element_instance_key, record).await?;
            } else {
                self.element_instance_store
                    .store_record(
                        event_instance_key,
                        flow_context.element_instance_key,
                        record,
                        Intent::ElementActivating,
                        DeferredPurpose::ActivatingEvent,
                    )
                    .await?;
            }

            flow_scope.active_token_count += 1;
            flow_scope.interrupting_event_key = event_instance_key;
            self.element_instance_store.update_instance(flow_scope).await?;
            tracing::debug!(flow_scope = %flow_context.element_instance_key, terminating = active_children.len(), "interrupting event sub-process triggered");
        } else {
            self.publish_new_child(event_instance_key, flow_context.element_instance_key, record).await?;
            flow_scope.active_token_count += 1;
            self.element_instance_store.update_instance(flow_scope).await?;
        }

        self.finish_trigger_consumption(flow_context.element_instance_key, &trigger, event_instance_key)
            .await?;
        Ok(())
    }

    /// Publishes the deferred event-sub-process activation once the flow
    /// scope reaches the "interrupted and both tokens present" predicate
    /// (§4.2).
    pub async fn publish_triggered_event_sub_process(&self, context: &BpmnElementContext) -> Result<(), SubscriptionBehaviorError> {
        let flow_context = context.with_flow_scope_as_element();
        let flow_scope = self.require_instance(flow_context.element_instance_key).await?;
        if !flow_scope.is_ready_for_interrupting_publish() {
            return Ok(());
        }

        let event_instance_key = flow_scope.interrupting_event_key;
        let Some(deferred) = self
            .find_deferred(flow_context.element_instance_key, event_instance_key, Intent::ElementActivating)
            .await?
        else {
            return Ok(());
        };

        self.publish_new_child(event_instance_key, flow_context.element_instance_key, deferred.record).await?;
        self.element_instance_store
            .delete_deferred_record(flow_context.element_instance_key, event_instance_key, Intent::ElementActivating)
            .await?;
        tracing::debug!(flow_scope = %flow_context.element_instance_key, event_sub_process = %event_instance_key, "published event sub-process activation");
        Ok(())
    }

    async fn require_instance(&self, key: Key) -> Result<ElementInstance, SubscriptionBehaviorError> {
        self.element_instance_store
            .get_instance(key)
            .await?
            .ok_or(SubscriptionBehaviorError::NoWorkflow { workflow_key: key })
    }

    /// Spawns a token in `scope_key`: every activation that creates a new
    /// child element instance under a flow scope also increments that
    /// scope's own token count (§4.2).
    async fn increment_active_token_count(&self, scope_key: Key) -> Result<(), SubscriptionBehaviorError> {
        let mut scope = self.require_instance(scope_key).await?;
        scope.active_token_count += 1;
        self.element_instance_store.update_instance(scope).await?;
        Ok(())
    }

    async fn find_deferred(
        &self,
        owner_scope_key: Key,
        child_instance_key: Key,
        intent: Intent,
    ) -> Result<Option<crate::types::DeferredRecord>, SubscriptionBehaviorError> {
        Ok(self
            .element_instance_store
            .get_deferred_records(owner_scope_key)
            .await?
            .into_iter()
            .find(|d| d.child_instance_key == child_instance_key && d.intent == intent))
    }

    /// Appends a NEW activating event and creates the child element
    /// instance in the given flow scope — the publish half of the
    /// deferred-record handoff (§4.2).
    async fn publish_new_child(&self, child_key: Key, flow_scope_key: Key, record: WorkflowRecord) -> Result<(), SubscriptionBehaviorError> {
        self.stream_writer.append_follow_up_event(child_key, Intent::ElementActivating, record.clone());
        let WorkflowRecord::ElementActivating(activating) = record;
        self.element_instance_store
            .new_instance(ElementInstance::new(
                child_key,
                flow_scope_key,
                activating.element_id,
                activating.bpmn_element_type,
            ))
            .await?;
        Ok(())
    }

    /// The shared tail of every trigger-handling operation: stores the
    /// trigger's variables as temporary variables against the newly minted
    /// key, then deletes the trigger by (scope key, event key) (§4.2
    /// "trigger consumption is atomic per call").
    async fn finish_trigger_consumption(
        &self,
        scope_key: Key,
        trigger: &crate::types::EventTrigger,
        minted_key: Key,
    ) -> Result<(), SubscriptionBehaviorError> {
        self.variables_store.set_temporary_variables(minted_key, trigger.variables.clone()).await?;
        self.event_scope_store.delete_trigger(scope_key, trigger.event_key).await?;
        Ok(())
    }
}

impl From<anyhow::Error> for SubscriptionBehaviorError {
    fn from(_: anyhow::Error) -> Self {
        SubscriptionBehaviorError::NoWorkflow { workflow_key: Key::NONE }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CatchEventFailure, CatchEventFailureKind};
    use crate::store_memory::{AtomicKeyGenerator, InMemoryStreamWriter, MemoryStores};
    use crate::types::{EventTrigger, PartitionId, Workflow};
    use bytes::Bytes;
    use std::sync::Arc;

    struct NullCatchEventBehavior;

    #[async_trait::async_trait]
    impl CatchEventBehavior for NullCatchEventBehavior {
        async fn subscribe_catch_events(&self, _events: &[CatchEventSpec], _context: &BpmnElementContext) -> Result<(), CatchEventFailure> {
            Ok(())
        }

        async fn unsubscribe_catch_events(&self, _context: &BpmnElementContext) {}
    }

    struct FailingCatchEventBehavior;

    #[async_trait::async_trait]
    impl CatchEventBehavior for FailingCatchEventBehavior {
        async fn subscribe_catch_events(&self, _events: &[CatchEventSpec], context: &BpmnElementContext) -> Result<(), CatchEventFailure> {
            Err(CatchEventFailure {
                kind: CatchEventFailureKind::ExpressionError,
                message: "unbound correlation variable".into(),
                scope_key: context.variables_scope_key,
            })
        }

        async fn unsubscribe_catch_events(&self, _context: &BpmnElementContext) {}
    }

    struct Fixture {
        stores: Arc<MemoryStores>,
        behavior: BpmnEventSubscriptionBehavior,
    }

    fn fixture(catch_event_behavior: Arc<dyn CatchEventBehavior>) -> Fixture {
        let stores = Arc::new(MemoryStores::new());
        let behavior = BpmnEventSubscriptionBehavior::new(
            stores.clone(),
            stores.clone(),
            stores.clone(),
            stores.clone(),
            Arc::new(AtomicKeyGenerator::new()),
            Arc::new(InMemoryStreamWriter::new()),
            catch_event_behavior,
        );
        Fixture { stores, behavior }
    }

    fn context(element_instance_key: Key, flow_scope_key: Key) -> BpmnElementContext {
        BpmnElementContext {
            element_instance_key,
            flow_scope_key,
            variables_scope_key: element_instance_key,
            workflow_key: Key(9),
            workflow_instance_key: Key(100),
            workflow_instance_partition_id: PartitionId(1),
            bpmn_process_id: "order-process".into(),
        }
    }

    async fn trigger(scope_key: Key, event_key: Key, target_element_id: &str) -> EventTrigger {
        EventTrigger {
            scope_key,
            event_key,
            target_element_id: target_element_id.into(),
            variables: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn non_interrupting_boundary_event_publishes_immediately_and_spawns_a_flow_scope_token() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let flow_scope = Key(1);
        let activity = Key(2);
        f.stores
            .new_instance(ElementInstance::new(flow_scope, Key::NONE, "sub-process", BpmnElementType::Process))
            .await
            .unwrap();
        f.stores
            .new_instance(ElementInstance::new(activity, flow_scope, "receive-task", BpmnElementType::ReceiveTask))
            .await
            .unwrap();
        f.stores
            .create_event_trigger(trigger(activity, Key(50), "timer-boundary").await)
            .await
            .unwrap();

        let activity_element = ActivityElement {
            element_id: "receive-task".into(),
            boundary_events: vec![BoundaryEventSpec {
                target_element_id: "timer-boundary".into(),
                interrupting: false,
            }],
        };

        f.behavior
            .trigger_boundary_event(&activity_element, &context(activity, flow_scope))
            .await
            .unwrap();

        let scope = f.stores.get_instance(flow_scope).await.unwrap().unwrap();
        assert_eq!(scope.active_token_count, 1);
        assert!(f.stores.peek_event_trigger(activity).await.unwrap().is_none());
        assert_eq!(f.stores.children_of(flow_scope).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn interrupting_boundary_event_defers_then_spawns_a_flow_scope_token_on_publish() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let flow_scope = Key(1);
        let activity = Key(2);
        f.stores
            .new_instance(ElementInstance::new(flow_scope, Key::NONE, "sub-process", BpmnElementType::Process))
            .await
            .unwrap();
        f.stores
            .new_instance(ElementInstance::new(activity, flow_scope, "receive-task", BpmnElementType::ReceiveTask))
            .await
            .unwrap();
        f.stores
            .create_event_trigger(trigger(activity, Key(50), "message-boundary").await)
            .await
            .unwrap();

        let activity_element = ActivityElement {
            element_id: "receive-task".into(),
            boundary_events: vec![BoundaryEventSpec {
                target_element_id: "message-boundary".into(),
                interrupting: true,
            }],
        };

        f.behavior
            .trigger_boundary_event(&activity_element, &context(activity, flow_scope))
            .await
            .unwrap();

        let terminating = f.stores.get_instance(activity).await.unwrap().unwrap();
        assert_eq!(terminating.state, ElementInstanceState::Terminating);
        assert!(terminating.is_interrupted());
        assert_eq!(f.stores.get_instance(flow_scope).await.unwrap().unwrap().active_token_count, 0);

        f.behavior.publish_triggered_boundary_event(&context(activity, flow_scope)).await.unwrap();

        let scope = f.stores.get_instance(flow_scope).await.unwrap().unwrap();
        assert_eq!(scope.active_token_count, 1);
        assert!(f.stores.get_deferred_records(flow_scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_based_gateway_defers_selected_branch_then_publishes_it() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let gateway = Key(1);
        f.stores
            .new_instance(ElementInstance::new(gateway, Key::NONE, "gateway", BpmnElementType::EventBasedGateway))
            .await
            .unwrap();
        f.stores
            .create_event_trigger(trigger(gateway, Key(50), "receive-approval").await)
            .await
            .unwrap();

        let gateway_element = EventBasedGatewayElement {
            element_id: "gateway".into(),
            outgoing: vec![
                SequenceFlowTarget {
                    target_element_id: "receive-approval".into(),
                    target_element_type: BpmnElementType::ReceiveTask,
                },
                SequenceFlowTarget {
                    target_element_id: "receive-rejection".into(),
                    target_element_type: BpmnElementType::ReceiveTask,
                },
            ],
        };

        f.behavior
            .trigger_event_based_gateway(&gateway_element, &context(gateway, gateway))
            .await
            .unwrap();

        assert_eq!(
            f.stores.get_instance(gateway).await.unwrap().unwrap().state,
            ElementInstanceState::Completing
        );
        assert_eq!(f.stores.get_deferred_records(gateway).await.unwrap().len(), 1);
        assert!(f.stores.children_of(gateway).await.unwrap().is_empty());

        f.behavior.publish_triggered_event_based_gateway(&context(gateway, gateway)).await.unwrap();

        let children = f.stores.children_of(gateway).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].element_id, "receive-approval");
        assert!(f.stores.get_deferred_records(gateway).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_interrupting_event_sub_process_publishes_immediately_and_spawns_a_token() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let flow_scope = Key(1);
        let mut scope = ElementInstance::new(flow_scope, Key::NONE, "sub-process", BpmnElementType::Process);
        scope.state = ElementInstanceState::Activated;
        f.stores.new_instance(scope).await.unwrap();
        f.stores
            .create_event_trigger(trigger(flow_scope, Key(50), "escalation-start").await)
            .await
            .unwrap();

        let start_event = EventSubProcessStartEvent {
            element_id: "escalation-start".into(),
            interrupting: false,
        };

        f.behavior
            .trigger_event_sub_process(&start_event, &context(flow_scope, flow_scope))
            .await
            .unwrap();

        let scope = f.stores.get_instance(flow_scope).await.unwrap().unwrap();
        assert_eq!(scope.active_token_count, 1);
        assert!(!scope.is_interrupted());
        assert_eq!(f.stores.children_of(flow_scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interrupting_event_sub_process_terminates_children_and_publishes_once_ready() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let flow_scope = Key(1);
        let child = Key(2);
        let mut scope = ElementInstance::new(flow_scope, Key::NONE, "sub-process", BpmnElementType::Process);
        scope.state = ElementInstanceState::Activated;
        scope.active_token_count = 1;
        f.stores.new_instance(scope).await.unwrap();
        f.stores
            .new_instance(ElementInstance::new(child, flow_scope, "service-task", BpmnElementType::ServiceTask))
            .await
            .unwrap();
        f.stores
            .create_event_trigger(trigger(flow_scope, Key(50), "error-start").await)
            .await
            .unwrap();

        let start_event = EventSubProcessStartEvent {
            element_id: "error-start".into(),
            interrupting: true,
        };

        f.behavior
            .trigger_event_sub_process(&start_event, &context(flow_scope, flow_scope))
            .await
            .unwrap();

        let scope = f.stores.get_instance(flow_scope).await.unwrap().unwrap();
        assert_eq!(scope.active_token_count, 2);
        assert!(scope.is_interrupted());
        assert!(scope.is_ready_for_interrupting_publish());
        assert_eq!(f.stores.get_deferred_records(flow_scope).await.unwrap().len(), 1);
        assert_eq!(
            f.stores.get_instance(child).await.unwrap().unwrap().state,
            ElementInstanceState::Terminating
        );
        assert!(f.stores.children_of(flow_scope).await.unwrap().iter().all(|c| c.key == child));

        f.behavior
            .publish_triggered_event_sub_process(&context(flow_scope, flow_scope))
            .await
            .unwrap();

        let published = f.stores.children_of(flow_scope).await.unwrap();
        assert!(published.iter().any(|c| c.element_id == "error-start"));
        assert!(f.stores.get_deferred_records(flow_scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_event_trigger_then_publish_spawns_a_token_in_the_new_workflow_instance() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        f.stores
            .deploy_workflow(Workflow {
                workflow_key: Key(9),
                bpmn_process_id: "order-process".into(),
                version: 1,
                root_element_id: "order-process".into(),
                element_type: BpmnElementType::Process,
            })
            .await;
        f.stores
            .create_event_trigger(trigger(Key(9), Key(50), "order-received").await)
            .await
            .unwrap();

        let workflow_instance_key = f
            .behavior
            .trigger_start_event(&context(Key::NONE, Key::NONE))
            .await
            .unwrap();

        let instance = f.stores.get_instance(workflow_instance_key).await.unwrap().unwrap();
        assert_eq!(instance.active_token_count, 0);
        assert!(f.stores.get_deferred_records(workflow_instance_key).await.unwrap().len() == 1);

        let published = f
            .behavior
            .publish_triggered_start_event(&context(workflow_instance_key, workflow_instance_key))
            .await
            .unwrap();
        assert!(published);

        let instance = f.stores.get_instance(workflow_instance_key).await.unwrap().unwrap();
        assert_eq!(instance.active_token_count, 1);
        assert_eq!(f.stores.children_of(workflow_instance_key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_to_events_records_an_incident_when_the_catch_event_behavior_fails() {
        let f = fixture(Arc::new(FailingCatchEventBehavior));
        let ctx = context(Key(1), Key(1));
        let events = vec![CatchEventSpec {
            kind: crate::catch_event::CatchEventKind::Message,
            element_id: "boundary-1".into(),
            interrupting: true,
            message_name_expression: "OrderCancelled".into(),
            correlation_key_expression: "order-42".into(),
        }];

        let err = f.behavior.subscribe_to_events(&events, &ctx).await.unwrap_err();
        assert_eq!(err.kind, CatchEventFailureKind::ExpressionError);

        let incidents = f.stores.incidents_for(ctx.variables_scope_key).await;
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].kind, "EXPRESSION_ERROR");
        assert_eq!(incidents[0].message, "unbound correlation variable");
    }

    #[tokio::test]
    async fn subscribe_to_events_records_no_incident_on_success() {
        let f = fixture(Arc::new(NullCatchEventBehavior));
        let ctx = context(Key(1), Key(1));
        f.behavior.subscribe_to_events(&[], &ctx).await.unwrap();
        assert!(f.stores.incidents_for(ctx.variables_scope_key).await.is_empty());
    }
}
