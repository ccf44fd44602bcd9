use crate::errors::{CatchEventFailure, CatchEventFailureKind, EvaluationException};
use crate::router::SubscriptionCommandRouter;
use crate::transport::TransportClient;
use crate::types::{Key, PartitionId};
use async_trait::async_trait;
use bytes::Bytes;

/// The element-instance plus scope keys every behavior operation needs, kept
/// as one small struct rather than threading five key parameters through
/// every call (§9: "pass a narrow behaviour context").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BpmnElementContext {
    pub element_instance_key: Key,
    pub flow_scope_key: Key,
    pub variables_scope_key: Key,
    pub workflow_key: Key,
    pub workflow_instance_key: Key,
    pub workflow_instance_partition_id: PartitionId,
    pub bpmn_process_id: String,
}

impl BpmnElementContext {
    /// A context for the same instance but rooted at the flow scope, used by
    /// `trigger_event_sub_process` which operates on the parent scope (§4.2).
    pub fn with_flow_scope_as_element(&self) -> Self {
        Self {
            element_instance_key: self.flow_scope_key,
            flow_scope_key: self.flow_scope_key,
            variables_scope_key: self.flow_scope_key,
            workflow_key: self.workflow_key,
            workflow_instance_key: self.workflow_instance_key,
            workflow_instance_partition_id: self.workflow_instance_partition_id,
            bpmn_process_id: self.bpmn_process_id.clone(),
        }
    }
}

/// One catch event declared on a BPMN element: a message, timer, or signal
/// subscription to install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchEventSpec {
    pub kind: CatchEventKind,
    pub element_id: String,
    pub interrupting: bool,
    pub message_name_expression: String,
    pub correlation_key_expression: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatchEventKind {
    Message,
    Timer,
    Signal,
}

/// Evaluates the expressions a `CatchEventSpec` carries against an instance's
/// variables. The expression language itself is out of scope (§1 non-goal:
/// "the variable-document/expression evaluator beyond its error taxonomy") —
/// callers supply their own evaluator; this core only needs the error shape.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate_message_name(
        &self,
        expression: &str,
        context: &BpmnElementContext,
    ) -> Result<Bytes, EvaluationException>;

    async fn extract_correlation_key(
        &self,
        expression: &str,
        context: &BpmnElementContext,
    ) -> Result<Bytes, EvaluationException>;
}

/// Fixed-value evaluator for tests and demos: every expression resolves to
/// the literal bytes it names, no variable lookup.
pub struct StaticExpressionEvaluator;

#[async_trait]
impl ExpressionEvaluator for StaticExpressionEvaluator {
    async fn evaluate_message_name(
        &self,
        expression: &str,
        _context: &BpmnElementContext,
    ) -> Result<Bytes, EvaluationException> {
        Ok(Bytes::copy_from_slice(expression.as_bytes()))
    }

    async fn extract_correlation_key(
        &self,
        expression: &str,
        _context: &BpmnElementContext,
    ) -> Result<Bytes, EvaluationException> {
        Ok(Bytes::copy_from_slice(expression.as_bytes()))
    }
}

/// Subscribes a scope to its declared catch events by writing subscription
/// records for the router to transport (§2).
#[async_trait]
pub trait CatchEventBehavior: Send + Sync {
    /// Installs one subscription per catch event in `events`. Stops at the
    /// first failure and reports it — matching `subscribe_to_events`'s
    /// either-result contract (§4.2, §7).
    async fn subscribe_catch_events(
        &self,
        events: &[CatchEventSpec],
        context: &BpmnElementContext,
    ) -> Result<(), CatchEventFailure>;

    async fn unsubscribe_catch_events(&self, context: &BpmnElementContext);
}

/// Default `CatchEventBehavior`: evaluates each event's expressions and
/// dispatches an `OpenMessageSubscription` through the router for message
/// events. Timer/signal subscriptions are out of scope here — their wire
/// encoding is not part of the subscription protocol (§3 lists only the
/// five message-subscription commands).
pub struct DefaultCatchEventBehavior<E: ExpressionEvaluator, T: TransportClient> {
    evaluator: std::sync::Arc<E>,
    router: std::sync::Arc<SubscriptionCommandRouter<T>>,
}

impl<E: ExpressionEvaluator, T: TransportClient> DefaultCatchEventBehavior<E, T> {
    pub fn new(evaluator: std::sync::Arc<E>, router: std::sync::Arc<SubscriptionCommandRouter<T>>) -> Self {
        Self { evaluator, router }
    }

    /// Scope key for error propagation: the variables-scope of the failing
    /// context, except `EvaluationException` which reports the element
    /// instance key itself (§4.2).
    async fn evaluate_one(
        &self,
        event: &CatchEventSpec,
        context: &BpmnElementContext,
    ) -> Result<(Bytes, Bytes), CatchEventFailure> {
        let message_name = self
            .evaluator
            .evaluate_message_name(&event.message_name_expression, context)
            .await
            .map_err(|e| CatchEventFailure {
                kind: CatchEventFailureKind::MessageNameError,
                message: e.message,
                scope_key: context.element_instance_key,
            })?;

        let correlation_key = self
            .evaluator
            .extract_correlation_key(&event.correlation_key_expression, context)
            .await
            .map_err(|e| CatchEventFailure {
                kind: CatchEventFailureKind::ExtractValueError,
                message: e.message,
                scope_key: context.variables_scope_key,
            })?;

        Ok((message_name, correlation_key))
    }
}

#[async_trait]
impl<E: ExpressionEvaluator, T: TransportClient> CatchEventBehavior for DefaultCatchEventBehavior<E, T> {
    async fn subscribe_catch_events(
        &self,
        events: &[CatchEventSpec],
        context: &BpmnElementContext,
    ) -> Result<(), CatchEventFailure> {
        for event in events {
            if event.kind != CatchEventKind::Message {
                continue;
            }
            let (message_name, correlation_key) = self.evaluate_one(event, context).await?;
            let outcome = self
                .router
                .open_message_subscription(
                    context.workflow_instance_key,
                    context.workflow_instance_partition_id,
                    context.element_instance_key,
                    message_name,
                    correlation_key,
                )
                .await;
            tracing::debug!(element = %event.element_id, scope = %context.element_instance_key, ?outcome, "message catch event subscribed");
        }
        Ok(())
    }

    async fn unsubscribe_catch_events(&self, context: &BpmnElementContext) {
        tracing::debug!(scope = %context.element_instance_key, "unsubscribing catch events");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyView;
    use crate::transport::{LeaderResolver, ResponseAcceptor};
    use std::net::SocketAddr;

    fn context() -> BpmnElementContext {
        BpmnElementContext {
            element_instance_key: Key(1),
            flow_scope_key: Key(1),
            variables_scope_key: Key(1),
            workflow_key: Key(9),
            workflow_instance_key: Key(100),
            workflow_instance_partition_id: PartitionId(1),
            bpmn_process_id: "order-process".into(),
        }
    }

    #[derive(Default)]
    struct NullTransport;

    #[async_trait]
    impl TransportClient for NullTransport {
        async fn send_message(&self, _destination: SocketAddr, _command: crate::types::SubscriptionCommand) -> bool {
            true
        }

        async fn send_request_with_retry(
            &self,
            _resolver: LeaderResolver,
            _acceptor: ResponseAcceptor,
            _request: Bytes,
            _deadline: std::time::Duration,
        ) -> Result<Bytes, crate::errors::RouterError> {
            Ok(Bytes::new())
        }

        fn register_remote_address(&self, addr: SocketAddr) -> crate::types::RemoteAddress {
            crate::types::RemoteAddress(addr)
        }
    }

    async fn router_without_known_leader() -> std::sync::Arc<SubscriptionCommandRouter<NullTransport>> {
        let topology = std::sync::Arc::new(TopologyView::new());
        topology.set_partition_ids(vec![PartitionId(1)]).await;
        std::sync::Arc::new(SubscriptionCommandRouter::new(
            topology,
            std::sync::Arc::new(NullTransport),
            PartitionId(1),
        ))
    }

    #[tokio::test]
    async fn static_evaluator_subscribes_message_events_without_error() {
        let behavior = DefaultCatchEventBehavior::new(
            std::sync::Arc::new(StaticExpressionEvaluator),
            router_without_known_leader().await,
        );
        let events = vec![CatchEventSpec {
            kind: CatchEventKind::Message,
            element_id: "boundary-1".into(),
            interrupting: true,
            message_name_expression: "OrderCancelled".into(),
            correlation_key_expression: "order-42".into(),
        }];
        let result = behavior.subscribe_catch_events(&events, &context()).await;
        assert!(result.is_ok());
    }

    struct FailingEvaluator;

    #[async_trait]
    impl ExpressionEvaluator for FailingEvaluator {
        async fn evaluate_message_name(
            &self,
            _expression: &str,
            _context: &BpmnElementContext,
        ) -> Result<Bytes, EvaluationException> {
            Err(EvaluationException {
                message: "unbound variable".into(),
            })
        }

        async fn extract_correlation_key(
            &self,
            _expression: &str,
            _context: &BpmnElementContext,
        ) -> Result<Bytes, EvaluationException> {
            Ok(Bytes::from_static(b"irrelevant"))
        }
    }

    #[tokio::test]
    async fn message_name_failure_reports_element_instance_key_as_scope() {
        let behavior = DefaultCatchEventBehavior::new(
            std::sync::Arc::new(FailingEvaluator),
            router_without_known_leader().await,
        );
        let events = vec![CatchEventSpec {
            kind: CatchEventKind::Message,
            element_id: "boundary-1".into(),
            interrupting: false,
            message_name_expression: "bad".into(),
            correlation_key_expression: "order-42".into(),
        }];
        let ctx = context();
        let err = behavior.subscribe_catch_events(&events, &ctx).await.unwrap_err();
        assert_eq!(err.kind, CatchEventFailureKind::MessageNameError);
        assert_eq!(err.scope_key, ctx.element_instance_key);
    }
}
