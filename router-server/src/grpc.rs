use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use router_core::errors::RouterError;
use router_core::topology::TopologyView;
use router_core::transport::{LeaderResolver, ResponseAcceptor, TransportClient};
use router_core::types::{PartitionId, RemoteAddress, SubscriptionCommand};

pub mod proto {
    tonic::include_proto!("subscription.v1");
}

use proto::subscription_gateway_client::SubscriptionGatewayClient;
use proto::subscription_gateway_server::SubscriptionGateway;
use proto::*;

/// Receiving end of the wire protocol: decodes a `SubscriptionCommand` off
/// the network and hands it to this partition's inbound queue. Correlating
/// and acting on the command is the owning partition's stream processor's
/// job (§1 non-goal, "persistence internals beyond the listed trait
/// operations") — this service only does the accept/refuse decision
/// `TransportClient::send_message` models on the sending side (§6).
pub struct SubscriptionGatewayService {
    inbox: tokio::sync::mpsc::Sender<SubscriptionCommand>,
    topology: Arc<TopologyView>,
}

impl SubscriptionGatewayService {
    /// `capacity` bounds the inbox exactly like the outgoing transport queue
    /// this mirrors; the returned receiver is the partition processor's feed.
    pub fn new(topology: Arc<TopologyView>, capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<SubscriptionCommand>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { inbox: tx, topology }, rx)
    }

    fn accept(&self, command: SubscriptionCommand) -> SubscriptionAck {
        let accepted = self.inbox.try_send(command).is_ok();
        if !accepted {
            tracing::warn!("subscription inbox saturated, refusing command");
        }
        SubscriptionAck { accepted }
    }
}

#[tonic::async_trait]
impl SubscriptionGateway for SubscriptionGatewayService {
    async fn open_message_subscription(
        &self,
        request: Request<OpenMessageSubscriptionRequest>,
    ) -> Result<Response<SubscriptionAck>, Status> {
        let req = request.into_inner();
        let command = SubscriptionCommand::OpenMessageSubscription {
            subscription_partition_id: PartitionId(req.subscription_partition_id),
            workflow_instance_partition_id: PartitionId(req.workflow_instance_partition_id),
            workflow_instance_key: router_core::types::Key(req.workflow_instance_key),
            activity_instance_key: router_core::types::Key(req.activity_instance_key),
            message_name: Bytes::from(req.message_name),
            correlation_key: Bytes::from(req.correlation_key),
        };
        Ok(Response::new(self.accept(command)))
    }

    async fn opened_message_subscription(
        &self,
        request: Request<OpenedMessageSubscriptionRequest>,
    ) -> Result<Response<SubscriptionAck>, Status> {
        let req = request.into_inner();
        let command = SubscriptionCommand::OpenedMessageSubscription {
            subscription_partition_id: PartitionId(req.subscription_partition_id),
            workflow_instance_partition_id: PartitionId(req.workflow_instance_partition_id),
            workflow_instance_key: router_core::types::Key(req.workflow_instance_key),
            activity_instance_key: router_core::types::Key(req.activity_instance_key),
            message_name: Bytes::from(req.message_name),
        };
        Ok(Response::new(self.accept(command)))
    }

    async fn correlate_workflow_instance_subscription(
        &self,
        request: Request<CorrelateWorkflowInstanceSubscriptionRequest>,
    ) -> Result<Response<SubscriptionAck>, Status> {
        let req = request.into_inner();
        let command = SubscriptionCommand::CorrelateWorkflowInstanceSubscription {
            subscription_partition_id: PartitionId(req.subscription_partition_id),
            workflow_instance_partition_id: PartitionId(req.workflow_instance_partition_id),
            workflow_instance_key: router_core::types::Key(req.workflow_instance_key),
            activity_instance_key: router_core::types::Key(req.activity_instance_key),
            message_name: Bytes::from(req.message_name),
            payload: Bytes::from(req.payload),
        };
        Ok(Response::new(self.accept(command)))
    }

    async fn close_message_subscription(
        &self,
        request: Request<CloseMessageSubscriptionRequest>,
    ) -> Result<Response<SubscriptionAck>, Status> {
        let req = request.into_inner();
        let command = SubscriptionCommand::CloseMessageSubscription {
            subscription_partition_id: PartitionId(req.subscription_partition_id),
            workflow_instance_partition_id: PartitionId(req.workflow_instance_partition_id),
            workflow_instance_key: router_core::types::Key(req.workflow_instance_key),
            activity_instance_key: router_core::types::Key(req.activity_instance_key),
            message_name: Bytes::from(req.message_name),
        };
        Ok(Response::new(self.accept(command)))
    }

    async fn reject_correlate_message_subscription(
        &self,
        request: Request<RejectCorrelateMessageSubscriptionRequest>,
    ) -> Result<Response<SubscriptionAck>, Status> {
        let req = request.into_inner();
        let command = SubscriptionCommand::RejectCorrelateMessageSubscription {
            subscription_partition_id: PartitionId(req.subscription_partition_id),
            workflow_instance_partition_id: PartitionId(req.workflow_instance_partition_id),
            workflow_instance_key: router_core::types::Key(req.workflow_instance_key),
            activity_instance_key: router_core::types::Key(req.activity_instance_key),
            message_name: Bytes::from(req.message_name),
            correlation_key: Bytes::from(req.correlation_key),
        };
        Ok(Response::new(self.accept(command)))
    }

    async fn fetch_created_topics(
        &self,
        _request: Request<FetchCreatedTopicsRequest>,
    ) -> Result<Response<FetchCreatedTopicsResponse>, Status> {
        let partition_ids = self
            .topology
            .partition_ids()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.0)
            .collect();
        Ok(Response::new(FetchCreatedTopicsResponse { partition_ids }))
    }
}

/// Sending end of the wire protocol: the `TransportClient` the router
/// dispatches through (§2, §6). Connections are opened lazily and cached per
/// destination; a connection failure is reported the same way a saturated
/// peer queue is — `send_message` returns `false`, matching the single bit
/// `DispatchOutcome::Retry` branches on.
pub struct GrpcTransportClient {
    channels: tokio::sync::RwLock<HashMap<SocketAddr, Channel>>,
}

impl GrpcTransportClient {
    pub fn new() -> Self {
        Self {
            channels: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn channel_for(&self, destination: SocketAddr) -> Result<Channel, tonic::transport::Error> {
        if let Some(channel) = self.channels.read().await.get(&destination) {
            return Ok(channel.clone());
        }
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{destination}"))?;
        let channel = endpoint.connect().await?;
        self.channels.write().await.insert(destination, channel.clone());
        Ok(channel)
    }

    async fn dispatch(&self, destination: SocketAddr, command: SubscriptionCommand) -> Result<bool, tonic::transport::Error> {
        let channel = self.channel_for(destination).await?;
        let mut client = SubscriptionGatewayClient::new(channel);

        let ack = match command {
            SubscriptionCommand::OpenMessageSubscription {
                subscription_partition_id,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
                message_name,
                correlation_key,
            } => {
                client
                    .open_message_subscription(OpenMessageSubscriptionRequest {
                        subscription_partition_id: subscription_partition_id.0,
                        workflow_instance_partition_id: workflow_instance_partition_id.0,
                        workflow_instance_key: workflow_instance_key.0,
                        activity_instance_key: activity_instance_key.0,
                        message_name: message_name.to_vec(),
                        correlation_key: correlation_key.to_vec(),
                    })
                    .await
            }
            SubscriptionCommand::OpenedMessageSubscription {
                subscription_partition_id,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
                message_name,
            } => {
                client
                    .opened_message_subscription(OpenedMessageSubscriptionRequest {
                        subscription_partition_id: subscription_partition_id.0,
                        workflow_instance_partition_id: workflow_instance_partition_id.0,
                        workflow_instance_key: workflow_instance_key.0,
                        activity_instance_key: activity_instance_key.0,
                        message_name: message_name.to_vec(),
                    })
                    .await
            }
            SubscriptionCommand::CorrelateWorkflowInstanceSubscription {
                subscription_partition_id,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
                message_name,
                payload,
            } => {
                client
                    .correlate_workflow_instance_subscription(CorrelateWorkflowInstanceSubscriptionRequest {
                        subscription_partition_id: subscription_partition_id.0,
                        workflow_instance_partition_id: workflow_instance_partition_id.0,
                        workflow_instance_key: workflow_instance_key.0,
                        activity_instance_key: activity_instance_key.0,
                        message_name: message_name.to_vec(),
                        payload: payload.to_vec(),
                    })
                    .await
            }
            SubscriptionCommand::CloseMessageSubscription {
                subscription_partition_id,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
                message_name,
            } => {
                client
                    .close_message_subscription(CloseMessageSubscriptionRequest {
                        subscription_partition_id: subscription_partition_id.0,
                        workflow_instance_partition_id: workflow_instance_partition_id.0,
                        workflow_instance_key: workflow_instance_key.0,
                        activity_instance_key: activity_instance_key.0,
                        message_name: message_name.to_vec(),
                    })
                    .await
            }
            SubscriptionCommand::RejectCorrelateMessageSubscription {
                subscription_partition_id,
                workflow_instance_partition_id,
                workflow_instance_key,
                activity_instance_key,
                message_name,
                correlation_key,
            } => {
                client
                    .reject_correlate_message_subscription(RejectCorrelateMessageSubscriptionRequest {
                        subscription_partition_id: subscription_partition_id.0,
                        workflow_instance_partition_id: workflow_instance_partition_id.0,
                        workflow_instance_key: workflow_instance_key.0,
                        activity_instance_key: activity_instance_key.0,
                        message_name: message_name.to_vec(),
                        correlation_key: correlation_key.to_vec(),
                    })
                    .await
            }
        };

        match ack {
            Ok(response) => Ok(response.into_inner().accepted),
            Err(status) => {
                tracing::warn!(%destination, %status, "subscription command rejected by peer");
                Ok(false)
            }
        }
    }
}

impl Default for GrpcTransportClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClient for GrpcTransportClient {
    async fn send_message(&self, destination: SocketAddr, command: SubscriptionCommand) -> bool {
        match self.dispatch(destination, command).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(%destination, error = %e, "failed to reach peer, treating as refused");
                false
            }
        }
    }

    async fn send_request_with_retry(
        &self,
        resolver: LeaderResolver,
        acceptor: ResponseAcceptor,
        _request: Bytes,
        deadline: Duration,
    ) -> Result<Bytes, RouterError> {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(addr) = resolver() {
                if let Ok(channel) = self.channel_for(addr).await {
                    let mut client = SubscriptionGatewayClient::new(channel);
                    if let Ok(response) = client.fetch_created_topics(FetchCreatedTopicsRequest {}).await {
                        let ids = response.into_inner().partition_ids;
                        let mut buf = Vec::with_capacity(ids.len() * 4);
                        for id in ids {
                            buf.extend_from_slice(&id.to_be_bytes());
                        }
                        let bytes = Bytes::from(buf);
                        if acceptor(&bytes) {
                            return Ok(bytes);
                        }
                    }
                }
            }
            if start.elapsed() >= deadline {
                return Err(RouterError::FetchTimeout);
            }
            tracing::warn!(elapsed = ?start.elapsed(), "fetch_created_topics attempt failed, retrying");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn register_remote_address(&self, addr: SocketAddr) -> RemoteAddress {
        RemoteAddress(addr)
    }
}
