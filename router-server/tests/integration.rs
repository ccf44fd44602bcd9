//! Black-box tests against the gRPC subscription gateway: a real server
//! bound to an OS-assigned port, driven through the generated tonic client.

use std::sync::Arc;
use std::time::Duration;

use router_core::topology::TopologyView;
use router_core::types::PartitionId;
use router_server::grpc::proto::subscription_gateway_client::SubscriptionGatewayClient;
use router_server::grpc::proto::subscription_gateway_server::SubscriptionGatewayServer;
use router_server::grpc::proto::*;
use router_server::grpc::SubscriptionGatewayService;
use tonic::transport::Server;

async fn spawn_server(topology: Arc<TopologyView>) -> (String, tokio::sync::mpsc::Receiver<router_core::types::SubscriptionCommand>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (gateway, inbox) = SubscriptionGatewayService::new(topology, 8);

    tokio::spawn(async move {
        Server::builder()
            .add_service(SubscriptionGatewayServer::new(gateway))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (format!("http://{addr}"), inbox)
}

#[tokio::test]
async fn open_message_subscription_is_accepted_and_forwarded_to_inbox() {
    let topology = Arc::new(TopologyView::new());
    let (url, mut inbox) = spawn_server(topology).await;

    let mut client = SubscriptionGatewayClient::connect(url).await.unwrap();
    let ack = client
        .open_message_subscription(OpenMessageSubscriptionRequest {
            subscription_partition_id: 2,
            workflow_instance_partition_id: 1,
            workflow_instance_key: 100,
            activity_instance_key: 200,
            message_name: b"OrderCancelled".to_vec(),
            correlation_key: b"order-42".to_vec(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(ack.accepted);

    let command = inbox.recv().await.expect("command forwarded to inbox");
    match command {
        router_core::types::SubscriptionCommand::OpenMessageSubscription {
            subscription_partition_id,
            workflow_instance_key,
            ..
        } => {
            assert_eq!(subscription_partition_id, PartitionId(2));
            assert_eq!(workflow_instance_key, router_core::types::Key(100));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[tokio::test]
async fn saturated_inbox_refuses_further_commands() {
    let topology = Arc::new(TopologyView::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (gateway, mut inbox) = SubscriptionGatewayService::new(topology, 1);

    tokio::spawn(async move {
        Server::builder()
            .add_service(SubscriptionGatewayServer::new(gateway))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut client = SubscriptionGatewayClient::connect(format!("http://{addr}")).await.unwrap();

    let request = || CloseMessageSubscriptionRequest {
        subscription_partition_id: 1,
        workflow_instance_partition_id: 1,
        workflow_instance_key: 1,
        activity_instance_key: 1,
        message_name: b"m".to_vec(),
    };

    let first = client.close_message_subscription(request()).await.unwrap().into_inner();
    assert!(first.accepted);

    // Inbox has capacity 1 and hasn't been drained yet: the next send must
    // be refused rather than blocking the RPC handler.
    let second = client.close_message_subscription(request()).await.unwrap().into_inner();
    assert!(!second.accepted);

    // Drain so the test doesn't leak a full channel.
    let _ = inbox.recv().await;
}

#[tokio::test]
async fn fetch_created_topics_reports_whatever_topology_currently_knows() {
    let topology = Arc::new(TopologyView::new());
    topology
        .set_partition_ids(vec![PartitionId(1), PartitionId(2), PartitionId(3)])
        .await;
    let (url, _inbox) = spawn_server(topology).await;

    let mut client = SubscriptionGatewayClient::connect(url).await.unwrap();
    let response = client
        .fetch_created_topics(FetchCreatedTopicsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.partition_ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn fetch_created_topics_is_empty_before_topology_is_known() {
    let topology = Arc::new(TopologyView::new());
    let (url, _inbox) = spawn_server(topology).await;

    let mut client = SubscriptionGatewayClient::connect(url).await.unwrap();
    let response = client
        .fetch_created_topics(FetchCreatedTopicsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(response.partition_ids.is_empty());
}
