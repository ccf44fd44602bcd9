use std::sync::Arc;

use router_core::catch_event::{DefaultCatchEventBehavior, StaticExpressionEvaluator};
use router_core::router::SubscriptionCommandRouter;
use router_core::store::{ElementInstanceStore, EventScopeStore, KeyGenerator, StreamWriter, VariablesStore, WorkflowStore};
use router_core::store_memory::{AtomicKeyGenerator, InMemoryStreamWriter, MemoryStores};
use router_core::subscription_behavior::BpmnEventSubscriptionBehavior;
use router_core::topology::TopologyView;
use router_core::types::PartitionId;
use router_server::grpc::proto::subscription_gateway_server::SubscriptionGatewayServer;
use router_server::grpc::{GrpcTransportClient, SubscriptionGatewayService};
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = parse_listen_addr();
    let system_partition_id = PartitionId(parse_system_partition_id());
    let database_url = parse_database_url();

    let workflow_store: Arc<dyn WorkflowStore>;
    let event_scope_store: Arc<dyn EventScopeStore>;
    let element_instance_store: Arc<dyn ElementInstanceStore>;
    let variables_store: Arc<dyn VariablesStore>;
    let key_generator: Arc<dyn KeyGenerator>;

    match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = Arc::new(router_core::store_postgres::PostgresStores::new(pool.clone()));
            pg.migrate().await?;
            tracing::info!("Using PostgresStores (migrations applied)");
            workflow_store = pg.clone();
            event_scope_store = pg.clone();
            element_instance_store = pg.clone();
            variables_store = pg;
            key_generator = Arc::new(router_core::store_postgres::SequenceKeyGenerator::new(pool));
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStores");
            let memory = Arc::new(MemoryStores::new());
            workflow_store = memory.clone();
            event_scope_store = memory.clone();
            element_instance_store = memory.clone();
            variables_store = memory;
            key_generator = Arc::new(AtomicKeyGenerator::new());
        }
        None => {
            tracing::info!("Using MemoryStores (no database URL configured)");
            let memory = Arc::new(MemoryStores::new());
            workflow_store = memory.clone();
            event_scope_store = memory.clone();
            element_instance_store = memory.clone();
            variables_store = memory;
            key_generator = Arc::new(AtomicKeyGenerator::new());
        }
    }

    let stream_writer: Arc<dyn StreamWriter> = Arc::new(InMemoryStreamWriter::new());

    let topology = Arc::new(TopologyView::new());
    let transport = Arc::new(GrpcTransportClient::new());
    let router = Arc::new(SubscriptionCommandRouter::new(topology.clone(), transport, system_partition_id));
    let catch_event_behavior = Arc::new(DefaultCatchEventBehavior::new(Arc::new(StaticExpressionEvaluator), router));

    // Held so the server can dispatch into it once a partition processor
    // (out of scope here) starts draining the gateway's inbound commands.
    let _behavior = Arc::new(BpmnEventSubscriptionBehavior::new(
        workflow_store,
        event_scope_store,
        element_instance_store,
        variables_store,
        key_generator,
        stream_writer,
        catch_event_behavior,
    ));

    let (gateway, _inbox) = SubscriptionGatewayService::new(topology, 1024);

    tracing::info!(%addr, %system_partition_id, "subscription gateway listening");

    Server::builder()
        .add_service(SubscriptionGatewayServer::new(gateway))
        .serve(addr)
        .await?;

    Ok(())
}

/// Parse the listen address from `--listen-addr <addr>` CLI arg or
/// `ROUTER_LISTEN_ADDR` env var, falling back to a fixed default.
fn parse_listen_addr() -> std::net::SocketAddr {
    cli_arg_then_env("--listen-addr", "ROUTER_LISTEN_ADDR")
        .unwrap_or_else(|| "0.0.0.0:50061".to_string())
        .parse()
        .expect("ROUTER_LISTEN_ADDR / --listen-addr must be a valid socket address")
}

/// Parse this node's system partition id from `--system-partition-id` or
/// `ROUTER_SYSTEM_PARTITION_ID`, defaulting to partition 1 (Zeebe-style
/// convention, §6).
fn parse_system_partition_id() -> u32 {
    cli_arg_then_env("--system-partition-id", "ROUTER_SYSTEM_PARTITION_ID")
        .map(|v| v.parse().expect("system partition id must be a u32"))
        .unwrap_or(1)
}

/// Parse database URL from `--database-url <url>` CLI arg or `DATABASE_URL`
/// env var.
fn parse_database_url() -> Option<String> {
    cli_arg_then_env("--database-url", "DATABASE_URL")
}

/// CLI arg takes precedence over the environment variable of the same name.
fn cli_arg_then_env(flag: &str, env_var: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(value) = args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone()) {
        return Some(value);
    }
    std::env::var(env_var).ok()
}
