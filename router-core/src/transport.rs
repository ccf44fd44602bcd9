use crate::errors::RouterError;
use crate::types::{RemoteAddress, SubscriptionCommand};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Resolves the current best-known address of the peer a bootstrap request
/// should go to. Re-invoked on every retry attempt (§4.1).
pub type LeaderResolver = Box<dyn Fn() -> Option<SocketAddr> + Send + Sync>;

/// Returns `true` once a response buffer parses successfully.
pub type ResponseAcceptor = Box<dyn Fn(&Bytes) -> bool + Send + Sync>;

/// Send-message and send-request-with-retry over the management and
/// subscription transports (§2, §6). One implementation backs both
/// transports; callers pick a destination per call.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Non-blocking. `false` when the outgoing queue is saturated (§6).
    async fn send_message(&self, destination: SocketAddr, command: SubscriptionCommand) -> bool;

    /// Retries until `acceptor` returns true or `deadline` elapses,
    /// re-resolving the destination via `resolver` on every attempt (§4.1).
    async fn send_request_with_retry(
        &self,
        resolver: LeaderResolver,
        acceptor: ResponseAcceptor,
        request: Bytes,
        deadline: Duration,
    ) -> Result<Bytes, RouterError>;

    /// Idempotent.
    fn register_remote_address(&self, addr: SocketAddr) -> RemoteAddress;
}
