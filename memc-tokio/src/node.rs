use std::sync::Arc;

use memc_core::address::Address;
use tokio::sync::mpsc;

use crate::{
    connection::ConnectionOptions,
    error::Error,
    pool::{ConnectionPool, ConnectionPoolMetrics, HealthEvent, PoolConfig, PoolConnection},
};

/// One cluster member: its address and the connection pool serving it.
/// Identity is the address; nodes are created by the cluster and
/// destroyed on cluster close or on removal by autodiscovery.
pub(crate) struct Node {
    address: Address,
    pool: Arc<ConnectionPool>,
}

impl Node {
    pub(crate) fn new(
        address: Address,
        options: ConnectionOptions,
        config: PoolConfig,
        health_events: mpsc::UnboundedSender<HealthEvent>,
    ) -> Arc<Node> {
        let pool = ConnectionPool::new(address.clone(), options, config, health_events);
        Arc::new(Node { address, pool })
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Lease a connection from the node's pool.
    pub(crate) async fn connection(&self) -> Result<PoolConnection, Error> {
        self.pool.acquire().await
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.pool.is_healthy()
    }

    pub(crate) fn metrics(&self) -> ConnectionPoolMetrics {
        self.pool.metrics()
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }
}
