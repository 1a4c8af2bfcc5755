//! An async memcached cluster client for tokio, speaking the text
//! protocol. Keys are routed to nodes with a Ketama consistent-hash
//! ring; each node is served by a bounded connection pool with health
//! tracking, and concurrent single-key retrievals can be coalesced into
//! batched requests. For example:
//!
//! ```ignore
//! use memc_tokio::{create_client, Address, ClientConfig};
//!
//! let client = create_client(
//!     vec![Address::tcp("localhost", 11211)],
//!     ClientConfig::new(),
//! )
//! .await?;
//! client.set(b"key", b"value", 0, 0, false).await?;
//! let item = client.get(b"key", false).await?;
//! ```

mod autobatching;
mod client;
mod cluster;
mod connection;
mod error;
mod node;
mod pool;
mod timeout;

#[cfg(test)]
pub(crate) mod testutil;

use std::{path::PathBuf, sync::Arc, time::Duration};

pub use client::{Client, Pipeline};
pub use cluster::{ClusterEvents, ClusterManagement};
pub use error::Error;
pub use memc_core::{
    address::Address,
    protocol::{Item, PipelineResponse, ResponseStatus},
};
pub use pool::ConnectionPoolMetrics;

use cluster::{AutodiscoveryConfig, Cluster};
use connection::ConnectionOptions;
use pool::PoolConfig;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_CONNECTIONS: usize = 2;
const DEFAULT_MIN_CONNECTIONS: usize = 1;
const DEFAULT_PURGE_UNUSED_CONNECTIONS_AFTER: Duration = Duration::from_secs(60);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AUTOBATCHING_MAX_KEYS: usize = 32;
const DEFAULT_AUTODISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_AUTODISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_WAIT_AUTODISCOVERY: Duration = Duration::from_secs(60);

/// Construction-time configuration, consumed by [`create_client`].
/// Starts from the defaults and is adjusted with the chainable setters.
#[derive(Clone)]
pub struct ClientConfig {
    timeout: Option<Duration>,
    max_connections: usize,
    min_connections: usize,
    purge_unused_connections_after: Option<Duration>,
    connection_timeout: Option<Duration>,
    cluster_events: Option<Arc<dyn ClusterEvents>>,
    purge_unhealthy_nodes: bool,
    autobatching: bool,
    autobatching_max_keys: usize,
    ssl: bool,
    ssl_verify: bool,
    ssl_extra_ca: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
    autodiscovery: bool,
    autodiscovery_poll_interval: Duration,
    autodiscovery_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Some(DEFAULT_TIMEOUT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            purge_unused_connections_after: Some(DEFAULT_PURGE_UNUSED_CONNECTIONS_AFTER),
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            cluster_events: None,
            purge_unhealthy_nodes: false,
            autobatching: false,
            autobatching_max_keys: DEFAULT_AUTOBATCHING_MAX_KEYS,
            ssl: false,
            ssl_verify: true,
            ssl_extra_ca: None,
            username: None,
            password: None,
            autodiscovery: false,
            autodiscovery_poll_interval: DEFAULT_AUTODISCOVERY_POLL_INTERVAL,
            autodiscovery_timeout: DEFAULT_AUTODISCOVERY_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }

    /// Per-operation deadline; `None` disables it.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound of TCP connections per node.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Number of connections kept warm per node.
    pub fn min_connections(mut self, min_connections: usize) -> Self {
        self.min_connections = min_connections;
        self
    }

    /// Close connections idle for longer than this; `None` disables
    /// purging.
    pub fn purge_unused_connections_after(mut self, after: Option<Duration>) -> Self {
        self.purge_unused_connections_after = after;
        self
    }

    /// Deadline for a single connect + TLS + authentication sequence;
    /// `None` disables it.
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Receive node health events.
    pub fn cluster_events(mut self, events: Arc<dyn ClusterEvents>) -> Self {
        self.cluster_events = Some(events);
        self
    }

    /// Exclude unhealthy nodes from routing. Surviving nodes absorb the
    /// remapped keys, which affects the hit ratio while a node is out.
    pub fn purge_unhealthy_nodes(mut self, purge: bool) -> Self {
        self.purge_unhealthy_nodes = purge;
        self
    }

    /// Coalesce concurrent `get`/`gets` calls into batched multi-key
    /// requests.
    pub fn autobatching(mut self, autobatching: bool) -> Self {
        self.autobatching = autobatching;
        self
    }

    /// Maximum number of keys merged into one batched request.
    pub fn autobatching_max_keys(mut self, max_keys: usize) -> Self {
        self.autobatching_max_keys = max_keys;
        self
    }

    /// Negotiate TLS on every connection.
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Verify the server certificate (on by default).
    pub fn ssl_verify(mut self, verify: bool) -> Self {
        self.ssl_verify = verify;
        self
    }

    /// Load an additional CA certificate file.
    pub fn ssl_extra_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_extra_ca = Some(path.into());
        self
    }

    /// Username for authentication; must be set together with
    /// [`password`](ClientConfig::password).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Password for authentication; must be set together with
    /// [`username`](ClientConfig::username).
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Periodically refresh the node list with `config get cluster`.
    pub fn autodiscovery(mut self, autodiscovery: bool) -> Self {
        self.autodiscovery = autodiscovery;
        self
    }

    /// How often the autodiscovery loop polls.
    pub fn autodiscovery_poll_interval(mut self, interval: Duration) -> Self {
        self.autodiscovery_poll_interval = interval;
        self
    }

    /// Deadline for one `config get cluster` round trip.
    pub fn autodiscovery_timeout(mut self, timeout: Duration) -> Self {
        self.autodiscovery_timeout = timeout;
        self
    }
}

/// Create a new [`Client`] for the given cluster nodes.
///
/// With autodiscovery enabled the call waits for the first successful
/// node-list refresh before returning, bounded by a startup deadline.
pub async fn create_client(
    addresses: Vec<Address>,
    config: ClientConfig,
) -> Result<Client, Error> {
    if addresses.is_empty() {
        return Err(Error::InvalidArgument(
            "at least one node address must be provided".into(),
        ));
    }
    if config.max_connections == 0 {
        return Err(Error::InvalidArgument(
            "max_connections must be at least 1".into(),
        ));
    }
    if config.min_connections > config.max_connections {
        return Err(Error::InvalidArgument(
            "min_connections can not exceed max_connections".into(),
        ));
    }
    let credentials = match (config.username, config.password) {
        (Some(username), Some(password)) => Some((username, password)),
        (None, None) => None,
        _ => {
            return Err(Error::InvalidArgument(
                "username and password must be provided together".into(),
            ))
        }
    };
    let tls = if config.ssl {
        if addresses
            .iter()
            .any(|address| matches!(address, Address::Unix { .. }))
        {
            return Err(Error::InvalidArgument(
                "TLS is not supported over unix socket addresses".into(),
            ));
        }
        Some(connection::tls_connector(
            config.ssl_verify,
            config.ssl_extra_ca.as_deref(),
        )?)
    } else {
        None
    };

    let options = ConnectionOptions {
        connection_timeout: config.connection_timeout,
        tls,
        credentials,
    };
    let pool_config = PoolConfig {
        min_connections: config.min_connections,
        max_connections: config.max_connections,
        purge_unused_connections_after: config.purge_unused_connections_after,
    };
    let autodiscovery = config.autodiscovery.then(|| AutodiscoveryConfig {
        poll_interval: config.autodiscovery_poll_interval,
        timeout: config.autodiscovery_timeout,
    });

    let cluster = Cluster::new(
        addresses,
        options,
        pool_config,
        config.purge_unhealthy_nodes,
        config.cluster_events,
        autodiscovery,
    );
    let client = Client::new(
        cluster.clone(),
        config.timeout,
        config.autobatching.then_some(config.autobatching_max_keys),
    );

    if config.autodiscovery {
        if let Err(err) = cluster.wait_autodiscovery(STARTUP_WAIT_AUTODISCOVERY).await {
            client.close();
            return Err(err);
        }
    }
    Ok(client)
}
