//! Cluster state: the node map, the routing ring, node health
//! bookkeeping and the optional autodiscovery loop. Readers route
//! through an immutable ring snapshot; node-set and health changes
//! build a new ring and install it with a single swap.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use memc_core::{address::Address, protocol::ConfigReply, ring::HashRing};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionOptions,
    error::Error,
    node::Node,
    pool::{ConnectionPoolMetrics, HealthEvent, PoolConfig},
    timeout::op_timeout,
};

/// Callbacks invoked when a node changes health. Fired regardless of
/// the `purge_unhealthy_nodes` setting.
#[async_trait]
pub trait ClusterEvents: Send + Sync {
    /// A node has at least one live connection again.
    async fn on_node_healthy(&self, management: &ClusterManagement, address: &Address);

    /// A node has no connections left and the latest creation attempt
    /// failed. Depending on configuration, traffic may no longer be
    /// routed to it.
    async fn on_node_unhealthy(&self, management: &ClusterManagement, address: &Address);
}

#[derive(Debug, Clone)]
pub(crate) struct AutodiscoveryConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) timeout: Duration,
}

fn no_available_nodes() -> Error {
    Error::Command("cluster has no available nodes".into())
}

#[derive(Clone)]
pub(crate) struct Cluster {
    shared: Arc<ClusterShared>,
}

struct ClusterShared {
    options: ConnectionOptions,
    pool_config: PoolConfig,
    purge_unhealthy_nodes: bool,
    events: Option<Arc<dyn ClusterEvents>>,
    health_tx: mpsc::UnboundedSender<HealthEvent>,
    state: Mutex<ClusterState>,
    ring: ArcSwap<HashRing>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    discovered: watch::Sender<bool>,
}

struct ClusterState {
    nodes: HashMap<Address, Arc<Node>>,
    healthy: HashMap<Address, bool>,
}

impl Cluster {
    pub(crate) fn new(
        addresses: Vec<Address>,
        options: ConnectionOptions,
        pool_config: PoolConfig,
        purge_unhealthy_nodes: bool,
        events: Option<Arc<dyn ClusterEvents>>,
        autodiscovery: Option<AutodiscoveryConfig>,
    ) -> Cluster {
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (discovered, _) = watch::channel(false);

        let shared = Arc::new(ClusterShared {
            options,
            pool_config,
            purge_unhealthy_nodes,
            events,
            health_tx,
            state: Mutex::new(ClusterState {
                nodes: HashMap::new(),
                healthy: HashMap::new(),
            }),
            ring: ArcSwap::from_pointee(HashRing::new(Vec::new())),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            discovered,
        });

        {
            let mut state = shared.state.lock().unwrap();
            for address in addresses {
                shared.insert_node(&mut state, address);
            }
            shared.install_ring(&state);
        }

        let mut tasks = vec![tokio::spawn(health_loop(Arc::clone(&shared), health_rx))];
        if let Some(config) = autodiscovery {
            tasks.push(tokio::spawn(autodiscovery_loop(Arc::clone(&shared), config)));
        }
        *shared.tasks.lock().unwrap() = tasks;

        Cluster { shared }
    }

    /// The node owning this key according to the current ring snapshot.
    pub(crate) fn pick_node(&self, key: &[u8]) -> Result<Arc<Node>, Error> {
        let ring = self.shared.ring.load();
        let address = ring.pick(key).ok_or_else(no_available_nodes)?;
        let state = self.shared.state.lock().unwrap();
        state.nodes.get(address).cloned().ok_or_else(no_available_nodes)
    }

    /// Group keys by destination node, preserving the input order of
    /// keys within each group.
    pub(crate) fn pick_nodes(
        &self,
        keys: Vec<Vec<u8>>,
    ) -> Result<Vec<(Arc<Node>, Vec<Vec<u8>>)>, Error> {
        let ring = self.shared.ring.load();
        if ring.is_empty() {
            return Err(no_available_nodes());
        }
        let groups = ring.pick_many(keys);
        let state = self.shared.state.lock().unwrap();
        groups
            .into_iter()
            .map(|(address, keys)| {
                state
                    .nodes
                    .get(address)
                    .cloned()
                    .map(|node| (node, keys))
                    .ok_or_else(no_available_nodes)
            })
            .collect()
    }

    /// Direct lookup for per-node admin commands.
    pub(crate) fn node(&self, address: &Address) -> Result<Arc<Node>, Error> {
        let state = self.shared.state.lock().unwrap();
        state.nodes.get(address).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("address does not belong to the cluster: {}", address))
        })
    }

    pub(crate) fn management(&self) -> ClusterManagement {
        ClusterManagement {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until the first autodiscovery poll succeeded, bounded by
    /// the startup deadline.
    pub(crate) async fn wait_autodiscovery(&self, deadline: Duration) -> Result<(), Error> {
        let mut rx = self.shared.discovered.subscribe();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| Error::Timeout)
    }

    /// Idempotent; cancels the background tasks and closes every pool.
    /// In-flight operations are not drained.
    pub(crate) fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let state = self.shared.state.lock().unwrap();
        for node in state.nodes.values() {
            node.close();
        }
    }
}

impl ClusterShared {
    fn insert_node(&self, state: &mut ClusterState, address: Address) {
        let node = Node::new(
            address.clone(),
            self.options.clone(),
            self.pool_config.clone(),
            self.health_tx.clone(),
        );
        state.healthy.insert(address.clone(), true);
        state.nodes.insert(address, node);
    }

    /// Build a ring over the current node set (minus unhealthy nodes
    /// when purging is enabled) and install it.
    fn install_ring(&self, state: &ClusterState) {
        let addresses: Vec<Address> = state
            .nodes
            .keys()
            .filter(|address| {
                !self.purge_unhealthy_nodes || state.healthy.get(*address).copied().unwrap_or(true)
            })
            .cloned()
            .collect();
        self.ring.store(Arc::new(HashRing::new(addresses)));
    }
}

async fn health_loop(shared: Arc<ClusterShared>, mut events: mpsc::UnboundedReceiver<HealthEvent>) {
    while let Some((address, healthy)) = events.recv().await {
        let known = {
            let mut state = shared.state.lock().unwrap();
            match state.healthy.get_mut(&address) {
                Some(entry) => {
                    *entry = healthy;
                    true
                }
                // a late event from a node autodiscovery already removed
                None => false,
            }
        };
        if !known {
            continue;
        }
        debug!(address = %address, healthy, "node health changed");
        if shared.purge_unhealthy_nodes {
            let state = shared.state.lock().unwrap();
            shared.install_ring(&state);
        }
        if let Some(events) = &shared.events {
            let management = ClusterManagement {
                shared: Arc::clone(&shared),
            };
            if healthy {
                events.on_node_healthy(&management, &address).await;
            } else {
                events.on_node_unhealthy(&management, &address).await;
            }
        }
    }
}

async fn autodiscovery_loop(shared: Arc<ClusterShared>, config: AutodiscoveryConfig) {
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match discover(&shared, config.timeout).await {
            Ok(addresses) => {
                apply_discovery(&shared, addresses);
                let _ = shared.discovered.send(true);
            }
            // fail closed: keep the current node set and retry at the
            // next poll
            Err(err) => warn!(error = %err, "autodiscovery poll failed"),
        }
    }
}

/// One `config get cluster` round trip against a live node.
async fn discover(shared: &Arc<ClusterShared>, timeout: Duration) -> Result<Vec<Address>, Error> {
    let node = {
        let state = shared.state.lock().unwrap();
        state
            .nodes
            .values()
            .find(|node| node.is_healthy())
            .or_else(|| state.nodes.values().next())
            .cloned()
    }
    .ok_or_else(no_available_nodes)?;

    op_timeout(Some(timeout), async {
        let mut connection = node.connection().await?;
        match connection.config_get_cluster().await? {
            ConfigReply::Config(payload) => parse_cluster_config(&payload),
            ConfigReply::Status(status) => {
                Err(Error::Command(format!("autodiscovery failed: {}", status)))
            }
        }
    })
    .await
}

/// Parse the ElastiCache configuration payload: the last non-empty line
/// lists `host|ip|port` triples separated by spaces.
fn parse_cluster_config(payload: &[u8]) -> Result<Vec<Address>, Error> {
    let malformed = || Error::Command("malformed autodiscovery response".into());
    let text = std::str::from_utf8(payload).map_err(|_| malformed())?;
    let line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(malformed)?;

    let mut addresses = Vec::new();
    for entry in line.split_whitespace() {
        let mut parts = entry.split('|');
        let (Some(host), Some(ip), Some(port)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed());
        };
        if parts.next().is_some() {
            return Err(malformed());
        }
        let port: u16 = port.parse().map_err(|_| malformed())?;
        let host = if host.is_empty() { ip } else { host };
        if host.is_empty() {
            return Err(malformed());
        }
        addresses.push(Address::tcp(host, port));
    }
    if addresses.is_empty() {
        return Err(malformed());
    }
    Ok(addresses)
}

/// Diff the discovered address set against the current nodes and apply
/// adds and removals.
fn apply_discovery(shared: &Arc<ClusterShared>, addresses: Vec<Address>) {
    let removed = {
        let mut state = shared.state.lock().unwrap();
        let next: HashSet<&Address> = addresses.iter().collect();
        let stale: Vec<Address> = state
            .nodes
            .keys()
            .filter(|address| !next.contains(address))
            .cloned()
            .collect();
        let fresh: Vec<Address> = addresses
            .iter()
            .filter(|address| !state.nodes.contains_key(address))
            .cloned()
            .collect();
        if stale.is_empty() && fresh.is_empty() {
            return;
        }

        let mut removed = Vec::new();
        for address in stale {
            state.healthy.remove(&address);
            if let Some(node) = state.nodes.remove(&address) {
                removed.push(node);
            }
        }
        for address in fresh {
            info!(address = %address, "node discovered");
            shared.insert_node(&mut state, address);
        }
        shared.install_ring(&state);
        removed
    };
    for node in removed {
        info!(address = %node.address(), "node removed by autodiscovery");
        node.close();
    }
}

/// Read-only view over the cluster used for introspection and from
/// [`ClusterEvents`] callbacks.
#[derive(Clone)]
pub struct ClusterManagement {
    shared: Arc<ClusterShared>,
}

impl ClusterManagement {
    /// All nodes currently belonging to the cluster.
    pub fn nodes(&self) -> Vec<Address> {
        let state = self.shared.state.lock().unwrap();
        state.nodes.keys().cloned().collect()
    }

    /// Nodes currently considered healthy.
    pub fn healthy_nodes(&self) -> Vec<Address> {
        let state = self.shared.state.lock().unwrap();
        state
            .healthy
            .iter()
            .filter(|(_, healthy)| **healthy)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Nodes currently considered unhealthy.
    pub fn unhealthy_nodes(&self) -> Vec<Address> {
        let state = self.shared.state.lock().unwrap();
        state
            .healthy
            .iter()
            .filter(|(_, healthy)| !**healthy)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Per-node connection pool counters.
    pub fn connection_pool_metrics(&self) -> HashMap<Address, ConnectionPoolMetrics> {
        let state = self.shared.state.lock().unwrap();
        state
            .nodes
            .iter()
            .map(|(address, node)| (address.clone(), node.metrics()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use memc_core::address::Address;

    use super::{parse_cluster_config, AutodiscoveryConfig, Cluster};
    use crate::{
        connection::ConnectionOptions,
        error::Error,
        pool::PoolConfig,
        testutil::MockServer,
    };

    fn pool_config() -> PoolConfig {
        PoolConfig {
            min_connections: 0,
            max_connections: 2,
            purge_unused_connections_after: None,
        }
    }

    fn cluster(addresses: Vec<Address>, purge: bool) -> Cluster {
        Cluster::new(
            addresses,
            ConnectionOptions::default(),
            pool_config(),
            purge,
            None,
            None,
        )
    }

    #[test]
    fn test_parse_cluster_config() {
        let payload = b"12\nhost-1|10.0.0.1|11211 |10.0.0.2|11212\n";
        assert_eq!(
            Ok(vec![
                Address::tcp("host-1", 11211),
                Address::tcp("10.0.0.2", 11212),
            ]),
            parse_cluster_config(payload)
        );
    }

    #[test]
    fn test_parse_cluster_config_fails_closed() {
        assert!(parse_cluster_config(b"").is_err());
        assert!(parse_cluster_config(b"12\n\n").is_err());
        assert!(parse_cluster_config(b"12\nhost-only\n").is_err());
        assert!(parse_cluster_config(b"12\nhost|ip|not-a-port\n").is_err());
        assert!(parse_cluster_config(b"12\n||11211\n").is_err());
        assert!(parse_cluster_config(b"12\nhost|ip|1|extra\n").is_err());
    }

    #[tokio::test]
    async fn test_pick_node_is_deterministic() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        let cluster = cluster(vec![a.address(), b.address()], false);

        for i in 0..50 {
            let key = format!("key-{}", i).into_bytes();
            let first = cluster.pick_node(&key).unwrap();
            let second = cluster.pick_node(&key).unwrap();
            assert_eq!(first.address(), second.address());
        }
        cluster.close();
    }

    #[tokio::test]
    async fn test_unknown_admin_address() {
        let a = MockServer::start().await;
        let cluster = cluster(vec![a.address()], false);
        let result = cluster.node(&Address::tcp("elsewhere", 11211)).map(|_| ());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        cluster.close();
    }

    #[tokio::test]
    async fn test_unhealthy_node_is_purged_from_routing() {
        let live = MockServer::start().await;
        let dead = MockServer::start().await;
        let dead_address = dead.address();
        dead.shutdown().await;

        let cluster = cluster(vec![live.address(), dead_address.clone()], true);

        // trip the dead node's pool
        let node = cluster.node(&dead_address).unwrap();
        node.connection().await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(vec![dead_address], cluster.management().unhealthy_nodes());
        for i in 0..50 {
            let key = format!("key-{}", i).into_bytes();
            let node = cluster.pick_node(&key).unwrap();
            assert_eq!(&live.address(), node.address());
        }
        cluster.close();
    }

    #[tokio::test]
    async fn test_autodiscovery_adds_and_removes_nodes() {
        let seed = MockServer::start().await;
        let other = MockServer::start().await;

        let entries = format!(
            "1\nnode-a|{}|{} node-b|{}|{}\n",
            seed.host(),
            seed.port(),
            other.host(),
            other.port()
        );
        seed.set_config_payload(&entries);

        let cluster = Cluster::new(
            vec![seed.address()],
            ConnectionOptions::default(),
            pool_config(),
            false,
            None,
            Some(AutodiscoveryConfig {
                poll_interval: Duration::from_millis(50),
                timeout: Duration::from_secs(1),
            }),
        );
        cluster.wait_autodiscovery(Duration::from_secs(5)).await.unwrap();

        let mut nodes = cluster.management().nodes();
        nodes.sort_by_key(|address| address.to_string());
        let mut expected = vec![
            Address::tcp("node-a", seed.port()),
            Address::tcp("node-b", other.port()),
        ];
        expected.sort_by_key(|address| address.to_string());
        assert_eq!(expected, nodes);

        // the seed address itself was not part of the discovered set
        assert!(cluster.node(&seed.address()).is_err());
        cluster.close();
    }
}
