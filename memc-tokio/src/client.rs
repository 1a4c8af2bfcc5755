//! The public client façade: argument validation, routing through the
//! cluster, and classification of wire replies into typed outcomes.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::future::try_join_all;
use memc_core::{
    address::Address,
    protocol::{
        self, is_key_valid, CounterCommand, CounterReply, FetchCommand, FetchReply, GatCommand,
        Item, PipelineResponse, ResponseStatus, StorageCommand, VersionReply,
    },
};

use crate::{
    autobatching::AutoBatching,
    cluster::{Cluster, ClusterManagement},
    error::Error,
    timeout::op_timeout,
};

fn check_key(key: &[u8]) -> Result<(), Error> {
    if is_key_valid(key) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(
            "key is empty, longer than 250 bytes, or contains whitespace or control characters"
                .into(),
        ))
    }
}

fn check_flags(flags: u32) -> Result<(), Error> {
    if u16::try_from(flags).is_ok() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "flags can not be higher than {}",
            u16::MAX
        )))
    }
}

fn command_error(detail: impl std::fmt::Display) -> Error {
    Error::Command(format!(
        "command finished with error, response returned {}",
        detail
    ))
}

/// Build the caller-facing item out of a fetch reply, honouring which
/// attributes were requested.
fn single_item(
    mut reply: FetchReply,
    key: &[u8],
    return_flags: bool,
    return_cas: bool,
) -> Result<Option<Item>, Error> {
    if let Some(client_error) = reply.client_error {
        return Err(command_error(client_error));
    }
    let Some(idx) = reply.keys.iter().position(|k| k == key) else {
        return Ok(None);
    };
    let flags = return_flags.then(|| reply.flags[idx]);
    let cas = if return_cas { reply.cas[idx] } else { None };
    let value = reply.values.swap_remove(idx);
    Ok(Some(Item { value, flags, cas }))
}

fn merge_items(
    replies: Vec<FetchReply>,
    return_flags: bool,
    return_cas: bool,
) -> Result<HashMap<Vec<u8>, Item>, Error> {
    let mut results = HashMap::new();
    for reply in replies {
        if let Some(client_error) = reply.client_error {
            return Err(command_error(client_error));
        }
        for idx in 0..reply.keys.len() {
            let flags = return_flags.then(|| reply.flags[idx]);
            let cas = if return_cas { reply.cas[idx] } else { None };
            results.insert(
                reply.keys[idx].clone(),
                Item {
                    value: reply.values[idx].clone(),
                    flags,
                    cas,
                },
            );
        }
    }
    Ok(results)
}

struct AutoBatchers {
    noflags_nocas: Arc<AutoBatching>,
    flags_nocas: Arc<AutoBatching>,
    noflags_cas: Arc<AutoBatching>,
    flags_cas: Arc<AutoBatching>,
}

struct ClientInner {
    cluster: Cluster,
    timeout: Option<Duration>,
    closed: AtomicBool,
    autobatching: Option<AutoBatchers>,
}

/// An async memcached cluster client. Cheap to clone; all clones share
/// the same cluster, pools and autobatchers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn new(
        cluster: Cluster,
        timeout: Option<Duration>,
        autobatching_max_keys: Option<usize>,
    ) -> Client {
        // one autobatcher per (return_flags, return_cas) shape, so a
        // batch only ever merges requests asking for the same fields
        let autobatching = autobatching_max_keys.map(|max_keys| AutoBatchers {
            noflags_nocas: AutoBatching::new(cluster.clone(), false, false, timeout, max_keys),
            flags_nocas: AutoBatching::new(cluster.clone(), true, false, timeout, max_keys),
            noflags_cas: AutoBatching::new(cluster.clone(), false, true, timeout, max_keys),
            flags_cas: AutoBatching::new(cluster.clone(), true, true, timeout, max_keys),
        });
        Client {
            inner: Arc::new(ClientInner {
                cluster,
                timeout,
                closed: AtomicBool::new(false),
                autobatching,
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Whether the client has been closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the client: the client is closed immediately, every pool
    /// and background task is shut down, and any in-flight operation is
    /// left to fail. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cluster.close();
    }

    /// The management view over this client's cluster.
    pub fn cluster_management(&self) -> ClusterManagement {
        self.inner.cluster.management()
    }

    async fn fetch_one(&self, command: FetchCommand, key: &[u8]) -> Result<FetchReply, Error> {
        let node = self.inner.cluster.pick_node(key)?;
        let keys = vec![key.to_vec()];
        op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.fetch(command, &keys).await
        })
        .await
    }

    async fn gat_one(
        &self,
        command: GatCommand,
        exptime: i64,
        key: &[u8],
    ) -> Result<FetchReply, Error> {
        let node = self.inner.cluster.pick_node(key)?;
        let keys = vec![key.to_vec()];
        op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.get_and_touch(command, exptime, &keys).await
        })
        .await
    }

    /// Fan a multi-key retrieval out to every involved node. If any
    /// sub-request fails, the first error cancels the siblings and no
    /// partial result escapes.
    async fn fetch_many(
        &self,
        command: FetchCommand,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
        return_cas: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<Vec<u8>> = keys.iter().map(|key| key.as_ref().to_vec()).collect();
        for key in &keys {
            check_key(key)?;
        }
        let groups = self.inner.cluster.pick_nodes(keys)?;
        let replies = op_timeout(
            self.inner.timeout,
            try_join_all(groups.into_iter().map(|(node, keys)| async move {
                let mut connection = node.connection().await?;
                connection.fetch(command, &keys).await
            })),
        )
        .await?;
        merge_items(replies, return_flags, return_cas)
    }

    async fn gat_many_command(
        &self,
        command: GatCommand,
        exptime: i64,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
        return_cas: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<Vec<u8>> = keys.iter().map(|key| key.as_ref().to_vec()).collect();
        for key in &keys {
            check_key(key)?;
        }
        let groups = self.inner.cluster.pick_nodes(keys)?;
        let replies = op_timeout(
            self.inner.timeout,
            try_join_all(groups.into_iter().map(|(node, keys)| async move {
                let mut connection = node.connection().await?;
                connection.get_and_touch(command, exptime, &keys).await
            })),
        )
        .await?;
        merge_items(replies, return_flags, return_cas)
    }

    /// Return the value stored under `key`, or `None` on a miss. With
    /// `return_flags` the stored flags are populated on the item. When
    /// autobatching is enabled, concurrent calls issued within one
    /// scheduler turn are coalesced into batched requests.
    pub async fn get(
        &self,
        key: impl AsRef<[u8]>,
        return_flags: bool,
    ) -> Result<Option<Item>, Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        if let Some(batchers) = &self.inner.autobatching {
            let batcher = if return_flags {
                &batchers.flags_nocas
            } else {
                &batchers.noflags_nocas
            };
            return batcher.execute(key).await;
        }
        let reply = self.fetch_one(FetchCommand::Get, key).await?;
        single_item(reply, key, return_flags, false)
    }

    /// Like [`get`](Client::get), additionally returning the item's CAS
    /// token for a later [`cas`](Client::cas).
    pub async fn gets(
        &self,
        key: impl AsRef<[u8]>,
        return_flags: bool,
    ) -> Result<Option<Item>, Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        if let Some(batchers) = &self.inner.autobatching {
            let batcher = if return_flags {
                &batchers.flags_cas
            } else {
                &batchers.noflags_cas
            };
            return batcher.execute(key).await;
        }
        let reply = self.fetch_one(FetchCommand::Gets, key).await?;
        single_item(reply, key, return_flags, true)
    }

    /// Return the values stored under `keys`; missing keys are absent
    /// from the result. Keys are grouped per destination node and the
    /// requests run concurrently.
    pub async fn get_many(
        &self,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.fetch_many(FetchCommand::Get, keys, return_flags, false).await
    }

    /// Like [`get_many`](Client::get_many), additionally returning CAS
    /// tokens.
    pub async fn gets_many(
        &self,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.fetch_many(FetchCommand::Gets, keys, return_flags, true).await
    }

    /// Fetch an item while updating its expiration time.
    pub async fn gat(
        &self,
        exptime: i64,
        key: impl AsRef<[u8]>,
        return_flags: bool,
    ) -> Result<Option<Item>, Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        let reply = self.gat_one(GatCommand::Gat, exptime, key).await?;
        single_item(reply, key, return_flags, false)
    }

    /// Fetch an item and its CAS token while updating its expiration
    /// time.
    pub async fn gats(
        &self,
        exptime: i64,
        key: impl AsRef<[u8]>,
        return_flags: bool,
    ) -> Result<Option<Item>, Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        let reply = self.gat_one(GatCommand::Gats, exptime, key).await?;
        single_item(reply, key, return_flags, true)
    }

    /// Fetch several items while updating their expiration time.
    pub async fn gat_many(
        &self,
        exptime: i64,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.gat_many_command(GatCommand::Gat, exptime, keys, return_flags, false)
            .await
    }

    /// Fetch several items and their CAS tokens while updating their
    /// expiration time.
    pub async fn gats_many(
        &self,
        exptime: i64,
        keys: &[impl AsRef<[u8]>],
        return_flags: bool,
    ) -> Result<HashMap<Vec<u8>, Item>, Error> {
        self.gat_many_command(GatCommand::Gats, exptime, keys, return_flags, true)
            .await
    }

    async fn storage_command(
        &self,
        command: StorageCommand,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: i64,
        cas: Option<u64>,
        noreply: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        check_flags(flags)?;
        check_key(key)?;
        let node = self.inner.cluster.pick_node(key)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection
                .storage(command, key, value, flags, exptime, cas, noreply)
                .await
        })
        .await?;
        match status {
            // under noreply there is no ack to classify
            None | Some(ResponseStatus::Stored) => Ok(()),
            Some(ResponseStatus::NotStored) | Some(ResponseStatus::Exists) => {
                Err(Error::NotStored)
            }
            Some(other) => Err(Error::Storage(format!(
                "command finished with error, response returned {}",
                other
            ))),
        }
    }

    /// Store `value` under `key` unconditionally.
    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Set,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
        .await
    }

    /// Store `value` under `key` only if the key does not exist yet;
    /// fails with [`Error::NotStored`] otherwise.
    pub async fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Add,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
        .await
    }

    /// Store `value` under `key` only if the key already exists; fails
    /// with [`Error::NotStored`] otherwise.
    pub async fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Replace,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
        .await
    }

    /// Append `value` to the current value of an existing key. Flags
    /// and expiration time are left untouched by the server.
    pub async fn append(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Append,
            key.as_ref(),
            value.as_ref(),
            0,
            0,
            None,
            noreply,
        )
        .await
    }

    /// Prepend `value` to the current value of an existing key. Flags
    /// and expiration time are left untouched by the server.
    pub async fn prepend(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Prepend,
            key.as_ref(),
            value.as_ref(),
            0,
            0,
            None,
            noreply,
        )
        .await
    }

    /// Store `value` under `key` only if the server's CAS token still
    /// matches `cas` (as returned by [`gets`](Client::gets)); fails
    /// with [`Error::NotStored`] when the item changed in between.
    pub async fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        cas: u64,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.storage_command(
            StorageCommand::Cas,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            Some(cas),
            noreply,
        )
        .await
    }

    async fn counter_command(
        &self,
        command: CounterCommand,
        key: &[u8],
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        self.ensure_open()?;
        check_key(key)?;
        let node = self.inner.cluster.pick_node(key)?;
        let reply = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.incr_decr(command, key, delta, noreply).await
        })
        .await?;
        match reply {
            None => Ok(None),
            Some(CounterReply::Value(value)) => Ok(Some(value)),
            Some(CounterReply::Status(ResponseStatus::NotFound)) => Err(Error::NotFound),
            Some(CounterReply::Status(other)) => Err(command_error(other)),
        }
    }

    /// Increment the integer stored under `key` by `delta`, returning
    /// the new value (`None` under noreply). The key must exist.
    pub async fn increment(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        self.counter_command(CounterCommand::Incr, key.as_ref(), delta, noreply)
            .await
    }

    /// Decrement the integer stored under `key` by `delta`, returning
    /// the new value (`None` under noreply). The server clamps at zero.
    /// The key must exist.
    pub async fn decrement(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        noreply: bool,
    ) -> Result<Option<u64>, Error> {
        self.counter_command(CounterCommand::Decr, key.as_ref(), delta, noreply)
            .await
    }

    /// Override the expiration time of an existing key. A negative
    /// `exptime` expires it immediately.
    pub async fn touch(
        &self,
        key: impl AsRef<[u8]>,
        exptime: i64,
        noreply: bool,
    ) -> Result<(), Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        let node = self.inner.cluster.pick_node(key)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.touch(key, exptime, noreply).await
        })
        .await?;
        match status {
            None | Some(ResponseStatus::Touched) => Ok(()),
            Some(ResponseStatus::NotFound) => Err(Error::NotFound),
            Some(other) => Err(command_error(other)),
        }
    }

    /// Delete an existing key.
    pub async fn delete(&self, key: impl AsRef<[u8]>, noreply: bool) -> Result<(), Error> {
        let key = key.as_ref();
        self.ensure_open()?;
        check_key(key)?;
        let node = self.inner.cluster.pick_node(key)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.delete(key, noreply).await
        })
        .await?;
        match status {
            None | Some(ResponseStatus::Deleted) => Ok(()),
            Some(ResponseStatus::NotFound) => Err(Error::NotFound),
            Some(other) => Err(command_error(other)),
        }
    }

    /// Flush every key on one node, optionally deferred server-side by
    /// `delay` seconds. Reads during the delay window may still return
    /// pre-flush values.
    pub async fn flush_all(
        &self,
        address: &Address,
        delay: u32,
        noreply: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let node = self.inner.cluster.node(address)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.flush_all(delay, noreply).await
        })
        .await?;
        match status {
            None | Some(ResponseStatus::Ok) => Ok(()),
            Some(other) => Err(command_error(other)),
        }
    }

    /// The version string reported by one node.
    pub async fn version(&self, address: &Address) -> Result<String, Error> {
        self.ensure_open()?;
        let node = self.inner.cluster.node(address)?;
        let reply = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.version().await
        })
        .await?;
        match reply {
            VersionReply::Version(version) => Ok(version),
            VersionReply::Status(status) => Err(command_error(status)),
        }
    }

    /// Server statistics from one node, optionally narrowed by
    /// arguments such as `settings` or `items`.
    pub async fn stats(
        &self,
        address: &Address,
        args: &[&str],
    ) -> Result<HashMap<String, String>, Error> {
        self.ensure_open()?;
        let node = self.inner.cluster.node(address)?;
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let raw = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.stats(&args).await
        })
        .await?;
        if !raw.ends_with(b"END\r\n") {
            return Err(command_error(String::from_utf8_lossy(&raw).trim_end()));
        }
        let text = String::from_utf8_lossy(&raw);
        let mut entries = HashMap::new();
        for line in text.lines() {
            if let Some(entry) = line.strip_prefix("STAT ") {
                let mut tokens = entry.splitn(2, ' ');
                if let (Some(name), Some(value)) = (tokens.next(), tokens.next()) {
                    entries.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(entries)
    }

    /// Adjust one node's cache memory limit, in megabytes.
    pub async fn cache_memlimit(
        &self,
        address: &Address,
        megabytes: u64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let node = self.inner.cluster.node(address)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.cache_memlimit(megabytes, noreply).await
        })
        .await?;
        match status {
            None | Some(ResponseStatus::Ok) => Ok(()),
            Some(other) => Err(command_error(other)),
        }
    }

    /// Adjust one node's log verbosity level.
    pub async fn verbosity(
        &self,
        address: &Address,
        level: u64,
        noreply: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let node = self.inner.cluster.node(address)?;
        let status = op_timeout(self.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.verbosity(level, noreply).await
        })
        .await?;
        match status {
            None | Some(ResponseStatus::Ok) => Ok(()),
            Some(other) => Err(command_error(other)),
        }
    }

    /// Start building a pipeline of commands for one node.
    pub fn pipeline(&self, address: &Address) -> Pipeline {
        Pipeline {
            client: self.clone(),
            address: address.clone(),
            stack: BytesMut::new(),
            expected_replies: 0,
            deferred_error: None,
        }
    }
}

/// A builder accumulating pre-serialised commands for a single node.
/// [`execute`](Pipeline::execute) sends the concatenation in one write
/// and demultiplexes the consolidated reply into one typed record per
/// reply-bearing command, in submission order (`noreply` commands
/// produce no record).
///
/// Argument validation failures are deferred and surfaced by
/// `execute()`, which keeps the builder methods chainable.
pub struct Pipeline {
    client: Client,
    address: Address,
    stack: BytesMut,
    expected_replies: usize,
    deferred_error: Option<Error>,
}

impl Pipeline {
    fn push(&mut self, command: BytesMut, expects_reply: bool) -> &mut Pipeline {
        self.stack.extend_from_slice(&command);
        if expects_reply {
            self.expected_replies += 1;
        }
        self
    }

    fn defer(&mut self, err: Error) -> &mut Pipeline {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(err);
        }
        self
    }

    fn retrieval(&mut self, command: FetchCommand, keys: &[&[u8]]) -> &mut Pipeline {
        for key in keys {
            if let Err(err) = check_key(key) {
                return self.defer(err);
            }
        }
        self.push(protocol::fetch(command, keys), true)
    }

    fn get_and_touch(&mut self, command: GatCommand, exptime: i64, keys: &[&[u8]]) -> &mut Pipeline {
        for key in keys {
            if let Err(err) = check_key(key) {
                return self.defer(err);
            }
        }
        self.push(protocol::get_and_touch(command, exptime, keys), true)
    }

    #[allow(clippy::too_many_arguments)]
    fn storage(
        &mut self,
        command: StorageCommand,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: i64,
        cas: Option<u64>,
        noreply: bool,
    ) -> &mut Pipeline {
        if let Err(err) = check_key(key).and_then(|()| check_flags(flags)) {
            return self.defer(err);
        }
        self.push(
            protocol::storage(command, key, value, flags, exptime, cas, noreply),
            !noreply,
        )
    }

    /// Queue a `get`.
    pub fn get(&mut self, key: impl AsRef<[u8]>) -> &mut Pipeline {
        self.retrieval(FetchCommand::Get, &[key.as_ref()])
    }

    /// Queue a `gets`.
    pub fn gets(&mut self, key: impl AsRef<[u8]>) -> &mut Pipeline {
        self.retrieval(FetchCommand::Gets, &[key.as_ref()])
    }

    /// Queue a multi-key `get`.
    pub fn get_many<'k>(&mut self, keys: impl IntoIterator<Item = &'k [u8]>) -> &mut Pipeline {
        let keys: Vec<&[u8]> = keys.into_iter().collect();
        self.retrieval(FetchCommand::Get, &keys)
    }

    /// Queue a multi-key `gets`.
    pub fn gets_many<'k>(&mut self, keys: impl IntoIterator<Item = &'k [u8]>) -> &mut Pipeline {
        let keys: Vec<&[u8]> = keys.into_iter().collect();
        self.retrieval(FetchCommand::Gets, &keys)
    }

    /// Queue a `gat`.
    pub fn gat(&mut self, exptime: i64, key: impl AsRef<[u8]>) -> &mut Pipeline {
        self.get_and_touch(GatCommand::Gat, exptime, &[key.as_ref()])
    }

    /// Queue a `gats`.
    pub fn gats(&mut self, exptime: i64, key: impl AsRef<[u8]>) -> &mut Pipeline {
        self.get_and_touch(GatCommand::Gats, exptime, &[key.as_ref()])
    }

    /// Queue a multi-key `gat`.
    pub fn gat_many<'k>(
        &mut self,
        exptime: i64,
        keys: impl IntoIterator<Item = &'k [u8]>,
    ) -> &mut Pipeline {
        let keys: Vec<&[u8]> = keys.into_iter().collect();
        self.get_and_touch(GatCommand::Gat, exptime, &keys)
    }

    /// Queue a multi-key `gats`.
    pub fn gats_many<'k>(
        &mut self,
        exptime: i64,
        keys: impl IntoIterator<Item = &'k [u8]>,
    ) -> &mut Pipeline {
        let keys: Vec<&[u8]> = keys.into_iter().collect();
        self.get_and_touch(GatCommand::Gats, exptime, &keys)
    }

    /// Queue a `set`.
    pub fn set(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Set,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
    }

    /// Queue an `add`.
    pub fn add(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Add,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
    }

    /// Queue a `replace`.
    pub fn replace(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Replace,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            None,
            noreply,
        )
    }

    /// Queue an `append`.
    pub fn append(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Append,
            key.as_ref(),
            value.as_ref(),
            0,
            0,
            None,
            noreply,
        )
    }

    /// Queue a `prepend`.
    pub fn prepend(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Prepend,
            key.as_ref(),
            value.as_ref(),
            0,
            0,
            None,
            noreply,
        )
    }

    /// Queue a `cas`.
    pub fn cas(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        cas: u64,
        flags: u32,
        exptime: i64,
        noreply: bool,
    ) -> &mut Pipeline {
        self.storage(
            StorageCommand::Cas,
            key.as_ref(),
            value.as_ref(),
            flags,
            exptime,
            Some(cas),
            noreply,
        )
    }

    /// Queue an `incr`.
    pub fn increment(&mut self, key: impl AsRef<[u8]>, delta: u64, noreply: bool) -> &mut Pipeline {
        if let Err(err) = check_key(key.as_ref()) {
            return self.defer(err);
        }
        self.push(
            protocol::incr_decr(CounterCommand::Incr, key.as_ref(), delta, noreply),
            !noreply,
        )
    }

    /// Queue a `decr`.
    pub fn decrement(&mut self, key: impl AsRef<[u8]>, delta: u64, noreply: bool) -> &mut Pipeline {
        if let Err(err) = check_key(key.as_ref()) {
            return self.defer(err);
        }
        self.push(
            protocol::incr_decr(CounterCommand::Decr, key.as_ref(), delta, noreply),
            !noreply,
        )
    }

    /// Queue a `touch`.
    pub fn touch(&mut self, key: impl AsRef<[u8]>, exptime: i64, noreply: bool) -> &mut Pipeline {
        if let Err(err) = check_key(key.as_ref()) {
            return self.defer(err);
        }
        self.push(protocol::touch(key.as_ref(), exptime, noreply), !noreply)
    }

    /// Queue a `delete`.
    pub fn delete(&mut self, key: impl AsRef<[u8]>, noreply: bool) -> &mut Pipeline {
        if let Err(err) = check_key(key.as_ref()) {
            return self.defer(err);
        }
        self.push(protocol::delete(key.as_ref(), noreply), !noreply)
    }

    /// Queue a `flush_all`.
    pub fn flush_all(&mut self, delay: u32, noreply: bool) -> &mut Pipeline {
        self.push(protocol::flush_all(delay, noreply), !noreply)
    }

    /// Queue a `version`.
    pub fn version(&mut self) -> &mut Pipeline {
        self.push(protocol::version(), true)
    }

    /// Queue a `stats`.
    pub fn stats(&mut self, args: &[&str]) -> &mut Pipeline {
        self.push(protocol::stats(args), true)
    }

    /// Queue a `cache_memlimit`.
    pub fn cache_memlimit(&mut self, megabytes: u64, noreply: bool) -> &mut Pipeline {
        self.push(protocol::cache_memlimit(megabytes, noreply), !noreply)
    }

    /// Queue a `verbosity`.
    pub fn verbosity(&mut self, level: u64, noreply: bool) -> &mut Pipeline {
        self.push(protocol::verbosity(level, noreply), !noreply)
    }

    /// Send the accumulated commands in a single write and demultiplex
    /// the consolidated reply. The builder is reset afterwards.
    pub async fn execute(&mut self) -> Result<Vec<PipelineResponse>, Error> {
        self.client.ensure_open()?;
        let commands = self.stack.split();
        let expected = std::mem::take(&mut self.expected_replies);
        if let Some(err) = self.deferred_error.take() {
            return Err(err);
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let node = self.client.inner.cluster.node(&self.address)?;
        let raw = op_timeout(self.client.inner.timeout, async move {
            let mut connection = node.connection().await?;
            connection.pipeline_raw(&commands, expected).await
        })
        .await?;
        if expected == 0 {
            return Ok(Vec::new());
        }
        match protocol::parse_pipeline_reply(&raw, expected)? {
            Some((_, records)) => Ok(records),
            None => Err(Error::Command(
                "pipeline response ended before every record was read".into(),
            )),
        }
    }
}
