//! Coalesces concurrent single-key retrievals into batched multi-key
//! requests. Keys arriving within one scheduler turn and routed to the
//! same node share a single `get`/`gets` on one connection; a batch is
//! sealed early when it reaches `max_keys`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use memc_core::{
    address::Address,
    protocol::{FetchCommand, FetchReply, Item},
};
use tokio::sync::oneshot;

use crate::{cluster::Cluster, error::Error, timeout::op_timeout};

type Waiter = oneshot::Sender<Result<Option<Item>, Error>>;

/// Keys and waiters accumulated for one destination node. Every waiter
/// is resolved exactly once: with an item, with `None`, or with an
/// error.
struct PendingBatch {
    epoch: u64,
    keys: Vec<Vec<u8>>,
    waiters: HashMap<Vec<u8>, Vec<Waiter>>,
}

/// One coalescer for a fixed `(return_flags, return_cas)` shape; the
/// client keeps four of them.
pub(crate) struct AutoBatching {
    cluster: Cluster,
    command: FetchCommand,
    return_flags: bool,
    timeout: Option<Duration>,
    max_keys: usize,
    epochs: AtomicU64,
    batches: Mutex<HashMap<Address, PendingBatch>>,
}

impl AutoBatching {
    pub(crate) fn new(
        cluster: Cluster,
        return_flags: bool,
        return_cas: bool,
        timeout: Option<Duration>,
        max_keys: usize,
    ) -> Arc<AutoBatching> {
        Arc::new(AutoBatching {
            cluster,
            command: if return_cas {
                FetchCommand::Gets
            } else {
                FetchCommand::Get
            },
            return_flags,
            timeout,
            max_keys,
            epochs: AtomicU64::new(0),
            batches: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a key and suspend until its batch is flushed.
    pub(crate) async fn execute(self: &Arc<Self>, key: &[u8]) -> Result<Option<Item>, Error> {
        let node = self.cluster.pick_node(key)?;
        let address = node.address().clone();
        drop(node);

        let (tx, rx) = oneshot::channel();
        let sealed = {
            let mut batches = self.batches.lock().unwrap();
            let batch = batches.entry(address.clone()).or_insert_with(|| {
                let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
                // flush on the next scheduler turn
                self.schedule_flush(address.clone(), epoch);
                PendingBatch {
                    epoch,
                    keys: Vec::new(),
                    waiters: HashMap::new(),
                }
            });
            let waiters = batch.waiters.entry(key.to_vec()).or_default();
            if waiters.is_empty() {
                batch.keys.push(key.to_vec());
            }
            waiters.push(tx);
            if batch.keys.len() >= self.max_keys {
                batches.remove(&address)
            } else {
                None
            }
        };
        if let Some(batch) = sealed {
            // the batch filled up within this turn; flush it right away
            // and let the already-scheduled task find nothing
            let this = Arc::clone(self);
            let address = address.clone();
            tokio::spawn(async move { this.flush(address, batch).await });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Command("batched fetch was dropped".into())),
        }
    }

    fn schedule_flush(self: &Arc<Self>, address: Address, epoch: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let batch = {
                let mut batches = this.batches.lock().unwrap();
                match batches.get(&address) {
                    Some(batch) if batch.epoch == epoch => batches.remove(&address),
                    // sealed and flushed early, or replaced by a newer batch
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                this.flush(address, batch).await;
            }
        });
    }

    /// Send one multi-key request for the batch and resolve every
    /// waiter; on failure, every waiter of the batch receives the same
    /// error.
    async fn flush(&self, address: Address, batch: PendingBatch) {
        let result = op_timeout(self.timeout, self.fetch_batch(&address, &batch.keys)).await;
        match result {
            Ok(reply) => {
                let mut items: HashMap<Vec<u8>, Item> = HashMap::with_capacity(reply.keys.len());
                for idx in 0..reply.keys.len() {
                    items.insert(
                        reply.keys[idx].clone(),
                        Item {
                            value: reply.values[idx].clone(),
                            flags: self.return_flags.then(|| reply.flags[idx]),
                            cas: if self.command.returns_cas() {
                                reply.cas[idx]
                            } else {
                                None
                            },
                        },
                    );
                }
                for (key, waiters) in batch.waiters {
                    let item = items.get(&key);
                    for waiter in waiters {
                        let _ = waiter.send(Ok(item.cloned()));
                    }
                }
            }
            Err(err) => {
                for waiters in batch.waiters.into_values() {
                    for waiter in waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        }
    }

    async fn fetch_batch(&self, address: &Address, keys: &[Vec<u8>]) -> Result<FetchReply, Error> {
        let node = self.cluster.node(address)?;
        let mut connection = node.connection().await?;
        let reply = connection.fetch(self.command, keys).await?;
        if let Some(client_error) = reply.client_error {
            return Err(Error::Command(format!(
                "command finished with error, response returned {}",
                client_error
            )));
        }
        Ok(reply)
    }
}
