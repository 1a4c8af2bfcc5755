//! An in-process memcached speaking just enough of the text protocol
//! for the tests: an in-memory store, per-connection tasks, and a
//! counter of wire requests so coalescing can be asserted.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::{Buf, BytesMut};
use memc_core::address::Address;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

pub(crate) struct MockServerBuilder {
    credentials: Option<String>,
    response_delay: Option<Duration>,
}

impl MockServerBuilder {
    pub(crate) fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(format!("{} {}", username, password));
        self
    }

    pub(crate) fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub(crate) async fn start(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        MockServer::serve(listener, self)
    }
}

struct StoredItem {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Default)]
struct Store {
    items: HashMap<Vec<u8>, StoredItem>,
    cas: u64,
}

impl Store {
    fn next_cas(&mut self) -> u64 {
        self.cas += 1;
        self.cas
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>, flags: u32) {
        let cas = self.next_cas();
        self.items.insert(key, StoredItem { value, flags, cas });
    }
}

struct Shared {
    store: Mutex<Store>,
    requests: AtomicUsize,
    config_payload: Mutex<Option<Vec<u8>>>,
    credentials: Option<String>,
    response_delay: Option<Duration>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct MockServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub(crate) fn builder() -> MockServerBuilder {
        MockServerBuilder {
            credentials: None,
            response_delay: None,
        }
    }

    pub(crate) async fn start() -> MockServer {
        MockServer::builder().start().await
    }

    /// Bind a specific address, e.g. to bring a "node" back on the port
    /// of a previously stopped one.
    pub(crate) async fn bind(address: &Address) -> MockServer {
        let Address::Tcp { host, port } = address else {
            panic!("mock server only binds TCP addresses");
        };
        let listener = TcpListener::bind((host.as_str(), *port)).await.unwrap();
        MockServer::serve(listener, MockServer::builder())
    }

    fn serve(listener: TcpListener, builder: MockServerBuilder) -> MockServer {
        let local_addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            store: Mutex::new(Store::default()),
            requests: AtomicUsize::new(0),
            config_payload: Mutex::new(None),
            credentials: builder.credentials,
            response_delay: builder.response_delay,
            connections: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let task =
                            tokio::spawn(serve_connection(stream, Arc::clone(&accept_shared)));
                        accept_shared.connections.lock().unwrap().push(task);
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            local_addr,
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    pub(crate) fn address(&self) -> Address {
        Address::tcp(self.host(), self.port())
    }

    pub(crate) fn host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub(crate) fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of commands received over the wire.
    pub(crate) fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Seed an item directly, bypassing the wire counter.
    pub(crate) fn insert(&self, key: Vec<u8>, value: Vec<u8>, flags: u32) {
        self.shared.store.lock().unwrap().put(key, value, flags);
    }

    /// Respond to `config get cluster` with this payload.
    pub(crate) fn set_config_payload(&self, payload: &str) {
        *self.shared.config_payload.lock().unwrap() = Some(payload.as_bytes().to_vec());
    }

    /// Stop accepting and drop every open connection.
    pub(crate) async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let connections: Vec<_> = self.shared.connections.lock().unwrap().drain(..).collect();
        for task in connections {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.shared.connections.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn read_line(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<u8>> {
    loop {
        if let Some(pos) = buf.windows(2).position(|window| window == b"\r\n") {
            let line = buf.split_to(pos).to_vec();
            buf.advance(2);
            return Some(line);
        }
        buf.reserve(4096);
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn read_payload(stream: &mut TcpStream, buf: &mut BytesMut, len: usize) -> Option<Vec<u8>> {
    while buf.len() < len + 2 {
        buf.reserve(4096);
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    let payload = buf.split_to(len).to_vec();
    buf.advance(2);
    Some(payload)
}

async fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = BytesMut::new();
    let mut authenticated = shared.credentials.is_none();

    loop {
        let Some(line) = read_line(&mut stream, &mut buf).await else {
            return;
        };
        let text = String::from_utf8_lossy(&line).to_string();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        shared.requests.fetch_add(1, Ordering::SeqCst);
        let noreply = tokens.last() == Some(&"noreply");

        let response: Option<Vec<u8>> = match tokens[0] {
            _ if !authenticated => {
                if tokens[0] == "set" && tokens.len() >= 5 && tokens[1] == "auth" {
                    let len: usize = tokens[4].parse().unwrap();
                    let Some(payload) = read_payload(&mut stream, &mut buf, len).await else {
                        return;
                    };
                    if Some(payload) == shared.credentials.as_ref().map(|c| c.as_bytes().to_vec())
                    {
                        authenticated = true;
                        Some(b"STORED\r\n".to_vec())
                    } else {
                        Some(b"CLIENT_ERROR authentication failure\r\n".to_vec())
                    }
                } else {
                    Some(b"ERROR\r\n".to_vec())
                }
            }
            "get" | "gets" => Some(fetch_response(&shared, &tokens[1..], tokens[0] == "gets")),
            "gat" | "gats" => {
                let exptime: i64 = tokens[1].parse().unwrap();
                let response = fetch_response(&shared, &tokens[2..], tokens[0] == "gats");
                if exptime < 0 {
                    let mut store = shared.store.lock().unwrap();
                    for key in &tokens[2..] {
                        store.items.remove(key.as_bytes());
                    }
                }
                Some(response)
            }
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let len: usize = tokens[4].parse().unwrap();
                let Some(payload) = read_payload(&mut stream, &mut buf, len).await else {
                    return;
                };
                let status = storage_response(&shared, &tokens, payload);
                if noreply {
                    None
                } else {
                    Some(status)
                }
            }
            "incr" | "decr" => {
                let status = counter_response(&shared, &tokens);
                if noreply {
                    None
                } else {
                    Some(status)
                }
            }
            "touch" => {
                let exptime: i64 = tokens[2].parse().unwrap();
                let mut store = shared.store.lock().unwrap();
                let status = if store.items.contains_key(tokens[1].as_bytes()) {
                    if exptime < 0 {
                        store.items.remove(tokens[1].as_bytes());
                    }
                    b"TOUCHED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                };
                if noreply {
                    None
                } else {
                    Some(status)
                }
            }
            "delete" => {
                let removed = shared
                    .store
                    .lock()
                    .unwrap()
                    .items
                    .remove(tokens[1].as_bytes())
                    .is_some();
                let status = if removed {
                    b"DELETED\r\n".to_vec()
                } else {
                    b"NOT_FOUND\r\n".to_vec()
                };
                if noreply {
                    None
                } else {
                    Some(status)
                }
            }
            "flush_all" => {
                shared.store.lock().unwrap().items.clear();
                if noreply {
                    None
                } else {
                    Some(b"OK\r\n".to_vec())
                }
            }
            "version" => Some(b"VERSION 1.6.38\r\n".to_vec()),
            "stats" => {
                if tokens.len() > 1 {
                    Some(b"STAT verbosity 1\r\nSTAT maxconns 1024\r\nEND\r\n".to_vec())
                } else {
                    Some(b"STAT version 1.6.38\r\nSTAT uptime 1\r\nEND\r\n".to_vec())
                }
            }
            "verbosity" | "cache_memlimit" => {
                if noreply {
                    None
                } else {
                    Some(b"OK\r\n".to_vec())
                }
            }
            "config" => {
                let payload = shared.config_payload.lock().unwrap().clone();
                match payload {
                    Some(payload) => {
                        let mut response =
                            format!("CONFIG cluster 0 {}\r\n", payload.len()).into_bytes();
                        response.extend_from_slice(&payload);
                        response.extend_from_slice(b"\r\nEND\r\n");
                        Some(response)
                    }
                    None => Some(b"ERROR\r\n".to_vec()),
                }
            }
            _ => Some(b"ERROR\r\n".to_vec()),
        };

        if let Some(response) = response {
            if let Some(delay) = shared.response_delay {
                tokio::time::sleep(delay).await;
            }
            if stream.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

fn fetch_response(shared: &Shared, keys: &[&str], with_cas: bool) -> Vec<u8> {
    let store = shared.store.lock().unwrap();
    let mut response = Vec::new();
    for key in keys {
        if let Some(item) = store.items.get(key.as_bytes()) {
            let header = if with_cas {
                format!("VALUE {} {} {} {}\r\n", key, item.flags, item.value.len(), item.cas)
            } else {
                format!("VALUE {} {} {}\r\n", key, item.flags, item.value.len())
            };
            response.extend_from_slice(header.as_bytes());
            response.extend_from_slice(&item.value);
            response.extend_from_slice(b"\r\n");
        }
    }
    response.extend_from_slice(b"END\r\n");
    response
}

fn storage_response(shared: &Shared, tokens: &[&str], payload: Vec<u8>) -> Vec<u8> {
    let key = tokens[1].as_bytes().to_vec();
    let flags: u32 = tokens[2].parse().unwrap();
    let exptime: i64 = tokens[3].parse().unwrap();
    let mut store = shared.store.lock().unwrap();

    let status: &[u8] = match tokens[0] {
        "set" => {
            if exptime < 0 {
                store.items.remove(&key);
            } else {
                store.put(key, payload, flags);
            }
            b"STORED\r\n"
        }
        "add" => {
            if store.items.contains_key(&key) {
                b"NOT_STORED\r\n"
            } else {
                store.put(key, payload, flags);
                b"STORED\r\n"
            }
        }
        "replace" => {
            if store.items.contains_key(&key) {
                store.put(key, payload, flags);
                b"STORED\r\n"
            } else {
                b"NOT_STORED\r\n"
            }
        }
        "append" | "prepend" => match store.items.remove(&key) {
            Some(item) => {
                let mut value = item.value;
                if tokens[0] == "append" {
                    value.extend_from_slice(&payload);
                } else {
                    let mut prefixed = payload;
                    prefixed.extend_from_slice(&value);
                    value = prefixed;
                }
                let flags = item.flags;
                store.put(key, value, flags);
                b"STORED\r\n"
            }
            None => b"NOT_STORED\r\n",
        },
        "cas" => {
            let expected: u64 = tokens[5].parse().unwrap();
            let current = store.items.get(&key).map(|item| item.cas);
            match current {
                None => b"NOT_FOUND\r\n",
                Some(cas) if cas != expected => b"EXISTS\r\n",
                Some(_) => {
                    store.put(key, payload, flags);
                    b"STORED\r\n"
                }
            }
        }
        _ => b"ERROR\r\n",
    };
    status.to_vec()
}

fn counter_response(shared: &Shared, tokens: &[&str]) -> Vec<u8> {
    let key = tokens[1].as_bytes();
    let delta: u64 = tokens[2].parse().unwrap();
    let mut store = shared.store.lock().unwrap();
    let Some(item) = store.items.get(key) else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let Ok(current) = String::from_utf8_lossy(&item.value).parse::<u64>() else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };
    let next = if tokens[0] == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    let flags = item.flags;
    store.put(key.to_vec(), next.to_string().into_bytes(), flags);
    format!("{}\r\n", next).into_bytes()
}
