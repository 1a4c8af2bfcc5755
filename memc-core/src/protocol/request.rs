//! Request encoders. Each function is a pure mapping from a typed
//! command to the exact bytes sent over the wire, one buffer per
//! command so a single `write` carries the whole request.

use std::fmt::Write;

use bytes::BytesMut;

const CRLF: &[u8] = b"\r\n";

/// Retrieval commands: `gets` additionally returns the CAS token of
/// every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCommand {
    Get,
    Gets,
}

impl FetchCommand {
    pub(crate) fn token(self) -> &'static str {
        match self {
            FetchCommand::Get => "get",
            FetchCommand::Gets => "gets",
        }
    }

    /// Whether replies to this command carry a CAS token.
    pub fn returns_cas(self) -> bool {
        matches!(self, FetchCommand::Gets)
    }
}

/// Get-and-touch commands: retrieve items while updating their
/// expiration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatCommand {
    Gat,
    Gats,
}

impl GatCommand {
    pub(crate) fn token(self) -> &'static str {
        match self {
            GatCommand::Gat => "gat",
            GatCommand::Gats => "gats",
        }
    }

    /// Whether replies to this command carry a CAS token.
    pub fn returns_cas(self) -> bool {
        matches!(self, GatCommand::Gats)
    }
}

/// Storage commands. `Cas` carries an extra token, the expected CAS
/// identifier, before `noreply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StorageCommand {
    pub(crate) fn token(self) -> &'static str {
        match self {
            StorageCommand::Set => "set",
            StorageCommand::Add => "add",
            StorageCommand::Replace => "replace",
            StorageCommand::Append => "append",
            StorageCommand::Prepend => "prepend",
            StorageCommand::Cas => "cas",
        }
    }
}

/// Counter commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCommand {
    Incr,
    Decr,
}

impl CounterCommand {
    pub(crate) fn token(self) -> &'static str {
        match self {
            CounterCommand::Incr => "incr",
            CounterCommand::Decr => "decr",
        }
    }
}

/// `get`/`gets` over one or more keys.
pub fn fetch(command: FetchCommand, keys: &[impl AsRef<[u8]>]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(command.token().as_bytes());
    for key in keys {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(key.as_ref());
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `gat`/`gats` over one or more keys.
pub fn get_and_touch(command: GatCommand, exptime: i64, keys: &[impl AsRef<[u8]>]) -> BytesMut {
    let mut buf = BytesMut::new();
    let _ = write!(buf, "{} {}", command.token(), exptime);
    for key in keys {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(key.as_ref());
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// Any storage command. The value payload follows the header line and
/// is framed by its own CR LF; payload bytes are written verbatim.
pub fn storage(
    command: StorageCommand,
    key: &[u8],
    value: &[u8],
    flags: u32,
    exptime: i64,
    cas: Option<u64>,
    noreply: bool,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(value.len() + key.len() + 32);
    buf.extend_from_slice(command.token().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(key);
    let _ = write!(buf, " {} {} {}", flags, exptime, value.len());
    if let Some(cas) = cas {
        let _ = write!(buf, " {}", cas);
    }
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(value);
    buf.extend_from_slice(CRLF);
    buf
}

/// `incr`/`decr` by an unsigned delta.
pub fn incr_decr(command: CounterCommand, key: &[u8], delta: u64, noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(command.token().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(key);
    let _ = write!(buf, " {}", delta);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `touch`: update the expiration time of an existing item. A negative
/// `exptime` expires the item immediately.
pub fn touch(key: &[u8], exptime: i64, noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"touch ");
    buf.extend_from_slice(key);
    let _ = write!(buf, " {}", exptime);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `delete` an existing item.
pub fn delete(key: &[u8], noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"delete ");
    buf.extend_from_slice(key);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `flush_all`, optionally deferred by `delay` seconds on the server.
pub fn flush_all(delay: u32, noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    let _ = write!(buf, "flush_all {}", delay);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `version`.
pub fn version() -> BytesMut {
    BytesMut::from(&b"version\r\n"[..])
}

/// `stats`, with optional arguments such as `settings` or `items`.
pub fn stats(args: &[impl AsRef<str>]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"stats");
    for arg in args {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(arg.as_ref().as_bytes());
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `cache_memlimit`: adjust the cache memory limit, in megabytes.
pub fn cache_memlimit(megabytes: u64, noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    let _ = write!(buf, "cache_memlimit {}", megabytes);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// `verbosity`: adjust the server log verbosity level.
pub fn verbosity(level: u64, noreply: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    let _ = write!(buf, "verbosity {}", level);
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(CRLF);
    buf
}

/// The ElastiCache `config get cluster` autodiscovery command.
pub fn config_get_cluster() -> BytesMut {
    BytesMut::from(&b"config get cluster\r\n"[..])
}
