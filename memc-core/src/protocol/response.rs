//! Incremental response parsing. Every parser has the shape
//! `fn(&[u8]) -> Result<Option<(consumed, T)>, ProtocolError>` and
//! returns `Ok(None)` until a complete terminal response is buffered,
//! so callers can keep reading from the socket and retry. Value
//! payloads are read by the byte count announced in the `VALUE` header,
//! never by scanning for CR LF.

use std::collections::HashMap;

use thiserror::Error;

/// A violation of the text protocol observed while parsing a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected response token: {0}")]
    UnexpectedToken(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A single stored item. `flags` is populated only when the caller
/// asked for it; `cas` only for `gets`/`gats` retrievals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Vec<u8>,
    pub flags: Option<u32>,
    pub cas: Option<u64>,
}

/// A terminal single-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    Error,
    ClientError(String),
    ServerError(String),
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Stored => write!(f, "STORED"),
            ResponseStatus::NotStored => write!(f, "NOT_STORED"),
            ResponseStatus::Exists => write!(f, "EXISTS"),
            ResponseStatus::NotFound => write!(f, "NOT_FOUND"),
            ResponseStatus::Deleted => write!(f, "DELETED"),
            ResponseStatus::Touched => write!(f, "TOUCHED"),
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::Error => write!(f, "ERROR"),
            ResponseStatus::ClientError(msg) => write!(f, "CLIENT_ERROR {}", msg),
            ResponseStatus::ServerError(msg) => write!(f, "SERVER_ERROR {}", msg),
        }
    }
}

impl ResponseStatus {
    /// Whether this status is one of the error lines.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ResponseStatus::Error
                | ResponseStatus::ClientError(_)
                | ResponseStatus::ServerError(_)
        )
    }
}

/// The outcome of a multi-item retrieval: four parallel arrays indexed
/// by reply position, plus the error line that may replace the block.
/// `cas` entries are present only when the server sent a CAS token
/// (`gets`/`gats`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReply {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub flags: Vec<u32>,
    pub cas: Vec<Option<u64>>,
    pub client_error: Option<String>,
}

/// Reply to `incr`/`decr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterReply {
    Value(u64),
    Status(ResponseStatus),
}

/// Reply to `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReply {
    Version(String),
    Status(ResponseStatus),
}

/// Reply to `config get <name>` (autodiscovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReply {
    Config(Vec<u8>),
    Status(ResponseStatus),
}

/// One demultiplexed record of a pipelined multi-command response. An
/// empty `Values` record is a retrieval miss (a bare `END`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResponse {
    Status(ResponseStatus),
    Values(Vec<(Vec<u8>, Item)>),
    Counter(u64),
    Version(String),
    Stats(HashMap<String, String>),
}

type ParseResult<T> = Result<Option<(usize, T)>, ProtocolError>;

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|position| from + position)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn ascii_u64(token: &[u8]) -> Option<u64> {
    if token.is_empty() || !token.iter().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn status_from_line(line: &[u8]) -> Option<ResponseStatus> {
    match line {
        b"STORED" => Some(ResponseStatus::Stored),
        b"NOT_STORED" => Some(ResponseStatus::NotStored),
        b"EXISTS" => Some(ResponseStatus::Exists),
        b"NOT_FOUND" => Some(ResponseStatus::NotFound),
        b"DELETED" => Some(ResponseStatus::Deleted),
        b"TOUCHED" => Some(ResponseStatus::Touched),
        b"OK" => Some(ResponseStatus::Ok),
        b"ERROR" => Some(ResponseStatus::Error),
        _ if line.starts_with(b"CLIENT_ERROR") => {
            Some(ResponseStatus::ClientError(error_message(line, 12)))
        }
        _ if line.starts_with(b"SERVER_ERROR") => {
            Some(ResponseStatus::ServerError(error_message(line, 12)))
        }
        _ => None,
    }
}

fn error_message(line: &[u8], prefix: usize) -> String {
    let rest = &line[prefix..];
    lossy(rest.strip_prefix(b" ").unwrap_or(rest))
}

struct ValueHeader<'a> {
    key: &'a [u8],
    flags: u32,
    len: usize,
    cas: Option<u64>,
}

/// Parse the token list after `VALUE `: `<key> <flags> <bytes> [<cas>]`.
fn parse_value_header(header: &[u8]) -> Result<ValueHeader<'_>, ProtocolError> {
    let mut tokens = header.split(|byte| *byte == b' ');
    let malformed = || ProtocolError::Malformed(format!("bad VALUE header: {}", lossy(header)));

    let key = tokens.next().filter(|key| !key.is_empty()).ok_or_else(malformed)?;
    let flags = tokens
        .next()
        .and_then(ascii_u64)
        .and_then(|flags| u32::try_from(flags).ok())
        .ok_or_else(malformed)?;
    let len = tokens
        .next()
        .and_then(ascii_u64)
        .map(|len| len as usize)
        .ok_or_else(malformed)?;
    let cas = match tokens.next() {
        Some(token) => Some(ascii_u64(token).ok_or_else(malformed)?),
        None => None,
    };
    if tokens.next().is_some() {
        return Err(malformed());
    }
    Ok(ValueHeader { key, flags, len, cas })
}

/// Parse a retrieval block: zero or more `VALUE` records terminated by
/// `END`, or an error line replacing the whole block.
pub fn parse_fetch_reply(buf: &[u8]) -> ParseResult<FetchReply> {
    let mut reply = FetchReply::default();
    let mut pos = 0;
    loop {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let line = &buf[pos..end];
        if line == b"END" {
            return Ok(Some((end + 2, reply)));
        }
        if let Some(header) = line.strip_prefix(b"VALUE ") {
            let header = parse_value_header(header)?;
            let payload_start = end + 2;
            let payload_end = payload_start + header.len;
            if buf.len() < payload_end + 2 {
                return Ok(None);
            }
            if &buf[payload_end..payload_end + 2] != b"\r\n" {
                return Err(ProtocolError::Malformed(
                    "value payload not terminated by CR LF".into(),
                ));
            }
            reply.keys.push(header.key.to_vec());
            reply.values.push(buf[payload_start..payload_end].to_vec());
            reply.flags.push(header.flags);
            reply.cas.push(header.cas);
            pos = payload_end + 2;
        } else if status_from_line(line).is_some_and(|status| status.is_error()) {
            reply.client_error = Some(lossy(line));
            return Ok(Some((end + 2, reply)));
        } else {
            return Err(ProtocolError::UnexpectedToken(lossy(line)));
        }
    }
}

/// Parse a single-line status reply (storage, touch, delete, flush_all,
/// cache_memlimit, verbosity).
pub fn parse_status_reply(buf: &[u8]) -> ParseResult<ResponseStatus> {
    let Some(end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[..end];
    match status_from_line(line) {
        Some(status) => Ok(Some((end + 2, status))),
        None => Err(ProtocolError::UnexpectedToken(lossy(line))),
    }
}

/// Parse an `incr`/`decr` reply: an ASCII decimal integer line, or a
/// status line such as `NOT_FOUND`.
pub fn parse_counter_reply(buf: &[u8]) -> ParseResult<CounterReply> {
    let Some(end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[..end];
    if let Some(value) = ascii_u64(line) {
        return Ok(Some((end + 2, CounterReply::Value(value))));
    }
    match status_from_line(line) {
        Some(status) => Ok(Some((end + 2, CounterReply::Status(status)))),
        None => Err(ProtocolError::UnexpectedToken(lossy(line))),
    }
}

/// Parse a `version` reply.
pub fn parse_version_reply(buf: &[u8]) -> ParseResult<VersionReply> {
    let Some(end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[..end];
    if let Some(version) = line.strip_prefix(b"VERSION ") {
        return Ok(Some((end + 2, VersionReply::Version(lossy(version)))));
    }
    match status_from_line(line) {
        Some(status) => Ok(Some((end + 2, VersionReply::Status(status)))),
        None => Err(ProtocolError::UnexpectedToken(lossy(line))),
    }
}

/// Parse a `stats` reply and return the raw block bytes through the
/// terminating `END` (or the error line replacing the block). Callers
/// post-process the `STAT <name> <value>` lines.
pub fn parse_stats_reply(buf: &[u8]) -> ParseResult<Vec<u8>> {
    let mut pos = 0;
    loop {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let line = &buf[pos..end];
        if line == b"END" {
            return Ok(Some((end + 2, buf[..end + 2].to_vec())));
        }
        if line.starts_with(b"STAT ") {
            pos = end + 2;
            continue;
        }
        if status_from_line(line).is_some_and(|status| status.is_error()) {
            return Ok(Some((end + 2, buf[..end + 2].to_vec())));
        }
        return Err(ProtocolError::UnexpectedToken(lossy(line)));
    }
}

/// Parse a `config get <name>` reply:
/// `CONFIG <name> <flags> <bytes>\r\n<payload>\r\nEND\r\n`, or an error
/// line.
pub fn parse_config_reply(buf: &[u8]) -> ParseResult<ConfigReply> {
    let Some(end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let line = &buf[..end];
    if let Some(header) = line.strip_prefix(b"CONFIG ") {
        let mut tokens = header.split(|byte| *byte == b' ');
        let malformed = || ProtocolError::Malformed(format!("bad CONFIG header: {}", lossy(line)));
        let _name = tokens.next().filter(|name| !name.is_empty()).ok_or_else(malformed)?;
        let _flags = tokens.next().and_then(ascii_u64).ok_or_else(malformed)?;
        let len = tokens
            .next()
            .and_then(ascii_u64)
            .map(|len| len as usize)
            .ok_or_else(malformed)?;

        let payload_start = end + 2;
        let payload_end = payload_start + len;
        // payload CR LF plus the END line
        if buf.len() < payload_end + 2 + 5 {
            return Ok(None);
        }
        if &buf[payload_end..payload_end + 2] != b"\r\n" {
            return Err(ProtocolError::Malformed(
                "config payload not terminated by CR LF".into(),
            ));
        }
        if &buf[payload_end + 2..payload_end + 7] != b"END\r\n" {
            return Err(ProtocolError::Malformed(
                "config block not terminated by END".into(),
            ));
        }
        let payload = buf[payload_start..payload_end].to_vec();
        return Ok(Some((payload_end + 7, ConfigReply::Config(payload))));
    }
    match status_from_line(line) {
        Some(status) => Ok(Some((end + 2, ConfigReply::Status(status)))),
        None => Err(ProtocolError::UnexpectedToken(lossy(line))),
    }
}

/// Parse a consolidated pipeline reply into exactly `expected` typed
/// records, in server order. Records are recognised by their leading
/// token; a bare `END` is an empty retrieval block.
pub fn parse_pipeline_reply(buf: &[u8], expected: usize) -> ParseResult<Vec<PipelineResponse>> {
    let mut records = Vec::with_capacity(expected);
    let mut pos = 0;
    while records.len() < expected {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let line = &buf[pos..end];
        if line == b"END" {
            records.push(PipelineResponse::Values(Vec::new()));
            pos = end + 2;
        } else if line.starts_with(b"VALUE ") {
            match parse_retrieval_block(buf, pos)? {
                Some((next, values)) => {
                    records.push(PipelineResponse::Values(values));
                    pos = next;
                }
                None => return Ok(None),
            }
        } else if line.starts_with(b"STAT ") {
            match parse_stats_block(buf, pos)? {
                Some((next, stats)) => {
                    records.push(PipelineResponse::Stats(stats));
                    pos = next;
                }
                None => return Ok(None),
            }
        } else if let Some(version) = line.strip_prefix(b"VERSION ") {
            records.push(PipelineResponse::Version(lossy(version)));
            pos = end + 2;
        } else if let Some(value) = ascii_u64(line) {
            records.push(PipelineResponse::Counter(value));
            pos = end + 2;
        } else if let Some(status) = status_from_line(line) {
            records.push(PipelineResponse::Status(status));
            pos = end + 2;
        } else {
            return Err(ProtocolError::UnexpectedToken(lossy(line)));
        }
    }
    Ok(Some((pos, records)))
}

fn parse_retrieval_block(buf: &[u8], start: usize) -> ParseResult<Vec<(Vec<u8>, Item)>> {
    let mut values = Vec::new();
    let mut pos = start;
    loop {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let line = &buf[pos..end];
        if line == b"END" {
            return Ok(Some((end + 2, values)));
        }
        let Some(header) = line.strip_prefix(b"VALUE ") else {
            return Err(ProtocolError::UnexpectedToken(lossy(line)));
        };
        let header = parse_value_header(header)?;
        let payload_start = end + 2;
        let payload_end = payload_start + header.len;
        if buf.len() < payload_end + 2 {
            return Ok(None);
        }
        if &buf[payload_end..payload_end + 2] != b"\r\n" {
            return Err(ProtocolError::Malformed(
                "value payload not terminated by CR LF".into(),
            ));
        }
        values.push((
            header.key.to_vec(),
            Item {
                value: buf[payload_start..payload_end].to_vec(),
                flags: Some(header.flags),
                cas: header.cas,
            },
        ));
        pos = payload_end + 2;
    }
}

fn parse_stats_block(buf: &[u8], start: usize) -> ParseResult<HashMap<String, String>> {
    let mut stats = HashMap::new();
    let mut pos = start;
    loop {
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let line = &buf[pos..end];
        if line == b"END" {
            return Ok(Some((end + 2, stats)));
        }
        let Some(entry) = line.strip_prefix(b"STAT ") else {
            return Err(ProtocolError::UnexpectedToken(lossy(line)));
        };
        let entry = lossy(entry);
        let mut tokens = entry.splitn(2, ' ');
        match (tokens.next(), tokens.next()) {
            (Some(name), Some(value)) => {
                stats.insert(name.to_string(), value.to_string());
            }
            _ => {
                return Err(ProtocolError::Malformed(format!("bad STAT line: {}", entry)));
            }
        }
        pos = end + 2;
    }
}
