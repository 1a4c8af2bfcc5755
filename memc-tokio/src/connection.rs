//! A single connection to one node: a duplex byte stream, a read
//! buffer that may carry a partial response chunk across turns, and the
//! protocol codec. Connections are exclusive leases, not multiplexed:
//! while open, exactly one request is in flight.

use std::{io, path::Path, sync::Arc};

use bytes::BytesMut;
use memc_core::{
    address::Address,
    protocol::{
        self, ConfigReply, CounterCommand, CounterReply, FetchCommand, FetchReply, GatCommand,
        ProtocolError, ResponseStatus, StorageCommand, VersionReply,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};
use tracing::debug;

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::Error;

/// How new connections are created: deadline for the whole
/// connect + TLS + auth sequence, optional TLS, optional credentials.
#[derive(Clone, Default)]
pub(crate) struct ConnectionOptions {
    pub(crate) connection_timeout: Option<std::time::Duration>,
    pub(crate) tls: Option<TlsConnector>,
    pub(crate) credentials: Option<(String, String)>,
}

/// Build the rustls connector shared by every connection of a client.
pub(crate) fn tls_connector(verify: bool, extra_ca: Option<&Path>) -> Result<TlsConnector, Error> {
    let config = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = extra_ca {
            let file = std::fs::File::open(path).map_err(|err| {
                Error::InvalidArgument(format!("cannot read CA file {}: {}", path.display(), err))
            })?;
            let mut reader = io::BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|err| {
                    Error::InvalidArgument(format!(
                        "cannot parse CA file {}: {}",
                        path.display(),
                        err
                    ))
                })?;
                roots.add(cert).map_err(|err| {
                    Error::InvalidArgument(format!(
                        "cannot load CA file {}: {}",
                        path.display(),
                        err
                    ))
                })?;
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

mod danger {
    use tokio_rustls::rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, Error as TlsError, SignatureScheme,
    };

    /// Accepts any server certificate. Installed only when the
    /// `ssl_verify` knob is disabled.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, TlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, TlsError> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Tcp(_) => f.write_str("Stream::Tcp"),
            Stream::Tls(_) => f.write_str("Stream::Tls"),
            #[cfg(unix)]
            Stream::Unix(_) => f.write_str("Stream::Unix"),
        }
    }
}

impl Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read_buf(buf).await,
            Stream::Tls(stream) => stream.read_buf(buf).await,
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read_buf(buf).await,
        }
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.write_all(data).await,
            Stream::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write_all(data).await,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    stream: Stream,
    buf: BytesMut,
    last_read_n: Option<usize>,
    open: bool,
    in_flight: bool,
    last_used: Instant,
}

impl Connection {
    /// Open a connection: TCP (or unix socket) connect, then the
    /// optional TLS handshake, then optional authentication — the whole
    /// sequence bounded by the connection timeout.
    pub(crate) async fn connect(
        address: &Address,
        options: &ConnectionOptions,
    ) -> Result<Connection, Error> {
        let connect = Self::connect_sequence(address, options);
        match options.connection_timeout {
            Some(deadline) => tokio::time::timeout(deadline, connect)
                .await
                .map_err(|_| Error::Timeout)?,
            None => connect.await,
        }
    }

    async fn connect_sequence(
        address: &Address,
        options: &ConnectionOptions,
    ) -> Result<Connection, Error> {
        let stream = match address {
            Address::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port)).await?;
                tcp.set_nodelay(true)?;
                match &options.tls {
                    Some(connector) => {
                        let name = rustls::pki_types::ServerName::try_from(host.clone())
                            .map_err(|_| {
                                Error::InvalidArgument(format!("invalid TLS server name: {}", host))
                            })?;
                        Stream::Tls(Box::new(connector.connect(name, tcp).await?))
                    }
                    None => Stream::Tcp(tcp),
                }
            }
            Address::Unix { path } => {
                #[cfg(unix)]
                {
                    Stream::Unix(UnixStream::connect(path).await?)
                }
                #[cfg(not(unix))]
                {
                    return Err(Error::InvalidArgument(format!(
                        "unix socket addresses are not supported on this platform: {}",
                        path.display()
                    )));
                }
            }
        };

        let mut connection = Connection {
            stream,
            buf: BytesMut::new(),
            last_read_n: None,
            open: true,
            in_flight: false,
            last_used: Instant::now(),
        };
        if let Some((username, password)) = &options.credentials {
            connection.authenticate(username, password).await?;
        }
        debug!(address = %address, "connection established");
        Ok(connection)
    }

    /// Text-protocol authentication: a `set` of the sentinel key `auth`
    /// whose payload is `<username> <password>`, expected to answer
    /// `STORED`.
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), Error> {
        let payload = format!("{} {}", username, password);
        let command = protocol::storage(
            StorageCommand::Set,
            b"auth",
            payload.as_bytes(),
            0,
            0,
            None,
            false,
        );
        match self.round_trip(&command, protocol::parse_status_reply).await {
            Ok(ResponseStatus::Stored) => Ok(()),
            Ok(status) => Err(self.fail(Error::Connection(format!(
                "authentication rejected: {}",
                status
            )))),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
    }

    fn fail(&mut self, err: Error) -> Error {
        self.open = false;
        err
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.stream.send(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Read until `parse` recognises a complete terminal response.
    /// Bytes past the consumed response stay buffered for the next
    /// read, which is what allows pipelined dialogues on one
    /// connection.
    async fn drive_receive<T, F>(&mut self, parse: F) -> Result<T, Error>
    where
        F: Fn(&[u8]) -> Result<Option<(usize, T)>, ProtocolError>,
    {
        // Advance past the previously consumed response.
        if let Some(n) = self.last_read_n.take() {
            let _ = self.buf.split_to(n);
        }

        let mut needs_more_data = false;
        loop {
            if self.buf.is_empty() || needs_more_data {
                self.buf.reserve(4096);
                let read = self.stream.read_buf(&mut self.buf).await;
                match read {
                    Ok(0) => {
                        return Err(
                            self.fail(Error::Connection("connection closed by server".into()))
                        )
                    }
                    Ok(_) => {}
                    Err(err) => return Err(self.fail(err.into())),
                }
            }

            match parse(&self.buf) {
                Ok(Some((n, response))) => {
                    self.last_read_n = Some(n);
                    return Ok(response);
                }
                Ok(None) => {
                    needs_more_data = true;
                }
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// One full request/response turn.
    async fn round_trip<T, F>(&mut self, command: &[u8], parse: F) -> Result<T, Error>
    where
        F: Fn(&[u8]) -> Result<Option<(usize, T)>, ProtocolError>,
    {
        self.in_flight = true;
        self.send(command).await?;
        let response = self.drive_receive(parse).await?;
        self.in_flight = false;
        Ok(response)
    }

    /// Write a `noreply` command: the server sends nothing back, so the
    /// connection must not attempt a read.
    async fn send_only(&mut self, command: &[u8]) -> Result<(), Error> {
        self.in_flight = true;
        self.send(command).await?;
        self.in_flight = false;
        Ok(())
    }

    pub(crate) async fn fetch(
        &mut self,
        command: FetchCommand,
        keys: &[Vec<u8>],
    ) -> Result<FetchReply, Error> {
        let request = protocol::fetch(command, keys);
        self.round_trip(&request, protocol::parse_fetch_reply).await
    }

    pub(crate) async fn get_and_touch(
        &mut self,
        command: GatCommand,
        exptime: i64,
        keys: &[Vec<u8>],
    ) -> Result<FetchReply, Error> {
        let request = protocol::get_and_touch(command, exptime, keys);
        self.round_trip(&request, protocol::parse_fetch_reply).await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn storage(
        &mut self,
        command: StorageCommand,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: i64,
        cas: Option<u64>,
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::storage(command, key, value, flags, exptime, cas, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn incr_decr(
        &mut self,
        command: CounterCommand,
        key: &[u8],
        delta: u64,
        noreply: bool,
    ) -> Result<Option<CounterReply>, Error> {
        let request = protocol::incr_decr(command, key, delta, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let reply = self.round_trip(&request, protocol::parse_counter_reply).await?;
        Ok(Some(reply))
    }

    pub(crate) async fn touch(
        &mut self,
        key: &[u8],
        exptime: i64,
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::touch(key, exptime, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn delete(
        &mut self,
        key: &[u8],
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::delete(key, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn flush_all(
        &mut self,
        delay: u32,
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::flush_all(delay, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn version(&mut self) -> Result<VersionReply, Error> {
        let request = protocol::version();
        self.round_trip(&request, protocol::parse_version_reply).await
    }

    /// Returns the raw stats block; the façade turns it into a map.
    pub(crate) async fn stats(&mut self, args: &[String]) -> Result<Vec<u8>, Error> {
        let request = protocol::stats(args);
        self.round_trip(&request, protocol::parse_stats_reply).await
    }

    pub(crate) async fn cache_memlimit(
        &mut self,
        megabytes: u64,
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::cache_memlimit(megabytes, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn verbosity(
        &mut self,
        level: u64,
        noreply: bool,
    ) -> Result<Option<ResponseStatus>, Error> {
        let request = protocol::verbosity(level, noreply);
        if noreply {
            self.send_only(&request).await?;
            return Ok(None);
        }
        let status = self.round_trip(&request, protocol::parse_status_reply).await?;
        Ok(Some(status))
    }

    pub(crate) async fn config_get_cluster(&mut self) -> Result<ConfigReply, Error> {
        let request = protocol::config_get_cluster();
        self.round_trip(&request, protocol::parse_config_reply).await
    }

    /// Write a pre-serialised multi-command buffer in one go and read
    /// the consolidated reply, returning its raw bytes. The reply
    /// boundary is found by parsing `expected_replies` terminal records;
    /// with zero expected replies nothing is read.
    pub(crate) async fn pipeline_raw(
        &mut self,
        commands: &[u8],
        expected_replies: usize,
    ) -> Result<Vec<u8>, Error> {
        if expected_replies == 0 {
            self.send_only(commands).await?;
            return Ok(Vec::new());
        }
        self.round_trip(commands, |buf| {
            match protocol::parse_pipeline_reply(buf, expected_replies)? {
                Some((n, _)) => Ok(Some((n, buf[..n].to_vec()))),
                None => Ok(None),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use memc_core::protocol::{FetchCommand, ResponseStatus, StorageCommand, VersionReply};

    use super::{Connection, ConnectionOptions};
    use crate::{error::Error, testutil::MockServer};

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let server = MockServer::start().await;
        let mut conn = Connection::connect(&server.address(), &ConnectionOptions::default())
            .await
            .unwrap();

        let status = conn
            .storage(StorageCommand::Set, b"foo", b"bar", 7, 0, None, false)
            .await
            .unwrap();
        assert_eq!(Some(ResponseStatus::Stored), status);

        let reply = conn.fetch(FetchCommand::Get, &[b"foo".to_vec()]).await.unwrap();
        assert_eq!(vec![b"foo".to_vec()], reply.keys);
        assert_eq!(vec![b"bar".to_vec()], reply.values);
        assert_eq!(vec![7], reply.flags);
        assert_eq!(vec![None], reply.cas);
    }

    #[tokio::test]
    async fn test_noreply_does_not_read() {
        let server = MockServer::start().await;
        let mut conn = Connection::connect(&server.address(), &ConnectionOptions::default())
            .await
            .unwrap();

        // a noreply set followed by a get on the same connection: the
        // next read must consume the get response, not block
        conn.storage(StorageCommand::Set, b"k", b"v", 0, 0, None, true)
            .await
            .unwrap();
        let reply = conn.fetch(FetchCommand::Get, &[b"k".to_vec()]).await.unwrap();
        assert_eq!(vec![b"v".to_vec()], reply.values);
    }

    #[tokio::test]
    async fn test_version() {
        let server = MockServer::start().await;
        let mut conn = Connection::connect(&server.address(), &ConnectionOptions::default())
            .await
            .unwrap();
        assert_eq!(
            VersionReply::Version("1.6.38".into()),
            conn.version().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_eof_closes_connection() {
        let server = MockServer::start().await;
        let mut conn = Connection::connect(&server.address(), &ConnectionOptions::default())
            .await
            .unwrap();
        server.shutdown().await;

        let result = conn.fetch(FetchCommand::Get, &[b"foo".to_vec()]).await;
        assert!(matches!(result, Err(Error::Connection(_))), "{:?}", result);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_authentication() {
        let server = MockServer::builder().credentials("user", "pass").start().await;

        let ok = ConnectionOptions {
            credentials: Some(("user".into(), "pass".into())),
            ..ConnectionOptions::default()
        };
        let mut conn = Connection::connect(&server.address(), &ok).await.unwrap();
        conn.storage(StorageCommand::Set, b"k", b"v", 0, 0, None, false)
            .await
            .unwrap();

        let bad = ConnectionOptions {
            credentials: Some(("user".into(), "wrong".into())),
            ..ConnectionOptions::default()
        };
        let result = Connection::connect(&server.address(), &bad).await;
        assert!(matches!(result, Err(Error::Connection(_))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_pipeline_raw() {
        let server = MockServer::start().await;
        let mut conn = Connection::connect(&server.address(), &ConnectionOptions::default())
            .await
            .unwrap();

        let commands = b"version\r\nset k 0 0 1\r\nv\r\nget k\r\n";
        let raw = conn.pipeline_raw(commands, 3).await.unwrap();
        let (consumed, records) =
            memc_core::protocol::parse_pipeline_reply(&raw, 3).unwrap().unwrap();
        assert_eq!(raw.len(), consumed);
        assert_eq!(3, records.len());
    }
}
