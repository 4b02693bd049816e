//! The XML-RPC client role.
//!
//! A [`Client`] owns the target options and an optional cached keep-alive
//! connection. `execute` is the single user-facing operation: serialize the
//! call, send it, read a complete response packet, decode it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::common::io::write_all_offset;
use crate::error::Error;
use crate::http::header::{Head, Packet, RequestHeader, ResponseHeader};
use crate::http::reader::PacketReader;
use crate::http::{VerificationLevel, XHeaders};
use crate::net::HostPort;
use crate::proto::{dump_request, parse_response, Params, Request, Response};

const READ_BUF_SIZE: usize = 65536;

trait Io: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Io for T {}

struct Conn {
    io: Box<dyn Io>,
    reader: PacketReader<ResponseHeader>,
}

struct TlsState {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// An XML-RPC client over HTTP or HTTPS.
pub struct Client {
    addr: HostPort,
    uri: String,
    vhost: String,
    keep_alive: bool,
    timeout: Option<Duration>,
    max_response_size: usize,
    level: VerificationLevel,
    auth: Option<(String, String)>,
    xheaders: XHeaders,
    proxy: Option<HostPort>,
    tls: Option<TlsState>,
    cache: Option<Conn>,
}

impl Client {
    /// A plain-HTTP client for the given address.
    pub fn new(addr: HostPort) -> Client {
        let vhost = addr.host().to_owned();
        Client {
            addr,
            uri: "/RPC2".to_owned(),
            vhost,
            keep_alive: false,
            timeout: None,
            max_response_size: 0,
            level: VerificationLevel::Weak,
            auth: None,
            xheaders: XHeaders::new(),
            proxy: None,
            tls: None,
            cache: None,
        }
    }

    /// An HTTPS client. The dialed hostname doubles as SNI and the
    /// certificate verification name unless
    /// [`set_expected_hostname`](Client::set_expected_hostname) overrides it.
    pub fn new_tls(addr: HostPort, config: Arc<ClientConfig>) -> crate::Result<Client> {
        let server_name =
            ServerName::try_from(addr.host().to_owned()).map_err(Error::new_tls)?;
        let mut client = Client::new(addr);
        client.tls = Some(TlsState {
            connector: TlsConnector::from(config),
            server_name,
        });
        Ok(client)
    }

    pub fn set_uri(&mut self, uri: &str) {
        self.uri = uri.to_owned();
    }

    /// The virtual host sent in the `Host` request field.
    pub fn set_vhost(&mut self, vhost: &str) {
        self.vhost = vhost.to_owned();
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
        if !keep_alive {
            self.cache = None;
        }
    }

    /// Per-call deadline; expiry raises a timeout error and drops any
    /// cached connection.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Caps the cumulative response size; zero means unlimited. Takes
    /// effect immediately, including for a response already in flight.
    pub fn set_max_response_size(&mut self, bytes: usize) {
        self.max_response_size = bytes;
    }

    pub fn set_verification_level(&mut self, level: VerificationLevel) {
        self.level = level;
    }

    pub fn set_authinfo(&mut self, user: &str, password: &str) {
        self.auth = Some((user.to_owned(), password.to_owned()));
    }

    /// X-headers sent with every call.
    pub fn set_xheaders(&mut self, xheaders: XHeaders) {
        self.xheaders = xheaders;
    }

    /// Routes the TLS connection through an HTTP `CONNECT` proxy.
    pub fn set_proxy(&mut self, proxy: HostPort) {
        self.proxy = Some(proxy);
    }

    /// Overrides the hostname used for SNI and certificate verification.
    pub fn set_expected_hostname(&mut self, hostname: &str) -> crate::Result<()> {
        let name = ServerName::try_from(hostname.to_owned()).map_err(Error::new_tls)?;
        match self.tls {
            Some(ref mut tls) => {
                tls.server_name = name;
                Ok(())
            }
            None => Err(Error::new_tls("expected hostname requires a TLS client")),
        }
    }

    /// Performs one call and returns the decoded response (success or
    /// fault; check [`Response::is_fault`]).
    pub async fn execute(&mut self, method: &str, params: Params) -> crate::Result<Response> {
        self.execute_with_xheaders(method, params, &XHeaders::new())
            .await
    }

    /// [`execute`](Client::execute) with extra per-call X-headers.
    pub async fn execute_with_xheaders(
        &mut self,
        method: &str,
        params: Params,
        extra_xheaders: &XHeaders,
    ) -> crate::Result<Response> {
        match self.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.do_execute(method, params, extra_xheaders))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        // the cached connection is mid-response; unusable
                        self.cache = None;
                        Err(Error::new_timeout())
                    }
                }
            }
            None => self.do_execute(method, params, extra_xheaders).await,
        }
    }

    async fn do_execute(
        &mut self,
        method: &str,
        params: Params,
        extra_xheaders: &XHeaders,
    ) -> crate::Result<Response> {
        let request = Request::new(method, params);
        let body = dump_request(&request)?.into_bytes();

        // The cache is taken for the duration of the call and put back only
        // on success: a call that errors out leaves the packet-reader state
        // indeterminate, so the connection must not be reused.
        let (mut conn, from_cache) = match self.cache.take() {
            Some(conn) if self.keep_alive => (conn, true),
            _ => (self.connect().await?, false),
        };

        let response = match self.session(&mut conn, &body, extra_xheaders).await {
            Ok(response) => response,
            Err(e) if from_cache && (e.is_closed() || e.is_io()) => {
                // the server evicted or dropped the idle connection since
                // the last call; retry once on a fresh one
                debug!("cached connection to {} is dead ({}); reconnecting", self.addr, e);
                drop(conn);
                conn = self.connect().await?;
                self.session(&mut conn, &body, extra_xheaders).await?
            }
            Err(e) => return Err(e),
        };

        if self.keep_alive {
            self.cache = Some(conn);
        }
        Ok(response)
    }

    async fn session(
        &self,
        conn: &mut Conn,
        body: &[u8],
        extra_xheaders: &XHeaders,
    ) -> crate::Result<Response> {
        let mut head = RequestHeader::new(&self.uri, &self.vhost, self.addr.port());
        if let Some((ref user, ref password)) = self.auth {
            head.set_authinfo(user, password)?;
        }
        head.header_mut().set_xheaders(&self.xheaders)?;
        head.header_mut().set_xheaders(extra_xheaders)?;

        let mut pkt = Packet::new(head, body.to_vec());
        pkt.set_keep_alive(self.keep_alive);
        write_all_offset(&mut conn.io, &pkt.dump()).await?;
        trace!("request sent to {}", self.addr);

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let packet = loop {
            // re-applied before every feed so limit changes take effect
            // immediately; cumulative size is still enforced across feeds
            conn.reader.set_verification_level(self.level);
            conn.reader.set_max_size(self.max_response_size);
            let n = conn.io.read(&mut buf).await.map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_closed());
            }
            if let Some(packet) = conn.reader.feed(&buf[..n])? {
                break packet;
            }
        };

        if packet.head.code() != 200 {
            debug!(
                "error response {} {} from {}",
                packet.head.code(),
                packet.head.phrase(),
                self.addr
            );
            return Err(Error::new_status_msg(
                packet.head.code(),
                packet.head.phrase().to_owned(),
            ));
        }

        let text = std::str::from_utf8(&packet.body)
            .map_err(|_| Error::new_xml("response payload is not valid UTF-8"))?;
        parse_response(text)
    }

    async fn connect(&self) -> crate::Result<Conn> {
        let dial = self.proxy.as_ref().unwrap_or(&self.addr);
        let sa = dial.resolve()?;
        let stream = TcpStream::connect(sa).await.map_err(Error::new_connect)?;
        let _ = stream.set_nodelay(true);

        match self.tls {
            None => Ok(Conn {
                io: Box::new(stream),
                reader: PacketReader::new(),
            }),
            Some(ref tls) => {
                let mut stream = stream;
                if self.proxy.is_some() {
                    self.setup_tunnel(&mut stream).await?;
                }
                let tls_stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(Error::new_tls)?;
                Ok(Conn {
                    io: Box::new(tls_stream),
                    reader: PacketReader::new(),
                })
            }
        }
    }

    // Writes `CONNECT host:port HTTP/1.0` and validates the header-only 200
    // before the TLS handshake runs over the established stream.
    async fn setup_tunnel(&self, stream: &mut TcpStream) -> crate::Result<()> {
        let connect = format!(
            "CONNECT {}:{} HTTP/1.0\r\n\r\n",
            self.addr.host(),
            self.addr.port()
        );
        write_all_offset(stream, connect.as_bytes()).await?;

        let mut reader: PacketReader<ResponseHeader> = PacketReader::new();
        let mut buf = vec![0u8; 8192];
        let packet = loop {
            let n = stream.read(&mut buf).await.map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_closed());
            }
            if let Some(packet) = reader.feed_header_only(&buf[..n])? {
                break packet;
            }
        };
        if packet.head.code() != 200 {
            return Err(Error::new_status_msg(
                packet.head.code(),
                packet.head.phrase().to_owned(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("uri", &self.uri)
            .field("keep_alive", &self.keep_alive)
            .field("tls", &self.tls.is_some())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}
