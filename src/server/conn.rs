//! Per-connection handling: the read/process/respond state machine driven
//! from an owned task, idle-state accounting, and the mapping of errors to
//! HTTP error responses or XML-RPC faults.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::common::io::write_all_offset;
use crate::error::{Error, Kind};
use crate::http::header::{Head, Packet, RequestHeader, ResponseHeader};
use crate::http::reader::PacketReader;
use crate::http::standard_phrase;
use crate::net::HostPort;
use crate::proto::{dump_response, parse_request, Fault, Response};

use super::dispatch::MethodContext;
use super::Shared;

const READ_BUF_SIZE: usize = 65536;

// "the server sends the interim response" — exact bytes, HTTP/1.1 100
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100\r\n\r\n";

#[derive(Default)]
struct IdleState {
    waiting: bool,
    since: Option<Instant>,
}

/// Shared per-connection state: peer identity, the idle flag the sweeper
/// races against, and the kill signal.
pub(crate) struct ConnState {
    peer: HostPort,
    idle: Mutex<IdleState>,
    kill: Notify,
}

impl ConnState {
    pub(crate) fn new(peer: HostPort) -> ConnState {
        ConnState {
            peer,
            idle: Mutex::new(IdleState::default()),
            kill: Notify::new(),
        }
    }

    pub(crate) fn peer(&self) -> &HostPort {
        &self.peer
    }

    fn start_idle(&self) {
        let mut idle = self.idle.lock().expect("idle lock");
        idle.waiting = true;
        idle.since = Some(Instant::now());
    }

    // Consumes the idle state on data arrival; false means an eviction
    // sweep claimed the connection first.
    fn try_begin_processing(&self) -> bool {
        let mut idle = self.idle.lock().expect("idle lock");
        if !idle.waiting {
            return false;
        }
        idle.waiting = false;
        idle.since = None;
        true
    }

    pub(crate) fn is_idle_expired(&self, timeout: Duration) -> bool {
        let idle = self.idle.lock().expect("idle lock");
        match (idle.waiting, idle.since) {
            (true, Some(since)) => since.elapsed() > timeout,
            _ => false,
        }
    }

    /// Atomically consumes the idle state; true means the caller won the
    /// race against concurrently arriving bytes and must terminate the
    /// connection.
    pub(crate) fn try_claim_for_termination(&self) -> bool {
        let mut idle = self.idle.lock().expect("idle lock");
        if !idle.waiting {
            return false;
        }
        idle.waiting = false;
        idle.since = None;
        true
    }

    pub(crate) fn kill(&self) {
        self.kill.notify_one();
    }
}

/// Serves one connection until close, eviction or server shutdown. The
/// terminate path always runs the stream's shutdown so TLS connections
/// send a close-notify.
pub(crate) async fn serve<I>(
    mut io: I,
    peer: HostPort,
    shared: Arc<Shared>,
    state: Arc<ConnState>,
    mut exit_rx: watch::Receiver<()>,
) -> crate::Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader: PacketReader<RequestHeader> = PacketReader::new();
    reader.set_header_max(shared.max_header_size);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let packet = loop {
            // re-applied before each feed so cap changes are live
            reader.set_verification_level(shared.level);
            reader.set_max_size(shared.max_request_size);

            state.start_idle();
            let n = tokio::select! {
                read = io.read(&mut buf) => read.map_err(Error::new_io)?,
                _ = state.kill.notified() => {
                    trace!("connection to {} evicted", peer);
                    let _ = io.shutdown().await;
                    return Ok(());
                }
                _ = exit_rx.changed() => {
                    if shared.is_exiting() {
                        let _ = io.shutdown().await;
                        return Ok(());
                    }
                    // plain interrupt; go back to waiting
                    continue;
                }
            };
            if !state.try_begin_processing() {
                // lost the race against the eviction sweep
                let _ = io.shutdown().await;
                return Ok(());
            }
            if n == 0 {
                trace!("connection to {} closed by peer", peer);
                return Ok(());
            }

            match reader.feed(&buf[..n]) {
                Ok(Some(packet)) => break packet,
                Ok(None) => {
                    if reader.expect_continue() {
                        write_all_offset(&mut io, CONTINUE_RESPONSE).await?;
                        reader.set_continue_sent();
                    }
                }
                Err(e) => {
                    debug!("bad request from {}: {}", peer, e);
                    if let Some(bytes) = http_error_bytes(&e) {
                        let _ = write_all_offset(&mut io, &bytes).await;
                    }
                    let _ = io.shutdown().await;
                    return Err(e);
                }
            }
        };

        let keep_alive = packet.head.header().keep_alive();
        let response = match process_request(&shared, &peer, packet, keep_alive).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("request from {} rejected: {}", peer, e);
                match http_error_bytes(&e) {
                    Some(bytes) => {
                        let _ = write_all_offset(&mut io, &bytes).await;
                    }
                    None => {}
                }
                let _ = io.shutdown().await;
                return Err(e);
            }
        };

        write_all_offset(&mut io, &response).await?;

        if !keep_alive {
            let _ = io.shutdown().await;
            return Ok(());
        }
    }
}

// Auth, decode, dispatch, execute, serialize. HTTP-level rejections come
// back as errors; everything else becomes a fault response with HTTP 200.
async fn process_request(
    shared: &Arc<Shared>,
    peer: &HostPort,
    packet: Packet<RequestHeader>,
    keep_alive: bool,
) -> crate::Result<Vec<u8>> {
    let authname = authenticate(shared, &packet.head)?;

    let response = match run_call(shared, peer, &packet, authname).await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_some() {
                return Err(e);
            }
            debug!("call from {} failed: {}", peer, e);
            Response::from_fault(Fault::new(e.fault_code(), e.to_string()))
        }
    };

    let xml = match dump_response(&response) {
        Ok(xml) => xml,
        Err(e) => {
            // a result that cannot be serialized degrades to a build fault
            let fault = Response::from_fault(Fault::new(e.fault_code(), e.to_string()));
            dump_response(&fault).expect("fault responses always serialize")
        }
    };

    let mut pkt = Packet::new(ResponseHeader::new(200, "OK"), xml.into_bytes());
    pkt.set_keep_alive(keep_alive);
    Ok(pkt.dump())
}

fn authenticate(shared: &Shared, head: &RequestHeader) -> crate::Result<Option<String>> {
    let plugin = match shared.auth {
        Some(ref plugin) => plugin,
        None => return Ok(None),
    };
    if !head.has_authinfo() {
        if !plugin.authenticate_anonymous() {
            return Err(Error::new_status(401));
        }
        return Ok(None);
    }
    let (user, password) = head.authinfo()?;
    if !plugin.authenticate(&user, &password) {
        return Err(Error::new_status(401));
    }
    Ok(Some(user))
}

async fn run_call(
    shared: &Arc<Shared>,
    peer: &HostPort,
    packet: &Packet<RequestHeader>,
    authname: Option<String>,
) -> crate::Result<Response> {
    let text = std::str::from_utf8(&packet.body)
        .map_err(|_| Error::new_xml("payload is not valid UTF-8"))?;
    let request = parse_request(text)?;
    let (name, params) = request.into_parts();

    let method = shared.dispatch.create_method(&name)?;
    let ctx = MethodContext::new(
        name,
        peer.clone(),
        authname,
        packet.head.header().xheaders(),
        shared.handle(),
    );

    shared
        .executor
        .execute(method, shared.interceptors.clone(), ctx, params)
        .await
}

// An HTTP-level error becomes a header-only response; anything without a
// status code closes the connection silently.
fn http_error_bytes(err: &Error) -> Option<Vec<u8>> {
    let code = err.status()?;
    let phrase = match *err.kind() {
        Kind::Status(_) => match std::error::Error::source(err) {
            Some(cause) => cause.to_string(),
            None => standard_phrase(code).to_owned(),
        },
        _ => standard_phrase(code).to_owned(),
    };

    let mut head = ResponseHeader::new(code, &phrase);
    match code {
        401 => {
            let _ = head.header_mut().set("www-authenticate", "Basic realm=\"\"");
        }
        405 => {
            let _ = head.header_mut().set("allowed", "POST");
        }
        _ => {}
    }
    let mut pkt = Packet::new(head, Vec::new());
    pkt.set_keep_alive(false);
    Some(pkt.dump())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_claim_race_is_exclusive() {
        let state = ConnState::new(HostPort::new("127.0.0.1", 1).unwrap());
        // not idle yet: nothing to claim
        assert!(!state.try_claim_for_termination());

        state.start_idle();
        assert!(state.try_claim_for_termination());
        // the connection's own attempt now loses
        assert!(!state.try_begin_processing());

        state.start_idle();
        assert!(state.try_begin_processing());
        assert!(!state.try_claim_for_termination());
    }

    #[test]
    fn idle_expiry_needs_waiting_state() {
        let state = ConnState::new(HostPort::new("127.0.0.1", 1).unwrap());
        assert!(!state.is_idle_expired(Duration::ZERO));
        state.start_idle();
        std::thread::sleep(Duration::from_millis(5));
        assert!(state.is_idle_expired(Duration::ZERO));
        assert!(!state.is_idle_expired(Duration::from_secs(60)));
    }

    #[test]
    fn error_responses_carry_required_fields() {
        let bytes = http_error_bytes(&Error::new_status(401)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("www-authenticate: Basic realm=\"\"\r\n"));
        assert!(text.contains("connection: close\r\n"));

        let bytes = http_error_bytes(&Error::new_status(405)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("allowed: POST\r\n"));

        assert!(http_error_bytes(&Error::new_timeout()).is_none());
    }
}
