//! Network primitives: address values, socket configuration, admission
//! control.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::trace;

pub mod addr;
pub mod firewall;

pub use self::addr::HostPort;
pub use self::firewall::{Firewall, RateLimitFirewall};

// RPC traffic is small request/response pairs, so Nagle only adds latency.
pub(crate) fn configure_stream(stream: &TcpStream, keepalive: Option<Duration>) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!("set_nodelay failed: {}", e);
    }
    if let Some(time) = keepalive {
        let ka = TcpKeepalive::new().with_time(time);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
            trace!("set_tcp_keepalive failed: {}", e);
        }
    }
}

/// Best-effort abortive close: zero-timeout linger after the final send, so
/// a rejected peer can receive a short reason without the server waiting
/// for FIN-ACK.
pub(crate) fn send_shutdown(stream: TcpStream, message: &[u8]) {
    let _ = stream.set_linger(Some(Duration::ZERO));
    if !message.is_empty() {
        let _ = stream.try_write(message);
    }
    drop(stream);
}
