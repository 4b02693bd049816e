#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use xylo::{Client, HostPort, Server, ServerHandle, Value};

/// Honors `RUST_LOG` for debugging test runs.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn register_echo(server: &mut Server) {
    server.register_fn("echo", |_ctx, params| {
        Ok(params.first().cloned().unwrap_or(Value::Nil))
    });
}

/// Binds a server on an ephemeral loopback port, applies `configure`, and
/// serves it on a background task.
pub fn spawn<F>(configure: F) -> (SocketAddr, ServerHandle, JoinHandle<xylo::Result<()>>)
where
    F: FnOnce(&mut Server),
{
    init_tracing();
    let mut server = Server::bind(&HostPort::new("127.0.0.1", 0).unwrap()).unwrap();
    configure(&mut server);
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let join = tokio::spawn(server.serve());
    (addr, handle, join)
}

pub fn client(addr: SocketAddr) -> Client {
    Client::new(HostPort::new("127.0.0.1", addr.port()).unwrap())
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
