//! The XML-RPC server role.
//!
//! A [`Server`] binds a listener, registers methods, and serves connections
//! until told to exit. Each accepted connection runs as an owned task; the
//! serve loop multiplexes accepts, idle-eviction sweeps and the interrupter.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::error::Error;
use crate::http::VerificationLevel;
use crate::net::{self, Firewall, HostPort};
use crate::proto::{Fault, Params};
use crate::value::Value;

mod auth;
mod conn;
mod dispatch;
mod executor;
mod interceptor;

pub use self::auth::{constant_time_eq, AuthPlugin};
pub use self::dispatch::{Dispatcher, Method, MethodContext, MethodFactory};
pub use self::executor::ExecutorConfig;
pub use self::interceptor::{Interceptor, MethodCall};

use self::conn::ConnState;
use self::dispatch::{DispatcherManager, FnMethodFactory};
use self::executor::Executor;

const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

pub(crate) struct ConnRegistry {
    map: Mutex<HashMap<u64, Arc<ConnState>>>,
    next_id: AtomicU64,
}

impl ConnRegistry {
    fn new() -> ConnRegistry {
        ConnRegistry {
            map: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, state: Arc<ConnState>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map.lock().expect("connections lock").insert(id, state);
        id
    }

    fn unregister(&self, id: u64, peer: &HostPort, firewall: Option<&dyn Firewall>) {
        if let Some(fw) = firewall {
            fw.release(peer);
        }
        self.map.lock().expect("connections lock").remove(&id);
    }

    fn count(&self) -> usize {
        self.map.lock().expect("connections lock").len()
    }

    // Snapshot under the lock, terminate outside it.
    fn collect_expired(&self, timeout: Duration) -> Vec<Arc<ConnState>> {
        self.map
            .lock()
            .expect("connections lock")
            .values()
            .filter(|c| c.is_idle_expired(timeout))
            .cloned()
            .collect()
    }
}

pub(crate) struct Shared {
    pub(crate) dispatch: DispatcherManager,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) auth: Option<Arc<dyn AuthPlugin>>,
    pub(crate) firewall: Option<Arc<dyn Firewall>>,
    pub(crate) executor: Executor,
    pub(crate) level: VerificationLevel,
    pub(crate) max_request_size: usize,
    pub(crate) max_header_size: usize,
    idle_timeout: Option<Duration>,
    keepalive: Option<Duration>,
    exit: Arc<AtomicBool>,
    wake: Arc<watch::Sender<()>>,
    conns: Arc<ConnRegistry>,
}

impl Shared {
    pub(crate) fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    pub(crate) fn handle(&self) -> ServerHandle {
        ServerHandle {
            exit: self.exit.clone(),
            wake: self.wake.clone(),
            conns: self.conns.clone(),
        }
    }
}

/// A cloneable handle onto a running (or about-to-run) server, safe to use
/// from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    exit: Arc<AtomicBool>,
    wake: Arc<watch::Sender<()>>,
    conns: Arc<ConnRegistry>,
}

impl ServerHandle {
    /// Requests shutdown: the work loop observes the flag on its next wake
    /// and exits after the in-flight dispatch returns.
    pub fn set_exit_flag(&self) {
        self.exit.store(true, Ordering::Relaxed);
        self.interrupt();
    }

    /// Wakes a blocked serve loop without requesting exit.
    pub fn interrupt(&self) {
        let _ = self.wake.send(());
    }

    /// The number of live connections in the server's connection set.
    pub fn connection_count(&self) -> usize {
        self.conns.count()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("connections", &self.conns.count())
            .finish()
    }
}

/// An XML-RPC server: listener, dispatcher, execution policy and the
/// hardening knobs around them.
pub struct Server {
    listener: std::net::TcpListener,
    dispatch: DispatcherManager,
    interceptors: Vec<Arc<dyn Interceptor>>,
    auth: Option<Arc<dyn AuthPlugin>>,
    firewall: Option<Arc<dyn Firewall>>,
    executor: ExecutorConfig,
    tls: Option<Arc<ServerConfig>>,
    level: VerificationLevel,
    max_request_size: usize,
    max_header_size: usize,
    idle_timeout: Option<Duration>,
    keepalive: Option<Duration>,
    exit: Arc<AtomicBool>,
    wake: Arc<watch::Sender<()>>,
    conns: Arc<ConnRegistry>,
}

impl Server {
    /// Binds the listening socket eagerly; `SO_REUSEADDR` is best-effort.
    pub fn bind(addr: &HostPort) -> crate::Result<Server> {
        let sa = addr.resolve()?;
        let socket = Socket::new(Domain::for_address(sa), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::new_listen)?;
        let _ = socket.set_reuse_address(true);
        socket.bind(&sa.into()).map_err(Error::new_listen)?;
        socket.listen(1024).map_err(Error::new_listen)?;
        let listener: std::net::TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(Error::new_listen)?;

        let (wake, _) = watch::channel(());
        Ok(Server {
            listener,
            dispatch: DispatcherManager::new(),
            interceptors: Vec::new(),
            auth: None,
            firewall: None,
            executor: ExecutorConfig::Serial,
            tls: None,
            level: VerificationLevel::Weak,
            max_request_size: 0,
            max_header_size: crate::http::reader::DEFAULT_HEADER_MAX,
            idle_timeout: None,
            keepalive: None,
            exit: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(wake),
            conns: Arc::new(ConnRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::new_listen)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            exit: self.exit.clone(),
            wake: self.wake.clone(),
            conns: self.conns.clone(),
        }
    }

    /// Registers a method backed by a factory; re-registration replaces.
    pub fn register_method(&mut self, name: &str, factory: impl MethodFactory) {
        self.dispatch.register_method(name, Box::new(factory));
    }

    /// Registers a method backed by a closure.
    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&MethodContext, &Params) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        self.dispatch
            .register_method(name, Box::new(FnMethodFactory(Arc::new(f))));
    }

    /// Appends a dispatcher consulted after the built-in one.
    pub fn push_dispatcher(&mut self, dispatcher: impl Dispatcher) {
        self.dispatch.push_dispatcher(Box::new(dispatcher));
    }

    /// Registers `system.listMethods`.
    pub fn enable_introspection(&mut self) {
        self.dispatch.enable_introspection();
    }

    /// Chains an interceptor around every method; the newest is outermost.
    pub fn push_interceptor(&mut self, interceptor: impl Interceptor) {
        self.interceptors.insert(0, Arc::new(interceptor));
    }

    pub fn set_auth_plugin(&mut self, plugin: impl AuthPlugin) {
        self.auth = Some(Arc::new(plugin));
    }

    pub fn set_firewall(&mut self, firewall: impl Firewall) {
        self.firewall = Some(Arc::new(firewall));
    }

    pub fn set_executor(&mut self, executor: ExecutorConfig) {
        self.executor = executor;
    }

    /// Serves TLS with the given configuration instead of plain TCP.
    pub fn set_tls(&mut self, config: Arc<ServerConfig>) {
        self.tls = Some(config);
    }

    /// Caps the cumulative size of one request; zero means unlimited.
    pub fn set_max_request_size(&mut self, bytes: usize) {
        self.max_request_size = bytes;
    }

    /// Caps the size of a request head alone; defaults to 16 KiB.
    pub fn set_max_header_size(&mut self, bytes: usize) {
        self.max_header_size = bytes;
    }

    pub fn set_verification_level(&mut self, level: VerificationLevel) {
        self.level = level;
    }

    /// Evicts connections idle longer than `timeout`; zero disables.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
    }

    pub fn set_tcp_keepalive(&mut self, time: Option<Duration>) {
        self.keepalive = time;
    }

    /// Runs the server until [`ServerHandle::set_exit_flag`] is observed.
    /// In-flight pool executors are drained on the way out.
    pub async fn serve(self) -> crate::Result<()> {
        let listener = TcpListener::from_std(self.listener).map_err(Error::new_listen)?;
        let shared = Arc::new(Shared {
            dispatch: self.dispatch,
            interceptors: self.interceptors,
            auth: self.auth,
            firewall: self.firewall,
            executor: Executor::new(self.executor),
            level: self.level,
            max_request_size: self.max_request_size,
            max_header_size: self.max_header_size,
            idle_timeout: self.idle_timeout,
            keepalive: self.keepalive,
            exit: self.exit,
            wake: self.wake,
            conns: self.conns,
        });
        let tls = self.tls.map(TlsAcceptor::from);

        let mut wake_rx = shared.wake.subscribe();
        // the sweep wakes at least once a second; short idle timeouts get a
        // proportionally shorter period so eviction stays timely
        let sweep_period = match shared.idle_timeout {
            Some(t) => t
                .min(Duration::from_secs(1))
                .max(Duration::from_millis(10)),
            None => Duration::from_secs(1),
        };
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!("serving on {}", listener.local_addr().map_err(Error::new_listen)?);

        loop {
            if shared.is_exiting() {
                break;
            }
            tokio::select! {
                _ = wake_rx.changed() => {}
                _ = sweep.tick() => {
                    if let Some(timeout) = shared.idle_timeout {
                        check_idle_timeouts(&shared, timeout);
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => accept_connection(&shared, &tls, stream, peer),
                        Err(e) => debug!("{}", Error::new_accept(e)),
                    }
                }
            }
        }

        drop(listener);
        if let Executor::Pool(ref pool) = shared.executor {
            pool.drain(DRAIN_DEADLINE).await;
            pool.shutdown_and_join();
        }
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener.local_addr().ok())
            .field("executor", &self.executor)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn accept_connection(
    shared: &Arc<Shared>,
    tls: &Option<TlsAcceptor>,
    stream: tokio::net::TcpStream,
    peer_sa: SocketAddr,
) {
    let peer = HostPort::from(peer_sa);

    if let Some(ref fw) = shared.firewall {
        if !fw.grant(&peer) {
            debug!("firewall rejected {}", peer);
            net::send_shutdown(stream, fw.reject_message());
            return;
        }
    }
    net::configure_stream(&stream, shared.keepalive);

    let state = Arc::new(ConnState::new(peer.clone()));
    let id = shared.conns.register(state.clone());
    let shared = shared.clone();
    let tls = tls.clone();
    let exit_rx = shared.wake.subscribe();

    tokio::spawn(async move {
        let result = match tls {
            None => conn::serve(stream, peer.clone(), shared.clone(), state, exit_rx).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    conn::serve(tls_stream, peer.clone(), shared.clone(), state, exit_rx).await
                }
                Err(e) => Err(Error::new_tls(e)),
            },
        };
        // server connections catch everything: log and drop only this peer
        if let Err(e) = result {
            debug!("connection from {} terminated: {}", peer, e);
        }
        shared
            .conns
            .unregister(id, &peer, shared.firewall.as_deref());
    });
}

fn check_idle_timeouts(shared: &Arc<Shared>, timeout: Duration) {
    for conn in shared.conns.collect_expired(timeout) {
        if conn.try_claim_for_termination() {
            warn!("connection idle timeout expired for {}", conn.peer());
            conn.kill();
        }
    }
}
