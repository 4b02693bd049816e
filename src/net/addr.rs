//! Immutable host+port address value with lazy, serialized DNS resolution.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use crate::error::Error;

// Serializes lookups: legacy resolver stacks have shared state that is not
// reliably safe under concurrent queries.
fn dns_mutex() -> &'static Mutex<()> {
    static DNS_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    DNS_MUTEX.get_or_init(|| Mutex::new(()))
}

/// A host and port. Resolution to a socket address happens lazily on first
/// use; clones share the resolution cell.
#[derive(Clone)]
pub struct HostPort {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    resolved: OnceLock<Option<SocketAddr>>,
}

impl HostPort {
    /// Builds an address from a hostname (or literal IP) and port.
    ///
    /// Hostnames containing CR or LF are rejected: they would otherwise flow
    /// into HTTP `Host` headers.
    pub fn new(host: impl Into<String>, port: u16) -> crate::Result<HostPort> {
        let host = host.into();
        if host.contains(['\r', '\n']) {
            return Err(Error::new_addr().with("hostname must not contain CR LF characters"));
        }
        Ok(HostPort {
            inner: Arc::new(Inner {
                host,
                port,
                resolved: OnceLock::new(),
            }),
        })
    }

    /// An address binding every local interface on `port`.
    pub fn local(port: u16) -> HostPort {
        let mut addr =
            HostPort::new("0.0.0.0", port).expect("static hostname is valid");
        let sa = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        Arc::get_mut(&mut addr.inner)
            .expect("freshly created")
            .resolved = OnceLock::from(Some(sa));
        addr
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// The resolved socket address, querying DNS on first call. IPv4
    /// addresses are preferred, matching the wire format the server binds.
    pub fn resolve(&self) -> crate::Result<SocketAddr> {
        let cell = self.inner.resolved.get_or_init(|| {
            let _serialize = dns_mutex().lock().expect("dns lock");
            let mut fallback = None;
            let addrs = match (self.inner.host.as_str(), self.inner.port).to_socket_addrs() {
                Ok(addrs) => addrs,
                Err(_) => return None,
            };
            for addr in addrs {
                match addr {
                    SocketAddr::V4(_) => return Some(addr),
                    SocketAddr::V6(_) => fallback = fallback.or(Some(addr)),
                }
            }
            fallback
        });
        cell.ok_or_else(|| {
            Error::new_addr().with(format!("failed to resolve '{}'", self.inner.host))
        })
    }
}

impl From<SocketAddr> for HostPort {
    fn from(sa: SocketAddr) -> HostPort {
        HostPort {
            inner: Arc::new(Inner {
                host: sa.ip().to_string(),
                port: sa.port(),
                resolved: OnceLock::from(Some(sa)),
            }),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inner.host, self.inner.port)
    }
}

impl fmt::Debug for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostPort")
            .field(&self.inner.host)
            .field(&self.inner.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_in_hostname_is_rejected() {
        assert!(HostPort::new("example.com", 80).is_ok());
        assert!(HostPort::new("evil.com\r\nHost: injected", 80).is_err());
        assert!(HostPort::new("evil.com\n", 80).is_err());
    }

    #[test]
    fn literal_addresses_resolve_without_dns() {
        let hp = HostPort::new("127.0.0.1", 8080).unwrap();
        assert_eq!(hp.resolve().unwrap(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn local_binds_any() {
        let hp = HostPort::local(9999);
        assert_eq!(hp.host(), "0.0.0.0");
        assert_eq!(hp.resolve().unwrap(), "0.0.0.0:9999".parse().unwrap());
    }

    #[test]
    fn clones_share_the_resolution_cell() {
        let a = HostPort::new("localhost", 1234).unwrap();
        let b = a.clone();
        let ra = a.resolve().unwrap();
        assert_eq!(b.resolve().unwrap(), ra);
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn from_socket_addr_round_trips() {
        let sa: SocketAddr = "192.0.2.7:1900".parse().unwrap();
        let hp = HostPort::from(sa);
        assert_eq!(hp.host(), "192.0.2.7");
        assert_eq!(hp.port(), 1900);
        assert_eq!(hp.resolve().unwrap(), sa);
    }
}
