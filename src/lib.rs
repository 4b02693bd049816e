//! # xylo
//!
//! An embeddable XML-RPC runtime providing both client and server roles
//! over HTTP and HTTPS.
//!
//! A [`Server`] binds a port, registers methods, and dispatches decoded
//! calls; a [`Client`] dials a server, serializes a call, and returns a
//! typed [`Response`] or fault. The implementation is written for hostile
//! input and heavy concurrency: every size derived from the network goes
//! through checked arithmetic, the XML codec is hardened against depth- and
//! count-based denial of service, and admission control, authentication and
//! idle eviction are built in.
//!
//! ## Example
//!
//! ```no_run
//! use xylo::{Client, HostPort, Server, Value};
//!
//! # async fn run() -> xylo::Result<()> {
//! let mut server = Server::bind(&HostPort::local(0))?;
//! server.register_fn("echo", |_ctx, params| {
//!     Ok(params.first().cloned().unwrap_or(Value::Nil))
//! });
//! let addr = server.local_addr()?;
//! tokio::spawn(server.serve());
//!
//! let mut client = Client::new(HostPort::new(addr.ip().to_string(), addr.port())?);
//! let response = client.execute("echo", vec![Value::from("hi")]).await?;
//! assert_eq!(response.value().and_then(Value::as_str), Some("hi"));
//! # Ok(())
//! # }
//! ```

pub use crate::error::{Error, Result};

mod common;
mod error;
mod xml;

pub mod client;
pub mod http;
pub mod net;
pub mod proto;
pub mod server;
pub mod tls;
pub mod value;

pub use crate::client::Client;
pub use crate::http::{VerificationLevel, XHeaders};
pub use crate::net::{Firewall, HostPort, RateLimitFirewall};
pub use crate::proto::{Fault, Params, Request, Response};
pub use crate::server::{
    AuthPlugin, ExecutorConfig, Interceptor, Method, MethodContext, Server, ServerHandle,
};
pub use crate::value::{Binary, DateTime, Struct, Value};
