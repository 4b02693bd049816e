//! Method registration, lookup and introspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Error;
use crate::http::XHeaders;
use crate::net::HostPort;
use crate::proto::{Fault, Params, MAX_METHOD_NAME_LEN};
use crate::value::Value;

use super::ServerHandle;

/// Per-call context handed to every method: decoded call metadata plus a
/// feedback handle to the owning server.
pub struct MethodContext {
    name: String,
    peer: HostPort,
    authname: Option<String>,
    xheaders: XHeaders,
    server: ServerHandle,
}

impl MethodContext {
    pub(crate) fn new(
        name: String,
        peer: HostPort,
        authname: Option<String>,
        xheaders: XHeaders,
        server: ServerHandle,
    ) -> MethodContext {
        MethodContext {
            name,
            peer,
            authname,
            xheaders,
            server,
        }
    }

    pub fn method_name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &HostPort {
        &self.peer
    }

    /// The authenticated user, when an auth plugin admitted credentials.
    pub fn authname(&self) -> Option<&str> {
        self.authname.as_deref()
    }

    pub fn xheaders(&self) -> &XHeaders {
        &self.xheaders
    }

    /// Feedback to the owning server; lets a method request shutdown.
    pub fn server(&self) -> &ServerHandle {
        &self.server
    }
}

/// A server-side method. One instance is created per call.
pub trait Method: Send {
    fn execute(&mut self, ctx: &MethodContext, params: &Params) -> Result<Value, Fault>;
}

impl std::fmt::Debug for dyn Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Method")
    }
}

/// Creates a fresh [`Method`] per decoded call.
pub trait MethodFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Method>;
}

/// A source of methods consulted by the dispatcher manager, in registration
/// order, after the default dispatcher.
pub trait Dispatcher: Send + Sync + 'static {
    /// Returns a method for `name`, or `None` if this dispatcher does not
    /// know it.
    fn create_method(&self, name: &str) -> Option<Box<dyn Method>>;

    /// Appends every method name this dispatcher serves.
    fn append_methods_list(&self, out: &mut Vec<String>);
}

struct FnMethod<F>(Arc<F>);

impl<F> Method for FnMethod<F>
where
    F: Fn(&MethodContext, &Params) -> Result<Value, Fault> + Send + Sync + 'static,
{
    fn execute(&mut self, ctx: &MethodContext, params: &Params) -> Result<Value, Fault> {
        (self.0)(ctx, params)
    }
}

pub(crate) struct FnMethodFactory<F>(pub(crate) Arc<F>);

impl<F> MethodFactory for FnMethodFactory<F>
where
    F: Fn(&MethodContext, &Params) -> Result<Value, Fault> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn Method> {
        Box::new(FnMethod(self.0.clone()))
    }
}

const INTROSPECTION_METHOD: &str = "system.listMethods";

// Name → factory; re-registration replaces (and drops) the old factory.
#[derive(Default)]
struct DefaultDispatcher {
    factories: BTreeMap<String, Box<dyn MethodFactory>>,
}

pub(crate) struct DispatcherManager {
    default: DefaultDispatcher,
    extra: Vec<Box<dyn Dispatcher>>,
    introspection: bool,
}

impl DispatcherManager {
    pub(crate) fn new() -> DispatcherManager {
        DispatcherManager {
            default: DefaultDispatcher::default(),
            extra: Vec::new(),
            introspection: false,
        }
    }

    pub(crate) fn register_method(&mut self, name: &str, factory: Box<dyn MethodFactory>) {
        self.default.factories.insert(name.to_owned(), factory);
    }

    pub(crate) fn push_dispatcher(&mut self, dispatcher: Box<dyn Dispatcher>) {
        self.extra.push(dispatcher);
    }

    pub(crate) fn enable_introspection(&mut self) {
        self.introspection = true;
    }

    /// Walks the dispatchers in order, returning the first hit. Over-long
    /// names are rejected before any lookup; the parse-time cap is the
    /// primary enforcement and this is defense in depth.
    pub(crate) fn create_method(&self, name: &str) -> crate::Result<Box<dyn Method>> {
        if name.len() > MAX_METHOD_NAME_LEN {
            return Err(Error::new_unknown_method(name));
        }
        if self.introspection && name == INTROSPECTION_METHOD {
            return Ok(Box::new(ListMethods {
                names: self.methods_list(),
            }));
        }
        if let Some(factory) = self.default.factories.get(name) {
            return Ok(factory.create());
        }
        for dispatcher in &self.extra {
            if let Some(method) = dispatcher.create_method(name) {
                return Ok(method);
            }
        }
        Err(Error::new_unknown_method(name))
    }

    pub(crate) fn methods_list(&self) -> Vec<String> {
        let mut out: Vec<String> = self.default.factories.keys().cloned().collect();
        for dispatcher in &self.extra {
            dispatcher.append_methods_list(&mut out);
        }
        if self.introspection {
            out.push(INTROSPECTION_METHOD.to_owned());
        }
        out
    }
}

// system.listMethods: enumerates every dispatcher in order. The name list
// is snapshotted at dispatch time.
struct ListMethods {
    names: Vec<String>,
}

impl Method for ListMethods {
    fn execute(&mut self, _ctx: &MethodContext, params: &Params) -> Result<Value, Fault> {
        if !params.is_empty() {
            let err = Error::new_invalid_params();
            return Err(Fault::new(err.fault_code(), err.to_string()));
        }
        Ok(Value::Array(
            self.names.drain(..).map(Value::String).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDispatcher;

    impl Dispatcher for StaticDispatcher {
        fn create_method(&self, name: &str) -> Option<Box<dyn Method>> {
            if name == "extra.ping" {
                let f = FnMethodFactory(Arc::new(|_: &MethodContext, _: &Params| {
                    Ok(Value::from("pong"))
                }));
                Some(f.create())
            } else {
                None
            }
        }

        fn append_methods_list(&self, out: &mut Vec<String>) {
            out.push("extra.ping".to_owned());
        }
    }

    fn manager_with(names: &[&str]) -> DispatcherManager {
        let mut m = DispatcherManager::new();
        for name in names {
            m.register_method(
                name,
                Box::new(FnMethodFactory(Arc::new(|_: &MethodContext, _: &Params| {
                    Ok(Value::Nil)
                }))),
            );
        }
        m
    }

    #[test]
    fn unknown_method_is_sanitized() {
        let m = manager_with(&["foo"]);
        let err = m.create_method("no такой <method>\r\n").unwrap_err();
        assert_eq!(err.fault_code(), -32601);
        let msg = err.to_string();
        assert!(!msg.contains('<'));
        assert!(!msg.contains('\r'));
    }

    #[test]
    fn over_long_name_is_rejected_before_lookup() {
        let m = manager_with(&["foo"]);
        let long = "a".repeat(257);
        let err = m.create_method(&long).unwrap_err();
        assert_eq!(err.fault_code(), -32601);
        // the echoed name is capped
        assert!(err.to_string().len() < 200);
    }

    #[test]
    fn ordered_dispatch_prefers_default() {
        let mut m = manager_with(&["foo"]);
        m.push_dispatcher(Box::new(StaticDispatcher));
        assert!(m.create_method("foo").is_ok());
        assert!(m.create_method("extra.ping").is_ok());
        assert!(m.create_method("missing").is_err());
    }

    #[test]
    fn introspection_lists_every_dispatcher() {
        let mut m = manager_with(&["foo", "bar"]);
        m.push_dispatcher(Box::new(StaticDispatcher));
        assert!(m.create_method(INTROSPECTION_METHOD).is_err());
        m.enable_introspection();
        assert!(m.create_method(INTROSPECTION_METHOD).is_ok());
        let mut names = m.methods_list();
        names.sort();
        assert_eq!(names, vec!["bar", "extra.ping", "foo", "system.listMethods"]);
    }

    #[test]
    fn re_registration_replaces() {
        let mut m = DispatcherManager::new();
        m.register_method(
            "m",
            Box::new(FnMethodFactory(Arc::new(|_: &MethodContext, _: &Params| {
                Ok(Value::from(1))
            }))),
        );
        m.register_method(
            "m",
            Box::new(FnMethodFactory(Arc::new(|_: &MethodContext, _: &Params| {
                Ok(Value::from(2))
            }))),
        );
        assert_eq!(m.methods_list().len(), 1);
    }
}
