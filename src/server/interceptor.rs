//! Interceptors: decorators chained around a method.

use std::sync::Arc;

use crate::proto::{Fault, Params};
use crate::value::Value;

use super::dispatch::{Method, MethodContext};

/// A decorator around a [`Method`]. `process` may observe or rewrite the
/// parameters and result, and calls [`MethodCall::proceed`] to run the rest
/// of the chain. By contract it must not proceed twice.
pub trait Interceptor: Send + Sync + 'static {
    fn process(
        &self,
        call: &mut MethodCall<'_>,
        ctx: &MethodContext,
        params: &Params,
    ) -> Result<Value, Fault>;
}

/// The remainder of an interceptor chain, ending at the method itself.
pub struct MethodCall<'a> {
    method: &'a mut dyn Method,
    rest: &'a [Arc<dyn Interceptor>],
}

impl MethodCall<'_> {
    /// Runs the next interceptor, or the method when the chain is exhausted.
    pub fn proceed(&mut self, ctx: &MethodContext, params: &Params) -> Result<Value, Fault> {
        match self.rest.split_first() {
            Some((next, others)) => next.process(
                &mut MethodCall {
                    method: &mut *self.method,
                    rest: others,
                },
                ctx,
                params,
            ),
            None => self.method.execute(ctx, params),
        }
    }
}

/// Runs `method` through `chain`, outermost interceptor first.
pub(crate) fn run_chain(
    chain: &[Arc<dyn Interceptor>],
    method: &mut dyn Method,
    ctx: &MethodContext,
    params: &Params,
) -> Result<Value, Fault> {
    match chain.split_first() {
        Some((outer, rest)) => outer.process(&mut MethodCall { method, rest }, ctx, params),
        None => method.execute(ctx, params),
    }
}
