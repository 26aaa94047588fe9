//! Method table (C5): the named-method dispatch surface a worker process
//! advertises, plus the progress-emission channel async handlers use.

use async_trait::async_trait;
use hashbrown::HashSet;
use serde_json::Value;
use std::time::Duration;

use flotilla_core::error::{FlotillaError, ReplyStatus};

/// A single progress item, forwarded to the client on the same connection
/// as the eventual reply (spec §4.5 "Progress notifications").
#[derive(Debug, Clone, serde::Serialize)]
pub struct Progress {
    pub data: Value,
    /// Milliseconds since the request was dispatched, stamped by the
    /// handler at emission time.
    pub time_offset_ms: u64,
}

/// Cooperative cancellation signal observed at a handler's suspension
/// points (spec §5: "the handler sees a cancelled flag at its next
/// suspension point").
#[derive(Clone, Default)]
pub struct CancelToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Everything a handler needs to run: its arguments, a progress sink, and
/// a cancellation token.
pub struct HandlerContext {
    pub args: Value,
    pub progress_tx: flume::Sender<Progress>,
    pub cancel: CancelToken,
    pub dispatched_at: std::time::Instant,
}

impl HandlerContext {
    /// Emit a progress item if the request has not been cancelled.
    ///
    /// Per spec §5 ("Progress events arriving after cancellation are
    /// dropped"), a cancelled request's late progress is silently
    /// discarded rather than erroring.
    pub fn emit_progress(&self, data: Value) {
        if self.cancel.is_cancelled() {
            return;
        }
        let time_offset_ms = self.dispatched_at.elapsed().as_millis() as u64;
        let _ = self.progress_tx.send(Progress { data, time_offset_ms });
    }
}

/// A worker method handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, FlotillaError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, FlotillaError>> + Send,
{
    async fn call(&self, ctx: HandlerContext) -> Result<Value, FlotillaError> {
        (self)(ctx).await
    }
}

/// A method's static declaration (spec §4.5): schemas, lock key-set,
/// async flag, default timeout.
pub struct MethodSpec {
    pub name: String,
    pub lock_keys: HashSet<String>,
    pub is_async: bool,
    pub default_timeout: Option<Duration>,
    pub validate_input: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    pub validate_output: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    /// `Arc`, not `Box`: the worker runtime hands an owning reference to
    /// a spawned task so the invocation can outlive the dispatcher
    /// borrow that resolved it.
    pub handler: std::sync::Arc<dyn Handler>,
}

impl MethodSpec {
    /// Validate `args` against this method's input schema.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyStatus::BadArg`] when validation fails.
    pub fn validate_args(&self, args: &Value) -> Result<(), FlotillaError> {
        if (self.validate_input)(args) {
            Ok(())
        } else {
            Err(FlotillaError::reply(
                ReplyStatus::BadArg,
                format!("{} received arguments that failed input validation", self.name),
            ))
        }
    }

    #[must_use]
    pub fn handler_arc(&self) -> std::sync::Arc<dyn Handler> {
        std::sync::Arc::clone(&self.handler)
    }
}

struct Unimplemented;

#[async_trait]
impl Handler for Unimplemented {
    async fn call(&self, _ctx: HandlerContext) -> Result<Value, FlotillaError> {
        Err(FlotillaError::reply(ReplyStatus::Unimpl, "no such method".into()))
    }
}

/// Fallback handler for a method name the dispatcher somehow resolved a
/// lock-set for but no longer has a live spec for (a worker that
/// unregisters a method while requests are in flight). Not expected to
/// be reached in normal operation.
#[must_use]
pub fn unimplemented_handler() -> std::sync::Arc<dyn Handler> {
    std::sync::Arc::new(Unimplemented)
}

/// The full set of methods one worker process advertises.
#[derive(Default)]
pub struct MethodTable {
    methods: hashbrown::HashMap<String, MethodSpec>,
}

impl MethodTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: MethodSpec) {
        self.methods.insert(spec.name.clone(), spec);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }
}

/// Always-true validator for methods declared with no input/output schema.
#[must_use]
pub fn accept_any(_: &Value) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (HandlerContext, flume::Receiver<Progress>) {
        let (tx, rx) = flume::unbounded();
        let ctx = HandlerContext {
            args: Value::Null,
            progress_tx: tx,
            cancel: CancelToken::new(),
            dispatched_at: std::time::Instant::now(),
        };
        (ctx, rx)
    }

    #[test]
    fn emit_progress_forwards_while_not_cancelled() {
        let (ctx, rx) = ctx();
        ctx.emit_progress(serde_json::json!({"pct": 50}));
        let item = rx.try_recv().unwrap();
        assert_eq!(item.data, serde_json::json!({"pct": 50}));
    }

    #[test]
    fn emit_progress_is_silently_dropped_after_cancel() {
        let (ctx, rx) = ctx();
        ctx.cancel.cancel();
        ctx.emit_progress(serde_json::json!({"pct": 50}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn validate_args_rejects_with_badarg() {
        let spec = MethodSpec {
            name: "needsStr".into(),
            lock_keys: Default::default(),
            is_async: false,
            default_timeout: None,
            validate_input: Box::new(|v: &Value| v.get("str").is_some_and(Value::is_string)),
            validate_output: Box::new(accept_any),
            handler: unimplemented_handler(),
        };
        let err = spec.validate_args(&Value::Null).unwrap_err();
        assert_eq!(err.reply_status(), Some(ReplyStatus::BadArg));
        assert!(spec.validate_args(&serde_json::json!({"str": "x"})).is_ok());
    }
}
