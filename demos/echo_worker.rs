//! Sample worker process exercising every corner of the worker runtime:
//! a synchronous echo, an async echo with timeout/cancellation, a trio of
//! key-set-locked echoes that share one mutable buffer, and an async echo
//! that emits progress notifications.
//!
//! Run with the broker already listening: `flotilla-broker &` then this
//! binary, which registers itself as the `echo` worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use flotilla_core::error::{FlotillaError, ReplyStatus};
use flotilla::worker_runtime::methods::{HandlerContext, MethodSpec, MethodTable};

fn take_str(args: &Value) -> Result<String, FlotillaError> {
    args.get("str")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FlotillaError::reply(ReplyStatus::BadArg, "`str` must be a string".into()))
}

fn take_delay_ms(args: &Value) -> u64 {
    args.get("delay").and_then(Value::as_u64).unwrap_or(0)
}

fn validate_echo_args(args: &Value) -> bool {
    args.get("str").is_some_and(Value::is_string)
}

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    flotilla::config::init_tracing();
    let config = flotilla::config::Config::from_env()?;

    let addr = match &config.broker_tcp {
        flotilla_core::endpoint::Endpoint::Tcp(addr) => *addr,
        #[allow(unreachable_patterns)]
        _ => unreachable!("broker_tcp is always constructed as Endpoint::Tcp"),
    };

    let methods = build_methods();
    let stream = compio::net::TcpStream::connect(addr).await?;
    flotilla::worker_runtime::run_worker(stream, "echo", methods, true).await;
    Ok(())
}

fn build_methods() -> MethodTable {
    let mut table = MethodTable::new();

    table.register(MethodSpec {
        name: "echoSync".into(),
        lock_keys: Default::default(),
        is_async: false,
        default_timeout: None,
        validate_input: Box::new(validate_echo_args),
        validate_output: Box::new(|_| true),
        handler: Arc::new(|ctx: HandlerContext| async move {
            let text = take_str(&ctx.args)?;
            Ok(Value::String(text))
        }),
    });

    table.register(MethodSpec {
        name: "echoAsync".into(),
        lock_keys: Default::default(),
        is_async: true,
        default_timeout: None,
        validate_input: Box::new(validate_echo_args),
        validate_output: Box::new(|_| true),
        handler: Arc::new(|ctx: HandlerContext| async move {
            let text = take_str(&ctx.args)?;
            let delay = take_delay_ms(&ctx.args);
            compio::time::sleep(Duration::from_millis(delay)).await;
            Ok(Value::String(text))
        }),
    });

    // The three locking handlers append to one shared buffer; the
    // request that finishes last sees (and returns) every contribution
    // so far, which is how the "A overtaken by B, AB runs last" ordering
    // scenario surfaces a deterministic combined string.
    let buffer: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

    table.register(locking_method("echoLockingA", ["A"], Arc::clone(&buffer)));
    table.register(locking_method("echoLockingAB", ["A", "B"], Arc::clone(&buffer)));
    table.register(locking_method("echoLockingB", ["B"], buffer));

    table.register(MethodSpec {
        name: "echoAsyncWithNotifications".into(),
        lock_keys: Default::default(),
        is_async: true,
        default_timeout: None,
        validate_input: Box::new(validate_echo_args),
        validate_output: Box::new(|_| true),
        handler: Arc::new(|ctx: HandlerContext| async move {
            let text = take_str(&ctx.args)?;
            let delay = take_delay_ms(&ctx.args);
            let step = Duration::from_millis(delay / 4);

            for pct in [0, 25, 50, 75, 100] {
                if pct > 0 {
                    compio::time::sleep(step).await;
                }
                ctx.emit_progress(serde_json::json!({ "str": format!("{text}-{pct}%") }));
            }
            Ok(Value::String(text))
        }),
    });

    table
}

fn locking_method(name: &str, keys: impl IntoIterator<Item = &'static str>, buffer: Arc<Mutex<String>>) -> MethodSpec {
    MethodSpec {
        name: name.to_string(),
        lock_keys: keys.into_iter().map(str::to_string).collect(),
        is_async: true,
        default_timeout: None,
        validate_input: Box::new(validate_echo_args),
        validate_output: Box::new(|_| true),
        handler: Arc::new(move |ctx: HandlerContext| {
            let buffer = Arc::clone(&buffer);
            async move {
                let text = take_str(&ctx.args)?;
                let delay = take_delay_ms(&ctx.args);
                compio::time::sleep(Duration::from_millis(delay)).await;
                let combined = {
                    let mut guard = buffer.lock().unwrap();
                    guard.push_str(&text);
                    guard.clone()
                };
                Ok(Value::String(combined))
            }
        }),
    }
}
