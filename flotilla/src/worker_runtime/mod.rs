//! The worker runtime (C5): key-set lock dispatch, the method table, and
//! cross-worker call support, embedded inside each worker process.

pub mod client;
pub mod dispatch;
pub mod locks;
pub mod methods;
pub mod runtime;

pub use dispatch::Dispatcher;
pub use methods::{Handler, MethodSpec, MethodTable};
pub use runtime::run as run_worker;
