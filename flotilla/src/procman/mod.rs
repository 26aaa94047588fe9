//! Process manager: the persistent worker registry (C6), the supervisor
//! (C7), and pid-file identity (C8).

pub mod client;
pub mod pidfile;
pub mod registry;
pub mod supervisor;

pub use registry::Registry;
