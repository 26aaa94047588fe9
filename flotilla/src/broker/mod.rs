//! The broker: worker representation (C2), dispatch core (C3), and
//! self-API (C4).

pub mod core;
pub mod selfapi;
pub mod session;
pub mod worker;

pub use core::BrokerCore;
