//! `netcore_server`
//!
//! Server binary support: wraps `netcore_shared`'s `NetService` in the
//! server role and drives its fixed-timestep tick loop.

pub mod server;

pub use server::NetServer;
