//! `netcore_client`
//!
//! Client binary support: wraps `netcore_shared`'s `NetService` in the
//! client role, driving discovery, the JOIN handshake, and the console
//! command loop.

pub mod client;

pub use client::NetClient;
