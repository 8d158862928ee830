//! # Service Layer
//!
//! The [`Connection`](connection::Connection) ties transport, protocol and
//! dispatch together and exposes the request and callback interface device
//! modules build on.

pub mod connection;

pub use connection::Connection;
