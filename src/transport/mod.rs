//! # Transport
//!
//! Socket setup for the daemon connection. The connection manager owns the
//! resulting stream and splits it into the receive loop and the single
//! writer.

pub mod tcp;
