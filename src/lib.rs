//! Riptide: share a local file over the internet for a bounded time window.
//!
//! A long-running agent owns the set of active shares, expires them, and
//! serves their bytes over HTTP. The `riptide` cli talks to the agent over a
//! local Unix socket.

pub mod config;
pub mod daemon;
pub mod format;
pub mod logging;
pub mod server;
