//! HLS reverse proxy.
//!
//! Fetches manifests on a client's behalf, rewrites every reference so the
//! client keeps talking to the relay, and streams segments and keys through
//! with the referer headers the origin expects.

pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod referrer;
pub mod relay;
pub mod server;
pub mod token;
