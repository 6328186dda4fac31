//! Tunnel layer
//!
//! Provides:
//! - [`DuplexConn`], one stream spliced from an input leg and an output leg
//! - [`relay`], the byte pump between a tunnel and its far endpoint

mod duplex;
mod relay;

pub use duplex::{DuplexConn, PrefixedReader};
pub use relay::relay;
