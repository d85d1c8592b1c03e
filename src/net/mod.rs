//! Networking.
//!
//! - [`tls`] - TLS material for the store client connection

pub mod tls;
