//! Subnet lease domain types and their store encoding.
//!
//! - [`types`] - Subnet, LeaseAttrs, Lease, Event
//! - [`codec`] - key layout, subnet key grammar, attribute encoding

pub mod codec;
pub mod types;

pub use codec::{
    decode_attrs, decode_subnet_key, encode_attrs, encode_subnet_key, is_subnet_suffix,
    CodecError, KeyLayout,
};
pub use types::{Event, EventKind, Lease, LeaseAttrs, Revision, Subnet};
