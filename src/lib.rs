//! Subnet lease registry over a revisioned key-value store.
//!
//! Each host of an overlay network leases an IPv4 subnet. Leases live in a
//! shared key-value store as `<prefix>/subnets/A.B.C.D-len` entries bound to
//! TTL store leases, next to one opaque `<prefix>/config` blob. This crate
//! is the translation layer between that key layout and typed operations:
//! it encodes keys and attributes, materializes expirations from lease TTLs,
//! turns change batches into subnet events, and serializes critical sections
//! through a store-wide mutex. Consensus and durability are the store's job.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Allocators (callers)                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Registry / LeaseRegistry                     │
//! │   LeaseStore │ watch translation + SubnetWatcher │ Mutex guard │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Key codec                               │
//! │        subnet keys │ grammar prefilter │ JSON attributes        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      KvBackend (trait)                          │
//! │   get/put/delete │ watch │ TTL leases │ sessions + mutexes      │
//! │            MemoryStore: in-process implementation               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::context`] - Cancellation and deadlines
//! - [`core::error`] - Error taxonomy
//! - [`core::telemetry`] - Logging setup
//! - [`core::time`] - Clocks and expiration arithmetic
//!
//! ## Subnets
//! - [`subnet::types`] - Subnet, LeaseAttrs, Lease, Event
//! - [`subnet::codec`] - Key layout and value encoding
//!
//! ## Store
//! - [`store`] - `KvBackend` capability surface
//! - [`store::memory`] - In-process store with leases, watches and mutexes
//! - `store::etcd` - etcd v3 backend (feature `etcd`)
//!
//! ## Registry
//! - [`registry`] - `Registry` facade and `LeaseRegistry`
//! - [`registry::leases`] - Lease reads and writes
//! - [`registry::watch`] - Change batches to subnet events
//! - [`registry::guard`] - Cluster-wide mutual exclusion
//!
//! ## Networking
//! - [`net::tls`] - Store client TLS material
//!
//! # Key Invariants
//!
//! - A subnet maps to at most one live entry; writes always overwrite.
//! - Expirations are derived from the bound lease's TTL at read time.
//! - Keys whose suffix fails the subnet grammar are never decoded.
//! - Watches resume strictly after the caller's revision.
//! - Guarded sections release mutex and session on every exit path.

// Core infrastructure
pub mod core;

// Subnet model and key codec
pub mod subnet;

// Backing store
pub mod store;

// Registry
pub mod registry;

// Networking
pub mod net;

// Re-exports for convenience
pub use self::core::config::{Config, ConfigOverrides, RegistryConfig, StoreConfig};
pub use self::core::context::Context;
pub use self::core::error::{CancelReason, LockStage, RegistryError, RegistryResult};
pub use self::core::time::{Clock, ManualClock, SystemClock};
pub use registry::{LeaseRegistry, MutualExclusionGuard, Registry, SubnetWatcher, WatchScope};
pub use store::{KvBackend, MemoryStore, StoreError};
pub use subnet::{Event, EventKind, KeyLayout, Lease, LeaseAttrs, Revision, Subnet};
