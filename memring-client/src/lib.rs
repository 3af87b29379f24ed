//! # memring Cache Client
//!
//! Purpose: Provide a synchronous, connection-pooled client for the
//! memcached text protocol across multiple nodes, with consistent hashing
//! and failure isolation.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Bounded per-node connection pools replace
//!    connect/teardown per call.
//! 2. **Consistent Hashing**: A weighted virtual-node ring routes keys, so
//!    topology changes remap only the affected arcs.
//! 3. **Failure Isolation**: Exponential-backoff retries for transient
//!    faults and a per-node circuit breaker that fails fast while a node is
//!    suspended.
//! 4. **Results, Not Panics**: Every operation returns a typed result; a
//!    missing key is an `Ok` outcome, never an error.
//!
//! ## Example
//!
//! ```rust,no_run
//! use memring_client::{CacheClient, ClientConfig};
//!
//! fn main() -> memring_client::Result<()> {
//!     let client = CacheClient::new(ClientConfig::new([
//!         "10.0.0.1:11211",
//!         "10.0.0.2:11211",
//!     ]))?;
//!
//!     client.set("greeting", b"hello", 60)?;
//!     if let Some(value) = client.get("greeting")? {
//!         println!("{}", String::from_utf8_lossy(&value));
//!     }
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod policy;
mod pool;
mod ring;

pub use client::{CacheClient, CasOutcome};
pub use config::{BreakerOptions, ClientConfig, PoolOptions, RetryOptions, ServerAddr};
pub use error::{Error, NodeFailure, PartialFailure, Result};
pub use policy::NodeHealth;
pub use ring::{HashRing, Node};
