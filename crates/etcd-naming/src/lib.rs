//! etcd-naming
//!
//! Lease-based service registration and watch-based discovery over etcd.
//!
//! - `registrar`: publish `/etcd3_naming/<service>/<host:port>` under a lease
//!   and keep the lease alive until shutdown
//! - `resolver` / `watcher`: snapshot a service's instances, then stream
//!   add/remove updates as instances come and go
//! - `membership`: a local address set fed by watcher updates
//! - `store`: the coordination-store seam, with etcd and in-memory backends

pub mod config;
pub mod error;
pub mod key;
pub mod membership;
pub mod metrics;
pub mod registrar;
pub mod resolver;
pub mod store;
pub mod watcher;

pub use config::NamingConfig;
pub use error::{NamingError, Result, StoreError};
pub use key::{ServiceKey, PREFIX};
pub use membership::AddressSet;
pub use registrar::{
    register, register_with, revoke, KeepAliveExit, Registration, RegistrationConfig,
};
pub use resolver::{connect, Resolver};
pub use store::{EtcdStore, MemoryStore, NamingStore};
pub use watcher::{MembershipUpdate, Operation, Watcher};
