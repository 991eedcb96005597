//! Finite resource pools.
//!
//! Three structurally identical pools hand out the kernel-visible resources a
//! container owns: a uid, a /30 subnet, and mapped host ports. Allocation
//! takes from the head of an ordered free list so runs are reproducible;
//! `remove` reserves a specific element during restore.
//!
//! Pools never block: an empty pool fails fast with a pool-exhausted error
//! and the caller is responsible for releasing anything it already acquired.

mod port;
mod subnet;
mod uid;

pub use port::PortPool;
pub use subnet::{split_cidr, Subnet, SubnetPool};
pub use uid::UidPool;
