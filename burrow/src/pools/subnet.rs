//! /30 subnet pool carved from a configured CIDR block.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use burrow_shared::{BurrowError, BurrowResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A /30 network assigned to one container. Of its four addresses the first
/// usable is the host side of the veth pair and the second the container
/// side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Subnet {
    base: u32,
}

impl Subnet {
    fn new(base: u32) -> Self {
        Self { base }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    pub fn container_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 2)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/30", self.network())
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl TryFrom<String> for Subnet {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (addr, prefix) = split_cidr(&value).map_err(|e| e.to_string())?;
        if prefix != 30 {
            return Err(format!("{} is not a /30", value));
        }
        Ok(Subnet::new(u32::from(addr)))
    }
}

/// Parse `a.b.c.d/len` into its parts.
pub fn split_cidr(cidr: &str) -> BurrowResult<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| BurrowError::InvalidArgument(format!("bad CIDR {:?}: missing /", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| BurrowError::InvalidArgument(format!("bad CIDR {:?}: {}", cidr, e)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| BurrowError::InvalidArgument(format!("bad CIDR {:?}: {}", cidr, e)))?;
    if prefix > 32 {
        return Err(BurrowError::InvalidArgument(format!(
            "bad CIDR {:?}: prefix out of range",
            cidr
        )));
    }
    Ok((addr, prefix))
}

pub struct SubnetPool {
    network: String,
    initial_size: u32,
    free: Mutex<VecDeque<Subnet>>,
}

impl SubnetPool {
    /// Carve every /30 out of `cidr`, in address order.
    pub fn new(cidr: &str) -> BurrowResult<Self> {
        let (addr, prefix) = split_cidr(cidr)?;
        if prefix > 30 {
            return Err(BurrowError::InvalidArgument(format!(
                "network pool {:?} is smaller than a /30",
                cidr
            )));
        }
        // The free list is materialized up front.
        if prefix < 8 {
            return Err(BurrowError::InvalidArgument(format!(
                "network pool {:?} is too large; use /8 or smaller",
                cidr
            )));
        }

        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let base = u32::from(addr) & mask;
        let count = 1u32 << (30 - prefix);
        let free = (0..count).map(|i| Subnet::new(base + i * 4)).collect();

        Ok(Self {
            network: format!("{}/{}", Ipv4Addr::from(base), prefix),
            initial_size: count,
            free: Mutex::new(free),
        })
    }

    /// The whole pool network in CIDR form, handed to `setup.sh`.
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn acquire(&self) -> BurrowResult<Subnet> {
        self.free
            .lock()
            .pop_front()
            .ok_or(BurrowError::PoolExhausted { pool: "subnet" })
    }

    pub fn release(&self, subnet: Subnet) {
        let mut free = self.free.lock();
        if free.contains(&subnet) {
            tracing::warn!(%subnet, "double release into subnet pool");
            return;
        }
        free.push_back(subnet);
    }

    pub fn remove(&self, subnet: Subnet) -> BurrowResult<()> {
        let mut free = self.free.lock();
        match free.iter().position(|&s| s == subnet) {
            Some(idx) => {
                free.remove(idx);
                Ok(())
            }
            None => Err(BurrowError::AlreadyTaken {
                pool: "subnet",
                element: subnet.to_string(),
            }),
        }
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    pub fn free_count(&self) -> u32 {
        self.free.lock().len() as u32
    }
}
