//! Synthetic pod address allocation
//!
//! Each node gets a [`NetworkAllocator`] for its pod CIDR. Only the last
//! octet is managed, so a pool never holds more than 254 addresses even if
//! the node declares a wider block.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use parking_lot::Mutex;
use tracing::debug;

use kubesim_common::{Error, Result};

/// Largest prefix length that still leaves a usable host
const MAX_PREFIX_LEN: u8 = 30;

#[derive(Debug, Default)]
struct PoolState {
    used: BTreeSet<u8>,
    free: BTreeSet<u8>,
    // Next never-assigned host identifier; u16 so it can step past 255
    next_sequential: u16,
}

/// Address pool for one node
#[derive(Debug)]
pub struct NetworkAllocator {
    network: [u8; 3],
    prefix: String,
    first_host: u8,
    last_host: u8,
    state: Mutex<PoolState>,
}

impl NetworkAllocator {
    /// Build a pool from an IPv4 CIDR such as `10.244.1.0/24`
    pub fn new(cidr: &str) -> Result<Self> {
        let (addr, len) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::invalid_cidr(cidr, "missing prefix length"))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::invalid_cidr(cidr, "malformed address"))?;
        let IpAddr::V4(addr) = addr else {
            return Err(Error::invalid_cidr(cidr, "must be IPv4"));
        };
        let len: u8 = len
            .parse()
            .ok()
            .filter(|l| *l <= 32)
            .ok_or_else(|| Error::invalid_cidr(cidr, "prefix length must be 0-32"))?;
        if len > MAX_PREFIX_LEN {
            return Err(Error::invalid_cidr(cidr, "block has no usable host address"));
        }

        let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        let [a, b, c, d] = network.octets();

        let (first_host, last_host) = if len >= 24 {
            let broadcast = d | !(mask as u8);
            (d + 1, broadcast - 1)
        } else {
            (1, 254)
        };

        Ok(Self {
            network: [a, b, c],
            prefix: format!("{a}.{b}.{c}"),
            first_host,
            last_host,
            state: Mutex::new(PoolState {
                next_sequential: u16::from(first_host),
                ..Default::default()
            }),
        })
    }

    /// First three octets of every address this pool hands out
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of host identifiers in the pool
    pub fn capacity(&self) -> u16 {
        u16::from(self.last_host) - u16::from(self.first_host) + 1
    }

    /// Number of addresses currently handed out
    pub fn allocated(&self) -> usize {
        self.state.lock().used.len()
    }

    /// Hand out an address, preferring previously released ones
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();

        let host = match state.free.pop_first() {
            Some(host) => host,
            None => {
                if state.next_sequential > u16::from(self.last_host) {
                    return Err(Error::pool_exhausted(&self.prefix, self.capacity()));
                }
                let host = state.next_sequential as u8;
                state.next_sequential += 1;
                host
            }
        };
        state.used.insert(host);
        Ok(self.address(host))
    }

    /// Return an address to the pool
    ///
    /// Rejects addresses from another prefix or outside the pool without
    /// touching its state. Releasing an address that is not allocated is a
    /// no-op.
    pub fn release(&self, ip: &str) -> Result<()> {
        let (prefix, host) = ip
            .trim()
            .rsplit_once('.')
            .ok_or_else(|| Error::invalid_address(ip, "not an IPv4 address"))?;
        if prefix != self.prefix {
            return Err(Error::invalid_address(
                ip,
                format!("does not belong to {}.0", self.prefix),
            ));
        }
        let host: u8 = host
            .parse()
            .map_err(|_| Error::invalid_address(ip, "host octet must be 0-255"))?;
        if !(self.first_host..=self.last_host).contains(&host) {
            return Err(Error::invalid_address(
                ip,
                format!(
                    "outside pool {}.{}-{}",
                    self.prefix, self.first_host, self.last_host
                ),
            ));
        }

        let mut state = self.state.lock();
        if state.used.remove(&host) {
            state.free.insert(host);
        } else {
            debug!(ip, "release of unallocated address ignored");
        }
        Ok(())
    }

    fn address(&self, host: u8) -> Ipv4Addr {
        let [a, b, c] = self.network;
        Ipv4Addr::new(a, b, c, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pool: &NetworkAllocator) -> (Vec<u8>, Vec<u8>) {
        let state = pool.state.lock();
        (
            state.used.iter().copied().collect(),
            state.free.iter().copied().collect(),
        )
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn slash_24_holds_254_hosts() {
        let pool = NetworkAllocator::new("10.244.1.0/24").unwrap();
        assert_eq!(pool.prefix(), "10.244.1");
        assert_eq!(pool.capacity(), 254);
    }

    #[test]
    fn wider_blocks_are_capped_to_last_octet() {
        let pool = NetworkAllocator::new("10.244.0.0/16").unwrap();
        assert_eq!(pool.prefix(), "10.244.0");
        assert_eq!(pool.capacity(), 254);
    }

    #[test]
    fn host_bits_in_cidr_are_masked() {
        let pool = NetworkAllocator::new("10.244.1.9/30").unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 1, 9));
    }

    #[test]
    fn rejects_ipv6_and_garbage() {
        assert!(matches!(
            NetworkAllocator::new("fd00::/64"),
            Err(Error::InvalidCidr { .. })
        ));
        assert!(NetworkAllocator::new("10.244.1.0").is_err());
        assert!(NetworkAllocator::new("10.244.1/24").is_err());
        assert!(NetworkAllocator::new("10.244.1.0/33").is_err());
        assert!(NetworkAllocator::new("").is_err());
    }

    #[test]
    fn rejects_blocks_without_usable_hosts() {
        assert!(NetworkAllocator::new("10.244.1.0/31").is_err());
        assert!(NetworkAllocator::new("10.244.1.1/32").is_err());
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    #[test]
    fn sequential_allocation_starts_after_network_address() {
        let pool = NetworkAllocator::new("10.244.3.0/24").unwrap();
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 3, 1));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 3, 2));
        assert_eq!(pool.allocated(), 2);
    }

    /// Story: a two-slot pool runs dry, then recycles a released address
    #[test]
    fn story_two_slot_pool_exhausts_and_recycles() {
        let pool = NetworkAllocator::new("10.244.1.0/30").unwrap();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_ne!(first, second);

        assert!(matches!(
            pool.allocate(),
            Err(Error::PoolExhausted { capacity: 2, .. })
        ));

        pool.release(&second.to_string()).unwrap();
        let reused = pool.allocate().unwrap();
        assert_eq!(reused, second);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn full_slash_24_never_hands_out_broadcast() {
        let pool = NetworkAllocator::new("10.244.1.0/24").unwrap();
        let mut last = None;
        for _ in 0..254 {
            last = Some(pool.allocate().unwrap());
        }
        assert_eq!(last, Some(Ipv4Addr::new(10, 244, 1, 254)));
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn released_addresses_come_back_lowest_first() {
        let pool = NetworkAllocator::new("10.244.1.0/24").unwrap();
        for _ in 0..5 {
            pool.allocate().unwrap();
        }
        pool.release("10.244.1.4").unwrap();
        pool.release("10.244.1.2").unwrap();
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 1, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 1, 4));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 1, 6));
    }

    // =========================================================================
    // Release validation
    // =========================================================================

    #[test]
    fn invalid_release_leaves_state_untouched() {
        let pool = NetworkAllocator::new("10.244.1.0/24").unwrap();
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.release("10.244.1.1").unwrap();
        let before = snapshot(&pool);

        for bad in [
            "10.244.2.2",
            "10.244.1.x",
            "10.244.1.256",
            "10.244.1.0",
            "10.244.1.255",
            "garbage",
            "",
        ] {
            assert!(
                matches!(pool.release(bad), Err(Error::InvalidAddress { .. })),
                "{bad} should be rejected"
            );
            assert_eq!(snapshot(&pool), before, "{bad} mutated the pool");
        }
    }

    #[test]
    fn releasing_unallocated_address_is_noop() {
        let pool = NetworkAllocator::new("10.244.1.0/24").unwrap();
        pool.release("10.244.1.77").unwrap();
        assert_eq!(snapshot(&pool), (vec![], vec![]));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 244, 1, 1));
    }

    #[test]
    fn used_and_free_stay_disjoint() {
        let pool = NetworkAllocator::new("10.244.1.0/29").unwrap();
        let a = pool.allocate().unwrap();
        pool.release(&a.to_string()).unwrap();
        pool.release(&a.to_string()).unwrap();
        let (used, free) = snapshot(&pool);
        assert!(used.is_empty());
        assert_eq!(free, vec![1]);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let pool = std::sync::Arc::new(NetworkAllocator::new("10.244.1.0/24").unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| pool.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<Ipv4Addr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
