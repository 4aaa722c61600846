//! Port Allocator: picks a free TCP port above a configured floor.
//!
//! The bind-and-close probe is the authority; the registry's set of
//! currently-assigned ports is only a hint used to skip obviously-taken
//! ports faster. Concurrent allocations are serialized by the caller
//! (the supervisor holds a single allocation lock, see [`crate::supervisor`]).

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::TcpListener;

use crate::error::{Result, SupervisorError};

const CEILING: u16 = 65000;

/// Returns the lowest free port `>= floor` that successfully binds to
/// `0.0.0.0`, skipping ports already recorded as assigned.
pub async fn allocate(floor: u16, assigned: &HashSet<u16>) -> Result<u16> {
    let mut candidate = floor;
    loop {
        if candidate >= CEILING {
            return Err(SupervisorError::NoFreePort);
        }

        if !assigned.contains(&candidate) && probe(candidate).await {
            return Ok(candidate);
        }

        candidate += 1;
    }
}

async fn probe(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_lowest_free_port_above_floor() {
        let floor = 18000;
        let held = TcpListener::bind((Ipv4Addr::UNSPECIFIED, floor))
            .await
            .expect("could not bind test listener");
        let held_port = held.local_addr().unwrap().port();

        let assigned = HashSet::new();
        let allocated = allocate(held_port, &assigned)
            .await
            .expect("should find a free port");

        assert_ne!(allocated, held_port);
        assert!(allocated > held_port);
    }

    #[tokio::test]
    async fn skips_ports_recorded_as_assigned_even_if_bindable() {
        let floor = 19500;
        let mut assigned = HashSet::new();
        assigned.insert(floor);

        let allocated = allocate(floor, &assigned)
            .await
            .expect("should find a free port");
        assert_ne!(allocated, floor);
    }

    #[tokio::test]
    async fn fails_with_no_free_port_past_ceiling() {
        let assigned = HashSet::new();
        let result = allocate(CEILING, &assigned).await;
        assert!(matches!(result, Err(SupervisorError::NoFreePort)));
    }
}
