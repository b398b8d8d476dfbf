use std::net::{Ipv4Addr, UdpSocket};
use std::ops::RangeInclusive;

use crate::error::{DaemonError, Result};

/// Finds an unused UDP port for a new worker.
///
/// Probing binds and releases a throwaway socket, so two allocators on the
/// same host can hand out the same port. Only one supervisor runs per
/// reference.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self { range }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// First port in the range that can currently be bound.
    pub fn allocate(&self) -> Result<u16> {
        for port in self.range.clone() {
            if UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok() {
                tracing::debug!(port, "Allocated worker port");
                return Ok(port);
            }
        }
        Err(DaemonError::PortsExhausted {
            min: *self.range.start(),
            max: *self.range.end(),
        })
    }
}
