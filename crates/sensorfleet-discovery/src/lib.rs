//! Sensorfleet Discovery - finds devices on the local subnet
//!
//! Discovery only produces (identity, address) pairs:
//! - a ping sweep warms the kernel neighbour table
//! - `ip neigh show` yields MAC/IP pairs
//! - every in-subnet pair is upserted into the Device Directory

pub mod arp;
pub mod scanner;

pub use arp::{NeighborEntry, NeighborState};
pub use scanner::{DiscoveryError, DiscoveryScanner, ScannerConfig};
