//! Neighbour table reading and ping sweeps

use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::scanner::DiscoveryError;

/// Upper bound on `ping` children alive at once
const MAX_CONCURRENT_PINGS: usize = 64;

/// One row of the kernel neighbour table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    /// Link-layer address, empty for unresolved entries
    pub mac: String,
    pub interface: String,
    pub state: NeighborState,
}

impl NeighborEntry {
    /// Whether the entry carries a usable hardware address
    pub fn is_resolved(&self) -> bool {
        !self.mac.is_empty()
            && self.mac != "00:00:00:00:00:00"
            && !matches!(self.state, NeighborState::Failed | NeighborState::Incomplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

/// Read the neighbour table via `ip neigh show`
pub async fn get_neighbor_table() -> Result<Vec<NeighborEntry>, DiscoveryError> {
    let output = Command::new("ip").args(["neigh", "show"]).output().await?;

    if !output.status.success() {
        return Err(DiscoveryError::NeighborTable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let entries = parse_neighbor_table(&String::from_utf8_lossy(&output.stdout));
    debug!(entries = entries.len(), "Read neighbour table");
    Ok(entries)
}

pub fn parse_neighbor_table(output: &str) -> Vec<NeighborEntry> {
    output.lines().filter_map(parse_ip_neigh_line).collect()
}

/// Parse a line such as "192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
fn parse_ip_neigh_line(line: &str) -> Option<NeighborEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    // IPv6 rows fail here and are skipped
    let ip = Ipv4Addr::from_str(parts[0]).ok()?;
    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let interface = parts.get(dev_idx + 1)?.to_string();

    let mac = parts
        .iter()
        .position(|&p| p == "lladdr")
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_string())
        .unwrap_or_default();

    let state = parts
        .last()
        .map(|s| parse_neighbor_state(s))
        .unwrap_or(NeighborState::Unknown);

    Some(NeighborEntry {
        ip,
        mac,
        interface,
        state,
    })
}

fn parse_neighbor_state(s: &str) -> NeighborState {
    match s.to_uppercase().as_str() {
        "REACHABLE" => NeighborState::Reachable,
        "STALE" => NeighborState::Stale,
        "DELAY" => NeighborState::Delay,
        "PROBE" => NeighborState::Probe,
        "FAILED" => NeighborState::Failed,
        "INCOMPLETE" => NeighborState::Incomplete,
        "PERMANENT" => NeighborState::Permanent,
        _ => NeighborState::Unknown,
    }
}

fn subnet_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => !((1u32 << (32 - p)) - 1),
    }
}

pub fn is_in_subnet(ip: Ipv4Addr, subnet: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = subnet_mask(prefix_len);
    (u32::from(ip) & mask) == (u32::from(subnet) & mask)
}

/// Host addresses of the subnet containing `address`, excluding network and broadcast
pub fn subnet_hosts(address: Ipv4Addr, prefix_len: u8) -> Vec<Ipv4Addr> {
    let mask = subnet_mask(prefix_len);
    let network = u32::from(address) & mask;
    let broadcast = network | !mask;
    if broadcast <= network.saturating_add(1) {
        return Vec::new();
    }
    ((network + 1)..broadcast).map(Ipv4Addr::from).collect()
}

/// Ping every host once so the kernel resolves their link-layer addresses.
/// Returns the hosts that answered.
pub async fn ping_sweep(hosts: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    if hosts.is_empty() {
        return Vec::new();
    }
    if is_fping_available().await {
        sweep_with_fping(hosts).await
    } else {
        sweep_with_ping(hosts).await
    }
}

async fn is_fping_available() -> bool {
    Command::new("which")
        .arg("fping")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn sweep_with_fping(hosts: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let output = Command::new("fping")
        .args(["-a", "-q", "-r", "1", "-t", "100"])
        .args(hosts.iter().map(|h| h.to_string()))
        .output()
        .await;

    // fping exits non-zero when any host is down, stdout is still valid
    let reachable: Vec<Ipv4Addr> = match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| Ipv4Addr::from_str(line.trim()).ok())
            .collect(),
        Err(e) => {
            debug!(error = %e, "fping failed");
            Vec::new()
        }
    };

    debug!(reachable = reachable.len(), "fping sweep finished");
    reachable
}

async fn sweep_with_ping(hosts: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let reachable = sweep_bounded(hosts, MAX_CONCURRENT_PINGS, |host| async move {
        let result = Command::new("ping")
            .args(["-c", "1", "-W", "1", &host.to_string()])
            .output()
            .await;
        matches!(result, Ok(output) if output.status.success())
    })
    .await;

    debug!(reachable = reachable.len(), "ping sweep finished");
    reachable
}

/// Run `check` for every host with at most `limit` in flight
async fn sweep_bounded<F, Fut>(hosts: &[Ipv4Addr], limit: usize, check: F) -> Vec<Ipv4Addr>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for &host in hosts {
        // The semaphore is never closed
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let probe = check(host);
        tasks.spawn(async move {
            let answered = probe.await;
            drop(permit);
            answered.then_some(host)
        });
    }

    let mut reachable = Vec::new();
    while let Some(result) = tasks.join_next().await {
        if let Ok(Some(ip)) = result {
            reachable.push(ip);
        }
    }
    reachable.sort();
    reachable
}
