//! Network configuration validation
//!
//! Turns raw gateway/DNS/manager/node-count input into an immutable
//! [`NetworkConfig`]. Rules are applied in a fixed order and the first
//! failing rule is reported.

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Highest usable last octet for a host on the /24
pub const MAX_HOST_OCTET: u32 = 254;

/// Maximum number of DNS servers accepted
pub const MAX_DNS_SERVERS: usize = 3;

/// Reasons a network configuration is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Gateway is not a valid IPv4 address
    #[error("The GW IP entered is not valid")]
    InvalidGateway(String),

    /// Manager is not a valid IPv4 address
    #[error("The Manager IP entered is not valid")]
    InvalidManager(String),

    /// DNS list is empty, too long, or holds an invalid address
    #[error("DNS must be in the format '1.2.3.4, 2.3.4.5, 3.4.5.6'")]
    InvalidDns(String),

    /// Gateway and manager differ in the first three octets
    #[error("The manager and the gw are not in the same sub-net")]
    SubnetMismatch,

    /// Last node would land past .254
    #[error("The nodes IP distribution is beyond 254")]
    NodeRangeOverflow {
        /// Last octet the final node would get
        last_octet: u32,
    },

    /// Gateway collides with the manager or one of the nodes
    #[error("the GW is one of the Nodes or Manager IPs")]
    GatewayInNodeRange,
}

/// Role a built image takes in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single manager
    Manager,
    /// A node, numbered from 1
    Node(u32),
}

impl Role {
    /// Position in build order: 0 for the manager, `k` for node `k`
    pub fn index(&self) -> u32 {
        match self {
            Role::Manager => 0,
            Role::Node(k) => *k,
        }
    }

    /// Value of the `MODE=` field
    pub fn mode(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Node(_) => "node",
        }
    }

    /// Short name used in file names and messages (`manager`, `node-3`)
    pub fn nick(&self) -> String {
        match self {
            Role::Manager => "manager".to_string(),
            Role::Node(k) => format!("node-{k}"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nick())
    }
}

/// Validated network configuration for a fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConfig {
    gateway: Ipv4Addr,
    dns: Vec<Ipv4Addr>,
    manager: Ipv4Addr,
    node_count: u32,
}

impl NetworkConfig {
    /// Gateway address
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// DNS servers in the order given
    pub fn dns(&self) -> &[Ipv4Addr] {
        &self.dns
    }

    /// Manager address
    pub fn manager(&self) -> Ipv4Addr {
        self.manager
    }

    /// Number of nodes besides the manager
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// DNS servers joined as `a, b, c`
    pub fn dns_csv(&self) -> String {
        self.dns
            .iter()
            .map(Ipv4Addr::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// All roles in build order, manager first
    pub fn roles(&self) -> Vec<Role> {
        std::iter::once(Role::Manager)
            .chain((1..=self.node_count).map(Role::Node))
            .collect()
    }

    /// Total number of images a build produces
    pub fn total_roles(&self) -> u32 {
        self.node_count + 1
    }

    /// Address assigned to a role
    ///
    /// Nodes take consecutive addresses right after the manager.
    pub fn role_ip(&self, role: Role) -> Ipv4Addr {
        let [a, b, c, last] = self.manager.octets();
        // validate() keeps manager.last + node_count within a u8
        let host = u32::from(last) + role.index();
        Ipv4Addr::new(a, b, c, u8::try_from(host).unwrap_or(u8::MAX))
    }
}

impl fmt::Display for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gw={} dns='{}' manager={} nodes={}",
            self.gateway,
            self.dns_csv(),
            self.manager,
            self.node_count
        )
    }
}

/// Strip surrounding spaces, commas and dots from user input
pub fn clean_input(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_whitespace() || c == ',' || c == '.')
}

/// Split a DNS list on commas and/or spaces into 1 to 3 addresses
pub fn parse_dns(raw: &str) -> std::result::Result<Vec<Ipv4Addr>, ValidationError> {
    let entries: Vec<&str> = clean_input(raw)
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();

    if entries.is_empty() || entries.len() > MAX_DNS_SERVERS {
        return Err(ValidationError::InvalidDns(raw.to_string()));
    }

    entries
        .iter()
        .map(|e| {
            e.parse::<Ipv4Addr>()
                .map_err(|_| ValidationError::InvalidDns(raw.to_string()))
        })
        .collect()
}

/// Validate raw network input
///
/// Rules, in order:
/// 1. gateway and manager are IPv4 addresses
/// 2. DNS holds 1 to 3 IPv4 addresses
/// 3. gateway and manager share the first three octets
/// 4. `manager.last + node_count <= 254`
/// 5. `gateway.last` is outside `[manager.last, manager.last + node_count]`
pub fn validate(
    gw: &str,
    dns_raw: &str,
    manager: &str,
    node_count: u32,
) -> std::result::Result<NetworkConfig, ValidationError> {
    let gateway: Ipv4Addr = clean_input(gw)
        .parse()
        .map_err(|_| ValidationError::InvalidGateway(gw.to_string()))?;
    let manager_ip: Ipv4Addr = clean_input(manager)
        .parse()
        .map_err(|_| ValidationError::InvalidManager(manager.to_string()))?;

    let dns = parse_dns(dns_raw)?;

    let [ga, gb, gc, g_last] = gateway.octets();
    let [ma, mb, mc, m_last] = manager_ip.octets();
    if (ga, gb, gc) != (ma, mb, mc) {
        return Err(ValidationError::SubnetMismatch);
    }

    let first = u32::from(m_last);
    let last_octet = first.saturating_add(node_count);
    if last_octet > MAX_HOST_OCTET {
        return Err(ValidationError::NodeRangeOverflow { last_octet });
    }

    if (first..=last_octet).contains(&u32::from(g_last)) {
        return Err(ValidationError::GatewayInNodeRange);
    }

    tracing::debug!(
        "Validated network: gw={} manager={} nodes={}",
        gateway,
        manager_ip,
        node_count
    );

    Ok(NetworkConfig {
        gateway,
        dns,
        manager: manager_ip,
        node_count,
    })
}

// ============================================================================
// UNIT TESTS
// ============================================================================
