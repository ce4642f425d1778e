//! The fixed-size configuration record embedded in every built image
//!
//! Wire format: ASCII text
//! `IP=<ip>\nGW=<gw>\nDNS='<dns-csv>'\nMODE=<manager|node>\nMIP=<manager>`
//! followed by NUL padding to exactly [`CONFIG_BLOCK_SIZE`] bytes.

use crate::error::{Error, Result};
use crate::network::{NetworkConfig, Role};
use std::fmt;
use std::net::Ipv4Addr;

/// Size of the configuration slot in bytes
pub const CONFIG_BLOCK_SIZE: usize = 256;

/// Default byte offset of the configuration slot (12 MiB)
pub const DEFAULT_CONFIG_OFFSET: u64 = 12 * 1024 * 1024;

/// Value of the `MODE=` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fleet manager
    Manager,
    /// Worker node
    Node,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Manager => "manager",
            Mode::Node => "node",
        }
    }
}

impl From<Role> for Mode {
    fn from(role: Role) -> Self {
        match role {
            Role::Manager => Mode::Manager,
            Role::Node(_) => Mode::Node,
        }
    }
}

/// Decoded configuration record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    /// Address of this image's host
    pub ip: Ipv4Addr,
    /// Gateway
    pub gateway: Ipv4Addr,
    /// DNS list, comma separated
    pub dns: String,
    /// Manager or node
    pub mode: Mode,
    /// Manager address
    pub manager: Ipv4Addr,
}

impl ConfigBlock {
    /// Build the record for one role of a fleet
    pub fn for_role(config: &NetworkConfig, role: Role) -> Self {
        Self {
            ip: config.role_ip(role),
            gateway: config.gateway(),
            dns: config.dns_csv(),
            mode: role.into(),
            manager: config.manager(),
        }
    }

    /// Render the record text without padding
    pub fn render(&self) -> String {
        format!(
            "IP={}\nGW={}\nDNS='{}'\nMODE={}\nMIP={}",
            self.ip,
            self.gateway,
            self.dns,
            self.mode.as_str(),
            self.manager
        )
    }

    /// Encode into the NUL-padded slot
    pub fn encode(&self) -> Result<[u8; CONFIG_BLOCK_SIZE]> {
        let text = self.render();
        let bytes = text.as_bytes();
        if bytes.len() > CONFIG_BLOCK_SIZE {
            return Err(Error::ConfigBlockTooLarge {
                len: bytes.len(),
                max: CONFIG_BLOCK_SIZE,
            });
        }

        let mut slot = [0u8; CONFIG_BLOCK_SIZE];
        slot[..bytes.len()].copy_from_slice(bytes);
        Ok(slot)
    }

    /// Decode a slot read back from an image
    ///
    /// Text ends at the first NUL byte.
    pub fn decode(slot: &[u8]) -> Result<Self> {
        let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
        let text = std::str::from_utf8(&slot[..end])
            .map_err(|_| malformed("record is not valid text"))?;

        let mut ip = None;
        let mut gateway = None;
        let mut dns = None;
        let mut mode = None;
        let mut manager = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "IP" => ip = Some(parse_ip(key, value)?),
                "GW" => gateway = Some(parse_ip(key, value)?),
                "DNS" => dns = Some(value.trim_matches('\'').to_string()),
                "MODE" => {
                    mode = Some(match value {
                        "manager" => Mode::Manager,
                        "node" => Mode::Node,
                        other => return Err(malformed(&format!("unknown mode '{other}'"))),
                    })
                }
                "MIP" => manager = Some(parse_ip(key, value)?),
                _ => {}
            }
        }

        Ok(Self {
            ip: ip.ok_or_else(|| malformed("missing IP"))?,
            gateway: gateway.ok_or_else(|| malformed("missing GW"))?,
            dns: dns.ok_or_else(|| malformed("missing DNS"))?,
            mode: mode.ok_or_else(|| malformed("missing MODE"))?,
            manager: manager.ok_or_else(|| malformed("missing MIP"))?,
        })
    }
}

impl fmt::Display for ConfigBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn parse_ip(key: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| malformed(&format!("{key} is not an IPv4 address: '{value}'")))
}

fn malformed(reason: &str) -> Error {
    Error::InvalidConfig(format!("Malformed configuration block: {reason}"))
}

/// Check that a slot offset keeps the builder's quarter-chunk copy exact
#[allow(clippy::manual_is_multiple_of)]
pub fn validate_offset(offset: u64) -> Result<()> {
    if offset == 0 || offset % 4 != 0 {
        return Err(Error::InvalidConfig(format!(
            "Configuration offset {offset} must be a positive multiple of 4"
        )));
    }
    Ok(())
}

// ============================================================================
// UNIT TESTS
// ============================================================================
