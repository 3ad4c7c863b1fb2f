// ── Port ranges, ingress rules, and the opened-ports key ──
//
// These are the values the worker mirrors between the model and the cloud
// provider. `IngressRule` keeps its source CIDRs sorted and deduplicated so
// that equality, ordering, and log output are all canonical.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tags::{MachineTag, SubnetTag};

/// Transport protocol of a port range.
///
/// Variants are declared in lexical order so the derived `Ord` matches the
/// protocol-name ordering used when sorting rules for the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icmp" => Ok(Self::Icmp),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(Error::UnknownProtocol {
                value: other.to_string(),
            }),
        }
    }
}

/// A contiguous range of ports for one protocol.
///
/// Field order carries the sort order: protocol, then from-port, then
/// to-port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub struct PortRange {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
}

impl PortRange {
    pub fn new(protocol: Protocol, from_port: u16, to_port: u16) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}/{}", self.from_port, self.to_port, self.protocol)
    }
}

/// A port range plus the source CIDRs allowed to reach it.
///
/// An empty CIDR set is read by consumers as "open to the world"
/// (`0.0.0.0/0`). The set is stored sorted and deduplicated, making the
/// derived equality and ordering canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngressRule {
    #[serde(flatten)]
    pub port_range: PortRange,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_cidrs: Vec<String>,
}

impl IngressRule {
    pub fn new<I, S>(port_range: PortRange, source_cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cidrs: Vec<String> = source_cidrs.into_iter().map(Into::into).collect();
        cidrs.sort();
        cidrs.dedup();
        Self {
            port_range,
            source_cidrs: cidrs,
        }
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source_cidrs.is_empty() {
            write!(f, "{}", self.port_range)
        } else {
            write!(f, "{} from {}", self.port_range, self.source_cidrs.join(","))
        }
    }
}

/// Parse an opened-ports key (`"<machineId>:<subnetCIDR>"`) into its
/// machine and subnet tags.
///
/// The subnet half may be empty (`"42:"`), which yields the zero-valued
/// subnet tag. A key without a `:` separator is a protocol mismatch and is
/// rejected.
pub fn parse_ports_key(key: &str) -> Result<(MachineTag, SubnetTag), Error> {
    let Some((machine_id, subnet_cidr)) = key.split_once(':') else {
        return Err(Error::InvalidPortsKey {
            key: key.to_string(),
        });
    };
    Ok((MachineTag::new(machine_id), SubnetTag::new(subnet_cidr)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trip() {
        for (text, protocol) in [
            ("tcp", Protocol::Tcp),
            ("udp", Protocol::Udp),
            ("icmp", Protocol::Icmp),
        ] {
            assert_eq!(text.parse::<Protocol>().unwrap(), protocol);
            assert_eq!(protocol.to_string(), text);
        }
    }

    #[test]
    fn protocol_rejects_unknown() {
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(Error::UnknownProtocol { .. })
        ));
    }

    #[test]
    fn port_range_ordering() {
        let a = PortRange::new(Protocol::Tcp, 80, 80);
        let b = PortRange::new(Protocol::Tcp, 443, 443);
        let c = PortRange::new(Protocol::Udp, 53, 53);
        let mut ranges = vec![c, b, a];
        ranges.sort();
        // tcp sorts before udp, then by from-port.
        assert_eq!(ranges, vec![a, b, c]);
    }

    #[test]
    fn ingress_rule_canonicalizes_cidrs() {
        let rule = IngressRule::new(
            PortRange::new(Protocol::Tcp, 80, 80),
            ["192.168.1.0/24", "10.0.0.0/8", "192.168.1.0/24"],
        );
        assert_eq!(rule.source_cidrs, vec!["10.0.0.0/8", "192.168.1.0/24"]);
        assert_eq!(rule.to_string(), "80-80/tcp from 10.0.0.0/8,192.168.1.0/24");
    }

    #[test]
    fn parse_ports_key_with_subnet() {
        let (machine, subnet) = parse_ports_key("42:10.0.0.0/24").unwrap();
        assert_eq!(machine, MachineTag::new("42"));
        assert_eq!(subnet, SubnetTag::new("10.0.0.0/24"));
    }

    #[test]
    fn parse_ports_key_empty_subnet() {
        let (machine, subnet) = parse_ports_key("0:").unwrap();
        assert_eq!(machine, MachineTag::new("0"));
        assert!(subnet.is_empty());
    }

    #[test]
    fn parse_ports_key_rejects_missing_separator() {
        assert!(matches!(
            parse_ports_key("42"),
            Err(Error::InvalidPortsKey { .. })
        ));
    }

    #[test]
    fn ingress_rule_json_shape() {
        let rule = IngressRule::new(PortRange::new(Protocol::Tcp, 80, 90), ["0.0.0.0/0"]);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "protocol": "tcp",
                "from-port": 80,
                "to-port": 90,
                "source-cidrs": ["0.0.0.0/0"],
            })
        );
    }
}
