use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// How the worker maintains the cloud firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallMode {
    /// One firewall per cloud instance.
    Instance,
    /// One firewall for the whole environment, reference-counted across
    /// machines.
    Global,
}

impl FirewallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Global => "global",
        }
    }
}

impl fmt::Display for FirewallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirewallMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(Self::Instance),
            "global" => Ok(Self::Global),
            other => Err(CoreError::InvalidFirewallMode {
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_modes() {
        assert_eq!("instance".parse::<FirewallMode>().ok(), Some(FirewallMode::Instance));
        assert_eq!("global".parse::<FirewallMode>().ok(), Some(FirewallMode::Global));
    }

    #[test]
    fn parse_rejects_unknown_mode() {
        assert!(matches!(
            "perimeter".parse::<FirewallMode>(),
            Err(CoreError::InvalidFirewallMode { .. })
        ));
    }
}
