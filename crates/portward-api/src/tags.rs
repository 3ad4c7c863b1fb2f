// ── Entity tags ──
//
// Every model entity is addressed by a tag of the form `kind-identifier`
// (`machine-3`, `unit-mysql-0`, `application-mysql`, `subnet-10.0.0.0/24`).
// Tags wrap the raw identifier; the kind prefix only appears in display
// output and logs.

use std::fmt;

/// Tag of a machine, wrapping its model-wide id (e.g. `"3"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineTag(String);

impl MachineTag {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw machine id, as used in API paths and opened-ports keys.
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine-{}", self.0)
    }
}

/// Tag of a unit, wrapping its name (e.g. `"mysql/0"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitTag(String);

impl UnitTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw unit name (`application/number` form).
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The `/` in unit names becomes `-` in tag form: unit-mysql-0.
        write!(f, "unit-{}", self.0.replace('/', "-"))
    }
}

/// Tag of an application, wrapping its name (e.g. `"mysql"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApplicationTag(String);

impl ApplicationTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "application-{}", self.0)
    }
}

/// Tag of a subnet, wrapping its CIDR (e.g. `"10.0.0.0/24"`).
///
/// A zero-valued subnet tag (empty CIDR) is legal and means "no specific
/// subnet": ports opened without subnet scoping are keyed this way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetTag(String);

impl SubnetTag {
    pub fn new(cidr: impl Into<String>) -> Self {
        Self(cidr.into())
    }

    pub fn cidr(&self) -> &str {
        &self.0
    }

    /// `true` for the zero-valued (subnet-less) tag.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SubnetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subnet-{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn machine_tag_display() {
        assert_eq!(MachineTag::new("3").to_string(), "machine-3");
    }

    #[test]
    fn unit_tag_display_replaces_slash() {
        let tag = UnitTag::new("mysql/0");
        assert_eq!(tag.to_string(), "unit-mysql-0");
        assert_eq!(tag.name(), "mysql/0");
    }

    #[test]
    fn application_tag_display() {
        assert_eq!(ApplicationTag::new("mysql").to_string(), "application-mysql");
    }

    #[test]
    fn subnet_tag_zero_value() {
        let tag = SubnetTag::default();
        assert!(tag.is_empty());
        assert_eq!(tag.cidr(), "");
    }
}
