// ── Entity records ──
//
// In-memory mirrors of the machines, units, and applications the worker
// tracks. All three tables are owned exclusively by the aggregator loop;
// nothing else reads or writes them. Unit membership is kept as tag-keyed
// indices on both sides (machine and application) rather than ownership
// references.

use std::collections::{BTreeMap, BTreeSet};

use portward_api::{ApplicationTag, IngressRule, MachineTag, PortRange, UnitTag};

use crate::tasks::WatcherTask;

/// One tracked, not-yet-dead machine.
pub(crate) struct MachineRecord {
    pub(crate) tag: MachineTag,
    /// Units currently assigned here.
    pub(crate) units: BTreeSet<UnitTag>,
    /// The rules most recently pushed to the cloud for this machine (or
    /// contributed to the global reference counts, in global mode).
    pub(crate) ingress_rules: Vec<IngressRule>,
    /// Port ranges observed open on this machine, by owning unit.
    pub(crate) defined_ports: BTreeMap<UnitTag, BTreeSet<PortRange>>,
    /// Relay task streaming this machine's unit-assignment changes.
    /// Installed once the initial assignment batch has been absorbed.
    pub(crate) watch: Option<WatcherTask>,
}

impl MachineRecord {
    pub(crate) fn new(tag: MachineTag) -> Self {
        Self {
            tag,
            units: BTreeSet::new(),
            ingress_rules: Vec::new(),
            defined_ports: BTreeMap::new(),
            watch: None,
        }
    }
}

/// One tracked unit, with back-pointers to its machine and application.
pub(crate) struct UnitRecord {
    pub(crate) tag: UnitTag,
    pub(crate) machine: MachineTag,
    pub(crate) application: ApplicationTag,
}

/// One application owning at least one tracked unit.
pub(crate) struct ApplicationRecord {
    pub(crate) tag: ApplicationTag,
    pub(crate) exposed: bool,
    /// The application's tracked units.
    pub(crate) units: BTreeSet<UnitTag>,
    /// Relay task streaming exposure changes.
    pub(crate) watch: Option<WatcherTask>,
}

/// Units-assignment change for one machine, as relayed by its child task.
#[derive(Debug)]
pub(crate) struct UnitsChange {
    pub(crate) machine: MachineTag,
    pub(crate) units: Vec<String>,
}

/// Exposure change for one application, as relayed by its child task.
#[derive(Debug)]
pub(crate) struct ExposedChange {
    pub(crate) application: ApplicationTag,
    pub(crate) exposed: bool,
}
