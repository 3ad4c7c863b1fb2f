// ── Model capability traits ──
//
// The surface the worker needs from the orchestrator: change streams over
// machines and opened ports, plus queryable machine / unit / application
// handles. Everything is behind `dyn` so the worker can be driven by the
// REST client in production and by scripted in-memory doubles in tests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Error;
use crate::life::Life;
use crate::ports::PortRange;
use crate::provider::InstanceId;
use crate::tags::{ApplicationTag, MachineTag, SubnetTag, UnitTag};
use crate::watch::{NotifyWatcher, StringsWatcher};

/// Client for the orchestrator's model.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Watch the model for machines whose lifecycle state changed.
    /// Batches carry raw machine ids.
    async fn watch_model_machines(&self) -> Result<StringsWatcher, Error>;

    /// Watch the model for opened-ports changes. Batches carry
    /// `"<machineId>:<subnetCIDR>"` keys (the subnet half may be empty).
    async fn watch_opened_ports(&self) -> Result<StringsWatcher, Error>;

    /// Fetch a machine. `Err` with `is_not_found()` when it is gone.
    async fn machine(&self, tag: &MachineTag) -> Result<Box<dyn Machine>, Error>;

    /// Fetch a unit. `Err` with `is_not_found()` when it is gone.
    async fn unit(&self, tag: &UnitTag) -> Result<Box<dyn Unit>, Error>;
}

/// A machine known to the model.
#[async_trait]
pub trait Machine: Send + Sync + std::fmt::Debug {
    fn tag(&self) -> &MachineTag;

    /// Lifecycle state observed when the handle was fetched.
    fn life(&self) -> Life;

    /// The machine's cloud instance id. `Err` with `is_not_provisioned()`
    /// while the machine has no instance yet.
    async fn instance_id(&self) -> Result<InstanceId, Error>;

    /// The subnets on which this machine currently has opened ports. May
    /// include the zero-valued subnet tag for subnet-less openings.
    async fn active_subnets(&self) -> Result<Vec<SubnetTag>, Error>;

    /// The ports opened on the given subnet, keyed by range, with the unit
    /// that opened each.
    async fn opened_ports(
        &self,
        subnet: &SubnetTag,
    ) -> Result<HashMap<PortRange, UnitTag>, Error>;

    /// Watch the set of units assigned to this machine. Batches carry raw
    /// unit names.
    async fn watch_units(&self) -> Result<StringsWatcher, Error>;
}

/// A unit known to the model.
#[async_trait]
pub trait Unit: Send + Sync {
    fn tag(&self) -> &UnitTag;

    /// Lifecycle state observed when the handle was fetched.
    fn life(&self) -> Life;

    /// The machine this unit is assigned to. `Err` with `is_not_assigned()`
    /// when unassigned, or `is_not_found()` when the unit is gone.
    async fn assigned_machine(&self) -> Result<MachineTag, Error>;

    /// The application owning this unit.
    async fn application(&self) -> Result<Box<dyn Application>, Error>;
}

/// An application known to the model.
#[async_trait]
pub trait Application: Send + Sync {
    fn tag(&self) -> &ApplicationTag;

    /// Whether the operator has exposed the application.
    async fn is_exposed(&self) -> Result<bool, Error>;

    /// Watch the application for changes (exposure included).
    async fn watch(&self) -> Result<NotifyWatcher, Error>;

    /// Re-read the application. `Err` with `is_not_found()` once it has
    /// been removed from the model.
    async fn refresh(&self) -> Result<(), Error>;
}
