use portward_api::MachineTag;
use thiserror::Error;

/// Unified error type for the worker.
///
/// Anything the worker cannot absorb as a lifecycle transition surfaces
/// here and tears the worker down; the supervisor restarts it from
/// scratch.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A `firewall-mode` value outside {instance, global}.
    #[error("invalid firewall-mode {value:?}")]
    InvalidFirewallMode { value: String },

    /// A model or provider call failed.
    #[error(transparent)]
    Api(#[from] portward_api::Error),

    /// A change stream ended. The worker cannot continue without it.
    #[error("{watcher} watcher closed")]
    WatcherClosed { watcher: &'static str },

    #[error("cannot watch units of {machine}")]
    WatchUnits {
        machine: MachineTag,
        #[source]
        source: portward_api::Error,
    },

    #[error("cannot respond to units changes for {machine}")]
    UnitsChange {
        machine: MachineTag,
        #[source]
        source: Box<CoreError>,
    },

    #[error("failed to get active subnets of {machine}")]
    ActiveSubnets {
        machine: MachineTag,
        #[source]
        source: portward_api::Error,
    },

    #[error("cannot update firewall ports")]
    Flush {
        #[source]
        source: Box<CoreError>,
    },

    /// The worker was started twice from the same value.
    #[error("worker already started")]
    AlreadyStarted,
}
