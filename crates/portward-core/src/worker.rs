// ── The firewaller worker ──
//
// Watches the model for port ranges opened or closed on machines and
// reflects those changes onto the cloud provider. A single aggregator
// loop owns the entity tables and makes every cloud call; per-machine and
// per-application child tasks only relay change events over channels.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use portward_api::{
    parse_ports_key, Application, ApplicationTag, Life, MachineTag, ModelApi, PortRange, Provider,
    StringsWatcher, SubnetTag, Unit, UnitTag,
};

use crate::config::FirewallMode;
use crate::error::CoreError;
use crate::records::{
    ApplicationRecord, ExposedChange, MachineRecord, UnitRecord, UnitsChange,
};
use crate::tasks::WatcherTask;

const UNITS_CHANNEL_SIZE: usize = 64;
const EXPOSED_CHANNEL_SIZE: usize = 64;
const TASK_ERR_CHANNEL_SIZE: usize = 16;

/// The reconciliation worker.
///
/// Construct with [`new`](Self::new), grab a [`cancel_token`](Self::cancel_token)
/// for external shutdown, then drive it to completion with
/// [`run`](Self::run). A clean external stop resolves to `Ok(())`; any
/// internal failure tears down every child task and surfaces the first
/// error, leaving a supervised restart to rebuild state from scratch.
pub struct Firewaller {
    pub(crate) model: Arc<dyn ModelApi>,
    pub(crate) environ: Arc<dyn Provider>,
    pub(crate) mode: FirewallMode,
    cancel: CancellationToken,

    pub(crate) machines: HashMap<MachineTag, MachineRecord>,
    pub(crate) units: HashMap<UnitTag, UnitRecord>,
    pub(crate) applications: HashMap<ApplicationTag, ApplicationRecord>,
    /// Reference counts for rules opened environment-wide (global mode).
    pub(crate) global_rule_refs: HashMap<String, usize>,

    units_tx: mpsc::Sender<UnitsChange>,
    units_rx: Option<mpsc::Receiver<UnitsChange>>,
    exposed_tx: mpsc::Sender<ExposedChange>,
    exposed_rx: Option<mpsc::Receiver<ExposedChange>>,
    task_err_tx: mpsc::Sender<CoreError>,
    task_err_rx: Option<mpsc::Receiver<CoreError>>,
}

impl Firewaller {
    pub fn new(
        model: Arc<dyn ModelApi>,
        environ: Arc<dyn Provider>,
        mode: FirewallMode,
    ) -> Self {
        let (units_tx, units_rx) = mpsc::channel(UNITS_CHANNEL_SIZE);
        let (exposed_tx, exposed_rx) = mpsc::channel(EXPOSED_CHANNEL_SIZE);
        let (task_err_tx, task_err_rx) = mpsc::channel(TASK_ERR_CHANNEL_SIZE);

        Self {
            model,
            environ,
            mode,
            cancel: CancellationToken::new(),
            machines: HashMap::new(),
            units: HashMap::new(),
            applications: HashMap::new(),
            global_rule_refs: HashMap::new(),
            units_tx,
            units_rx: Some(units_rx),
            exposed_tx,
            exposed_rx: Some(exposed_rx),
            task_err_tx,
            task_err_rx: Some(task_err_rx),
        }
    }

    /// Token that stops the worker (and all its children) when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the worker until it is cancelled or fails.
    ///
    /// All children are cancelled and joined before this returns, whatever
    /// the exit path.
    pub async fn run(mut self) -> Result<(), CoreError> {
        let (mut units_rx, mut exposed_rx, mut task_err_rx) = match (
            self.units_rx.take(),
            self.exposed_rx.take(),
            self.task_err_rx.take(),
        ) {
            (Some(u), Some(e), Some(t)) => (u, e, t),
            _ => return Err(CoreError::AlreadyStarted),
        };

        let mut machines_watcher = self.model.watch_model_machines().await?;
        let mut ports_watcher = self.model.watch_opened_ports().await?;
        debug!("started watching machines and opened port ranges");

        let result = self
            .main_loop(
                &mut machines_watcher,
                &mut ports_watcher,
                &mut units_rx,
                &mut exposed_rx,
                &mut task_err_rx,
            )
            .await;

        self.shutdown().await;
        result
    }

    async fn main_loop(
        &mut self,
        machines_watcher: &mut StringsWatcher,
        ports_watcher: &mut StringsWatcher,
        units_rx: &mut mpsc::Receiver<UnitsChange>,
        exposed_rx: &mut mpsc::Receiver<ExposedChange>,
        task_err_rx: &mut mpsc::Receiver<CoreError>,
    ) -> Result<(), CoreError> {
        let cancel = self.cancel.clone();
        let mut reconciled = false;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                Some(err) = task_err_rx.recv() => return Err(err),

                batch = machines_watcher.recv() => {
                    let Some(machine_ids) = batch else {
                        return Err(CoreError::WatcherClosed { watcher: "machines" });
                    };
                    for machine_id in machine_ids {
                        self.machine_life_changed(MachineTag::new(machine_id)).await?;
                    }
                    // The first batch describes the initial world; only now
                    // do the tables reflect it, so reconcile exactly once.
                    if !reconciled {
                        reconciled = true;
                        match self.mode {
                            FirewallMode::Global => self.reconcile_global().await?,
                            FirewallMode::Instance => self.reconcile_instances().await?,
                        }
                    }
                }

                batch = ports_watcher.recv() => {
                    let Some(keys) = batch else {
                        return Err(CoreError::WatcherClosed { watcher: "opened ports" });
                    };
                    for key in keys {
                        let (machine, subnet) = parse_ports_key(&key)?;
                        self.opened_ports_changed(&machine, &subnet).await?;
                    }
                }

                Some(change) = units_rx.recv() => {
                    self.units_changed(change).await?;
                }

                Some(change) = exposed_rx.recv() => {
                    self.exposed_changed(change).await?;
                }
            }
        }
    }

    /// Cancel every child task and wait for all of them.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        for (_, mut record) in self.machines.drain() {
            if let Some(watch) = record.watch.take() {
                watch.stop().await;
            }
        }
        for (_, mut record) in self.applications.drain() {
            if let Some(watch) = record.watch.take() {
                watch.stop().await;
            }
        }
        self.units.clear();
    }

    // ── Machine lifecycle ────────────────────────────────────────────

    /// Start tracking machines that came to life and forget machines that
    /// died or disappeared.
    pub(crate) async fn machine_life_changed(&mut self, tag: MachineTag) -> Result<(), CoreError> {
        let machine = match self.model.machine(&tag).await {
            Ok(machine) => Some(machine),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let dead = machine.map_or(true, |m| m.life() == Life::Dead);
        let known = self.machines.contains_key(&tag);

        if known && dead {
            self.forget_machine(&tag).await?;
        } else if !known && !dead {
            self.start_machine(tag.clone()).await?;
            debug!(machine = %tag, "started watching machine");
        }
        Ok(())
    }

    /// Begin tracking one machine.
    ///
    /// The first unit-assignment batch is consumed inline so the machine's
    /// unit membership is in place before its relay task starts streaming
    /// later batches. Observing NotFound at any step is a clean no-op: the
    /// machine will simply never be tracked.
    async fn start_machine(&mut self, tag: MachineTag) -> Result<(), CoreError> {
        let machine = match self.model.machine(&tag).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(CoreError::WatchUnits {
                    machine: tag,
                    source: e,
                })
            }
        };
        let mut unit_watcher = match machine.watch_units().await {
            Ok(watcher) => watcher,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => {
                return Err(CoreError::WatchUnits {
                    machine: tag,
                    source: e,
                })
            }
        };

        let first_batch = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            batch = unit_watcher.recv() => match batch {
                Some(batch) => batch,
                None => return Err(CoreError::WatcherClosed { watcher: "machine units" }),
            },
        };

        self.machines.insert(tag.clone(), MachineRecord::new(tag.clone()));
        if let Err(err) = self
            .units_changed(UnitsChange {
                machine: tag.clone(),
                units: first_batch,
            })
            .await
        {
            self.machines.remove(&tag);
            return Err(CoreError::UnitsChange {
                machine: tag,
                source: Box::new(err),
            });
        }

        let child = self.cancel.child_token();
        let handle = tokio::spawn(relay_units(
            unit_watcher,
            tag.clone(),
            self.units_tx.clone(),
            self.task_err_tx.clone(),
            child.clone(),
        ));
        if let Some(record) = self.machines.get_mut(&tag) {
            record.watch = Some(WatcherTask::new(child, handle));
        }
        Ok(())
    }

    /// Forget one machine: forget its units, flush it once (closing its
    /// ports in the cloud), then stop its relay task before dropping the
    /// record.
    pub(crate) async fn forget_machine(&mut self, tag: &MachineTag) -> Result<(), CoreError> {
        let unit_tags: Vec<UnitTag> = self
            .machines
            .get(tag)
            .map(|record| record.units.iter().cloned().collect())
            .unwrap_or_default();
        for unit_tag in &unit_tags {
            self.forget_unit(unit_tag).await;
        }
        self.flush_machine(tag).await?;

        let watch = self.machines.get_mut(tag).and_then(|record| record.watch.take());
        if let Some(watch) = watch {
            watch.stop().await;
        }
        if let Some(record) = self.machines.remove(tag) {
            debug!(machine = %record.tag, "stopped watching machine");
        }
        Ok(())
    }

    // ── Unit lifecycle ───────────────────────────────────────────────

    /// Respond to a batch of unit-assignment changes, then flush every
    /// machine touched by them.
    pub(crate) async fn units_changed(&mut self, change: UnitsChange) -> Result<(), CoreError> {
        let mut touched: BTreeSet<MachineTag> = BTreeSet::new();

        for name in change.units {
            let unit_tag = UnitTag::new(name);
            let unit = match self.model.unit(&unit_tag).await {
                Ok(unit) => Some(unit),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };

            let assigned = match &unit {
                Some(unit) => match unit.assigned_machine().await {
                    Ok(machine) => Some(machine),
                    Err(e) if e.is_not_found() => continue,
                    // An unassigned unit is left exactly as it is: no
                    // membership change, no flush.
                    Err(e) if e.is_not_assigned() => continue,
                    Err(e) => return Err(e.into()),
                },
                None => None,
            };

            if let Some(record) = self.units.get(&unit_tag) {
                let known_machine = record.machine.clone();
                let gone = match &unit {
                    None => true,
                    Some(unit) => unit.life() == Life::Dead,
                };
                if gone || assigned.as_ref() != Some(&known_machine) {
                    self.forget_unit(&unit_tag).await;
                    touched.insert(known_machine);
                }
            } else if let Some(unit) = unit {
                if unit.life() == Life::Dead {
                    continue;
                }
                let Some(machine_tag) = assigned else { continue };
                if self.machines.contains_key(&machine_tag) {
                    self.start_unit(unit, &machine_tag).await?;
                    touched.insert(machine_tag);
                }
            }
        }

        self.flush_machines(touched)
            .await
            .map_err(|e| CoreError::Flush { source: Box::new(e) })
    }

    /// Begin tracking one unit on a tracked machine.
    ///
    /// Finds or creates the owning application record (starting its
    /// exposure watcher if new), wires the membership indices, then
    /// replays ports-changed for each of the machine's active subnets so
    /// ports opened before the unit became known are picked up.
    async fn start_unit(
        &mut self,
        unit: Box<dyn Unit>,
        machine_tag: &MachineTag,
    ) -> Result<(), CoreError> {
        let application = unit.application().await?;
        let application_tag = application.tag().clone();
        let unit_tag = unit.tag().clone();

        if !self.applications.contains_key(&application_tag) {
            self.start_application(application).await?;
        }

        self.units.insert(
            unit_tag.clone(),
            UnitRecord {
                tag: unit_tag.clone(),
                machine: machine_tag.clone(),
                application: application_tag.clone(),
            },
        );
        if let Some(machine) = self.machines.get_mut(machine_tag) {
            machine.units.insert(unit_tag.clone());
        }
        if let Some(app) = self.applications.get_mut(&application_tag) {
            app.units.insert(unit_tag.clone());
        }
        debug!(unit = %unit_tag, machine = %machine_tag, "started watching unit");

        let machine = self.model.machine(machine_tag).await?;
        let subnets = machine.active_subnets().await.map_err(|e| {
            CoreError::ActiveSubnets {
                machine: machine_tag.clone(),
                source: e,
            }
        })?;
        for subnet in subnets {
            self.opened_ports_changed(machine_tag, &subnet).await?;
        }
        Ok(())
    }

    /// Begin tracking one application: record its current exposure and
    /// spawn the relay task watching for changes.
    async fn start_application(
        &mut self,
        application: Box<dyn Application>,
    ) -> Result<(), CoreError> {
        let tag = application.tag().clone();
        let exposed = application.is_exposed().await?;

        let child = self.cancel.child_token();
        let handle = tokio::spawn(watch_application(
            application,
            exposed,
            self.exposed_tx.clone(),
            self.task_err_tx.clone(),
            child.clone(),
        ));
        self.applications.insert(
            tag.clone(),
            ApplicationRecord {
                tag: tag.clone(),
                exposed,
                units: BTreeSet::new(),
                watch: Some(WatcherTask::new(child, handle)),
            },
        );
        debug!(application = %tag, exposed, "started watching application");
        Ok(())
    }

    /// Drop a unit from all three registries. When it was its
    /// application's last tracked unit, the application watcher is stopped
    /// and the application forgotten too. The caller flushes the affected
    /// machines.
    async fn forget_unit(&mut self, tag: &UnitTag) {
        let Some(record) = self.units.remove(tag) else {
            return;
        };
        if let Some(machine) = self.machines.get_mut(&record.machine) {
            machine.units.remove(tag);
        }

        let mut stopped_application = None;
        if let Some(app) = self.applications.get_mut(&record.application) {
            app.units.remove(tag);
            if app.units.is_empty() {
                stopped_application = self.applications.remove(&record.application);
            }
        }
        debug!(unit = %record.tag, "stopped watching unit");

        if let Some(mut app) = stopped_application {
            if let Some(watch) = app.watch.take() {
                watch.stop().await;
            }
            debug!(application = %app.tag, "stopped watching application");
        }
    }

    // ── Ports and exposure ───────────────────────────────────────────

    /// Rebuild a machine's observed opened ports from the model and flush
    /// it when they changed.
    ///
    /// Port change notifications commonly race ahead of machine and unit
    /// registration, so changes for unknown machines or units are skipped;
    /// they are replayed when the late entity registers.
    pub(crate) async fn opened_ports_changed(
        &mut self,
        machine_tag: &MachineTag,
        subnet: &SubnetTag,
    ) -> Result<(), CoreError> {
        if !self.machines.contains_key(machine_tag) {
            warn!(machine = %machine_tag, "skipping port change for untracked machine");
            return Ok(());
        }

        let machine = self.model.machine(machine_tag).await?;
        let opened = machine.opened_ports(subnet).await?;

        let mut defined_ports: BTreeMap<UnitTag, BTreeSet<PortRange>> = BTreeMap::new();
        if let Some(record) = self.machines.get(machine_tag) {
            for (port_range, unit_tag) in opened {
                if !record.units.contains(&unit_tag) {
                    warn!(unit = %unit_tag, "skipping port change for untracked unit");
                    return Ok(());
                }
                defined_ports.entry(unit_tag).or_default().insert(port_range);
            }
        }

        let changed = self
            .machines
            .get(machine_tag)
            .map_or(false, |record| record.defined_ports != defined_ports);
        if changed {
            if let Some(record) = self.machines.get_mut(machine_tag) {
                record.defined_ports = defined_ports;
            }
            self.flush_machine(machine_tag).await?;
        }
        Ok(())
    }

    /// Apply an exposure change and flush every machine hosting one of the
    /// application's units.
    pub(crate) async fn exposed_changed(&mut self, change: ExposedChange) -> Result<(), CoreError> {
        match self.applications.get_mut(&change.application) {
            Some(app) => app.exposed = change.exposed,
            // The application may have been forgotten while the change was
            // in flight.
            None => return Ok(()),
        }

        let touched: BTreeSet<MachineTag> = self
            .applications
            .get(&change.application)
            .map(|app| {
                app.units
                    .iter()
                    .filter_map(|unit| self.units.get(unit).map(|r| r.machine.clone()))
                    .collect()
            })
            .unwrap_or_default();

        self.flush_machines(touched)
            .await
            .map_err(|e| CoreError::Flush { source: Box::new(e) })
    }
}

// ── Child relay tasks ────────────────────────────────────────────────

/// Stream unit-assignment batches for one machine to the aggregator.
async fn relay_units(
    mut watcher: StringsWatcher,
    machine: MachineTag,
    tx: mpsc::Sender<UnitsChange>,
    err_tx: mpsc::Sender<CoreError>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            batch = watcher.recv() => batch,
        };
        let Some(units) = batch else {
            report(
                &err_tx,
                &cancel,
                CoreError::WatcherClosed {
                    watcher: "machine units",
                },
            )
            .await;
            return;
        };
        let change = UnitsChange {
            machine: machine.clone(),
            units,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(change) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Watch one application and report exposure deltas to the aggregator.
///
/// The aggregator owns the record; this task only reports changes it has
/// not seen before. When the application disappears from the model the
/// task ends silently — the unit transitions will clean the record up.
async fn watch_application(
    application: Box<dyn Application>,
    mut exposed: bool,
    tx: mpsc::Sender<ExposedChange>,
    err_tx: mpsc::Sender<CoreError>,
    cancel: CancellationToken,
) {
    let mut watcher = match application.watch().await {
        Ok(watcher) => watcher,
        Err(e) => {
            report(&err_tx, &cancel, e.into()).await;
            return;
        }
    };

    loop {
        let notified = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            notified = watcher.recv() => notified,
        };
        if notified.is_none() {
            report(
                &err_tx,
                &cancel,
                CoreError::WatcherClosed {
                    watcher: "application",
                },
            )
            .await;
            return;
        }

        match application.refresh().await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                report(&err_tx, &cancel, e.into()).await;
                return;
            }
        }
        let now = match application.is_exposed().await {
            Ok(now) => now,
            Err(e) => {
                report(&err_tx, &cancel, e.into()).await;
                return;
            }
        };
        if now == exposed {
            continue;
        }
        exposed = now;

        let change = ExposedChange {
            application: application.tag().clone(),
            exposed: now,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(change) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Send a fatal child error to the aggregator, unless shutdown has begun.
async fn report(err_tx: &mpsc::Sender<CoreError>, cancel: &CancellationToken, err: CoreError) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = err_tx.send(err) => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::testing::{FakeModel, FakeProvider};

    fn worker(model: &FakeModel) -> Firewaller {
        let (provider, _ops) = FakeProvider::new();
        Firewaller::new(
            Arc::new(model.clone()),
            Arc::new(provider),
            FirewallMode::Instance,
        )
    }

    #[tokio::test]
    async fn tracking_keeps_cross_indices_consistent() {
        let model = FakeModel::new();
        model.add_machine("0", None);
        model.add_unit("mysql/0", Some("0"));

        let mut fw = worker(&model);
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();

        let unit_tag = UnitTag::new("mysql/0");
        let unit = &fw.units[&unit_tag];
        assert!(fw.machines[&unit.machine].units.contains(&unit_tag));
        assert!(fw.applications[&unit.application].units.contains(&unit_tag));
    }

    #[tokio::test]
    async fn repeated_life_change_is_a_no_op() {
        let model = FakeModel::new();
        model.add_machine("0", None);
        model.add_unit("mysql/0", Some("0"));

        let mut fw = worker(&model);
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();

        assert_eq!(fw.machines.len(), 1);
        assert_eq!(fw.units.len(), 1);
        assert_eq!(fw.applications.len(), 1);
    }

    #[tokio::test]
    async fn dead_machine_is_forgotten_with_its_units_and_application() {
        let model = FakeModel::new();
        model.add_machine("0", None);
        model.add_unit("mysql/0", Some("0"));

        let mut fw = worker(&model);
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();
        assert_eq!(fw.machines.len(), 1);

        model.set_machine_life("0", Life::Dead);
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();

        assert!(fw.machines.is_empty());
        assert!(fw.units.is_empty());
        // Last tracked unit gone, so the application record went with it.
        assert!(fw.applications.is_empty());
    }

    #[tokio::test]
    async fn unassigned_unit_keeps_its_membership() {
        let model = FakeModel::new();
        model.add_machine("0", None);
        model.add_unit("mysql/0", Some("0"));

        let mut fw = worker(&model);
        fw.machine_life_changed(MachineTag::new("0")).await.unwrap();
        assert_eq!(fw.units.len(), 1);

        model.assign_unit("mysql/0", None);
        fw.units_changed(UnitsChange {
            machine: MachineTag::new("0"),
            units: vec!["mysql/0".into()],
        })
        .await
        .unwrap();

        // No membership change for a unit that merely became unassigned.
        assert_eq!(fw.units.len(), 1);
        assert!(fw.machines[&MachineTag::new("0")]
            .units
            .contains(&UnitTag::new("mysql/0")));
    }

    #[tokio::test]
    async fn port_change_for_unknown_machine_is_dropped() {
        let model = FakeModel::new();
        let mut fw = worker(&model);
        // No machine tracked; the change must be absorbed silently.
        fw.opened_ports_changed(&MachineTag::new("9"), &SubnetTag::default())
            .await
            .unwrap();
        assert!(fw.machines.is_empty());
    }
}
