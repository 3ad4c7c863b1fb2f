//! In-memory test doubles for the model and provider seams.
//!
//! [`FakeModel`] is a scripted orchestrator: tests mutate its state and
//! announce watcher events, and the worker observes them through the
//! ordinary capability traits. [`FakeProvider`] records every cloud
//! operation, in order, on a channel the test can drain.
//!
//! Handles snapshot lifecycle state at fetch time, like the production
//! REST client does; everything else reads live state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use portward_api::{
    Application, ApplicationTag, Error, IngressRule, Instance, InstanceId, Life, Machine,
    MachineTag, ModelApi, NotifyWatcher, PortRange, Provider, StringsWatcher, SubnetTag, Unit,
    UnitTag,
};

const FAKE_CHANNEL_SIZE: usize = 64;

// ── Model double ─────────────────────────────────────────────────────

#[derive(Default)]
struct ModelState {
    machines: HashMap<String, MachineState>,
    units: HashMap<String, UnitState>,
    applications: HashMap<String, ApplicationState>,
    machines_subs: Vec<mpsc::Sender<Vec<String>>>,
    ports_subs: Vec<mpsc::Sender<Vec<String>>>,
}

struct MachineState {
    life: Life,
    instance_id: Option<String>,
    /// Opened ports by subnet CIDR ("" for subnet-less), then by range.
    opened: BTreeMap<String, HashMap<PortRange, String>>,
    units_subs: Vec<mpsc::Sender<Vec<String>>>,
}

struct UnitState {
    life: Life,
    machine: Option<String>,
    application: String,
}

struct ApplicationState {
    exposed: bool,
    subs: Vec<mpsc::Sender<()>>,
}

/// Scripted in-memory model.
#[derive(Clone, Default)]
pub struct FakeModel {
    state: Arc<Mutex<ModelState>>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ModelState> {
        self.state.lock().expect("model state poisoned")
    }

    // ── Scripting surface ────────────────────────────────────────────

    /// Add an alive machine, optionally with a provisioned instance id.
    pub fn add_machine(&self, id: &str, instance_id: Option<&str>) {
        self.lock().machines.insert(
            id.to_string(),
            MachineState {
                life: Life::Alive,
                instance_id: instance_id.map(String::from),
                opened: BTreeMap::new(),
                units_subs: Vec::new(),
            },
        );
    }

    pub fn set_machine_life(&self, id: &str, life: Life) {
        if let Some(machine) = self.lock().machines.get_mut(id) {
            machine.life = life;
        }
    }

    pub fn remove_machine(&self, id: &str) {
        self.lock().machines.remove(id);
    }

    /// Add an alive unit. The application name is everything before the
    /// `/` in the unit name; it is created (unexposed) if not yet known.
    pub fn add_unit(&self, name: &str, machine: Option<&str>) {
        let application = name.split('/').next().unwrap_or(name).to_string();
        let mut state = self.lock();
        state
            .applications
            .entry(application.clone())
            .or_insert_with(|| ApplicationState {
                exposed: false,
                subs: Vec::new(),
            });
        state.units.insert(
            name.to_string(),
            UnitState {
                life: Life::Alive,
                machine: machine.map(String::from),
                application,
            },
        );
    }

    pub fn set_unit_life(&self, name: &str, life: Life) {
        if let Some(unit) = self.lock().units.get_mut(name) {
            unit.life = life;
        }
    }

    pub fn assign_unit(&self, name: &str, machine: Option<&str>) {
        if let Some(unit) = self.lock().units.get_mut(name) {
            unit.machine = machine.map(String::from);
        }
    }

    pub fn remove_unit(&self, name: &str) {
        self.lock().units.remove(name);
    }

    /// Flip an application's exposed flag and notify its watchers.
    pub fn set_exposed(&self, application: &str, exposed: bool) {
        let mut state = self.lock();
        if let Some(app) = state.applications.get_mut(application) {
            app.exposed = exposed;
            app.subs.retain(|tx| tx.try_send(()).is_ok());
        }
    }

    pub fn remove_application(&self, application: &str) {
        self.lock().applications.remove(application);
    }

    /// Record a port range as opened by `unit` on `machine`.
    pub fn open_port(&self, machine: &str, subnet: &str, range: PortRange, unit: &str) {
        if let Some(m) = self.lock().machines.get_mut(machine) {
            m.opened
                .entry(subnet.to_string())
                .or_default()
                .insert(range, unit.to_string());
        }
    }

    pub fn close_port(&self, machine: &str, subnet: &str, range: PortRange) {
        if let Some(m) = self.lock().machines.get_mut(machine) {
            if let Some(ports) = m.opened.get_mut(subnet) {
                ports.remove(&range);
            }
        }
    }

    /// Announce a machines-lifecycle batch to every model-machines watcher.
    pub fn announce_machines(&self, ids: &[&str]) {
        let batch: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        self.lock()
            .machines_subs
            .retain(|tx| tx.try_send(batch.clone()).is_ok());
    }

    /// Announce an opened-ports batch (`"<machineId>:<subnetCIDR>"` keys).
    pub fn announce_ports(&self, keys: &[&str]) {
        let batch: Vec<String> = keys.iter().map(|s| s.to_string()).collect();
        self.lock()
            .ports_subs
            .retain(|tx| tx.try_send(batch.clone()).is_ok());
    }

    /// Announce a unit-assignment batch to one machine's units watchers.
    pub fn announce_units(&self, machine: &str, names: &[&str]) {
        let batch: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        if let Some(m) = self.lock().machines.get_mut(machine) {
            m.units_subs.retain(|tx| tx.try_send(batch.clone()).is_ok());
        }
    }
}

#[async_trait]
impl ModelApi for FakeModel {
    async fn watch_model_machines(&self) -> Result<StringsWatcher, Error> {
        let (tx, watcher) = StringsWatcher::channel(FAKE_CHANNEL_SIZE);
        let mut state = self.lock();
        let mut initial: Vec<String> = state.machines.keys().cloned().collect();
        initial.sort();
        let _ = tx.try_send(initial);
        state.machines_subs.push(tx);
        Ok(watcher)
    }

    async fn watch_opened_ports(&self) -> Result<StringsWatcher, Error> {
        let (tx, watcher) = StringsWatcher::channel(FAKE_CHANNEL_SIZE);
        let mut state = self.lock();
        let mut initial: Vec<String> = state
            .machines
            .iter()
            .flat_map(|(id, m)| {
                m.opened
                    .iter()
                    .filter(|(_, ports)| !ports.is_empty())
                    .map(move |(subnet, _)| format!("{id}:{subnet}"))
            })
            .collect();
        initial.sort();
        let _ = tx.try_send(initial);
        state.ports_subs.push(tx);
        Ok(watcher)
    }

    async fn machine(&self, tag: &MachineTag) -> Result<Box<dyn Machine>, Error> {
        let state = self.lock();
        let machine = state
            .machines
            .get(tag.id())
            .ok_or_else(|| Error::NotFound(tag.to_string()))?;
        Ok(Box::new(FakeMachineHandle {
            model: self.clone(),
            tag: tag.clone(),
            life: machine.life,
        }))
    }

    async fn unit(&self, tag: &UnitTag) -> Result<Box<dyn Unit>, Error> {
        let state = self.lock();
        let unit = state
            .units
            .get(tag.name())
            .ok_or_else(|| Error::NotFound(tag.to_string()))?;
        Ok(Box::new(FakeUnitHandle {
            model: self.clone(),
            tag: tag.clone(),
            life: unit.life,
            machine: unit.machine.clone(),
            application: unit.application.clone(),
        }))
    }
}

struct FakeMachineHandle {
    model: FakeModel,
    tag: MachineTag,
    life: Life,
}

impl std::fmt::Debug for FakeMachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeMachineHandle")
            .field("tag", &self.tag)
            .field("life", &self.life)
            .finish()
    }
}

#[async_trait]
impl Machine for FakeMachineHandle {
    fn tag(&self) -> &MachineTag {
        &self.tag
    }

    fn life(&self) -> Life {
        self.life
    }

    async fn instance_id(&self) -> Result<InstanceId, Error> {
        let state = self.model.lock();
        let machine = state
            .machines
            .get(self.tag.id())
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))?;
        machine
            .instance_id
            .clone()
            .map(InstanceId::new)
            .ok_or_else(|| Error::NotProvisioned(self.tag.to_string()))
    }

    async fn active_subnets(&self) -> Result<Vec<SubnetTag>, Error> {
        let state = self.model.lock();
        let machine = state
            .machines
            .get(self.tag.id())
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))?;
        Ok(machine
            .opened
            .iter()
            .filter(|(_, ports)| !ports.is_empty())
            .map(|(subnet, _)| SubnetTag::new(subnet.clone()))
            .collect())
    }

    async fn opened_ports(
        &self,
        subnet: &SubnetTag,
    ) -> Result<HashMap<PortRange, UnitTag>, Error> {
        let state = self.model.lock();
        let machine = state
            .machines
            .get(self.tag.id())
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))?;
        Ok(machine
            .opened
            .get(subnet.cidr())
            .map(|ports| {
                ports
                    .iter()
                    .map(|(range, unit)| (*range, UnitTag::new(unit.clone())))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch_units(&self) -> Result<StringsWatcher, Error> {
        let (tx, watcher) = StringsWatcher::channel(FAKE_CHANNEL_SIZE);
        let mut state = self.model.lock();
        let mut initial: Vec<String> = state
            .units
            .iter()
            .filter(|(_, unit)| unit.machine.as_deref() == Some(self.tag.id()))
            .map(|(name, _)| name.clone())
            .collect();
        initial.sort();
        let machine = state
            .machines
            .get_mut(self.tag.id())
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))?;
        let _ = tx.try_send(initial);
        machine.units_subs.push(tx);
        Ok(watcher)
    }
}

struct FakeUnitHandle {
    model: FakeModel,
    tag: UnitTag,
    life: Life,
    machine: Option<String>,
    application: String,
}

#[async_trait]
impl Unit for FakeUnitHandle {
    fn tag(&self) -> &UnitTag {
        &self.tag
    }

    fn life(&self) -> Life {
        self.life
    }

    async fn assigned_machine(&self) -> Result<MachineTag, Error> {
        match self.machine {
            Some(ref id) => Ok(MachineTag::new(id.clone())),
            None => Err(Error::NotAssigned(self.tag.to_string())),
        }
    }

    async fn application(&self) -> Result<Box<dyn Application>, Error> {
        Ok(Box::new(FakeApplicationHandle {
            model: self.model.clone(),
            tag: ApplicationTag::new(self.application.clone()),
        }))
    }
}

struct FakeApplicationHandle {
    model: FakeModel,
    tag: ApplicationTag,
}

#[async_trait]
impl Application for FakeApplicationHandle {
    fn tag(&self) -> &ApplicationTag {
        &self.tag
    }

    async fn is_exposed(&self) -> Result<bool, Error> {
        let state = self.model.lock();
        state
            .applications
            .get(self.tag.name())
            .map(|app| app.exposed)
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))
    }

    async fn watch(&self) -> Result<NotifyWatcher, Error> {
        let (tx, watcher) = NotifyWatcher::channel(FAKE_CHANNEL_SIZE);
        let mut state = self.model.lock();
        let app = state
            .applications
            .get_mut(self.tag.name())
            .ok_or_else(|| Error::NotFound(self.tag.to_string()))?;
        let _ = tx.try_send(());
        app.subs.push(tx);
        Ok(watcher)
    }

    async fn refresh(&self) -> Result<(), Error> {
        let state = self.model.lock();
        if state.applications.contains_key(self.tag.name()) {
            Ok(())
        } else {
            Err(Error::NotFound(self.tag.to_string()))
        }
    }
}

// ── Provider double ──────────────────────────────────────────────────

/// One recorded cloud operation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudOp {
    OpenEnviron(Vec<IngressRule>),
    CloseEnviron(Vec<IngressRule>),
    OpenInstance {
        machine: String,
        rules: Vec<IngressRule>,
    },
    CloseInstance {
        machine: String,
        rules: Vec<IngressRule>,
    },
}

#[derive(Default)]
struct ProviderState {
    environ_rules: BTreeSet<IngressRule>,
    instances: BTreeSet<String>,
    /// Per machine-id rule sets for instance mode.
    instance_rules: HashMap<String, BTreeSet<IngressRule>>,
}

/// Recording in-memory provider. Operations are applied to its own state
/// (so reconciliation reads back what was opened) and logged to the ops
/// channel in call order.
#[derive(Clone)]
pub struct FakeProvider {
    state: Arc<Mutex<ProviderState>>,
    ops: mpsc::UnboundedSender<CloudOp>,
}

impl FakeProvider {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CloudOp>) {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(ProviderState::default())),
                ops,
            },
            ops_rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().expect("provider state poisoned")
    }

    pub fn register_instance(&self, id: &str) {
        self.lock().instances.insert(id.to_string());
    }

    /// Seed the environment-global rules (drift before the worker starts).
    pub fn seed_environ_rules(&self, rules: impl IntoIterator<Item = IngressRule>) {
        self.lock().environ_rules.extend(rules);
    }

    /// Seed a machine's instance rules (drift before the worker starts).
    pub fn seed_instance_rules(&self, machine: &str, rules: impl IntoIterator<Item = IngressRule>) {
        self.lock()
            .instance_rules
            .entry(machine.to_string())
            .or_default()
            .extend(rules);
    }

    /// The rules currently in force on a machine's instance.
    pub fn instance_rules(&self, machine: &str) -> Vec<IngressRule> {
        self.lock()
            .instance_rules
            .get(machine)
            .map(|rules| rules.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The rules currently in force environment-wide.
    pub fn environ_rules(&self) -> Vec<IngressRule> {
        self.lock().environ_rules.iter().cloned().collect()
    }

    fn record(&self, op: CloudOp) {
        let _ = self.ops.send(op);
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn ingress_rules(&self) -> Result<Vec<IngressRule>, Error> {
        Ok(self.environ_rules())
    }

    async fn open_ports(&self, rules: &[IngressRule]) -> Result<(), Error> {
        self.lock().environ_rules.extend(rules.iter().cloned());
        self.record(CloudOp::OpenEnviron(rules.to_vec()));
        Ok(())
    }

    async fn close_ports(&self, rules: &[IngressRule]) -> Result<(), Error> {
        {
            let mut state = self.lock();
            for rule in rules {
                state.environ_rules.remove(rule);
            }
        }
        self.record(CloudOp::CloseEnviron(rules.to_vec()));
        Ok(())
    }

    async fn instances(&self, ids: &[InstanceId]) -> Result<Vec<Box<dyn Instance>>, Error> {
        let state = self.lock();
        let found: Vec<Box<dyn Instance>> = ids
            .iter()
            .filter(|id| state.instances.contains(id.as_str()))
            .map(|id| {
                Box::new(FakeInstanceHandle {
                    provider: self.clone(),
                    id: id.clone(),
                }) as Box<dyn Instance>
            })
            .collect();
        if found.is_empty() {
            return Err(Error::NoInstances);
        }
        Ok(found)
    }
}

struct FakeInstanceHandle {
    provider: FakeProvider,
    id: InstanceId,
}

impl std::fmt::Debug for FakeInstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeInstanceHandle")
            .field("id", &self.id)
            .finish()
    }
}

#[async_trait]
impl Instance for FakeInstanceHandle {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    async fn ingress_rules(&self, machine_id: &str) -> Result<Vec<IngressRule>, Error> {
        Ok(self.provider.instance_rules(machine_id))
    }

    async fn open_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error> {
        self.provider
            .lock()
            .instance_rules
            .entry(machine_id.to_string())
            .or_default()
            .extend(rules.iter().cloned());
        self.provider.record(CloudOp::OpenInstance {
            machine: machine_id.to_string(),
            rules: rules.to_vec(),
        });
        Ok(())
    }

    async fn close_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error> {
        {
            let mut state = self.provider.lock();
            if let Some(current) = state.instance_rules.get_mut(machine_id) {
                for rule in rules {
                    current.remove(rule);
                }
            }
        }
        self.provider.record(CloudOp::CloseInstance {
            machine: machine_id.to_string(),
            rules: rules.to_vec(),
        });
        Ok(())
    }
}
