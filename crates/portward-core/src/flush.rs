// ── Flush strategies ──
//
// Turning a machine's observed state into cloud operations: gather the
// wanted rules, diff against the rules last pushed, then apply the delta
// either per instance or against the environment-global firewall with
// reference counting.

use std::collections::BTreeSet;

use tracing::info;

use portward_api::{ApplicationTag, IngressRule, MachineTag};

use crate::config::FirewallMode;
use crate::diff::{diff_rules, ALL_SOURCES};
use crate::error::CoreError;
use crate::worker::Firewaller;

impl Firewaller {
    /// Flush each of the given machines once (tags that are no longer
    /// tracked are skipped).
    pub(crate) async fn flush_machines<I>(&mut self, machines: I) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = MachineTag>,
    {
        for tag in machines {
            if self.machines.contains_key(&tag) {
                self.flush_machine(&tag).await?;
            }
        }
        Ok(())
    }

    /// Recompute one machine's wanted rules, record them as its effective
    /// rules, and push the delta to the cloud via the active mode.
    pub(crate) async fn flush_machine(&mut self, tag: &MachineTag) -> Result<(), CoreError> {
        let want = self.gather_ingress_rules(std::slice::from_ref(tag));
        let current = match self.machines.get_mut(tag) {
            Some(record) => std::mem::replace(&mut record.ingress_rules, want.clone()),
            None => return Ok(()),
        };
        let (to_open, to_close) = diff_rules(&current, &want);

        match self.mode {
            FirewallMode::Global => self.flush_global_ports(to_open, to_close).await,
            FirewallMode::Instance => self.flush_instance_ports(tag, to_open, to_close).await,
        }
    }

    /// Compute the wanted ingress rules across the given machines.
    ///
    /// Each unit's port ranges are granted to the CIDRs its application
    /// allows: the world when exposed, plus whatever cross-model relation
    /// policy contributes. Stale entries for units that are no longer
    /// tracked are dropped along the way. Units whose applications allow
    /// no sources contribute nothing.
    pub(crate) fn gather_ingress_rules(&mut self, machines: &[MachineTag]) -> Vec<IngressRule> {
        let mut want = Vec::new();
        let mut stale: Vec<(MachineTag, portward_api::UnitTag)> = Vec::new();

        for tag in machines {
            let Some(machine) = self.machines.get(tag) else {
                continue;
            };
            for (unit_tag, port_ranges) in &machine.defined_ports {
                let Some(unit) = self.units.get(unit_tag) else {
                    stale.push((tag.clone(), unit_tag.clone()));
                    continue;
                };

                let mut cidrs: BTreeSet<String> = BTreeSet::new();
                let exposed = self
                    .applications
                    .get(&unit.application)
                    .map_or(false, |app| app.exposed);
                if exposed {
                    cidrs.insert(ALL_SOURCES.to_string());
                }
                self.update_for_remote_relation_ingress(&unit.application, &mut cidrs);

                if !cidrs.is_empty() {
                    for port_range in port_ranges {
                        want.push(IngressRule::new(*port_range, cidrs.iter().cloned()));
                    }
                }
            }
        }

        for (machine_tag, unit_tag) in stale {
            if let Some(machine) = self.machines.get_mut(&machine_tag) {
                machine.defined_ports.remove(&unit_tag);
            }
        }
        want
    }

    /// Fold in source CIDRs required by cross-model relation ingress.
    // TODO: wire in cross-model relation ingress sources once relation
    // tracking lands.
    fn update_for_remote_relation_ingress(
        &self,
        _application: &ApplicationTag,
        _cidrs: &mut BTreeSet<String>,
    ) {
    }

    /// Open and close ports on the environment-global firewall.
    ///
    /// Rules are reference-counted across machines: only a 0→1 transition
    /// opens and only a 1→0 transition closes; rules at zero leave the
    /// map.
    async fn flush_global_ports(
        &mut self,
        raw_open: Vec<IngressRule>,
        raw_close: Vec<IngressRule>,
    ) -> Result<(), CoreError> {
        let mut to_open = Vec::new();
        for rule in raw_open {
            let count = self.global_rule_refs.entry(rule.to_string()).or_insert(0);
            if *count == 0 {
                to_open.push(rule);
            }
            *count += 1;
        }

        let mut to_close = Vec::new();
        for rule in raw_close {
            let key = rule.to_string();
            if let Some(count) = self.global_rule_refs.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.global_rule_refs.remove(&key);
                    to_close.push(rule);
                }
            }
        }

        if !to_open.is_empty() {
            self.environ.open_ports(&to_open).await?;
            info!(rules = ?to_open, "opened port ranges in environment");
        }
        if !to_close.is_empty() {
            self.environ.close_ports(&to_close).await?;
            info!(rules = ?to_close, "closed port ranges in environment");
        }
        Ok(())
    }

    /// Open and close ports on the machine's own instance.
    async fn flush_instance_ports(
        &mut self,
        tag: &MachineTag,
        to_open: Vec<IngressRule>,
        to_close: Vec<IngressRule>,
    ) -> Result<(), CoreError> {
        // A freshly created machine has no instance id yet, but also no
        // open ports; with nothing to do there must be no lookup to fail.
        if to_open.is_empty() && to_close.is_empty() {
            return Ok(());
        }

        let machine = match self.model.machine(tag).await {
            Ok(machine) => machine,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let instance_id = machine.instance_id().await?;
        let instances = self
            .environ
            .instances(std::slice::from_ref(&instance_id))
            .await?;
        let Some(instance) = instances.into_iter().next() else {
            return Err(portward_api::Error::NoInstances.into());
        };

        if !to_open.is_empty() {
            instance.open_ports(tag.id(), &to_open).await?;
            info!(machine = %tag, rules = ?to_open, "opened port ranges");
        }
        if !to_close.is_empty() {
            instance.close_ports(tag.id(), &to_close).await?;
            info!(machine = %tag, rules = ?to_close, "closed port ranges");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use portward_api::{ApplicationTag, MachineTag, PortRange, Protocol, UnitTag};

    use crate::config::FirewallMode;
    use crate::records::{ApplicationRecord, MachineRecord, UnitRecord};
    use crate::testing::{FakeModel, FakeProvider};
    use crate::worker::Firewaller;

    fn worker() -> Firewaller {
        let (provider, _ops) = FakeProvider::new();
        Firewaller::new(
            Arc::new(FakeModel::new()),
            Arc::new(provider),
            FirewallMode::Instance,
        )
    }

    /// Track machine `0` hosting one unit of `app`, with the given ports
    /// observed open.
    fn track_unit(fw: &mut Firewaller, exposed: bool, ports: &[PortRange]) -> MachineTag {
        let machine_tag = MachineTag::new("0");
        let unit_tag = UnitTag::new("app/0");
        let app_tag = ApplicationTag::new("app");

        let mut machine = MachineRecord::new(machine_tag.clone());
        machine.units.insert(unit_tag.clone());
        machine
            .defined_ports
            .insert(unit_tag.clone(), ports.iter().copied().collect());
        fw.machines.insert(machine_tag.clone(), machine);

        fw.units.insert(
            unit_tag.clone(),
            UnitRecord {
                tag: unit_tag.clone(),
                machine: machine_tag.clone(),
                application: app_tag.clone(),
            },
        );
        fw.applications.insert(
            app_tag.clone(),
            ApplicationRecord {
                tag: app_tag,
                exposed,
                units: [unit_tag].into_iter().collect(),
                watch: None,
            },
        );
        machine_tag
    }

    #[test]
    fn gather_is_empty_when_nothing_is_exposed() {
        let mut fw = worker();
        let tag = track_unit(&mut fw, false, &[PortRange::new(Protocol::Tcp, 80, 80)]);
        assert!(fw.gather_ingress_rules(std::slice::from_ref(&tag)).is_empty());
    }

    #[test]
    fn gather_grants_the_world_to_exposed_applications() {
        let mut fw = worker();
        let tag = track_unit(
            &mut fw,
            true,
            &[
                PortRange::new(Protocol::Udp, 53, 53),
                PortRange::new(Protocol::Tcp, 80, 80),
            ],
        );

        let want = fw.gather_ingress_rules(std::slice::from_ref(&tag));
        assert_eq!(want.len(), 2);
        for rule in &want {
            assert_eq!(rule.source_cidrs, vec!["0.0.0.0/0"]);
        }
    }

    #[test]
    fn gather_drops_defined_ports_of_untracked_units() {
        let mut fw = worker();
        let tag = track_unit(&mut fw, true, &[PortRange::new(Protocol::Tcp, 80, 80)]);

        // A defined-ports entry left behind by a unit that is gone.
        let stale = UnitTag::new("ghost/0");
        fw.machines
            .get_mut(&tag)
            .unwrap()
            .defined_ports
            .insert(stale.clone(), [PortRange::new(Protocol::Tcp, 22, 22)].into());

        let want = fw.gather_ingress_rules(std::slice::from_ref(&tag));
        assert_eq!(want.len(), 1);
        assert!(!fw.machines[&tag].defined_ports.contains_key(&stale));
    }
}
