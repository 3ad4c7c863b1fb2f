// ── Cold-start reconciliation ──
//
// Runs exactly once, after the first machines batch has been absorbed:
// only then do the tables describe the initial world. Brings the cloud's
// actual rules into agreement with the worker's wanted state, correcting
// whatever drifted while no worker was running.

use tracing::{info, warn};

use portward_api::{IngressRule, MachineTag};

use crate::diff::diff_rules;
use crate::error::CoreError;
use crate::worker::Firewaller;

impl Firewaller {
    /// Reconcile the environment-global firewall.
    ///
    /// Recomputes every machine's wanted rules, records them as the
    /// machines' effective rules, and rebuilds the global reference counts
    /// from scratch so each rule's count equals the number of machines
    /// wanting it. The combined wanted set is then diffed against the
    /// environment's actual rules.
    pub(crate) async fn reconcile_global(&mut self) -> Result<(), CoreError> {
        let mut tags: Vec<MachineTag> = self.machines.keys().cloned().collect();
        tags.sort();

        self.global_rule_refs.clear();
        let mut want_all: Vec<IngressRule> = Vec::new();
        for tag in &tags {
            let want = self.gather_ingress_rules(std::slice::from_ref(tag));
            for rule in &want {
                *self.global_rule_refs.entry(rule.to_string()).or_insert(0) += 1;
            }
            if let Some(record) = self.machines.get_mut(tag) {
                record.ingress_rules = want.clone();
            }
            want_all.extend(want);
        }

        let initial_rules = self.environ.ingress_rules().await?;
        let (to_open, to_close) = diff_rules(&initial_rules, &want_all);
        if !to_open.is_empty() {
            info!(rules = ?to_open, "opening global port ranges");
            self.environ.open_ports(&to_open).await?;
        }
        if !to_close.is_empty() {
            info!(rules = ?to_close, "closing global port ranges");
            self.environ.close_ports(&to_close).await?;
        }
        Ok(())
    }

    /// Reconcile per-instance firewalls.
    ///
    /// For each tracked machine, diffs the instance's actual rules against
    /// the machine's effective rules and applies the delta. Machines that
    /// vanished are forgotten; unprovisioned machines are skipped this
    /// pass. A failure on one machine aborts the remainder of the pass and
    /// surfaces to the supervisor.
    pub(crate) async fn reconcile_instances(&mut self) -> Result<(), CoreError> {
        let mut tags: Vec<MachineTag> = self.machines.keys().cloned().collect();
        tags.sort();

        for tag in tags {
            let machine = match self.model.machine(&tag).await {
                Ok(machine) => machine,
                Err(e) if e.is_not_found() => {
                    self.forget_machine(&tag).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let instance_id = match machine.instance_id().await {
                Ok(id) => id,
                Err(e) if e.is_not_provisioned() => {
                    warn!(machine = %tag, "machine not yet provisioned");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let instances = match self
                .environ
                .instances(std::slice::from_ref(&instance_id))
                .await
            {
                Ok(instances) => instances,
                Err(e) if e.is_no_instances() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let Some(instance) = instances.into_iter().next() else {
                return Ok(());
            };

            let initial_rules = instance.ingress_rules(tag.id()).await?;
            let wanted = self
                .machines
                .get(&tag)
                .map(|record| record.ingress_rules.clone())
                .unwrap_or_default();

            let (to_open, to_close) = diff_rules(&initial_rules, &wanted);
            if !to_open.is_empty() {
                info!(machine = %tag, rules = ?to_open, "opening instance port ranges");
                instance.open_ports(tag.id(), &to_open).await?;
            }
            if !to_close.is_empty() {
                info!(machine = %tag, rules = ?to_close, "closing instance port ranges");
                instance.close_ports(tag.id(), &to_close).await?;
            }
        }
        Ok(())
    }
}
