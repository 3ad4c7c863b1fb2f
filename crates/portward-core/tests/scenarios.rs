#![allow(clippy::unwrap_used)]
// End-to-end scenarios driving the worker through the in-memory model and
// provider doubles. The tokio clock is paused, so "expect no operation"
// assertions elapse as soon as the worker goes idle instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use portward_api::{IngressRule, Life, PortRange, Protocol};
use portward_core::testing::{CloudOp, FakeModel, FakeProvider};
use portward_core::{CoreError, Firewaller, FirewallMode};

const WORLD: &str = "0.0.0.0/0";

fn tcp(port: u16) -> PortRange {
    PortRange::new(Protocol::Tcp, port, port)
}

fn udp(port: u16) -> PortRange {
    PortRange::new(Protocol::Udp, port, port)
}

fn world_rule(range: PortRange) -> IngressRule {
    IngressRule::new(range, [WORLD])
}

struct Harness {
    model: FakeModel,
    provider: FakeProvider,
    ops: UnboundedReceiver<CloudOp>,
    cancel: CancellationToken,
    worker: JoinHandle<Result<(), CoreError>>,
}

impl Harness {
    fn start(
        mode: FirewallMode,
        model: FakeModel,
        provider: FakeProvider,
        ops: UnboundedReceiver<CloudOp>,
    ) -> Self {
        let fw = Firewaller::new(Arc::new(model.clone()), Arc::new(provider.clone()), mode);
        let cancel = fw.cancel_token();
        let worker = tokio::spawn(fw.run());
        Self {
            model,
            provider,
            ops,
            cancel,
            worker,
        }
    }

    async fn expect_op(&mut self) -> CloudOp {
        timeout(Duration::from_secs(5), self.ops.recv())
            .await
            .expect("timed out waiting for a cloud operation")
            .expect("operations channel closed")
    }

    async fn assert_quiet(&mut self) {
        assert!(
            timeout(Duration::from_millis(250), self.ops.recv())
                .await
                .is_err(),
            "expected no cloud operations"
        );
    }

    async fn stop(self) {
        self.cancel.cancel();
        let result = self.worker.await.expect("worker panicked");
        result.expect("worker failed");
    }
}

/// One machine `0` (instance `i-aaa`) hosting `app/0`, which has opened
/// tcp/80 without subnet scoping. The application starts unexposed.
fn instance_world() -> (FakeModel, FakeProvider, UnboundedReceiver<CloudOp>) {
    let model = FakeModel::new();
    model.add_machine("0", Some("i-aaa"));
    model.add_unit("app/0", Some("0"));
    model.open_port("0", "", tcp(80), "app/0");

    let (provider, ops) = FakeProvider::new();
    provider.register_instance("i-aaa");
    (model, provider, ops)
}

// ── Instance mode ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn bring_up_unexposed_opens_nothing() {
    let (model, provider, ops) = instance_world();
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    // Not exposed, so the wanted rule set is empty: zero cloud calls.
    h.assert_quiet().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exposing_opens_the_unit_ports_to_the_world() {
    let (model, provider, ops) = instance_world();
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);
    h.assert_quiet().await;

    h.model.set_exposed("app", true);
    assert_eq!(
        h.expect_op().await,
        CloudOp::OpenInstance {
            machine: "0".into(),
            rules: vec![world_rule(tcp(80))],
        }
    );
    h.assert_quiet().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn added_port_range_opens_only_the_delta() {
    let (model, provider, ops) = instance_world();
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    h.model.set_exposed("app", true);
    h.expect_op().await; // tcp/80 opens

    h.model.open_port("0", "", udp(53), "app/0");
    h.model.announce_ports(&["0:"]);
    assert_eq!(
        h.expect_op().await,
        CloudOp::OpenInstance {
            machine: "0".into(),
            rules: vec![world_rule(udp(53))],
        }
    );
    // No ClosePorts alongside the incremental open.
    h.assert_quiet().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unexposing_closes_every_rule_in_sorted_order() {
    let (model, provider, ops) = instance_world();
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    h.model.set_exposed("app", true);
    h.expect_op().await;
    h.model.open_port("0", "", udp(53), "app/0");
    h.model.announce_ports(&["0:"]);
    h.expect_op().await;

    h.model.set_exposed("app", false);
    assert_eq!(
        h.expect_op().await,
        CloudOp::CloseInstance {
            machine: "0".into(),
            // Sorted by (protocol, from-port, to-port): tcp before udp.
            rules: vec![world_rule(tcp(80)), world_rule(udp(53))],
        }
    );
    h.assert_quiet().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dead_machine_has_its_ports_closed_and_is_dropped() {
    let (model, provider, ops) = instance_world();
    model.set_exposed("app", true);
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    assert_eq!(
        h.expect_op().await,
        CloudOp::OpenInstance {
            machine: "0".into(),
            rules: vec![world_rule(tcp(80))],
        }
    );
    h.assert_quiet().await;

    h.model.set_machine_life("0", Life::Dead);
    h.model.announce_machines(&["0"]);
    assert_eq!(
        h.expect_op().await,
        CloudOp::CloseInstance {
            machine: "0".into(),
            rules: vec![world_rule(tcp(80))],
        }
    );
    assert!(h.provider.instance_rules("0").is_empty());

    // Ports-change events for the forgotten machine are ignored.
    h.model.announce_ports(&["0:"]);
    h.assert_quiet().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn machines_batch_is_idempotent() {
    let (model, provider, ops) = instance_world();
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);
    h.assert_quiet().await;

    // Replaying the same lifecycle batch changes nothing.
    h.model.announce_machines(&["0"]);
    h.assert_quiet().await;

    // The worker is still live and reactive afterwards.
    h.model.set_exposed("app", true);
    assert!(matches!(h.expect_op().await, CloudOp::OpenInstance { .. }));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn forgotten_machine_restarts_into_the_same_state() {
    let (model, provider, ops) = instance_world();
    model.set_exposed("app", true);
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    h.expect_op().await; // bring-up open
    let rules_before = h.provider.instance_rules("0");

    h.model.set_machine_life("0", Life::Dead);
    h.model.announce_machines(&["0"]);
    h.expect_op().await; // close on death

    h.model.set_machine_life("0", Life::Alive);
    h.model.announce_machines(&["0"]);
    assert_eq!(
        h.expect_op().await,
        CloudOp::OpenInstance {
            machine: "0".into(),
            rules: vec![world_rule(tcp(80))],
        }
    );
    assert_eq!(h.provider.instance_rules("0"), rules_before);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconciliation_closes_drifted_instance_rules() {
    let (model, provider, ops) = instance_world();
    // A rule left behind by a previous worker, no longer wanted.
    provider.seed_instance_rules("0", [world_rule(tcp(8080))]);
    let mut h = Harness::start(FirewallMode::Instance, model, provider, ops);

    assert_eq!(
        h.expect_op().await,
        CloudOp::CloseInstance {
            machine: "0".into(),
            rules: vec![world_rule(tcp(8080))],
        }
    );
    h.assert_quiet().await;
    h.stop().await;
}

// ── Global mode ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn global_mode_reference_counts_shared_rules() {
    let model = FakeModel::new();
    model.add_machine("0", None);
    model.add_machine("1", None);
    model.add_unit("app/0", Some("0"));
    model.add_unit("app/1", Some("1"));
    model.set_exposed("app", true);
    model.open_port("0", "", tcp(443), "app/0");
    model.open_port("1", "", tcp(443), "app/1");

    let (provider, ops) = FakeProvider::new();
    let mut h = Harness::start(FirewallMode::Global, model, provider, ops);

    // Both machines want tcp/443, but the environment opens it once.
    assert_eq!(
        h.expect_op().await,
        CloudOp::OpenEnviron(vec![world_rule(tcp(443))])
    );
    h.assert_quiet().await;

    // First unit leaving drops the count to one: nothing closes.
    h.model.remove_unit("app/0");
    h.model.announce_units("0", &["app/0"]);
    h.assert_quiet().await;

    // Second unit leaving drops it to zero: the rule closes.
    h.model.remove_unit("app/1");
    h.model.announce_units("1", &["app/1"]);
    assert_eq!(
        h.expect_op().await,
        CloudOp::CloseEnviron(vec![world_rule(tcp(443))])
    );
    assert!(h.provider.environ_rules().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn global_reconciliation_closes_drifted_rules() {
    let model = FakeModel::new();
    model.add_machine("0", None);

    let (provider, ops) = FakeProvider::new();
    provider.seed_environ_rules([world_rule(tcp(9999))]);
    let mut h = Harness::start(FirewallMode::Global, model, provider, ops);

    assert_eq!(
        h.expect_op().await,
        CloudOp::CloseEnviron(vec![world_rule(tcp(9999))])
    );
    h.assert_quiet().await;
    h.stop().await;
}
