#![allow(clippy::unwrap_used)]
// Integration tests for the REST model and provider clients using wiremock.

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portward_api::{
    ClientConfig, Error, IngressRule, InstanceId, Life, MachineTag, ModelApi, PortRange, Protocol,
    Provider, RestModel, RestProvider, SubnetTag, UnitTag,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn model_setup() -> (MockServer, RestModel) {
    let server = MockServer::start().await;
    let config = ClientConfig::new(Url::parse(&server.uri()).unwrap());
    let model = RestModel::new(&config).unwrap();
    (server, model)
}

async fn provider_setup() -> (MockServer, RestProvider) {
    let server = MockServer::start().await;
    let config = ClientConfig::new(Url::parse(&server.uri()).unwrap());
    let provider = RestProvider::new(&config).unwrap();
    (server, provider)
}

fn not_found_body(message: &str) -> serde_json::Value {
    json!({ "error": { "code": "not-found", "message": message } })
}

// ── Machine queries ─────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_machine() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/3"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "3", "life": "alive" })),
        )
        .mount(&server)
        .await;

    let machine = model.machine(&MachineTag::new("3")).await.unwrap();
    assert_eq!(machine.life(), Life::Alive);
    assert_eq!(machine.tag(), &MachineTag::new("3"));
}

#[tokio::test]
async fn test_fetch_machine_not_found() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/9"))
        .respond_with(ResponseTemplate::new(404).set_body_json(not_found_body("machine-9")))
        .mount(&server)
        .await;

    let err = model.machine(&MachineTag::new("9")).await.unwrap_err();
    assert!(err.is_not_found(), "expected not-found, got: {err:?}");
}

#[tokio::test]
async fn test_machine_instance_id() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "0", "life": "alive" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/0/instance"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "instance-id": "i-aaa" })),
        )
        .mount(&server)
        .await;

    let machine = model.machine(&MachineTag::new("0")).await.unwrap();
    assert_eq!(machine.instance_id().await.unwrap(), InstanceId::new("i-aaa"));
}

#[tokio::test]
async fn test_machine_not_provisioned() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "0", "life": "alive" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/0/instance"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "not-provisioned", "message": "machine-0" }
        })))
        .mount(&server)
        .await;

    let machine = model.machine(&MachineTag::new("0")).await.unwrap();
    let err = machine.instance_id().await.unwrap_err();
    assert!(err.is_not_provisioned(), "expected not-provisioned, got: {err:?}");
}

#[tokio::test]
async fn test_machine_opened_ports() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "0", "life": "alive" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/machines/0/opened-ports"))
        .and(query_param("subnet", "10.0.0.0/24"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ports": [
                { "protocol": "tcp", "from-port": 80, "to-port": 80, "unit": "mysql/0" },
                { "protocol": "udp", "from-port": 53, "to-port": 53, "unit": "dns/2" }
            ]
        })))
        .mount(&server)
        .await;

    let machine = model.machine(&MachineTag::new("0")).await.unwrap();
    let opened = machine
        .opened_ports(&SubnetTag::new("10.0.0.0/24"))
        .await
        .unwrap();

    assert_eq!(opened.len(), 2);
    assert_eq!(
        opened[&PortRange::new(Protocol::Tcp, 80, 80)],
        UnitTag::new("mysql/0")
    );
    assert_eq!(
        opened[&PortRange::new(Protocol::Udp, 53, 53)],
        UnitTag::new("dns/2")
    );
}

// ── Unit queries ────────────────────────────────────────────────────

#[tokio::test]
async fn test_unit_assigned_machine() {
    let (server, model) = model_setup().await;

    // Unit names contain a slash, which travels percent-encoded.
    Mock::given(method("GET"))
        .and(path("/v1/units/mysql%2F0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "mysql/0", "life": "alive", "machine": "0", "application": "mysql"
        })))
        .mount(&server)
        .await;

    let unit = model.unit(&UnitTag::new("mysql/0")).await.unwrap();
    assert_eq!(unit.life(), Life::Alive);
    assert_eq!(unit.assigned_machine().await.unwrap(), MachineTag::new("0"));
}

#[tokio::test]
async fn test_unit_not_assigned() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/units/mysql%2F0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "mysql/0", "life": "alive", "machine": null, "application": "mysql"
        })))
        .mount(&server)
        .await;

    let unit = model.unit(&UnitTag::new("mysql/0")).await.unwrap();
    let err = unit.assigned_machine().await.unwrap_err();
    assert!(err.is_not_assigned(), "expected not-assigned, got: {err:?}");
}

#[tokio::test]
async fn test_application_exposure() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/units/mysql%2F0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "mysql/0", "life": "alive", "machine": "0", "application": "mysql"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/applications/mysql"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "mysql", "exposed": true })),
        )
        .mount(&server)
        .await;

    let unit = model.unit(&UnitTag::new("mysql/0")).await.unwrap();
    let application = unit.application().await.unwrap();
    assert!(application.is_exposed().await.unwrap());
    application.refresh().await.unwrap();
}

// ── Watchers ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_machines_watch_delivers_initial_batch() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/watch/machines"))
        .and(query_param("after", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "next": 7, "changes": ["0", "1"] })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/watch/machines"))
        .and(query_param("after", "7"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "next": 9, "changes": ["1"] }))
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let mut watcher = model.watch_model_machines().await.unwrap();
    assert_eq!(watcher.recv().await.unwrap(), vec!["0", "1"]);
    // The relay advances the cursor for the next poll.
    assert_eq!(watcher.recv().await.unwrap(), vec!["1"]);
}

#[tokio::test]
async fn test_watch_closes_on_poll_failure() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/watch/opened-ports"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut watcher = model.watch_opened_ports().await.unwrap();
    assert!(watcher.recv().await.is_none());
}

// ── Provider ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_environ_open_ports_body() {
    let (server, provider) = provider_setup().await;

    let rules = vec![IngressRule::new(
        PortRange::new(Protocol::Tcp, 443, 443),
        ["0.0.0.0/0"],
    )];
    Mock::given(method("POST"))
        .and(path("/v1/environ/open-ports"))
        .and(body_json(json!({
            "rules": [
                { "protocol": "tcp", "from-port": 443, "to-port": 443,
                  "source-cidrs": ["0.0.0.0/0"] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    provider.open_ports(&rules).await.unwrap();
}

#[tokio::test]
async fn test_environ_ingress_rules() {
    let (server, provider) = provider_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/environ/ingress-rules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rules": [
                { "protocol": "tcp", "from-port": 80, "to-port": 90,
                  "source-cidrs": ["10.0.0.0/8"] }
            ]
        })))
        .mount(&server)
        .await;

    let rules = provider.ingress_rules().await.unwrap();
    assert_eq!(
        rules,
        vec![IngressRule::new(
            PortRange::new(Protocol::Tcp, 80, 90),
            ["10.0.0.0/8"]
        )]
    );
}

#[tokio::test]
async fn test_instances_no_match() {
    let (server, provider) = provider_setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/environ/instances"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "no-instances", "message": "no instances" }
        })))
        .mount(&server)
        .await;

    let err = provider
        .instances(&[InstanceId::new("i-gone")])
        .await
        .unwrap_err();
    assert!(err.is_no_instances(), "expected no-instances, got: {err:?}");
}

#[tokio::test]
async fn test_instance_open_ports() {
    let (server, provider) = provider_setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/environ/instances"))
        .and(body_json(json!({ "instance-ids": ["i-aaa"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [ { "instance-id": "i-aaa" } ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/instances/i-aaa/open-ports"))
        .and(body_json(json!({
            "machine": "0",
            "rules": [
                { "protocol": "tcp", "from-port": 80, "to-port": 80,
                  "source-cidrs": ["0.0.0.0/0"] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let instances = provider.instances(&[InstanceId::new("i-aaa")]).await.unwrap();
    let rules = vec![IngressRule::new(
        PortRange::new(Protocol::Tcp, 80, 80),
        ["0.0.0.0/0"],
    )];
    instances[0].open_ports("0", &rules).await.unwrap();
}

#[tokio::test]
async fn test_unexpected_error_maps_to_api_error() {
    let (server, model) = model_setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/machines/0"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "code": "internal", "message": "database on fire" }
        })))
        .mount(&server)
        .await;

    let err = model.machine(&MachineTag::new("0")).await.unwrap_err();
    match err {
        Error::Api { status, code, message } => {
            assert_eq!(status, 500);
            assert_eq!(code.as_deref(), Some("internal"));
            assert_eq!(message, "database on fire");
        }
        other => panic!("expected Api error, got: {other:?}"),
    }
}
