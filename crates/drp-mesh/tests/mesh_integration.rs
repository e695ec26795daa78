//! End-to-end tests over real WebSockets on localhost.

use drp_mesh::{
    Broker, Consumer, MeshServer, Provider, Registry, RunningServer, ServiceDefinition,
    BROKER_ROUTE, PROVIDER_ROUTE, REGISTRY_ROUTE,
};
use drp_types::{DrpError, NodeConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn config(node_id: &str) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        reconnect_delay_secs: 1,
        provider_connect_attempts: 100,
        provider_connect_poll_ms: 20,
        ..NodeConfig::default()
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream message in time")
        .expect("channel open")
}

struct Mesh {
    server: RunningServer,
    registry: Arc<Registry>,
    broker: Arc<Broker>,
}

impl Mesh {
    async fn start() -> Mesh {
        let registry = Registry::new("registry-1");
        let broker = Broker::new(config("broker-1"));
        let server = MeshServer::new()
            .route(REGISTRY_ROUTE, registry.endpoint())
            .route(BROKER_ROUTE, broker.endpoint())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        broker.connect_registry(&server.url(REGISTRY_ROUTE));
        eventually("broker registration", || registry.directory().broker_count() == 1).await;
        Mesh {
            server,
            registry,
            broker,
        }
    }

    /// Start a provider with its own listener and register it.
    async fn provider(&self, id: &str, streams: &[&str]) -> (Arc<Provider>, RunningServer) {
        let provider = Provider::new(config(id));
        for stream in streams {
            provider.add_stream(stream, json!({ "Description": format!("{stream} feed") }));
        }
        let server = MeshServer::new()
            .route(PROVIDER_ROUTE, provider.endpoint())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        provider.set_provider_url(&server.url(PROVIDER_ROUTE));
        (provider, server)
    }

    async fn register(&self, provider: &Provider) {
        provider.connect_registry(&self.server.url(REGISTRY_ROUTE));
        let id = provider.id().to_string();
        eventually("provider in broker directory", || {
            self.broker.directory().provider(&id).is_some()
        })
        .await;
    }

    fn consumer(&self) -> Arc<Consumer> {
        Consumer::connect(&self.server.url(BROKER_ROUTE), config("consumer-1"))
    }

    async fn stop(self) {
        self.broker.shutdown().await;
        self.server.shutdown().await;
    }
}

#[tokio::test]
async fn test_stream_flows_from_provider_to_consumer() {
    let mesh = Mesh::start().await;
    let (provider, provider_server) = mesh.provider("prov-1", &["ticks"]).await;
    mesh.register(&provider).await;
    assert!(mesh.registry.directory().provider("prov-1").is_some());

    let consumer = mesh.consumer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio_test::assert_ok!(
        consumer
            .subscribe("ticks", None, move |payload| {
                let _ = tx.send(payload);
            })
            .await
    );
    assert_eq!(handle.providers(), &json!({"prov-1": "OKAY"}));
    assert_eq!(provider.topics().subscriber_count("ticks"), 1);

    for n in 1..=3 {
        provider.publish("ticks", json!({ "n": n }));
    }
    for n in 1..=3 {
        assert_eq!(recv(&mut rx).await, json!({ "n": n }));
    }

    tokio_test::assert_ok!(consumer.unsubscribe(&handle).await);
    eventually("provider subscription removed", || {
        provider.topics().subscriber_count("ticks") == 0
    })
    .await;
    assert_eq!(mesh.broker.relay_count(), 0);

    consumer.shutdown().await;
    provider.shutdown().await;
    provider_server.shutdown().await;
    mesh.stop().await;
}

#[tokio::test]
async fn test_unknown_command_keeps_connection_open() {
    let mesh = Mesh::start().await;
    let consumer = mesh.consumer();

    let cmds = tokio_test::assert_ok!(consumer.call("getCmds", Value::Null).await);
    let cmds: Vec<&str> = cmds
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(cmds.contains(&"subscribe"));
    assert!(cmds.contains(&"getCmds"));

    match consumer.call("fooBar", json!({})).await {
        Err(DrpError::Remote(msg)) => assert_eq!(msg, "Endpoint does not have method 'fooBar'"),
        other => panic!("Expected remote error, got {other:?}"),
    }
    assert!(consumer.is_connected());
    tokio_test::assert_ok!(consumer.call("getRegistry", Value::Null).await);

    consumer.shutdown().await;
    mesh.stop().await;
}

#[tokio::test]
async fn test_browse_and_service_through_broker() {
    let mesh = Mesh::start().await;
    let (provider, provider_server) = mesh.provider("prov-1", &["ticks"]).await;
    provider.add_path("Config", json!({ "interval": 5 }));
    provider
        .add_service(ServiceDefinition::new("Greeter").command(
            "hello",
            |p: Value, _: Arc<drp_mesh::Connection>, _: Option<u64>| async move {
                Ok(json!(format!("hello {}", p["name"].as_str().unwrap_or("?"))))
            },
        ))
        .await;
    mesh.register(&provider).await;
    let consumer = mesh.consumer();

    let listing = tokio_test::assert_ok!(consumer.get_path("Providers/prov-1/Streams", true).await);
    assert_eq!(listing["pathItemList"][0]["Name"], "ticks");

    let interval = tokio_test::assert_ok!(consumer.get_path("/Providers/prov-1/Config/interval", false).await);
    assert_eq!(interval, json!({ "pathItem": 5 }));

    let greeting = tokio_test::assert_ok!(
        consumer
            .service_cmd("Greeter", "hello", json!({ "name": "mesh" }))
            .await
    );
    assert_eq!(greeting, json!("hello mesh"));

    let missing = consumer.service_cmd("Nope", "hello", Value::Null).await;
    assert!(matches!(missing, Err(DrpError::Remote(_))));

    consumer.shutdown().await;
    provider.shutdown().await;
    provider_server.shutdown().await;
    mesh.stop().await;
}

#[tokio::test]
async fn test_late_provider_picks_up_existing_subscription() {
    let mesh = Mesh::start().await;
    let consumer = mesh.consumer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio_test::assert_ok!(
        consumer
            .subscribe("alarms", None, move |payload| {
                let _ = tx.send(payload);
            })
            .await
    );
    assert_eq!(handle.providers(), &json!({}));

    let (provider, provider_server) = mesh.provider("prov-late", &["alarms"]).await;
    mesh.register(&provider).await;
    eventually("broker resubscribed", || {
        provider.topics().subscriber_count("alarms") == 1
    })
    .await;

    provider.publish("alarms", json!("fire"));
    assert_eq!(recv(&mut rx).await, json!("fire"));

    consumer.shutdown().await;
    provider.shutdown().await;
    provider_server.shutdown().await;
    mesh.stop().await;
}

#[tokio::test]
async fn test_provider_disconnect_is_propagated() {
    let mesh = Mesh::start().await;
    let (provider, provider_server) = mesh.provider("prov-gone", &["ticks"]).await;
    mesh.register(&provider).await;

    provider.shutdown().await;
    eventually("registry dropped provider", || {
        mesh.registry.directory().provider("prov-gone").is_none()
    })
    .await;
    eventually("broker dropped provider", || {
        mesh.broker.directory().provider("prov-gone").is_none()
    })
    .await;

    provider_server.shutdown().await;
    mesh.stop().await;
}

#[tokio::test]
async fn test_consumer_disconnect_releases_provider_subscription() {
    let mesh = Mesh::start().await;
    let (provider, provider_server) = mesh.provider("prov-1", &["ticks"]).await;
    mesh.register(&provider).await;

    let consumer = mesh.consumer();
    tokio_test::assert_ok!(consumer.subscribe("ticks", None, |_| {}).await);
    assert_eq!(provider.topics().subscriber_count("ticks"), 1);

    consumer.shutdown().await;
    eventually("broker forgot consumer", || mesh.broker.consumer_count() == 0).await;
    eventually("provider subscription removed", || {
        provider.topics().subscriber_count("ticks") == 0
    })
    .await;

    provider.shutdown().await;
    provider_server.shutdown().await;
    mesh.stop().await;
}
