//! DRP mesh: declarative resource protocol networking.
//!
//! Nodes exchange JSON `cmd` / `reply` / `stream` frames over WebSockets
//! using the `drp` subprotocol. On top of that endpoint protocol sit four
//! roles that together form a publish/subscribe and service mesh.
//!
//! ## Architecture
//!
//! - **Endpoint**: command table and frame router shared by a route's connections
//! - **Connection**: per-socket session (token counter, reply and stream handlers)
//! - **Registry**: authoritative directory of providers and brokers
//! - **Broker**: consumer entry point; relays provider streams and browses the mesh
//! - **Provider**: publishes topics and hosts services
//! - **Consumer**: subscribes through a broker, optionally into a webhook
//! - **MeshServer / MeshClient**: listening and initiating WebSocket transports

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod directory;
pub mod endpoint;
pub mod message;
pub mod path;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod topic;
pub mod transport;
pub mod webhook;

pub use broker::{Broker, BROKER_ROUTE, REGISTRY_UPDATE_TOPIC};
pub use connection::Connection;
pub use consumer::{Consumer, WatchHandle};
pub use directory::MeshDirectory;
pub use endpoint::{method, CommandHandler, ConnectionHooks, Endpoint};
pub use message::{CmdPacket, Packet, ReplyPacket, StreamPacket};
pub use path::{PathNode, PathRequest};
pub use provider::{Provider, ServiceDefinition, PROVIDER_ROUTE};
pub use registry::{Registry, REGISTRY_ROUTE};
pub use relay::{RelayHandle, RelaySink};
pub use topic::TopicManager;
pub use transport::client::{ClientOptions, MeshClient, ReconnectPolicy};
pub use transport::listener::{MeshServer, RunningServer};
