//! Core types for the DRP mesh.
//!
//! This crate defines the data structures shared by every node role and the
//! command-line tool: the error taxonomy, node configuration, and the
//! declarations providers and brokers publish to the registry. It contains
//! no networking.

pub mod config;
pub mod declaration;
pub mod error;

pub use config::{load_config, parse_config, NodeConfig, WebhookConfig};
pub use declaration::{ProviderDeclaration, ServiceDeclaration};
pub use error::{DrpError, DrpResult};
