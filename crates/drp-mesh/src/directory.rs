//! Mesh directory: who provides what.
//!
//! The [`MeshDirectory`] is a thread-safe table of provider declarations and
//! registered brokers. The registry owns the authoritative copy; brokers keep
//! a local mirror bootstrapped from `getDeclarations` and kept current by
//! the registry's relayed changes.

use chrono::{DateTime, Utc};
use drp_types::ProviderDeclaration;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// A registered provider.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub declaration: ProviderDeclaration,
    /// Connection the provider registered over, if it registered directly.
    pub conn_id: Option<u64>,
    pub registered_at: DateTime<Utc>,
}

/// A registered broker.
#[derive(Debug, Clone)]
pub struct BrokerEntry {
    pub broker_id: String,
    pub conn_id: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    providers: HashMap<String, ProviderEntry>,
    brokers: HashMap<String, BrokerEntry>,
}

/// Thread-safe directory of providers and brokers.
#[derive(Debug, Clone, Default)]
pub struct MeshDirectory {
    tables: Arc<RwLock<Tables>>,
}

impl MeshDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a provider. Returns `true` if it was new.
    pub fn register_provider(&self, declaration: ProviderDeclaration, conn_id: Option<u64>) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let id = declaration.provider_id.clone();
        tables
            .providers
            .insert(
                id,
                ProviderEntry {
                    declaration,
                    conn_id,
                    registered_at: Utc::now(),
                },
            )
            .is_none()
    }

    pub fn unregister_provider(&self, provider_id: &str) -> Option<ProviderEntry> {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .providers
            .remove(provider_id)
    }

    pub fn provider(&self, provider_id: &str) -> Option<ProviderDeclaration> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .providers
            .get(provider_id)
            .map(|p| p.declaration.clone())
    }

    /// All declarations keyed by provider id.
    pub fn declarations(&self) -> BTreeMap<String, ProviderDeclaration> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .providers
            .iter()
            .map(|(id, p)| (id.clone(), p.declaration.clone()))
            .collect()
    }

    /// Replace every provider with `declarations` (bootstrap from the registry).
    pub fn replace_declarations(&self, declarations: BTreeMap<String, ProviderDeclaration>) {
        let now = Utc::now();
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.providers = declarations
            .into_iter()
            .map(|(id, mut declaration)| {
                if declaration.provider_id.is_empty() {
                    declaration.provider_id = id.clone();
                }
                (
                    id,
                    ProviderEntry {
                        declaration,
                        conn_id: None,
                        registered_at: now,
                    },
                )
            })
            .collect();
    }

    /// Providers whose declaration lists `topic` among its streams, sorted by id.
    pub fn providers_for_stream(&self, topic: &str) -> Vec<ProviderDeclaration> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<ProviderDeclaration> = tables
            .providers
            .values()
            .filter(|p| p.declaration.has_stream(topic))
            .map(|p| p.declaration.clone())
            .collect();
        found.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        found
    }

    /// Provider ids registered over `conn_id`.
    pub fn providers_owned_by(&self, conn_id: u64) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .providers
            .values()
            .filter(|p| p.conn_id == Some(conn_id))
            .map(|p| p.declaration.provider_id.clone())
            .collect()
    }

    pub fn register_broker(&self, broker_id: &str, conn_id: u64) {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .brokers
            .insert(
                broker_id.to_string(),
                BrokerEntry {
                    broker_id: broker_id.to_string(),
                    conn_id,
                    registered_at: Utc::now(),
                },
            );
    }

    pub fn unregister_broker(&self, broker_id: &str) -> Option<BrokerEntry> {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .brokers
            .remove(broker_id)
    }

    pub fn brokers_owned_by(&self, conn_id: u64) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .brokers
            .values()
            .filter(|b| b.conn_id == conn_id)
            .map(|b| b.broker_id.clone())
            .collect()
    }

    pub fn brokers(&self) -> Vec<BrokerEntry> {
        let mut brokers: Vec<BrokerEntry> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .brokers
            .values()
            .cloned()
            .collect();
        brokers.sort_by(|a, b| a.broker_id.cmp(&b.broker_id));
        brokers
    }

    pub fn provider_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .providers
            .len()
    }

    pub fn broker_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .brokers
            .len()
    }
}
