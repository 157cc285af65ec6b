//! Acquisition adapter contracts and the selector-driven store adapters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use mpw_core::{CheckResult, Target};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod http;
pub mod selector;

pub use http::{
    BackoffPolicy, HttpSession, HttpSessionConfig, HttpSessionFactory, RateLimit, StoreRateLimiter,
};
pub use selector::{parse_price, KeywordSearchAdapter, UrlSelectorAdapter};

pub const CRATE_NAME: &str = "mpw-adapters";

/// How a store identifies its watch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// A fixed product page per target.
    Url,
    /// A search over listings; the keyword is the identity.
    Keyword,
}

/// Per-store adapter definition from the target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub name: String,
    pub kind: StoreKind,
    #[serde(default)]
    pub price_selector: Option<String>,
    #[serde(default)]
    pub out_of_stock_selector: Option<String>,
    #[serde(default)]
    pub out_of_stock_text: Option<String>,
    #[serde(default)]
    pub thumbnail_selector: Option<String>,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub result_selector: Option<String>,
    #[serde(default)]
    pub result_title_selector: Option<String>,
    #[serde(default)]
    pub result_price_selector: Option<String>,
    #[serde(default)]
    pub result_link_selector: Option<String>,
    #[serde(default)]
    pub key_includes_store: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The listing or page no longer exists. Adapters map this to out-of-stock.
    #[error("not found: {url}")]
    NotFound { url: String },
    /// A per-target failure; recorded as a failed observation.
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    /// The shared acquisition session is unusable and must be recreated.
    #[error("acquisition session lost: {0}")]
    SessionLost(String),
    #[error("invalid store definition `{store}`: {reason}")]
    InvalidDefinition { store: String, reason: String },
}

#[derive(Debug, Error)]
#[error("cannot create acquisition session: {0}")]
pub struct SharedResourceError(pub String);

/// The expensive shared resource adapters fetch through (an HTTP client, a browser).
#[async_trait]
pub trait AcquisitionSession: Send + Sync {
    fn session_id(&self) -> Uuid;

    async fn fetch_page(&self, store: &str, url: &str) -> Result<FetchedPage, AdapterError>;

    async fn close(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn AcquisitionSession>, SharedResourceError>;
}

/// One store's way of turning a target into a normalized reading.
///
/// Ordinary "not found" conditions come back as `Ok` with out-of-stock.
/// `Err(Acquisition)` is a per-target failure, `Err(SessionLost)` asks the
/// caller to recreate the session.
#[async_trait]
pub trait AcquisitionAdapter: Send + Sync {
    fn store(&self) -> &str;

    fn kind(&self) -> StoreKind;

    async fn check(
        &self,
        session: &dyn AcquisitionSession,
        target: &Target,
    ) -> Result<CheckResult, AdapterError>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AcquisitionAdapter>>,
    fold_store: HashSet<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build selector adapters for every valid definition; invalid ones are skipped.
    pub fn from_definitions(definitions: &[StoreDefinition]) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            match adapter_for_definition(definition) {
                Ok(adapter) => registry.register(adapter, definition.key_includes_store),
                Err(err) => warn!(store = %definition.name, error = %err, "skipping store definition"),
            }
        }
        registry
    }

    /// Register (or replace) the adapter for its store.
    pub fn register(&mut self, adapter: Arc<dyn AcquisitionAdapter>, fold_store_into_key: bool) {
        let store = adapter.store().to_string();
        if fold_store_into_key {
            self.fold_store.insert(store.clone());
        } else {
            self.fold_store.remove(&store);
        }
        self.adapters.insert(store, adapter);
    }

    /// Overlay `other` on top of this registry.
    pub fn merge(&mut self, other: &AdapterRegistry) {
        for (store, adapter) in &other.adapters {
            self.register(adapter.clone(), other.fold_store.contains(store));
        }
    }

    pub fn get(&self, store: &str) -> Option<Arc<dyn AcquisitionAdapter>> {
        self.adapters.get(store).cloned()
    }

    pub fn fold_store_into_key(&self, store: &str) -> bool {
        self.fold_store.contains(store)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

pub fn adapter_for_definition(
    definition: &StoreDefinition,
) -> Result<Arc<dyn AcquisitionAdapter>, AdapterError> {
    match definition.kind {
        StoreKind::Url => Ok(Arc::new(UrlSelectorAdapter::new(definition.clone())?)),
        StoreKind::Keyword => Ok(Arc::new(KeywordSearchAdapter::new(definition.clone())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, kind: StoreKind) -> StoreDefinition {
        StoreDefinition {
            name: name.into(),
            kind,
            price_selector: Some(".price".into()),
            out_of_stock_selector: None,
            out_of_stock_text: None,
            thumbnail_selector: None,
            search_url: None,
            result_selector: None,
            result_title_selector: None,
            result_price_selector: None,
            result_link_selector: None,
            key_includes_store: name == "compare",
        }
    }

    #[test]
    fn registry_skips_incomplete_definitions() {
        let registry = AdapterRegistry::from_definitions(&[
            definition("camera-shop", StoreKind::Url),
            definition("compare", StoreKind::Url),
            definition("flea", StoreKind::Keyword),
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("flea").is_none());
        assert_eq!(registry.get("camera-shop").unwrap().kind(), StoreKind::Url);
        assert!(registry.fold_store_into_key("compare"));
        assert!(!registry.fold_store_into_key("camera-shop"));
    }

    #[test]
    fn merge_overrides_by_store_name() {
        let mut base = AdapterRegistry::from_definitions(&[definition("camera-shop", StoreKind::Url)]);
        let mut overlay = AdapterRegistry::new();
        let mut folded = definition("camera-shop", StoreKind::Url);
        folded.price_selector = Some("#price".into());
        overlay.register(adapter_for_definition(&folded).unwrap(), true);
        base.merge(&overlay);
        assert_eq!(base.len(), 1);
        assert!(base.fold_store_into_key("camera-shop"));
    }
}
