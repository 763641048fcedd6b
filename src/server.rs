//! Model server façade consumed by protocol bindings.
//!
//! Owns the open-document table and composes the tree converter with the
//! subscription service: queries project documents through the converter,
//! and editor lifecycle hooks (changed/saved/closed) fan out through the
//! subscription service.

use crate::config::ServerConfig;
use crate::convert::{
    find_node_by_id, find_nodes_by_type, get_node_by_path, ConvertOptions, ConvertedTree,
    TreeConverter,
};
use crate::error::ExecuteError;
use crate::node::AstNode;
use crate::services::clock::{SharedClock, SystemClock};
use crate::subscriptions::{ContentProvider, SubscriberCallback, SubscriptionService};
use crate::types::{
    ChangeEventType, ModelSnapshot, NodeChange, SubscribeRequest, SubscribeResponse,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A partial-model query against one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelQuery {
    /// Node with the given synthetic or declared id.
    ById(String),
    /// All nodes of the given type.
    ByType(String),
    /// Node at a dot-and-bracket path such as `states[0].name`.
    ByPath(String),
}

struct DocumentEntry {
    root: Arc<dyn AstNode>,
    version: u64,
}

type DocumentTable = Arc<RwLock<HashMap<String, DocumentEntry>>>;

/// The façade: full/partial model queries, subscriptions, and document
/// lifecycle hooks.
pub struct ModelServer {
    documents: DocumentTable,
    converter: TreeConverter,
    subscriptions: SubscriptionService,
}

impl ModelServer {
    /// Create a server on the system clock.
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a server with an injected clock (tests).
    pub fn with_clock(config: &ServerConfig, clock: SharedClock) -> Self {
        let documents: DocumentTable = Arc::new(RwLock::new(HashMap::new()));
        let converter = TreeConverter::new(ConvertOptions::from_config(config));

        let provider_documents = Arc::clone(&documents);
        let provider_converter = converter.clone();
        let provider: ContentProvider = Arc::new(move |uri| {
            let documents = provider_documents.read().unwrap();
            documents.get(uri).map(|entry| ModelSnapshot {
                version: entry.version,
                content: provider_converter.convert(&entry.root).data,
            })
        });

        Self {
            documents,
            converter,
            subscriptions: SubscriptionService::new(
                provider,
                config.default_debounce(),
                config.max_debounce(),
                clock,
            ),
        }
    }

    /// The subscription service, for hosts that wire notifications directly.
    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    /// Full projection of one document.
    pub fn get_model(&self, uri: &str) -> Result<ConvertedTree, ExecuteError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ExecuteError::InternalError("document table poisoned".to_string()))?;
        let entry = documents
            .get(uri)
            .ok_or_else(|| ExecuteError::NodeNotFound(format!("no open document for '{uri}'")))?;
        Ok(self.converter.convert(&entry.root))
    }

    /// Partial projection of one document.
    pub fn get_model_partial(&self, uri: &str, query: &ModelQuery) -> Result<Value, ExecuteError> {
        let tree = self.get_model(uri)?;
        match query {
            ModelQuery::ById(id) => find_node_by_id(&tree.data, id)
                .cloned()
                .ok_or_else(|| ExecuteError::NodeNotFound(format!("no node with id '{id}'"))),
            ModelQuery::ByType(node_type) => Ok(Value::Array(
                find_nodes_by_type(&tree.data, node_type)
                    .into_iter()
                    .cloned()
                    .collect(),
            )),
            ModelQuery::ByPath(path) => get_node_by_path(&tree.data, path).map(Value::clone),
        }
    }

    /// Register a subscription for change events on one document URI.
    pub fn subscribe(
        &self,
        request: SubscribeRequest,
        callback: SubscriberCallback,
    ) -> Result<SubscribeResponse, ExecuteError> {
        let handle = self
            .subscriptions
            .subscribe(&request.uri, callback, request.options)?;
        Ok(SubscribeResponse {
            subscription_id: handle.id().to_string(),
            uri: handle.uri().to_string(),
        })
    }

    /// Remove one subscription.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.unsubscribe(subscription_id)
    }

    /// Remove every subscription owned by a disconnected client.
    pub fn client_disconnected(&self, client_id: &str) -> usize {
        self.subscriptions.on_client_disconnect(client_id)
    }

    /// Number of open documents.
    pub fn document_count(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Track a newly opened document.
    pub fn document_opened(&self, uri: &str, root: Arc<dyn AstNode>, version: u64) {
        self.documents
            .write()
            .unwrap()
            .insert(uri.to_string(), DocumentEntry { root, version });
        tracing::debug!("document '{}' opened at version {}", uri, version);
    }

    /// Replace a document's model and fan the change out to subscribers.
    /// Content is not computed here; subscriptions that want it fetch it
    /// lazily at flush time.
    pub fn document_changed(
        &self,
        uri: &str,
        version: u64,
        root: Arc<dyn AstNode>,
        changes: Vec<NodeChange>,
    ) {
        self.documents
            .write()
            .unwrap()
            .insert(uri.to_string(), DocumentEntry { root, version });
        self.subscriptions
            .notify_change(uri, ChangeEventType::Update, version, changes, None);
    }

    /// Forward a save notification to subscribers.
    pub fn document_saved(&self, uri: &str) {
        let version = self
            .documents
            .read()
            .unwrap()
            .get(uri)
            .map(|entry| entry.version)
            .unwrap_or(0);
        self.subscriptions
            .notify_change(uri, ChangeEventType::Saved, version, Vec::new(), None);
    }

    /// Forward a close notification to subscribers, then drop the document.
    pub fn document_closed(&self, uri: &str) {
        let version = self
            .documents
            .read()
            .unwrap()
            .get(uri)
            .map(|entry| entry.version)
            .unwrap_or(0);
        self.subscriptions
            .notify_change(uri, ChangeEventType::Closed, version, Vec::new(), None);
        if self.documents.write().unwrap().remove(uri).is_some() {
            tracing::debug!("document '{}' closed", uri);
        }
    }

    /// Dispose all subscriptions. Used at process shutdown.
    pub fn shutdown(&self) {
        self.subscriptions.dispose();
        tracing::info!("model server shut down");
    }
}

impl std::fmt::Debug for ModelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelServer")
            .field("documents", &self.document_count())
            .field("subscriptions", &self.subscriptions.subscription_count())
            .finish()
    }
}
