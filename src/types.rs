//! Shared data model: operation declarations, execution contexts, wire
//! requests/results, and change-notification events.

use crate::node::AstNode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ExecuteError;

/// Licensing level attached to an authenticated user.
///
/// Ordering is capability ordering: `Free < Pro < Enterprise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionTier::Free => write!(f, "free"),
            SubscriptionTier::Pro => write!(f, "pro"),
            SubscriptionTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Caller identity forwarded by the protocol binding, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub id: String,
    pub tier: SubscriptionTier,
}

/// Node types an operation declares itself applicable to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetTypes {
    /// Applies to every node type.
    Any,
    /// Applies only to the listed node types.
    Types(Vec<String>),
}

impl TargetTypes {
    /// Whether any of `types` is targeted by this declaration.
    pub fn intersects(&self, types: &[&str]) -> bool {
        match self {
            TargetTypes::Any => true,
            TargetTypes::Types(declared) => {
                types.iter().any(|t| declared.iter().any(|d| d == t))
            }
        }
    }
}

/// How an operation is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Caller waits for the result, racing the sync timeout.
    #[default]
    Sync,
    /// A job is created and the handler runs in the background.
    Async,
}

/// Licensing gate on an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequirement {
    /// The operation refuses anonymous callers.
    #[serde(default)]
    pub requires_auth: bool,

    /// Minimum tier the caller must hold, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tier: Option<SubscriptionTier>,
}

/// Static metadata for one operation. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDeclaration {
    pub id: String,
    pub category: String,
    pub target_types: TargetTypes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licensing: Option<LicenseRequirement>,
    #[serde(default)]
    pub execution: ExecutionMode,
}

/// Progress reporting callback handed to handlers. Values are clamped to
/// `[0, 100]` downstream, so out-of-range reports are harmless.
pub type ProgressFn = Arc<dyn Fn(i32, Option<String>) + Send + Sync>;

/// The future an operation handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// An operation handler: a pure function of context and progress callback.
/// The context is moved into the call, so a handler cannot retain it.
pub type OperationHandler = Arc<dyn Fn(OperationContext, ProgressFn) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into the registerable [`OperationHandler`] shape.
pub fn operation_handler<F, Fut>(f: F) -> OperationHandler
where
    F: Fn(OperationContext, ProgressFn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx, progress| Box::pin(f(ctx, progress)))
}

/// A declaration bound to its handler and owning language.
#[derive(Clone)]
pub struct RegisteredOperation {
    pub declaration: OperationDeclaration,
    pub handler: OperationHandler,
    pub language_id: String,
}

impl std::fmt::Debug for RegisteredOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredOperation")
            .field("declaration", &self.declaration)
            .field("language_id", &self.language_id)
            .finish()
    }
}

/// How a caller names the document an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub uri: String,
}

impl DocumentReference {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// A resolved document: identity plus the parsed model root.
#[derive(Clone)]
pub struct DocumentHandle {
    pub uri: String,
    pub language_id: String,
    pub version: u64,
    pub root: Arc<dyn AstNode>,
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("uri", &self.uri)
            .field("language_id", &self.language_id)
            .field("version", &self.version)
            .finish()
    }
}

/// Per-invocation value object handed to handlers. Built once, then moved
/// into the handler call.
#[derive(Clone)]
pub struct OperationContext {
    pub document: DocumentHandle,
    pub selected_ids: Vec<String>,
    pub input: Option<Value>,
    pub user: Option<AuthenticatedUser>,
    pub correlation_id: String,
    pub language_id: String,
    pub uri: String,
}

/// One operation invocation as received from a protocol binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub language_id: String,
    pub operation_id: String,
    pub document: DocumentReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthenticatedUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Outcome of one invocation. For async operations `success` means the job
/// was created; the job carries the eventual result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ExecuteResult {
    /// Successful synchronous completion.
    pub fn completed(result: Option<Value>, correlation_id: String, duration_ms: u64) -> Self {
        Self {
            success: true,
            result,
            job_id: None,
            error: None,
            correlation_id,
            duration_ms: Some(duration_ms),
        }
    }

    /// Async dispatch accepted; the handler runs in the background.
    pub fn accepted(job_id: String, correlation_id: String) -> Self {
        Self {
            success: true,
            result: None,
            job_id: Some(job_id),
            error: None,
            correlation_id,
            duration_ms: None,
        }
    }

    /// Any failure, before or during handler execution.
    pub fn failure(error: &ExecuteError, correlation_id: String, duration_ms: Option<u64>) -> Self {
        Self {
            success: false,
            result: None,
            job_id: None,
            error: Some(error.to_string()),
            correlation_id,
            duration_ms,
        }
    }
}

/// Kind of a change notification delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventType {
    Initial,
    Update,
    Saved,
    Closed,
}

/// Atomic record of one model mutation; the type tag drives filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl NodeChange {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            node_id: None,
            path: None,
        }
    }
}

/// One delivered notification: an ordered batch of accumulated changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelChangeEvent {
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    pub uri: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<NodeChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Current projection of a document, as served by a content provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub version: u64,
    pub content: Value,
}

/// Per-subscription delivery options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    /// Debounce window in milliseconds; clamped into `[0, max]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,

    /// Only changes with these node types are delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_types: Option<Vec<String>>,

    /// Attach the current model projection to delivered events.
    #[serde(default)]
    pub include_content: bool,

    /// Deliver a synthetic initial event on subscribe.
    #[serde(default)]
    pub immediate: bool,

    /// Owning client; used for bulk removal on disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Subscription request as received from a protocol binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub uri: String,
    #[serde(default)]
    pub options: SubscribeOptions,
}

/// Acknowledgement returned to the subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: String,
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Free < SubscriptionTier::Pro);
        assert!(SubscriptionTier::Pro < SubscriptionTier::Enterprise);
    }

    #[test]
    fn test_target_types_intersection() {
        let any = TargetTypes::Any;
        assert!(any.intersects(&["Entity"]));
        assert!(any.intersects(&[]));

        let entity_only = TargetTypes::Types(vec!["Entity".to_string()]);
        assert!(entity_only.intersects(&["Entity", "Property"]));
        assert!(!entity_only.intersects(&["Property"]));
        assert!(!entity_only.intersects(&[]));
    }

    #[test]
    fn test_declaration_deserializes_with_defaults() {
        let decl: OperationDeclaration = serde_json::from_str(
            r#"{"id": "rename", "category": "refactor", "targetTypes": {"types": ["Entity"]}}"#,
        )
        .unwrap();
        assert_eq!(decl.execution, ExecutionMode::Sync);
        assert!(decl.licensing.is_none());
    }

    #[test]
    fn test_execute_result_shapes() {
        let ok = ExecuteResult::completed(None, "c1".to_string(), 12);
        assert!(ok.success);
        assert_eq!(ok.duration_ms, Some(12));

        let accepted = ExecuteResult::accepted("job-a".to_string(), "c2".to_string());
        assert!(accepted.success);
        assert_eq!(accepted.job_id.as_deref(), Some("job-a"));

        let failed = ExecuteResult::failure(
            &ExecuteError::AuthenticationRequired,
            "c3".to_string(),
            None,
        );
        assert!(!failed.success);
        assert!(failed.error.is_some());
    }

    #[test]
    fn test_change_event_serializes_camel_case() {
        let event = ModelChangeEvent {
            event_type: ChangeEventType::Update,
            uri: "model://m".to_string(),
            version: 3,
            timestamp: chrono::Utc::now(),
            changes: vec![NodeChange::new("Entity")],
            content: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["changes"][0]["nodeType"], "Entity");
        assert!(json.get("content").is_none());
    }
}
