//! Subscription service: debounced, filtered delivery of model changes.
//!
//! Subscriptions are scoped to one document URI. Incoming changes accumulate
//! in a per-subscription buffer; a debounce timer (at most one armed per
//! subscription) coalesces bursts into a single delivered batch. Subscriber
//! callbacks are fallible and isolated: one failing subscriber never affects
//! the others or the service itself.

use crate::error::ExecuteError;
use crate::services::clock::SharedClock;
use crate::types::{
    ChangeEventType, ModelChangeEvent, ModelSnapshot, NodeChange, SubscribeOptions,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

/// Delivery callback. Errors are logged per subscriber, never propagated.
pub type SubscriberCallback = Arc<dyn Fn(ModelChangeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Supplies the current projection of a document, keyed by URI. Consulted
/// lazily at flush time when a subscription wants content.
pub type ContentProvider = Arc<dyn Fn(&str) -> Option<ModelSnapshot> + Send + Sync>;

/// Inspection view of one live subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub debounce_ms: u64,
}

struct Subscription {
    id: String,
    uri: String,
    callback: SubscriberCallback,
    debounce: Duration,
    node_types: Option<Vec<String>>,
    include_content: bool,
    client_id: Option<String>,
    /// Changes accumulated since the last flush, in arrival order.
    pending: Vec<NodeChange>,
    pending_type: ChangeEventType,
    pending_version: u64,
    pending_content: Option<Value>,
    /// The armed debounce timer, if any. Always aborted before re-arming.
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<String, Subscription>,
    by_uri: HashMap<String, HashSet<String>>,
    by_client: HashMap<String, HashSet<String>>,
}

impl State {
    fn remove(&mut self, id: &str) -> bool {
        let Some(subscription) = self.subscriptions.remove(id) else {
            return false;
        };
        if let Some(timer) = subscription.timer {
            timer.abort();
        }
        if let Some(ids) = self.by_uri.get_mut(&subscription.uri) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_uri.remove(&subscription.uri);
            }
        }
        if let Some(client_id) = &subscription.client_id {
            if let Some(ids) = self.by_client.get_mut(client_id) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_client.remove(client_id);
                }
            }
        }
        true
    }
}

struct Inner {
    state: Mutex<State>,
    provider: ContentProvider,
    default_debounce: Duration,
    max_debounce: Duration,
    clock: SharedClock,
}

impl Inner {
    /// Deliver a subscription's accumulated buffer as one event.
    fn flush(self: &Arc<Self>, id: &str) {
        let (callback, mut event, wants_content) = {
            let mut state = self.state.lock().unwrap();
            let Some(subscription) = state.subscriptions.get_mut(id) else {
                return;
            };
            subscription.timer = None;

            let changes = std::mem::take(&mut subscription.pending);
            if changes.is_empty() && subscription.pending_type == ChangeEventType::Update {
                return;
            }

            let event = ModelChangeEvent {
                event_type: subscription.pending_type,
                uri: subscription.uri.clone(),
                version: subscription.pending_version,
                timestamp: self.clock.now_utc(),
                changes,
                content: subscription.pending_content.take(),
            };
            (
                subscription.callback.clone(),
                event,
                subscription.include_content,
            )
        };

        if wants_content && event.content.is_none() {
            event.content = (self.provider)(&event.uri).map(|snapshot| snapshot.content);
        }

        deliver(&callback, event);
    }
}

fn deliver(callback: &SubscriberCallback, event: ModelChangeEvent) {
    let id_context = (event.uri.clone(), event.event_type);
    if let Err(error) = callback(event) {
        tracing::warn!(
            "subscriber callback for '{}' failed on {:?} event: {}",
            id_context.0,
            id_context.1,
            error
        );
    }
}

/// Manages all subscriptions for one model server instance.
pub struct SubscriptionService {
    inner: Arc<Inner>,
}

impl SubscriptionService {
    /// Create a service that fetches lazy content through `provider`.
    pub fn new(
        provider: ContentProvider,
        default_debounce: Duration,
        max_debounce: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                provider,
                default_debounce,
                max_debounce,
                clock,
            }),
        }
    }

    /// Register a subscription for `uri`.
    ///
    /// The requested debounce window is clamped into `[0, max]`. With
    /// `options.immediate` a synthetic initial event is delivered before
    /// this call returns.
    pub fn subscribe(
        &self,
        uri: &str,
        callback: SubscriberCallback,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, ExecuteError> {
        Url::parse(uri).map_err(|_| ExecuteError::InvalidUri(uri.to_string()))?;

        let requested = options
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(self.inner.default_debounce);
        let debounce = requested.min(self.inner.max_debounce);
        if debounce < requested {
            tracing::debug!(
                "debounce window {:?} clamped to {:?} for '{}'",
                requested,
                debounce,
                uri
            );
        }

        let id = Uuid::new_v4().to_string();
        let subscription = Subscription {
            id: id.clone(),
            uri: uri.to_string(),
            callback: callback.clone(),
            debounce,
            node_types: options.node_types.clone(),
            include_content: options.include_content,
            client_id: options.client_id.clone(),
            pending: Vec::new(),
            pending_type: ChangeEventType::Update,
            pending_version: 0,
            pending_content: None,
            timer: None,
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state
                .by_uri
                .entry(uri.to_string())
                .or_default()
                .insert(id.clone());
            if let Some(client_id) = &options.client_id {
                state
                    .by_client
                    .entry(client_id.clone())
                    .or_default()
                    .insert(id.clone());
            }
            state.subscriptions.insert(id.clone(), subscription);
        }

        tracing::debug!("subscription {} registered for '{}'", id, uri);

        if options.immediate {
            let snapshot = if options.include_content {
                (self.inner.provider)(uri)
            } else {
                None
            };
            let event = ModelChangeEvent {
                event_type: ChangeEventType::Initial,
                uri: uri.to_string(),
                version: snapshot.as_ref().map(|s| s.version).unwrap_or(0),
                timestamp: self.inner.clock.now_utc(),
                changes: Vec::new(),
                content: snapshot.map(|s| s.content),
            };
            deliver(&callback, event);
        }

        Ok(SubscriptionHandle {
            id,
            uri: uri.to_string(),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Fan one document change out to every subscription under `uri`.
    ///
    /// `content`, when supplied by the caller, is attached as-is to
    /// content-requesting subscriptions; otherwise content is fetched lazily
    /// at flush time.
    pub fn notify_change(
        &self,
        uri: &str,
        change_type: ChangeEventType,
        version: u64,
        changes: Vec<NodeChange>,
        content: Option<Value>,
    ) {
        let mut flush_now = Vec::new();

        {
            let mut state = self.inner.state.lock().unwrap();
            let Some(ids) = state.by_uri.get(uri).cloned() else {
                return;
            };

            for id in ids {
                let Some(subscription) = state.subscriptions.get_mut(&id) else {
                    continue;
                };

                let surviving: Vec<NodeChange> = match &subscription.node_types {
                    Some(types) => changes
                        .iter()
                        .filter(|change| types.contains(&change.node_type))
                        .cloned()
                        .collect(),
                    None => changes.clone(),
                };

                // An update that no surviving change justifies is dropped for
                // this subscriber; saved/closed always go through.
                if surviving.is_empty() && change_type == ChangeEventType::Update {
                    continue;
                }

                subscription.pending.extend(surviving);
                subscription.pending_type = change_type;
                subscription.pending_version = version;
                if subscription.include_content && content.is_some() {
                    subscription.pending_content = content.clone();
                }

                if let Some(timer) = subscription.timer.take() {
                    timer.abort();
                }

                if subscription.debounce.is_zero() {
                    flush_now.push(id.clone());
                } else {
                    let weak = Arc::downgrade(&self.inner);
                    let timer_id = id.clone();
                    let deadline = tokio::time::Instant::now() + subscription.debounce;
                    subscription.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep_until(deadline).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.flush(&timer_id);
                        }
                    }));
                }
            }
        }

        for id in flush_now {
            self.inner.flush(&id);
        }
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.inner.state.lock().unwrap().remove(id);
        if removed {
            tracing::debug!("subscription {} removed", id);
        } else {
            tracing::warn!("cannot remove unknown subscription {}", id);
        }
        removed
    }

    /// Remove every subscription owned by `client_id`. Returns how many
    /// were removed.
    pub fn on_client_disconnect(&self, client_id: &str) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        let Some(ids) = state.by_client.remove(client_id) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if state.remove(&id) {
                removed += 1;
            }
        }
        tracing::info!(
            "client '{}' disconnected, removed {} subscription(s)",
            client_id,
            removed
        );
        removed
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().unwrap().subscriptions.len()
    }

    /// Inspection views of all live subscriptions, sorted by id.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let state = self.inner.state.lock().unwrap();
        let mut infos: Vec<SubscriptionInfo> = state
            .subscriptions
            .values()
            .map(|subscription| SubscriptionInfo {
                id: subscription.id.clone(),
                uri: subscription.uri.clone(),
                client_id: subscription.client_id.clone(),
                debounce_ms: subscription.debounce.as_millis() as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Drop every subscription and cancel all timers. Used at shutdown.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for subscription in state.subscriptions.values_mut() {
            if let Some(timer) = subscription.timer.take() {
                timer.abort();
            }
        }
        let count = state.subscriptions.len();
        state.subscriptions.clear();
        state.by_uri.clear();
        state.by_client.clear();
        if count > 0 {
            tracing::info!("subscription service disposed, dropped {} subscription(s)", count);
        }
    }
}

impl std::fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// Caller-facing handle to one subscription.
pub struct SubscriptionHandle {
    id: String,
    uri: String,
    inner: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether the subscription is still registered.
    pub fn is_active(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner
                .state
                .lock()
                .unwrap()
                .subscriptions
                .contains_key(&self.id),
            None => false,
        }
    }

    /// Unsubscribe. Safe to call more than once.
    pub fn dispose(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().unwrap().remove(&self.id);
        }
    }
}
