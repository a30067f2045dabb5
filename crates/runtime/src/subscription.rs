//! Subscriptions to output tables.
//!
//! Subscribers register a callback per output. The callback is invoked once
//! per closed time in which the output changed, and an optional end callback
//! runs when the runtime finishes.

use crate::change_set::ChangeSet;
use hashbrown::HashMap;

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback receiving the changes of one batch.
pub type ChangeCallback = Box<dyn FnMut(&ChangeSet) + Send>;

/// Callback invoked once at the end of the stream.
pub type EndCallback = Box<dyn FnMut() + Send>;

/// A subscription to one output.
pub struct Subscription {
    id: SubscriptionId,
    on_change: ChangeCallback,
    on_end: Option<EndCallback>,
    active: bool,
}

impl Subscription {
    pub fn new<F>(id: SubscriptionId, on_change: F) -> Self
    where
        F: FnMut(&ChangeSet) + Send + 'static,
    {
        Self {
            id,
            on_change: Box::new(on_change),
            on_end: None,
            active: true,
        }
    }

    /// Adds a callback run when the stream ends.
    pub fn with_end<F>(mut self, on_end: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_end = Some(Box::new(on_end));
        self
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Delivers a change set. Empty sets are not delivered.
    pub fn notify(&mut self, changes: &ChangeSet) {
        if self.active && !changes.is_empty() {
            (self.on_change)(changes);
        }
    }

    /// Signals the end of the stream; later calls do nothing.
    pub fn finish(&mut self) {
        if !self.active {
            return;
        }
        if let Some(on_end) = self.on_end.as_mut() {
            on_end();
        }
        self.active = false;
    }
}

/// Subscriptions of one output.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    next_id: SubscriptionId,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Subscribes with a change callback.
    pub fn subscribe<F>(&mut self, on_change: F) -> SubscriptionId
    where
        F: FnMut(&ChangeSet) + Send + 'static,
    {
        let id = self.allocate();
        self.subscriptions.insert(id, Subscription::new(id, on_change));
        id
    }

    /// Subscribes with a change callback and an end-of-stream callback.
    pub fn subscribe_with_end<F, E>(&mut self, on_change: F, on_end: E) -> SubscriptionId
    where
        F: FnMut(&ChangeSet) + Send + 'static,
        E: FnMut() + Send + 'static,
    {
        let id = self.allocate();
        self.subscriptions
            .insert(id, Subscription::new(id, on_change).with_end(on_end));
        id
    }

    fn allocate(&mut self) -> SubscriptionId {
        self.next_id = self.next_id.max(1);
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Notifies subscriptions in id order.
    pub fn notify_all(&mut self, changes: &ChangeSet) {
        for id in self.subscription_ids() {
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                sub.notify(changes);
            }
        }
    }

    pub fn finish_all(&mut self) {
        for id in self.subscription_ids() {
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                sub.finish();
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Returns all subscription ids, sorted.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.subscriptions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
