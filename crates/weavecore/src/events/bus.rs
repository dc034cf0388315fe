//! Publish/subscribe bus for run lifecycle events.
//!
//! Hooks are invoked synchronously, in subscription order, on the task that
//! publishes. A failing or panicking hook is logged and skipped. Every event
//! is also sent on a broadcast channel for consumers that prefer a stream.

use super::base::{EventKind, Hook, WorkflowEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every kind
    kind: Option<EventKind>,
    hook: Arc<dyn Hook>,
}

/// Cloning shares subscriptions and the broadcast channel
#[derive(Clone)]
pub struct HookBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HookBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            sender,
        }
    }

    pub async fn subscribe(&self, kind: EventKind, hook: impl Hook + 'static) -> SubscriptionId {
        self.add(Some(kind), Arc::new(hook)).await
    }

    pub async fn subscribe_all(&self, hook: impl Hook + 'static) -> SubscriptionId {
        self.add(None, Arc::new(hook)).await
    }

    async fn add(&self, kind: Option<EventKind>, hook: Arc<dyn Hook>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .await
            .push(Subscription { id, kind, hook });
        id
    }

    /// Returns whether the subscription existed
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Receiver of every event published from now on
    pub fn stream(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event. Returns how many hooks failed or panicked.
    pub async fn publish(&self, event: WorkflowEvent) -> usize {
        let hooks: Vec<(SubscriptionId, Arc<dyn Hook>)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == event.kind))
            .map(|s| (s.id, Arc::clone(&s.hook)))
            .collect();

        let mut failures = 0;
        for (id, hook) in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(subscription = id, event = %event.kind, "Hook error: {}", e);
                }
                Err(_) => {
                    failures += 1;
                    warn!(subscription = id, event = %event.kind, "Hook panicked");
                }
            }
        }

        let _ = self.sender.send(event);
        failures
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HookError;
    use crate::state::WorkflowState;
    use crate::workflow::StepId;
    use std::sync::atomic::AtomicUsize;

    fn event(kind: EventKind) -> WorkflowEvent {
        WorkflowEvent::new(kind, &WorkflowState::new("wf".into(), &Vec::<StepId>::new()))
    }

    #[tokio::test]
    async fn hooks_filtered_by_kind() {
        let bus = HookBus::new(16);
        let started = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let s = started.clone();
        bus.subscribe(EventKind::StepStarted, move |_: &WorkflowEvent| -> Result<(), HookError> {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        let a = all.clone();
        bus.subscribe_all(move |_: &WorkflowEvent| -> Result<(), HookError> {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        bus.publish(event(EventKind::StepStarted)).await;
        bus.publish(event(EventKind::StepSucceeded)).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_and_panicking_hooks_are_contained() {
        let bus = HookBus::new(16);
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe_all(|_: &WorkflowEvent| -> Result<(), HookError> {
            Err(HookError("boom".into()))
        })
            .await;
        bus.subscribe_all(|_: &WorkflowEvent| -> Result<(), HookError> { panic!("hook bug") })
            .await;
        let r = reached.clone();
        bus.subscribe_all(move |_: &WorkflowEvent| -> Result<(), HookError> {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        let failures = bus.publish(event(EventKind::WorkflowStarted)).await;
        assert_eq!(failures, 2);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = HookBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus
            .subscribe_all(move |_: &WorkflowEvent| -> Result<(), HookError> {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        bus.publish(event(EventKind::WorkflowCompleted)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_receives_events() {
        let bus = HookBus::new(16);
        let mut rx = bus.stream();
        bus.publish(event(EventKind::StepRetried).for_step("a").with_attempt(2))
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::StepRetried);
        assert_eq!(received.attempt, Some(2));
    }
}
