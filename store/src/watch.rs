//! The Watch Hub (§4.4): fans committed events out to per-subscription
//! ordered channels, matching each event's key against the subscription's
//! range and filters. Delivery is best-effort but bounded: a subscriber that
//! falls behind for longer than the configured grace period is cancelled
//! rather than allowed to stall the hub indefinitely.
//!
//! Event history isn't kept past the live keyspace, so a subscription that
//! asks to start at an old revision is caught up with a synthesized batch of
//! `Put` events for whatever currently-live keys fall in its range, not a
//! byte-for-byte replay of what actually happened since that revision — see
//! DESIGN.md for why this reading of §9's "historical watch synthesis" open
//! question was chosen.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    error::CoreError,
    header_gen::HeaderGenerator,
    rpc::{Event, EventType, KeyRange, KeyValue, WatchCreateRequest, WatchResponse},
};

/// Largest number of events one `WatchResponse` carries when the
/// subscription requested fragmentation; otherwise a single response carries
/// however many events one publish produced.
const DEFAULT_FRAGMENT_SIZE: usize = 128;

struct Subscription {
    id: i64,
    range: KeyRange,
    filters: Vec<i32>,
    want_prev_kv: bool,
    fragment: bool,
    progress_notify: bool,
    tx: mpsc::Sender<WatchResponse>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        let key = event.kv.as_ref().map(|kv| kv.key.as_slice()).unwrap_or(&[]);
        if !self.range.contains(key) {
            return false;
        }
        self.filters.iter().all(|filter| match *filter {
            1 => event.r#type != EventType::Put as i32,
            2 => event.r#type != EventType::Delete as i32,
            _ => true,
        })
    }

    fn project(&self, mut event: Event) -> Event {
        if !self.want_prev_kv {
            event.prev_kv = None;
        }
        event
    }
}

/// Owns every live watch subscription. Held behind an `Arc` and shared by
/// the apply loop (publishes events after every commit), the front-end
/// facing `Engine::watch`/`Engine::cancel_watch` methods, and the progress
/// notifier task.
#[derive(Debug)]
pub struct WatchHub {
    subscriptions: RwLock<HashMap<i64, Subscription>>,
    next_id: AtomicI64,
    channel_size: usize,
    send_timeout: Duration,
    fragment_size: usize,
    header_gen: Arc<HeaderGenerator>,
}

impl WatchHub {
    /// Build an empty hub. `channel_size` bounds each subscriber's event
    /// queue; `send_timeout` is the slow-consumer grace period (§4.4,
    /// default 5s per `utils::config::TimeoutConfig::watch_send_timeout`).
    pub fn new(
        header_gen: Arc<HeaderGenerator>,
        channel_size: usize,
        send_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            channel_size,
            send_timeout,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            header_gen: Arc::clone(&header_gen),
        })
    }

    /// Register a new subscription and deliver its `created` acknowledgement
    /// plus a synthesized catch-up batch built from `initial_kvs` (the
    /// caller — `Engine::watch` — has already resolved `start_revision`
    /// against the compacted/current revision and supplies whatever
    /// currently-live keys fall in range when `start_revision > 0`; an empty
    /// `initial_kvs` means no catch-up is needed).
    ///
    /// # Errors
    /// Returns [`CoreError::AlreadyExists`] if the caller requested a
    /// specific `watch_id` that is already in use.
    pub fn subscribe(
        self: &Arc<Self>,
        req: WatchCreateRequest,
        initial_kvs: Vec<KeyValue>,
    ) -> Result<(i64, mpsc::Receiver<WatchResponse>), CoreError> {
        let mut subs = self.subscriptions.write();
        let watch_id = if req.watch_id != 0 {
            if subs.contains_key(&req.watch_id) {
                return Err(CoreError::AlreadyExists(format!(
                    "watch id {} already in use",
                    req.watch_id
                )));
            }
            req.watch_id
        } else {
            self.next_id.fetch_add(1, Ordering::AcqRel)
        };

        let (tx, rx) = mpsc::channel(self.channel_size.max(1));
        let sub = Subscription {
            id: watch_id,
            range: KeyRange::new(req.key, req.range_end),
            filters: req.filters,
            want_prev_kv: req.prev_kv,
            fragment: req.fragment,
            progress_notify: req.progress_notify,
            tx: tx.clone(),
        };
        let _ignore = subs.insert(watch_id, sub);
        drop(subs);

        let _ignore = tx.try_send(WatchResponse {
            header: Some(self.header_gen.gen_header()),
            watch_id,
            created: true,
            canceled: false,
            compact_revision: 0,
            cancel_reason: String::new(),
            events: Vec::new(),
        });

        if !initial_kvs.is_empty() {
            let events: Vec<Event> = initial_kvs
                .into_iter()
                .map(|kv| EventType::Put.event(kv, None))
                .collect();
            for chunk in events.chunks(self.fragment_size.max(1)) {
                let _ignore = tx.try_send(WatchResponse {
                    header: Some(self.header_gen.gen_header()),
                    watch_id,
                    created: false,
                    canceled: false,
                    compact_revision: 0,
                    cancel_reason: String::new(),
                    events: chunk.to_vec(),
                });
            }
        }

        Ok((watch_id, rx))
    }

    /// Cancel a subscription. Idempotent via a once-guard at the map level:
    /// the first call removes the subscription and delivers a `canceled`
    /// response; any later call for the same id (already cancelled, or
    /// never existed) finds nothing left to remove and is a no-op success,
    /// so concurrent cancellers can't race each other into an error.
    pub fn cancel(&self, watch_id: i64, reason: &str) -> Result<(), CoreError> {
        let Some(sub) = self.subscriptions.write().remove(&watch_id) else {
            return Ok(());
        };
        let _ignore = sub.tx.try_send(WatchResponse {
            header: Some(self.header_gen.gen_header()),
            watch_id,
            created: false,
            canceled: true,
            compact_revision: 0,
            cancel_reason: reason.to_string(),
            events: Vec::new(),
        });
        Ok(())
    }

    /// Fan `events` (produced by one apply) out to every matching
    /// subscription, in the order given. Never blocks the apply loop: each
    /// subscriber's delivery is either immediate (room in its channel) or
    /// handed off to a bounded background wait, so one slow watcher can't
    /// stall the single apply task (§5).
    pub fn publish(self: &Arc<Self>, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let subs = self.subscriptions.read();
        for sub_id in subs.keys().copied().collect::<Vec<_>>() {
            let Some(matched) = subs.get(&sub_id).map(|sub| {
                let hits: Vec<Event> = events
                    .iter()
                    .filter(|event| sub.matches(event))
                    .cloned()
                    .map(|event| sub.project(event))
                    .collect();
                (hits, sub.fragment, sub.tx.clone())
            }) else {
                continue;
            };
            let (hits, fragment, tx) = matched;
            if hits.is_empty() {
                continue;
            }
            let fragment_size = if fragment { self.fragment_size } else { usize::MAX };
            for chunk in hits.chunks(fragment_size.max(1)) {
                self.deliver(sub_id, tx.clone(), chunk.to_vec());
            }
        }
    }

    fn deliver(self: &Arc<Self>, watch_id: i64, tx: mpsc::Sender<WatchResponse>, events: Vec<Event>) {
        let response = WatchResponse {
            header: Some(self.header_gen.gen_header()),
            watch_id,
            created: false,
            canceled: false,
            compact_revision: 0,
            cancel_reason: String::new(),
            events,
        };
        if tx.try_send(response.clone()).is_ok() {
            return;
        }
        let hub = Arc::clone(self);
        let deadline = self.send_timeout;
        tokio::spawn(async move {
            let delivered = matches!(
                tokio::time::timeout(deadline, tx.send(response)).await,
                Ok(Ok(()))
            );
            if !delivered {
                warn!(watch_id, "slow watch subscriber exceeded send deadline; cancelling");
                let _ignore = hub.cancel(watch_id, "slow consumer");
            }
        });
    }

    /// Send a no-op progress marker (§9 "Watch progress notifications") to
    /// every subscription that requested `progress_notify`, carrying just
    /// the current revision. Called on a fixed interval by the caller (a
    /// `tokio::time::interval` loop the `Engine` facade owns) rather than by
    /// the hub itself, so tests can drive it deterministically.
    pub fn notify_progress(&self) {
        let subs = self.subscriptions.read();
        for sub in subs.values().filter(|sub| sub.progress_notify) {
            let _ignore = sub.tx.try_send(WatchResponse {
                header: Some(self.header_gen.gen_header()),
                watch_id: sub.id,
                created: false,
                canceled: false,
                compact_revision: 0,
                cancel_reason: String::new(),
                events: Vec::new(),
            });
        }
    }

    /// Number of currently-live subscriptions, for diagnostics/tests.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<WatchHub> {
        WatchHub::new(
            Arc::new(HeaderGenerator::new(1, 1)),
            16,
            Duration::from_millis(100),
        )
    }

    fn put_event(key: &str) -> Event {
        EventType::Put.event(
            KeyValue {
                key: key.as_bytes().to_vec(),
                create_revision: 1,
                mod_revision: 1,
                version: 1,
                value: b"v".to_vec(),
                lease: 0,
            },
            None,
        )
    }

    fn create_request(key: &str, range_end: &[u8]) -> WatchCreateRequest {
        WatchCreateRequest {
            key: key.as_bytes().to_vec(),
            range_end: range_end.to_vec(),
            start_revision: 0,
            progress_notify: false,
            filters: Vec::new(),
            prev_kv: false,
            watch_id: 0,
            fragment: false,
        }
    }

    #[tokio::test]
    async fn subscribing_delivers_a_created_acknowledgement() {
        let hub = hub();
        let (watch_id, mut rx) = hub.subscribe(create_request("a", &[]), Vec::new()).unwrap();
        let first = rx.recv().await.unwrap();
        assert!(first.created);
        assert_eq!(first.watch_id, watch_id);
    }

    #[tokio::test]
    async fn publish_only_reaches_subscriptions_whose_range_matches() {
        let hub = hub();
        let (_, mut matching) = hub.subscribe(create_request("a", &[]), Vec::new()).unwrap();
        let (_, mut other) = hub.subscribe(create_request("z", &[]), Vec::new()).unwrap();
        let _created = matching.recv().await.unwrap();
        let _created = other.recv().await.unwrap();

        hub.publish(&[put_event("a")]);

        let delivered = matching.recv().await.unwrap();
        assert_eq!(delivered.events.len(), 1);
        assert_eq!(delivered.events[0].kv.as_ref().unwrap().key, b"a");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn prev_kv_is_stripped_unless_requested() {
        let hub = hub();
        let mut req = create_request("a", &[]);
        req.prev_kv = false;
        let (_, mut rx) = hub.subscribe(req, Vec::new()).unwrap();
        let _created = rx.recv().await.unwrap();

        let mut event = put_event("a");
        event.prev_kv = Some(KeyValue {
            key: b"a".to_vec(),
            create_revision: 0,
            mod_revision: 0,
            version: 0,
            value: Vec::new(),
            lease: 0,
        });
        hub.publish(&[event]);

        let delivered = rx.recv().await.unwrap();
        assert!(delivered.events[0].prev_kv.is_none());
    }

    #[tokio::test]
    async fn no_put_filter_drops_put_events() {
        let hub = hub();
        let mut req = create_request("a", &[]);
        req.filters = vec![1];
        let (_, mut rx) = hub.subscribe(req, Vec::new()).unwrap();
        let _created = rx.recv().await.unwrap();

        hub.publish(&[put_event("a")]);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_a_second_call_is_a_no_op_success() {
        let hub = hub();
        let (watch_id, _rx) = hub.subscribe(create_request("a", &[]), Vec::new()).unwrap();
        hub.cancel(watch_id, "client requested").unwrap();
        hub.cancel(watch_id, "client requested").unwrap();
        assert_eq!(hub.subscription_count(), 0);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_watch_id_is_also_a_no_op_success() {
        let hub = hub();
        hub.cancel(999, "client requested").unwrap();
    }

    #[tokio::test]
    async fn subscribing_with_a_duplicate_explicit_id_fails() {
        let hub = hub();
        let mut req = create_request("a", &[]);
        req.watch_id = 42;
        let _ = hub.subscribe(req.clone(), Vec::new()).unwrap();
        assert!(matches!(
            hub.subscribe(req, Vec::new()),
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn a_slow_subscriber_is_eventually_cancelled() {
        let header_gen = Arc::new(HeaderGenerator::new(1, 1));
        let hub = WatchHub::new(header_gen, 1, Duration::from_millis(30));
        let (watch_id, mut rx) = hub.subscribe(create_request("a", &[]), Vec::new()).unwrap();
        let _created = rx.recv().await.unwrap();

        // Fill the bounded channel without draining it, then publish past
        // capacity so the delivery has to fall back to the bounded wait.
        hub.publish(&[put_event("a")]);
        hub.publish(&[put_event("a")]);
        hub.publish(&[put_event("a")]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.subscription_count(), 0);
        drop(rx);
    }
}
