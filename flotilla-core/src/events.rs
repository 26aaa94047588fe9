//! Named event bus (private vs joint scope).
//!
//! Generalizes the PUB/SUB hub pattern from topic-prefix matching over a
//! wire protocol to exact-name matching over in-process channels, with one
//! extra axis: a published [`Event`] carries a [`EventScope`] that decides
//! whether it may cross a process boundary.
//!
//! - `Private` events never leave the process that published them; they
//!   exist to decouple subsystems within the broker or procman (e.g. the
//!   heartbeat monitor notifying the dispatch table) without direct calls.
//! - `Joint` events are also handed to subscribers registered as remote
//!   (i.e. backed by a transport connection rather than an in-process
//!   task), so a process such as procman can subscribe to a broker's
//!   `worker_failedHb` stream across the wire.
//!
//! Concurrency model:
//! - Single-threaded async task, same as the PUB/SUB hub.
//! - Uses `futures::select!` for runtime-agnostic multiplexing.
//! - Delivery to each subscriber preserves publication order, since each
//!   subscriber has a single channel and the hub processes one command at
//!   a time.

use flume::{Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use serde_json::Value;

/// Whether an event may be observed outside the publishing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    /// Intra-process only.
    Private,
    /// Delivered to in-process and remote (transport-backed) subscribers.
    Joint,
}

/// A named structured event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub scope: EventScope,
    pub payload: Value,
}

impl Event {
    #[must_use]
    pub fn private(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            scope: EventScope::Private,
            payload,
        }
    }

    #[must_use]
    pub fn joint(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            scope: EventScope::Joint,
            payload,
        }
    }
}

/// Opaque subscriber identity, stable for the lifetime of a subscription.
pub type SubscriberKey = u64;

/// Commands from publishers to the hub.
#[derive(Debug)]
pub enum EventsCmd {
    Publish(Event),
    Close,
}

/// Events coming from subscriber-side actors.
#[derive(Debug)]
pub enum EventsHubEvent {
    SubscriberUp {
        id: SubscriberKey,
        /// True if this subscriber is backed by a transport peer rather
        /// than an in-process task; gates delivery of `Private` events.
        remote: bool,
        tx: Sender<Event>,
    },
    SubscriberDown {
        id: SubscriberKey,
    },
    Subscribe {
        id: SubscriberKey,
        name: String,
    },
    Unsubscribe {
        id: SubscriberKey,
        name: String,
    },
}

/// Supervisor for the named event bus.
///
/// Does no I/O itself; only routes already-decoded events between
/// subscribers, same division of labor as the transport-facing hubs.
pub struct EventsHub {
    /// event name -> subscriber ids
    subs_by_name: HashMap<String, HashSet<SubscriberKey>>,
    /// subscriber id -> (is_remote, channel)
    subscribers: HashMap<SubscriberKey, (bool, Sender<Event>)>,
    hub_rx: Receiver<EventsHubEvent>,
    publish_rx: Receiver<EventsCmd>,
}

impl EventsHub {
    #[must_use]
    pub fn new(hub_rx: Receiver<EventsHubEvent>, publish_rx: Receiver<EventsCmd>) -> Self {
        Self {
            subs_by_name: HashMap::new(),
            subscribers: HashMap::new(),
            hub_rx,
            publish_rx,
        }
    }

    /// Main event loop.
    pub async fn run(mut self) {
        use futures::select;
        use futures::FutureExt;

        loop {
            select! {
                msg = self.hub_rx.recv_async().fuse() => {
                    match msg {
                        Ok(ev) => self.on_hub_event(ev),
                        Err(_) => break,
                    }
                }
                msg = self.publish_rx.recv_async().fuse() => {
                    match msg {
                        Ok(cmd) => self.on_publish_cmd(cmd),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn on_hub_event(&mut self, ev: EventsHubEvent) {
        match ev {
            EventsHubEvent::SubscriberUp { id, remote, tx } => {
                self.subscribers.insert(id, (remote, tx));
            }
            EventsHubEvent::SubscriberDown { id } => {
                self.subscribers.remove(&id);
                for subs in self.subs_by_name.values_mut() {
                    subs.remove(&id);
                }
            }
            EventsHubEvent::Subscribe { id, name } => {
                if self.subscribers.contains_key(&id) {
                    self.subs_by_name.entry(name).or_default().insert(id);
                }
            }
            EventsHubEvent::Unsubscribe { id, name } => {
                if let Some(subs) = self.subs_by_name.get_mut(&name) {
                    subs.remove(&id);
                }
            }
        }
    }

    fn on_publish_cmd(&mut self, cmd: EventsCmd) {
        match cmd {
            EventsCmd::Publish(event) => self.publish(event),
            EventsCmd::Close => {
                for (_, tx) in self.subscribers.values() {
                    drop(tx);
                }
            }
        }
    }

    fn publish(&mut self, event: Event) {
        let Some(ids) = self.subs_by_name.get(&event.name) else {
            return;
        };
        if ids.is_empty() {
            return;
        }

        for id in ids {
            let Some((remote, tx)) = self.subscribers.get(id) else {
                continue;
            };
            if *remote && event.scope == EventScope::Private {
                continue;
            }
            let _ = tx.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_events_skip_remote_subscribers() {
        let (hub_tx, hub_rx) = flume::unbounded();
        let (pub_tx, pub_rx) = flume::unbounded();
        let mut hub = EventsHub::new(hub_rx, pub_rx);

        let (local_tx, local_rx) = flume::unbounded();
        let (remote_tx, remote_rx) = flume::unbounded();

        hub_tx
            .send(EventsHubEvent::SubscriberUp {
                id: 1,
                remote: false,
                tx: local_tx,
            })
            .unwrap();
        hub_tx
            .send(EventsHubEvent::SubscriberUp {
                id: 2,
                remote: true,
                tx: remote_tx,
            })
            .unwrap();
        hub_tx
            .send(EventsHubEvent::Subscribe {
                id: 1,
                name: "process_offline".into(),
            })
            .unwrap();
        hub_tx
            .send(EventsHubEvent::Subscribe {
                id: 2,
                name: "process_offline".into(),
            })
            .unwrap();

        while let Ok(ev) = hub_rx_try(&hub) {
            hub.on_hub_event(ev);
        }

        pub_tx
            .send(EventsCmd::Publish(Event::private(
                "process_offline",
                serde_json::json!({"name": "echo"}),
            )))
            .unwrap();
        while let Ok(cmd) = pub_rx.try_recv() {
            hub.on_publish_cmd(cmd);
        }

        assert!(local_rx.try_recv().is_ok());
        assert!(remote_rx.try_recv().is_err());

        fn hub_rx_try(hub: &EventsHub) -> Result<EventsHubEvent, flume::TryRecvError> {
            hub.hub_rx.try_recv()
        }
    }

    #[test]
    fn joint_events_reach_remote_subscribers() {
        let (hub_tx, hub_rx) = flume::unbounded();
        let (pub_tx, pub_rx) = flume::unbounded();
        let mut hub = EventsHub::new(hub_rx, pub_rx);

        let (remote_tx, remote_rx) = flume::unbounded();
        hub_tx
            .send(EventsHubEvent::SubscriberUp {
                id: 1,
                remote: true,
                tx: remote_tx,
            })
            .unwrap();
        hub_tx
            .send(EventsHubEvent::Subscribe {
                id: 1,
                name: "worker_failedHb".into(),
            })
            .unwrap();
        while let Ok(ev) = hub.hub_rx.try_recv() {
            hub.on_hub_event(ev);
        }

        pub_tx
            .send(EventsCmd::Publish(Event::joint(
                "worker_failedHb",
                serde_json::json!({"name": "echo"}),
            )))
            .unwrap();
        while let Ok(cmd) = pub_rx.try_recv() {
            hub.on_publish_cmd(cmd);
        }

        assert!(remote_rx.try_recv().is_ok());
    }
}
