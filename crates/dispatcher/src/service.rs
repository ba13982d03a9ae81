//! Per-service routing runtime: one inbound `Assocket` (receives frames the
//! service publishes) and one outbound `Acsocket` pool (forwards them to
//! every other loaded service that subscribes), tied together by shared,
//! `Rc<RefCell<_>>`-guarded state (`spec.md §4.D`).
//!
//! Both the inbound and outbound chain objects belong to the same `Chain`,
//! so a frame routed during one reactor iteration is handed to the
//! outbound pool's send queue before that same iteration's `post_select`
//! pass finishes — no extra tick of latency. The outbound `Acsocket` itself
//! is wrapped in `Rc<RefCell<_>>` rather than owned directly by its
//! `ChainObject` wrapper so the inbound handler can reach it too; the two
//! never borrow it re-entrantly because `Chain::run` calls every object's
//! `post_select` sequentially, never nested.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jiukun_slab::Jiukun;
use mio::net::UnixListener;
use mio::{Events, Registry};
use netchain::{Acsocket, AsocketHandler, AsocketId, Assocket, ChainObject, ConnHandle, DisconnectReason, Outbox};

use crate::backoff::ReconnectBackoff;
use crate::config::{ServiceConfig, MAX_MSG_SIZE};
use crate::frame::{Frame, FrameHeader};
use crate::queue::{EnqueueOutcome, SubscriberQueue};

/// `spec.md §4.D`: "Per-peer connection state machine `Init -> Connecting
/// -> Connected`, `Connecting -> Failed -> ReconnectAfter(backoff) ->
/// Connecting` on dial error, `Connected -> ReconnectAfter(backoff)` on
/// disconnect." A subscriber never reaches a terminal closed state on its
/// own — it keeps retrying for the dispatcher's whole lifetime, same as the
/// original's "a lost subscriber connection is always worth reconnecting."
/// `Dispatcher::stop`'s best-effort drain (`DispatcherStopHandle::stop`)
/// happens above this state machine, via the dispatcher-wide
/// `pending_total` counter, rather than as a per-peer state: every reactor
/// iteration already forwards a connected subscriber's entire queue before
/// returning, so there is no partially-drained state for a peer to sit in
/// between iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Init,
    Connecting,
    Connected,
    ReconnectAfter(std::time::Instant),
}

struct SubscriberRuntime {
    target_service: String,
    socket_path: PathBuf,
    max_msg_size: u32,
    /// The ids `target_service` actually subscribes to, cloned from its
    /// `ServiceConfig` at construction (config is immutable after load —
    /// `spec.md §5`). `ServiceRuntime::spawn` only admits a target into
    /// `subscribers` when it subscribes to *some* id this service
    /// publishes, but `route_frame` still has to check *this specific*
    /// frame's id against *this* subscriber's own set before enqueueing —
    /// a service publishing more than one id would otherwise fan every one
    /// of them out to every subscriber regardless of what each actually
    /// asked for (`spec.md §8` property 7).
    subscribed_ids: Vec<u32>,
    conn: Option<ConnHandle>,
    state: PeerState,
    backoff: ReconnectBackoff,
    queue: SubscriberQueue,
    paused: Arc<AtomicBool>,
}

impl SubscriberRuntime {
    fn new(target: &ServiceConfig, socket_dir: &Path) -> Self {
        Self {
            target_service: target.name.clone(),
            socket_path: socket_dir.join(&target.messaging_in),
            max_msg_size: target.max_msg_size,
            subscribed_ids: target.subscribed.iter().map(|m| m.id).collect(),
            conn: None,
            state: PeerState::Init,
            backoff: ReconnectBackoff::default(),
            queue: SubscriberQueue::new(target.max_num_msg as usize),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    fn subscribes(&self, message_id: u32) -> bool {
        self.subscribed_ids.contains(&message_id)
    }
}

/// State shared between a service's inbound and outbound handlers.
struct ServiceShared {
    config: ServiceConfig,
    subscribers: Vec<SubscriberRuntime>,
    /// Maps an `Acsocket` slot (the `AsocketId` callbacks are keyed by) to
    /// the subscriber currently bound to it. A slot is reused by whichever
    /// subscriber next dials successfully after its previous occupant
    /// disconnects, so this cannot be derived from `subscribers`' index —
    /// it is the single source of truth for "which subscriber is this
    /// callback about".
    slot_to_subscriber: HashMap<AsocketId, usize>,
}

impl ServiceShared {
    fn subscriber_mut(&mut self, target: &str) -> Option<&mut SubscriberRuntime> {
        self.subscribers.iter_mut().find(|s| s.target_service == target)
    }

    fn subscriber_by_slot(&mut self, slot: AsocketId) -> Option<&mut SubscriberRuntime> {
        let idx = *self.slot_to_subscriber.get(&slot)?;
        self.subscribers.get_mut(idx)
    }
}

struct ServerHandler {
    shared: Rc<RefCell<ServiceShared>>,
    pending_total: Arc<AtomicUsize>,
}

impl ServerHandler {
    fn route_frame(&self, frame: Frame) {
        let mut shared = self.shared.borrow_mut();
        if !shared.config.publishes(frame.header.message_id) {
            tracing::warn!(
                service = %shared.config.name,
                message_id = frame.header.message_id,
                "dropping frame: message id not in this service's published set"
            );
            return;
        }

        for sub in &mut shared.subscribers {
            if !sub.subscribes(frame.header.message_id) {
                continue;
            }

            if frame.payload.len() as u32 > sub.max_msg_size {
                tracing::warn!(
                    target = %sub.target_service,
                    len = frame.payload.len(),
                    limit = sub.max_msg_size,
                    "dropping frame pre-enqueue: exceeds subscriber's max_msg_size"
                );
                continue;
            }

            match sub.queue.enqueue(frame.clone()) {
                EnqueueOutcome::Enqueued => {
                    self.pending_total.fetch_add(1, Ordering::Relaxed);
                }
                EnqueueOutcome::EnqueuedAfterEviction => {
                    self.pending_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(target = %sub.target_service, "evicted oldest low-priority frame on queue overflow");
                }
                EnqueueOutcome::Dropped => {
                    tracing::warn!(target = %sub.target_service, "subscriber queue full; dropping arriving lowest-priority frame");
                }
            }
        }
    }
}

impl AsocketHandler for ServerHandler {
    fn on_connect(&mut self, _id: AsocketId, _result: io::Result<()>) {}

    fn on_data(&mut self, _id: AsocketId, data: &[u8], _outbox: &mut dyn Outbox) -> usize {
        let mut consumed = 0;
        loop {
            let Some(header) = FrameHeader::decode(&data[consumed..]) else {
                break;
            };
            if header.payload_len > MAX_MSG_SIZE {
                tracing::error!(
                    message_id = header.message_id,
                    declared = header.payload_len,
                    "corrupted frame header on inbound stream; discarding buffered bytes"
                );
                return data.len();
            }
            match Frame::try_decode(&data[consumed..]) {
                Some((frame, used)) => {
                    consumed += used;
                    self.route_frame(frame);
                }
                None => break,
            }
        }
        consumed
    }

    fn on_disconnect(&mut self, _id: AsocketId, _reason: DisconnectReason) {}
    fn on_send_data(&mut self, _id: AsocketId, _result: io::Result<()>) {}
}

struct ClientHandler {
    shared: Rc<RefCell<ServiceShared>>,
}

impl AsocketHandler for ClientHandler {
    fn on_connect(&mut self, id: AsocketId, result: io::Result<()>) {
        let mut shared = self.shared.borrow_mut();
        let Some(sub) = shared.subscriber_by_slot(id) else {
            return;
        };
        match result {
            Ok(()) => {
                tracing::info!(target = %sub.target_service, "connected to subscriber");
                sub.state = PeerState::Connected;
                sub.backoff.reset();
            }
            Err(e) => {
                tracing::warn!(target = %sub.target_service, error = %e, "dial to subscriber failed, will retry");
                sub.conn = None;
                sub.state = PeerState::ReconnectAfter(Instant::now() + sub.backoff.next_delay());
            }
        }
    }

    fn on_data(&mut self, _id: AsocketId, data: &[u8], _outbox: &mut dyn Outbox) -> usize {
        // Subscribers never send application data back upstream in this
        // protocol; drain and discard anything they write.
        data.len()
    }

    fn on_disconnect(&mut self, id: AsocketId, reason: DisconnectReason) {
        let mut shared = self.shared.borrow_mut();
        let Some(sub) = shared.subscriber_by_slot(id) else {
            return;
        };
        tracing::warn!(target = %sub.target_service, reason = ?reason, "lost connection to subscriber, scheduling reconnect");
        sub.conn = None;
        sub.state = PeerState::ReconnectAfter(Instant::now() + sub.backoff.next_delay());
        // The `Acsocket` frees this slot for reuse once it observes the
        // asocket has gone `Closed`; drop the mapping now so a future
        // subscriber that claims the same slot isn't attributed to us.
        shared.slot_to_subscriber.remove(&id);
    }

    fn on_send_data(&mut self, id: AsocketId, result: io::Result<()>) {
        if let Err(e) = result {
            tracing::warn!(id, error = %e, "send to subscriber failed");
        }
    }
}

/// Thin `ChainObject` delegating to a shared `Acsocket`, so the handler
/// that owns the same `Rc` can also call `send`/`connect_to` on it between
/// reactor iterations.
struct SharedAcsocket {
    shared: Rc<RefCell<ServiceShared>>,
    acsocket: Rc<RefCell<Acsocket>>,
    pending_total: Arc<AtomicUsize>,
}

impl SharedAcsocket {
    /// Advance every subscriber's connection state machine and forward as
    /// many queued frames as the (now-established) connections allow.
    /// Always called after `Acsocket::post_select` has returned, so this
    /// borrow of `acsocket` never nests inside that one.
    fn service_tick(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let mut shared = self.shared.borrow_mut();
        let mut acsocket = self.acsocket.borrow_mut();

        for (idx, sub) in shared.subscribers.iter_mut().enumerate() {
            let should_dial = match sub.state {
                PeerState::Init => true,
                PeerState::ReconnectAfter(at) => at <= now,
                _ => false,
            };
            if should_dial {
                match acsocket.connect_to(&sub.socket_path) {
                    Ok(handle) => {
                        shared.slot_to_subscriber.insert(handle.raw(), idx);
                        sub.conn = Some(handle);
                        sub.state = PeerState::Connecting;
                    }
                    Err(e) => {
                        tracing::warn!(target = %sub.target_service, error = %e, "could not claim slot / dial subscriber, will retry");
                        sub.state = PeerState::ReconnectAfter(now + sub.backoff.next_delay());
                    }
                }
            }

            let forwarding = sub.state == PeerState::Connected;
            if forwarding && !sub.paused.load(Ordering::Relaxed) {
                while let Some(frame) = sub.queue.drain_next() {
                    if let Some(handle) = sub.conn {
                        let _ = acsocket.send(handle, frame.encode());
                    }
                    self.pending_total.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl ChainObject for SharedAcsocket {
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        self.acsocket.borrow_mut().register(registry)
    }

    fn pre_select(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .borrow()
            .subscribers
            .iter()
            .filter_map(|s| match s.state {
                PeerState::ReconnectAfter(at) => Some(at.saturating_duration_since(now)),
                PeerState::Init => Some(Duration::ZERO),
                _ => None,
            })
            .min()
    }

    fn post_select(&mut self, events: &Events) -> io::Result<()> {
        self.acsocket.borrow_mut().post_select(events)?;
        self.service_tick()
    }
}

/// One loaded service's complete routing runtime: its inbound listener and
/// its pool of outbound connections to every subscriber.
pub(crate) struct ServiceRuntime {
    shared: Rc<RefCell<ServiceShared>>,
}

impl ServiceRuntime {
    /// Build the runtime for `config`, computing its subscriber list from
    /// every other loaded `all_configs` entry that subscribes to a message
    /// this service publishes, and append its chain objects.
    pub(crate) fn spawn(
        config: ServiceConfig,
        all_configs: &[ServiceConfig],
        socket_dir: &Path,
        pool: &Arc<Jiukun>,
        pending_total: &Arc<AtomicUsize>,
        chain: &mut netchain::Chain,
    ) -> io::Result<Self> {
        let subscribers: Vec<SubscriberRuntime> = all_configs
            .iter()
            .filter(|other| other.name != config.name)
            .filter(|other| config.published.iter().any(|m| other.subscribes(m.id)))
            .map(|other| SubscriberRuntime::new(other, socket_dir))
            .collect();

        let listener_path = socket_dir.join(&config.messaging_in);
        let _ = std::fs::remove_file(&listener_path);
        let listener = UnixListener::bind(&listener_path)?;

        let shared = Rc::new(RefCell::new(ServiceShared {
            config,
            subscribers,
            slot_to_subscriber: HashMap::new(),
        }));

        // Both chain objects below share this chain's token sequence
        // (`netchain::TokenAllocator`), so the listener, every connection it
        // accepts, and every slot the outbound pool dials get distinct
        // `mio::Token`s even though they're minted by two different objects.
        let tokens = chain.token_allocator();

        let server_handler: Rc<RefCell<dyn AsocketHandler>> = Rc::new(RefCell::new(ServerHandler {
            shared: Rc::clone(&shared),
            pending_total: Arc::clone(pending_total),
        }));
        let assocket = Assocket::new(listener, tokens.clone(), 64, Arc::clone(pool), server_handler);
        chain.append(Box::new(assocket))?;

        let capacity = shared.borrow().subscribers.len().max(1);
        let client_handler: Rc<RefCell<dyn AsocketHandler>> = Rc::new(RefCell::new(ClientHandler {
            shared: Rc::clone(&shared),
        }));
        let acsocket = Rc::new(RefCell::new(Acsocket::new(
            capacity,
            tokens,
            Arc::clone(pool),
            client_handler,
        )));
        chain.append(Box::new(SharedAcsocket {
            shared: Rc::clone(&shared),
            acsocket,
            pending_total: Arc::clone(pending_total),
        }))?;

        Ok(Self { shared })
    }

    #[must_use]
    pub(crate) fn name(&self) -> String {
        self.shared.borrow().config.name.clone()
    }

    /// `spec.md §4.D`: `pause_subscriber`/`resume_subscriber`.
    pub(crate) fn set_subscriber_paused(&self, target: &str, paused: bool) -> bool {
        let mut shared = self.shared.borrow_mut();
        let Some(sub) = shared.subscriber_mut(target) else {
            return false;
        };
        sub.paused.store(paused, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageConfig;

    fn config_with(name: &str, published: &[u32], subscribed: &[u32]) -> ServiceConfig {
        let to_messages = |ids: &[u32]| {
            ids.iter()
                .map(|&id| MessageConfig {
                    id,
                    description: String::new(),
                })
                .collect()
        };
        ServiceConfig {
            version: "1.0".to_string(),
            name: name.to_string(),
            user_name: "nobody".to_string(),
            messaging_in: format!("{name}-in"),
            messaging_out: format!("{name}-out"),
            max_num_msg: 10,
            max_msg_size: 4096,
            published: to_messages(published),
            subscribed: to_messages(subscribed),
        }
    }

    /// `spec.md §8` property 7: a frame with id `m` is delivered to every
    /// service that subscribes `m`, and to no other — including other
    /// subscribers of the *same* publisher that asked for a different id.
    #[test]
    fn route_frame_only_enqueues_subscribers_of_this_message_id() {
        let socket_dir = PathBuf::from("/tmp");
        let publisher_cfg = config_with("publisher", &[101, 202], &[]);
        let b_cfg = config_with("b", &[], &[101]);
        let c_cfg = config_with("c", &[], &[202]);

        let shared = Rc::new(RefCell::new(ServiceShared {
            config: publisher_cfg,
            subscribers: vec![
                SubscriberRuntime::new(&b_cfg, &socket_dir),
                SubscriberRuntime::new(&c_cfg, &socket_dir),
            ],
            slot_to_subscriber: HashMap::new(),
        }));

        let handler = ServerHandler {
            shared: Rc::clone(&shared),
            pending_total: Arc::new(AtomicUsize::new(0)),
        };

        handler.route_frame(Frame::new(202, 1, 0, b"x".to_vec()));

        let shared = shared.borrow();
        assert!(
            shared.subscribers[0].queue.is_empty(),
            "b subscribes only 101; must not receive a 202 frame"
        );
        assert!(
            !shared.subscribers[1].queue.is_empty(),
            "c subscribes 202; must receive it"
        );
    }

    #[test]
    fn route_frame_fans_out_to_every_matching_subscriber() {
        let socket_dir = PathBuf::from("/tmp");
        let publisher_cfg = config_with("publisher", &[101], &[]);
        let b_cfg = config_with("b", &[], &[101]);
        let c_cfg = config_with("c", &[], &[101]);

        let shared = Rc::new(RefCell::new(ServiceShared {
            config: publisher_cfg,
            subscribers: vec![
                SubscriberRuntime::new(&b_cfg, &socket_dir),
                SubscriberRuntime::new(&c_cfg, &socket_dir),
            ],
            slot_to_subscriber: HashMap::new(),
        }));

        let handler = ServerHandler {
            shared: Rc::clone(&shared),
            pending_total: Arc::new(AtomicUsize::new(0)),
        };

        handler.route_frame(Frame::new(101, 1, 0, b"x".to_vec()));

        let shared = shared.borrow();
        assert!(!shared.subscribers[0].queue.is_empty());
        assert!(!shared.subscribers[1].queue.is_empty());
    }
}
