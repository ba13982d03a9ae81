//! Per-connection async socket state (`spec.md §4.C`).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use jiukun_slab::Jiukun;
use mio::net::UnixStream;
use mio::{Events, Interest, Registry, Token};

use crate::buffer::JiukunBuffer;
use crate::error::DisconnectReason;
use crate::invariants::debug_assert_no_callback_after_disconnect;
use crate::ChainObject;

pub type AsocketId = usize;

/// `spec.md §3`: `{idle, connecting, connected, closing, closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Capability handed to `on_data`/`on_connect` so a handler can queue an
/// outbound send on the same connection without holding a back-reference
/// to the owning `Asocket` (`spec.md` DESIGN NOTES: "never form owning
/// cycles" — the handler is never given anything that outlives the call).
pub trait Outbox {
    fn send(&mut self, data: Vec<u8>);
}

struct SendQueueOutbox<'a>(&'a mut VecDeque<PendingSend>);

impl Outbox for SendQueueOutbox<'_> {
    fn send(&mut self, data: Vec<u8>) {
        self.0.push_back(PendingSend { data, offset: 0 });
    }
}

/// Replaces the C callback-plus-user-data idiom: the owner of one or more
/// asockets implements this and stores its own per-connection state
/// (`spec.md` DESIGN NOTES: "implementers store their own state in the
/// implementer type").
pub trait AsocketHandler {
    /// Connect attempt completed (only fires for client-initiated sockets).
    fn on_connect(&mut self, id: AsocketId, result: io::Result<()>);
    /// New bytes are available in `[begin, end)` of the receive buffer.
    /// Returns the number of bytes consumed; unconsumed bytes are
    /// preserved across calls. `outbox` lets the handler queue a reply on
    /// this same connection (e.g. an echo service) without reaching back
    /// into the `Asocket`.
    fn on_data(&mut self, id: AsocketId, data: &[u8], outbox: &mut dyn Outbox) -> usize;
    /// The connection ended; always the last callback for `id`.
    fn on_disconnect(&mut self, id: AsocketId, reason: DisconnectReason);
    /// A queued send either completed or failed.
    fn on_send_data(&mut self, id: AsocketId, result: io::Result<()>);
}

struct PendingSend {
    data: Vec<u8>,
    offset: usize,
}

/// One stream connection driven by the reactor.
pub struct Asocket {
    id: AsocketId,
    stream: UnixStream,
    token: Token,
    state: ConnState,
    recv_buf: JiukunBuffer,
    send_queue: VecDeque<PendingSend>,
    handler: Rc<RefCell<dyn AsocketHandler>>,
    disconnected: bool,
    /// Opaque tag the owner may stash in `on_connect` (`spec.md §3`:
    /// "owner back-pointer, user tag").
    pub user_tag: Option<u64>,
}

const DEFAULT_RECV_CAP: usize = 4096;
const MAX_RECV_CAP: usize = 1 << 20;

impl Asocket {
    /// Wrap an already-connected stream (the `Assocket` accept path).
    pub fn connected(
        id: AsocketId,
        stream: UnixStream,
        token: Token,
        pool: Arc<Jiukun>,
        handler: Rc<RefCell<dyn AsocketHandler>>,
    ) -> Self {
        Self {
            id,
            stream,
            token,
            state: ConnState::Connected,
            recv_buf: JiukunBuffer::new(pool, DEFAULT_RECV_CAP, MAX_RECV_CAP),
            send_queue: VecDeque::new(),
            handler,
            disconnected: false,
            user_tag: None,
        }
    }

    /// Begin a non-blocking outbound connection (the `Acsocket` dial path).
    pub fn connecting(
        id: AsocketId,
        stream: UnixStream,
        token: Token,
        pool: Arc<Jiukun>,
        handler: Rc<RefCell<dyn AsocketHandler>>,
    ) -> Self {
        Self {
            id,
            stream,
            token,
            state: ConnState::Connecting,
            recv_buf: JiukunBuffer::new(pool, DEFAULT_RECV_CAP, MAX_RECV_CAP),
            send_queue: VecDeque::new(),
            handler,
            disconnected: false,
            user_tag: None,
        }
    }

    /// Raw access for owners (`Assocket`/`Acsocket`) that register this
    /// socket's fd with a chain's `Registry` on the caller's behalf.
    pub(crate) fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    #[must_use]
    pub fn id(&self) -> AsocketId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Queue bytes for sending. Always accepted; backpressure is handled
    /// by the caller observing queue depth if it cares (the dispatcher's
    /// per-subscriber queue owns admission control — `spec.md §4.D`).
    pub fn send(&mut self, data: Vec<u8>) {
        self.send_queue.push_back(PendingSend { data, offset: 0 });
    }

    /// Close the local side, delivering `on_disconnect(LocalClose)` on the
    /// next `post_select`. Used by per-operation utimer timeouts
    /// (`spec.md §4.C`: "Cancellation / timeouts").
    pub fn close(&mut self) {
        if self.state != ConnState::Closed && self.state != ConnState::Closing {
            self.state = ConnState::Closing;
        }
    }

    fn fail(&mut self, reason: DisconnectReason) {
        self.state = ConnState::Closed;
        debug_assert_no_callback_after_disconnect!(self.disconnected);
        if !self.disconnected {
            self.disconnected = true;
            self.handler.borrow_mut().on_disconnect(self.id, reason);
        }
    }
}

impl ChainObject for Asocket {
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        // Always register both directions: `post_select` filters on
        // current `state`, so a spurious writable event while idle is
        // simply ignored (mirrors the original setting both read and
        // write bits liberally and letting post-select decide what to act
        // on, rather than reregistering interest on every state change).
        registry.register(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    fn pre_select(&mut self) -> Option<Duration> {
        None
    }

    fn post_select(&mut self, events: &Events) -> io::Result<()> {
        if self.disconnected {
            return Ok(());
        }

        let (mut readable, mut writable) = (false, false);
        for event in events.iter().filter(|e| e.token() == self.token) {
            readable |= event.is_readable();
            writable |= event.is_writable();
            if event.is_error() {
                self.fail(DisconnectReason::Error);
                return Ok(());
            }
        }

        if self.state == ConnState::Connecting && writable {
            match self.stream.take_error() {
                Ok(None) => {
                    self.state = ConnState::Connected;
                    self.handler.borrow_mut().on_connect(self.id, Ok(()));
                }
                Ok(Some(e)) | Err(e) => {
                    let err = io::Error::new(e.kind(), e.to_string());
                    self.handler.borrow_mut().on_connect(self.id, Err(err));
                    self.fail(DisconnectReason::Error);
                    return Ok(());
                }
            }
        }

        if self.state == ConnState::Connected && readable {
            self.drive_recv()?;
        }

        if (self.state == ConnState::Connected || self.state == ConnState::Closing)
            && writable
            && !self.send_queue.is_empty()
        {
            self.drive_send();
        }

        if self.state == ConnState::Closing && self.send_queue.is_empty() {
            self.fail(DisconnectReason::LocalClose);
        }

        Ok(())
    }
}

impl Asocket {
    fn drive_recv(&mut self) -> io::Result<()> {
        loop {
            let spare = self.recv_buf.spare_mut();
            if spare.is_empty() {
                if !self.recv_buf.reclaim() {
                    // Callback consumed nothing and buffer is at max cap:
                    // stop reading this round, try again next readiness.
                    break;
                }
                continue;
            }

            match self.stream.read(self.recv_buf.spare_mut()) {
                Ok(0) => {
                    self.state = ConnState::Closing;
                    self.fail(DisconnectReason::PeerClosed);
                    return Ok(());
                }
                Ok(n) => {
                    self.recv_buf.advance_end(n);
                    let mut outbox = SendQueueOutbox(&mut self.send_queue);
                    let consumed =
                        self.handler
                            .borrow_mut()
                            .on_data(self.id, self.recv_buf.filled(), &mut outbox);
                    self.recv_buf.consume(consumed);
                    if consumed == 0 {
                        self.recv_buf.reclaim();
                        break;
                    }
                    self.recv_buf.reclaim();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(DisconnectReason::Error);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn drive_send(&mut self) {
        while let Some(pending) = self.send_queue.front_mut() {
            match self.stream.write(&pending.data[pending.offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    pending.offset += n;
                    if pending.offset == pending.data.len() {
                        self.send_queue.pop_front();
                        self.handler.borrow_mut().on_send_data(self.id, Ok(()));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let kind = e.kind();
                    self.handler
                        .borrow_mut()
                        .on_send_data(self.id, Err(io::Error::new(kind, e.to_string())));
                    self.fail(DisconnectReason::Error);
                    break;
                }
            }
        }
    }
}
