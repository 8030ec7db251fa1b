//! The RDMA stream connection.
//!
//! Protocol outline:
//!
//! ```text
//!      initiator                        target
//! -----------------------------------------------------
//!                                  resolve/bind/listen
//! resolve/prepost/connect
//!                                    prepost/accept
//!     send SETUP         <------->    send SETUP
//!   wait for SETUP                   wait for SETUP
//! RDMA write w/ immediate  ------->  write arrival (CQ)
//!     recv FC            <-------      FC send
//! ```
//!
//! The private payload of the native connect/accept call carries
//! `{magic, version, queue depth}`; a mismatch rejects the connection
//! before any data setup. After establishment each side posts one SETUP
//! describing its sink ring (base, length, remote key) and blocks until
//! the peer's SETUP arrives. From then on either side may write: data is
//! copied into the local source ring and pushed with one
//! RDMA-write-with-immediate per call into the peer's sink window at the
//! current head offset. The immediate carries the byte count and up to 15
//! control-message acks; explicit FC messages report drained bytes and
//! received writes back to the writer.
//!
//! If credits or buffer space run out, the caller spins with a yield until
//! flow control catches up or the configured timeout expires. No thread
//! drives the connection: all progress happens inside `read`, `write`,
//! `close`, or whatever call the owner makes after its event loop sees the
//! notifier fire.

use crate::config::ConnConfig;
use crate::event::Notifier;
use crate::flow::Credits;
use crate::msg_pool::{MsgPool, MsgSlot};
use crate::protocol::{
    pack_imm, unpack_imm, ConnParams, ControlMessage, MAX_BYTES_PER_WRITE, MSG_BUF_SIZE,
};
use crate::ring::RingCursor;
use crate::ring_buffer::RingBuffer;
use crate::verbs::{IntoIoError, Verbs};
use crate::window::RemoteWindow;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sideway::ibverbs::completion::{
    PollCompletionQueueError, WorkCompletionOperationType, WorkCompletionStatus,
};
use sideway::ibverbs::queue_pair::{
    PostSendGuard as _, QueuePair, SetScatterGatherEntry, WorkRequestFlags,
};
use sideway::ibverbs::AccessFlags;
use sideway::rdmacm::communication_manager::{
    ConnectionParameter, EventChannel, EventType, Identifier, PortSpace,
};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 128;
const MAX_QUEUE_DEPTH: u16 = 4096;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Closed = 0,
    Connecting = 1,
    Listening = 2,
    Connected = 3,
    Closing = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Listening,
            3 => Self::Connected,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Observer invoked on every state transition. Must not call back into the
/// connection.
pub type StateListener = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Transfer counters, reported via [`RdmaConnection::stats`] and logged on
/// close.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub reads: u64,
    pub writes: u64,
    pub buffer_empty: u64,
    pub buffer_full: u64,
    pub no_write_credit: u64,
    pub no_control_credit: u64,
}

/// One completion, copied out of the queue before processing.
#[derive(Debug, Clone, Copy)]
struct Wc {
    wr_id: u64,
    status: WorkCompletionStatus,
    opcode: WorkCompletionOperationType,
    imm: u32,
}

enum ReadProgress {
    Done(usize),
    Eof,
    NoData,
    Retry,
}

enum WriteProgress {
    Done(usize),
    Retry,
}

/// A reliable, flow-controlled byte-stream connection over RDMA verbs.
///
/// Constructed in `Closed`; `connect` or `listen` + `accept_sync` move it
/// to `Connected`. Any protocol failure, timeout, or peer disconnect
/// forces `Closing` then `Closed`; a fresh connection object is needed to
/// retry. Concurrent calls on one connection are serialized by an internal
/// lock shared with completion-queue draining.
pub struct RdmaConnection {
    config: ConnConfig,
    state: AtomicU8,
    listener: Mutex<Option<StateListener>>,
    inner: Mutex<Inner>,
}

// SAFETY: the verbs resources, rings, and pool are reached only through
// the connection mutex; the state word and listener have their own
// synchronization. The underlying ibverbs/rdmacm objects tolerate use
// from any thread as long as calls are serialized, which the lock
// guarantees.
unsafe impl Send for RdmaConnection {}
unsafe impl Sync for RdmaConnection {}

/// Everything behind the connection lock.
struct Inner {
    established: bool,
    cm: Option<Arc<EventChannel>>,
    id: Option<Arc<Identifier>>,
    verbs: Option<Verbs>,
    notifier: Option<Notifier>,
    msg_pool: Option<MsgPool>,
    source: Option<RingBuffer>,
    sink: Option<RingBuffer>,
    source_cur: RingCursor,
    sink_cur: RingCursor,
    remote: RemoteWindow,
    credits: Credits,
    depth: u16,
    next_wr_id: u64,
    posted_recvs: FxHashMap<u64, MsgSlot>,
    inflight_sends: FxHashMap<u64, MsgSlot>,
    inflight_writes: FxHashMap<u64, u32>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    stats: ConnStats,
}

impl Inner {
    fn new(depth: u16) -> Self {
        Self {
            established: false,
            cm: None,
            id: None,
            verbs: None,
            notifier: None,
            msg_pool: None,
            source: None,
            sink: None,
            source_cur: RingCursor::new(1),
            sink_cur: RingCursor::new(1),
            remote: RemoteWindow::empty(),
            credits: Credits::new(depth),
            depth,
            next_wr_id: 1,
            posted_recvs: FxHashMap::default(),
            inflight_sends: FxHashMap::default(),
            inflight_writes: FxHashMap::default(),
            peer: None,
            local: None,
            stats: ConnStats::default(),
        }
    }

    fn alloc_wr_id(&mut self) -> u64 {
        let id = self.next_wr_id;
        self.next_wr_id = self.next_wr_id.wrapping_add(1);
        id
    }

    /// Release every native resource, in reverse acquisition order
    /// (registrations before the domain that issued them, the identifier
    /// before its event channel), and reset the protocol state. Safe to
    /// call repeatedly.
    fn release_resources(&mut self) {
        self.posted_recvs.clear();
        self.inflight_sends.clear();
        self.inflight_writes.clear();
        self.source.take();
        self.sink.take();
        self.msg_pool.take();
        self.id.take();
        self.verbs.take();
        self.cm.take();
        self.notifier.take();
        self.remote = RemoteWindow::empty();
        self.source_cur.clear(1);
        self.sink_cur.clear(1);
        self.credits = Credits::new(self.depth);
        self.established = false;
    }

    /// Consume pending connection-manager events. The only event a live
    /// connection expects is a disconnect; anything else is a protocol
    /// error.
    fn handle_cm_events(&mut self) -> io::Result<()> {
        loop {
            let Some(notifier) = self.notifier.as_ref() else {
                return Ok(());
            };
            if !notifier.check()?.cm {
                return Ok(());
            }
            let Some(cm) = self.cm.as_ref() else {
                return Ok(());
            };
            let event = cm.get_cm_event().io_err()?;
            match event.event_type() {
                EventType::Disconnected => {
                    debug!("peer disconnected");
                    self.established = false;
                }
                EventType::TimewaitExit => {}
                other => {
                    return Err(io::Error::other(format!(
                        "unexpected CM event while connected: {other:?}"
                    )));
                }
            }
        }
    }

    /// Drain the completion queue until it polls empty.
    fn drain_cq(&mut self) -> io::Result<()> {
        loop {
            let batch = {
                let Some(verbs) = self.verbs.as_ref() else {
                    return Ok(());
                };
                let mut batch: Vec<Wc> = Vec::new();
                match verbs.cq.start_poll() {
                    Ok(poller) => {
                        for wc in poller {
                            let opcode = WorkCompletionOperationType::from(wc.opcode());
                            let imm = match opcode {
                                WorkCompletionOperationType::ReceiveWithImmediate => wc.imm_data(),
                                _ => 0,
                            };
                            batch.push(Wc {
                                wr_id: wc.wr_id(),
                                status: WorkCompletionStatus::from(wc.status()),
                                opcode,
                                imm,
                            });
                        }
                    }
                    Err(PollCompletionQueueError::CompletionQueueEmpty) => {}
                    Err(e) => return Err(io::Error::other(e.to_string())),
                }
                batch
            };
            if batch.is_empty() {
                return Ok(());
            }
            let mut recvs_consumed = 0u32;
            for wc in batch {
                self.handle_completion(wc, &mut recvs_consumed)?;
            }
            if recvs_consumed > 0 {
                self.post_receives(recvs_consumed)?;
            }
        }
    }

    fn handle_completion(&mut self, wc: Wc, recvs_consumed: &mut u32) -> io::Result<()> {
        if wc.status != WorkCompletionStatus::Success {
            // Queued work is flushed with error status when the peer
            // drops; that is the normal end of a torn-down queue pair.
            if !self.established {
                self.reclaim_slot(wc.wr_id);
                return Ok(());
            }
            return Err(io::Error::other(format!(
                "work completion failed: status={:?} opcode={:?} wr_id={}",
                wc.status, wc.opcode, wc.wr_id
            )));
        }

        match wc.opcode {
            WorkCompletionOperationType::ReceiveWithImmediate => {
                // A peer RDMA write landed in the sink ring.
                self.on_remote_write(wc.imm)?;
                if let Some(slot) = self.posted_recvs.remove(&wc.wr_id) {
                    if let Some(pool) = self.msg_pool.as_mut() {
                        pool.put(slot);
                    }
                    *recvs_consumed += 1;
                }
            }
            WorkCompletionOperationType::Receive => {
                let Some(slot) = self.posted_recvs.remove(&wc.wr_id) else {
                    warn!("receive completion for unknown wr_id={}", wc.wr_id);
                    return Ok(());
                };
                let msg = {
                    let pool = self.msg_pool.as_ref().expect("pool outlives posted recvs");
                    ControlMessage::decode(pool.slice(slot))
                };
                match msg {
                    Ok(msg) => self.on_control_message(msg),
                    Err(e) => warn!("dropping malformed control message: {e}"),
                }
                if let Some(pool) = self.msg_pool.as_mut() {
                    pool.put(slot);
                }
                *recvs_consumed += 1;
            }
            WorkCompletionOperationType::Send => {
                if let Some(slot) = self.inflight_sends.remove(&wc.wr_id) {
                    if let Some(pool) = self.msg_pool.as_mut() {
                        pool.put(slot);
                    }
                }
            }
            WorkCompletionOperationType::RdmaWrite => {
                if let Some(len) = self.inflight_writes.remove(&wc.wr_id) {
                    // The NIC is done with these source bytes.
                    self.source_cur.advance_tail(u64::from(len));
                }
            }
            other => warn!("unexpected completion opcode {other:?}"),
        }
        Ok(())
    }

    /// Return the buffer slot of a flushed work request to the pool.
    fn reclaim_slot(&mut self, wr_id: u64) {
        let slot = self
            .posted_recvs
            .remove(&wr_id)
            .or_else(|| self.inflight_sends.remove(&wr_id));
        if let (Some(slot), Some(pool)) = (slot, self.msg_pool.as_mut()) {
            pool.put(slot);
        }
        self.inflight_writes.remove(&wr_id);
    }

    /// Peer write arrival: the immediate tells us how many bytes landed and
    /// acks control messages we sent earlier. Both counts come off the
    /// wire; the byte count is clamped to the sink's free space so a bad
    /// peer can corrupt accounting, never memory.
    fn on_remote_write(&mut self, imm: u32) -> io::Result<()> {
        let (bytes, acks) = unpack_imm(imm);
        let bytes = u64::from(bytes).min(self.sink_cur.free());
        self.credits.on_write_received(acks);
        if bytes > 0 {
            self.sink_cur.advance_head(bytes);
            if let Some(notifier) = self.notifier.as_ref() {
                notifier.signal_bytes(bytes)?;
            }
        }
        Ok(())
    }

    fn on_control_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Setup { base, len, key } => {
                if self.remote.install(base, len, key) {
                    debug!(base, len, key, "peer sink window");
                } else {
                    warn!("duplicate SETUP message ignored");
                }
            }
            ControlMessage::FlowControl {
                bytes_received,
                writes_received,
            } => {
                self.remote.note_drained(u64::from(bytes_received));
                self.credits.on_flow_control(writes_received);
            }
        }
    }

    /// Post `count` receives, recycling free pool slots. The pool holds
    /// `2 * depth` slots for `depth` posted receives, so a slot is always
    /// available here.
    fn post_receives(&mut self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            let (slot, lkey, addr) = {
                let pool = self.msg_pool.as_mut().expect("pool present while posting");
                let slot = pool.get().ok_or_else(|| {
                    io::Error::other("control buffer pool exhausted while reposting receives")
                })?;
                (slot, pool.lkey(), pool.addr_of(slot))
            };
            let wr_id = self.alloc_wr_id();
            self.posted_recvs.insert(wr_id, slot);

            let verbs = self.verbs.as_mut().expect("verbs present while posting");
            let res = {
                let mut guard = verbs.qp.start_post_recv();
                // SAFETY: the pool slot stays registered and untouched
                // until this request's completion returns it.
                unsafe {
                    guard.construct_wr(wr_id).setup_sge(lkey, addr, MSG_BUF_SIZE as u32);
                }
                guard.post().io_err()
            };
            if res.is_err() {
                self.posted_recvs.remove(&wr_id);
                if let Some(pool) = self.msg_pool.as_mut() {
                    pool.put(slot);
                }
                return res;
            }
        }
        Ok(())
    }

    /// Post one control message on the two-sided channel. Consumes a
    /// control credit and a pool slot; both are preconditions the caller
    /// has checked (or is the SETUP exchange, where credits are fresh).
    fn post_control(&mut self, msg: ControlMessage) -> io::Result<()> {
        let (slot, len, lkey, addr) = {
            let pool = self.msg_pool.as_mut().expect("pool present while posting");
            let slot = pool
                .get()
                .ok_or_else(|| io::Error::other("control buffer pool exhausted"))?;
            let len = msg.encode(pool.slice_mut(slot));
            (slot, len, pool.lkey(), pool.addr_of(slot))
        };

        let wr_id = self.alloc_wr_id();
        self.inflight_sends.insert(wr_id, slot);

        let verbs = self.verbs.as_mut().expect("verbs present while posting");
        let res = {
            let mut guard = verbs.qp.start_post_send();
            let wr = guard.construct_wr(wr_id, WorkRequestFlags::Signaled);
            // SAFETY: the pool slot stays registered and untouched until
            // the send completion returns it.
            unsafe {
                wr.setup_send().setup_sge(lkey, addr, len as u32);
            }
            guard.post().io_err()
        };
        if res.is_err() {
            self.inflight_sends.remove(&wr_id);
            if let Some(pool) = self.msg_pool.as_mut() {
                pool.put(slot);
            }
            return res;
        }
        self.credits.consume_control();
        Ok(())
    }

    /// Advertise the local sink ring to the peer.
    fn post_setup(&mut self) -> io::Result<()> {
        let sink = self.sink.as_ref().expect("sink ring present");
        let msg = ControlMessage::Setup {
            base: sink.base_addr(),
            len: sink.capacity() as u64,
            key: u64::from(sink.rkey()),
        };
        self.post_control(msg)
    }

    /// Report `drained` bytes (and all unacked writes) back to the writer.
    fn post_flow_control(&mut self, drained: u32) -> io::Result<()> {
        let writes_received = self.credits.take_fc_writes();
        let msg = ControlMessage::FlowControl {
            bytes_received: drained,
            writes_received,
        };
        self.post_control(msg)
    }

    /// Push everything the writer has staged (`pending` bytes behind the
    /// source head) into the peer's window with one write-with-immediate.
    fn post_rdma_write(&mut self) -> io::Result<()> {
        let len = self.source_cur.pending();
        debug_assert!(len > 0 && len <= u64::from(MAX_BYTES_PER_WRITE));

        let acks = self.credits.take_imm_acks();
        let imm = pack_imm(len as u32, acks);
        let wr_id = self.alloc_wr_id();

        let (lkey, local_addr) = {
            let source = self.source.as_ref().expect("source ring present");
            (source.lkey(), source.addr_at(self.source_cur.middle_offset()))
        };
        let remote_addr = self.remote.write_addr();
        let rkey = self.remote.key() as u32;

        self.inflight_writes.insert(wr_id, len as u32);
        let verbs = self.verbs.as_mut().expect("verbs present while posting");
        let res = {
            let mut guard = verbs.qp.start_post_send();
            let wr = guard.construct_wr(wr_id, WorkRequestFlags::Signaled);
            // SAFETY: the source ring bytes between middle and head are
            // frozen until the write completion advances the tail.
            unsafe {
                wr.setup_write_imm(rkey, remote_addr, imm)
                    .setup_sge(lkey, local_addr, len as u32);
            }
            guard.post().io_err()
        };
        if res.is_err() {
            self.inflight_writes.remove(&wr_id);
            return res;
        }

        self.source_cur.advance_middle(len);
        self.remote.note_written(len);
        self.credits.consume_write();
        Ok(())
    }
}

impl RdmaConnection {
    /// Create a connection in the `Closed` state. No native resources are
    /// acquired until `connect` or `listen`.
    pub fn new(mut config: ConnConfig) -> Self {
        // The credit split needs a handful of slots, and the control pool
        // is 2 x depth slots; keep the depth in a workable range.
        config.queue_depth = config.queue_depth.clamp(8, MAX_QUEUE_DEPTH);
        let depth = config.queue_depth;
        Self {
            config,
            state: AtomicU8::new(ConnectionState::Closed as u8),
            listener: Mutex::new(None),
            inner: Mutex::new(Inner::new(depth)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Install a state-transition observer.
    pub fn set_state_listener(&self, listener: StateListener) {
        *self.listener.lock() = Some(listener);
    }

    /// The multiplexed notifier fd (readable when CM events, completions,
    /// or buffered bytes are pending), or `None` before connect/listen.
    pub fn notifier_fd(&self) -> Option<RawFd> {
        self.inner.lock().notifier.as_ref().map(|n| n.as_raw_fd())
    }

    /// Peer address, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().peer
    }

    /// Locally bound address (listeners only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local
    }

    /// Transfer counters.
    pub fn stats(&self) -> ConnStats {
        self.inner.lock().stats
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            if let Some(listener) = self.listener.lock().as_ref() {
                listener(state);
            }
        }
    }

    /// Tear the connection down and report `err`.
    fn fail<T>(&self, inner: &mut Inner, err: io::Error) -> io::Result<T> {
        self.close_locked(inner);
        Err(err)
    }

    /// Establish an outbound connection to `addr`. Requires `Closed`.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if self.state() != ConnectionState::Closed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connect requires a closed connection",
            ));
        }
        self.set_state(ConnectionState::Connecting);
        match self.do_connect(&mut inner, addr) {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(%addr, depth = inner.depth, "connection established");
                Ok(())
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                self.fail(&mut inner, e)
            }
        }
    }

    fn do_connect(&self, inner: &mut Inner, addr: SocketAddr) -> io::Result<()> {
        let timeout = self.config.resolve_timeout;

        let notifier = Notifier::new()
            .map_err(|e| io::Error::other(format!("failed to create notifier: {e}")))?;

        let cm = EventChannel::new()
            .map_err(|e| io::Error::other(format!("failed to create event channel: {e}")))?;
        notifier.watch_cm(cm.as_raw_fd())?;

        let id = cm
            .create_id(PortSpace::Tcp)
            .map_err(|e| io::Error::other(format!("failed to create identifier: {e}")))?;

        id.resolve_addr(None, addr, timeout)
            .map_err(|e| io::Error::other(format!("failed to resolve {addr}: {e}")))?;
        wait_cm_event(&notifier, &cm, &[EventType::AddressResolved], Some(timeout))?;

        id.resolve_route(timeout)
            .map_err(|e| io::Error::other(format!("failed to resolve route to {addr}: {e}")))?;
        wait_cm_event(&notifier, &cm, &[EventType::RouteResolved], Some(timeout))?;

        self.setup_data_path(inner, &id)?;
        notifier.watch_cq(inner.verbs.as_ref().expect("verbs just built").comp_fd())?;
        inner.notifier = Some(notifier);
        inner.cm = Some(cm);
        inner.peer = Some(addr);

        let mut param = ConnectionParameter::new();
        param.setup_qp_number(inner.verbs.as_ref().expect("verbs just built").qp.qp_number());
        param.setup_private_data(&ConnParams::local(inner.depth).encode());
        id.connect(param)
            .map_err(|e| io::Error::other(format!("failed to connect to {addr}: {e}")))?;

        // Some providers report ConnectResponse before the queue pair is
        // ready-to-send; finish the transitions and confirm establishment.
        let (event_type, info) = wait_cm_event(
            inner.notifier.as_ref().expect("notifier installed"),
            inner.cm.as_ref().expect("cm installed"),
            &[EventType::Established, EventType::ConnectResponse],
            Some(timeout),
        )?;
        if event_type == EventType::ConnectResponse {
            let verbs = inner.verbs.as_mut().expect("verbs just built");
            verbs.to_ready(&id)?;
            id.establish().io_err()?;
        }
        inner.established = true;
        inner.id = Some(id);

        let peer = info
            .peer_params
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no connect parameters"))?;
        if !peer.compatible() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "protocol mismatch: peer magic={:#04x} version={:#04x}",
                    peer.magic, peer.version
                ),
            ));
        }

        self.exchange_setup(inner, /* post_first = */ true)
    }

    /// Bind and listen on `addr`. Requires `Closed`.
    pub fn listen(&self, addr: SocketAddr) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if self.state() != ConnectionState::Closed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listen requires a closed connection",
            ));
        }
        self.set_state(ConnectionState::Connecting);
        match Self::do_listen(&mut inner, addr) {
            Ok(()) => {
                self.set_state(ConnectionState::Listening);
                info!(%addr, "listening");
                Ok(())
            }
            Err(e) => {
                debug!(%addr, error = %e, "listen failed");
                self.fail(&mut inner, e)
            }
        }
    }

    fn do_listen(inner: &mut Inner, addr: SocketAddr) -> io::Result<()> {
        let notifier = Notifier::new()?;
        let cm = EventChannel::new()
            .map_err(|e| io::Error::other(format!("failed to create event channel: {e}")))?;
        notifier.watch_cm(cm.as_raw_fd())?;

        let id = cm
            .create_id(PortSpace::Tcp)
            .map_err(|e| io::Error::other(format!("failed to create identifier: {e}")))?;
        id.bind_addr(addr)
            .map_err(|e| io::Error::other(format!("failed to bind {addr}: {e}")))?;
        id.listen(LISTEN_BACKLOG)
            .map_err(|e| io::Error::other(format!("failed to listen on {addr}: {e}")))?;

        inner.notifier = Some(notifier);
        inner.cm = Some(cm);
        inner.id = Some(id);
        inner.local = Some(addr);
        Ok(())
    }

    /// Wait for an inbound connection and return it as a fresh, fully
    /// independent connection object. Requires `Listening`; the listening
    /// connection itself is unaffected by the outcome.
    pub fn accept_sync(&self) -> io::Result<RdmaConnection> {
        let inner = self.inner.lock();
        if self.state() != ConnectionState::Listening {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept requires a listening connection",
            ));
        }
        let notifier = inner.notifier.as_ref().expect("listener has notifier");
        let cm = inner.cm.as_ref().expect("listener has event channel");

        let (_, info) = wait_cm_event(
            notifier,
            cm,
            &[EventType::ConnectRequest],
            self.config.io_timeout,
        )?;
        drop(inner);

        let new_id = info
            .id
            .ok_or_else(|| io::Error::other("connect request carried no identifier"))?;
        let peer = info
            .peer_params
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no connect parameters"))?;

        let accepted = RdmaConnection::new(self.config.clone());
        match accepted.finish_accept(new_id, peer) {
            Ok(()) => Ok(accepted),
            Err(e) => {
                debug!(error = %e, "accept failed");
                Err(e)
            }
        }
    }

    /// Complete the passive side of the handshake on a fresh connection.
    fn finish_accept(&self, id: Arc<Identifier>, peer: ConnParams) -> io::Result<()> {
        let mut inner = self.inner.lock();
        self.set_state(ConnectionState::Connecting);

        if !peer.compatible() || peer.depth < 8 || peer.depth > MAX_QUEUE_DEPTH {
            // Reject before any resources are committed.
            if let Err(e) = id.reject() {
                warn!("failed to reject incompatible peer: {e}");
            }
            return self.fail(
                &mut inner,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "protocol mismatch: peer magic={:#04x} version={:#04x} depth={}",
                        peer.magic, peer.version, peer.depth
                    ),
                ),
            );
        }

        // The initiator's depth governs both sides of the credit split.
        inner.depth = peer.depth;
        inner.credits = Credits::new(peer.depth);

        match self.do_accept(&mut inner, id) {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(depth = inner.depth, "connection accepted");
                Ok(())
            }
            Err(e) => self.fail(&mut inner, e),
        }
    }

    fn do_accept(&self, inner: &mut Inner, id: Arc<Identifier>) -> io::Result<()> {
        let timeout = self.config.resolve_timeout;

        let notifier = Notifier::new()?;
        let cm = EventChannel::new()
            .map_err(|e| io::Error::other(format!("failed to create event channel: {e}")))?;
        notifier.watch_cm(cm.as_raw_fd())?;
        // Move the accepted identifier off the listener's channel so its
        // disconnect events arrive here.
        id.migrate(&cm)
            .map_err(|e| io::Error::other(format!("failed to migrate identifier: {e}")))?;

        self.setup_data_path(inner, &id)?;
        notifier.watch_cq(inner.verbs.as_ref().expect("verbs just built").comp_fd())?;
        inner.notifier = Some(notifier);
        inner.cm = Some(cm);

        {
            let verbs = inner.verbs.as_mut().expect("verbs just built");
            verbs.to_ready(&id)?;
        }

        let mut param = ConnectionParameter::new();
        param.setup_qp_number(inner.verbs.as_ref().expect("verbs just built").qp.qp_number());
        param.setup_private_data(&ConnParams::local(inner.depth).encode());
        id.accept(param)
            .map_err(|e| io::Error::other(format!("failed to accept: {e}")))?;

        wait_cm_event(
            inner.notifier.as_ref().expect("notifier installed"),
            inner.cm.as_ref().expect("cm installed"),
            &[EventType::Established],
            Some(timeout),
        )?;
        inner.established = true;
        inner.id = Some(id);

        self.exchange_setup(inner, /* post_first = */ false)
    }

    /// Allocate rings, control pool, and verbs for a resolved identifier,
    /// and pre-post the receive queue. Shared by both handshake sides.
    fn setup_data_path(&self, inner: &mut Inner, id: &Arc<Identifier>) -> io::Result<()> {
        let depth = inner.depth;
        let config = ConnConfig {
            queue_depth: depth,
            ..self.config.clone()
        };
        let verbs = Verbs::build(id, &config)?;

        let mut pool = MsgPool::new(depth * 2)?;
        pool.register(&verbs.pd)?;

        let mut source = RingBuffer::alloc(self.config.ring_capacity)?;
        source.register(&verbs.pd, AccessFlags::LocalWrite)?;
        let mut sink = RingBuffer::alloc(self.config.ring_capacity)?;
        sink.register(&verbs.pd, AccessFlags::LocalWrite | AccessFlags::RemoteWrite)?;

        inner.source_cur.clear(source.capacity() as u64);
        inner.sink_cur.clear(sink.capacity() as u64);
        inner.msg_pool = Some(pool);
        inner.source = Some(source);
        inner.sink = Some(sink);
        inner.verbs = Some(verbs);

        inner.post_receives(u32::from(depth))
    }

    /// Post our SETUP and wait for the peer's, in the order the handshake
    /// role dictates (initiator sends first).
    fn exchange_setup(&self, inner: &mut Inner, post_first: bool) -> io::Result<()> {
        if post_first {
            inner.post_setup()?;
        }

        let start = Instant::now();
        loop {
            inner.handle_cm_events()?;
            if !inner.established {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "disconnected while waiting for setup message",
                ));
            }
            if let Some(notifier) = inner.notifier.as_ref() {
                if notifier.check()?.cq {
                    if let Some(verbs) = inner.verbs.as_ref() {
                        verbs.absorb_cq_event()?;
                    }
                }
            }
            inner.drain_cq()?;
            if inner.remote.is_valid() {
                break;
            }
            if start.elapsed() > self.config.resolve_timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for setup message",
                ));
            }
            std::thread::yield_now();
        }

        if !post_first {
            inner.post_setup()?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes from the sink ring.
    ///
    /// Returns the number of bytes copied (at least 1), `Ok(0)` on orderly
    /// end of stream (peer disconnected and the ring is drained), or
    /// `ErrorKind::WouldBlock` when `block` is false and no data has
    /// arrived. Blocking reads spin with a yield until data, EOF, or the
    /// configured timeout.
    pub fn read(&self, buf: &mut [u8], block: bool) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state() != ConnectionState::Connected {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read requires a connected connection",
            ));
        }

        let start = Instant::now();
        let mut extra_event_absorbed = false;
        loop {
            let progress = {
                let mut inner = self.inner.lock();
                match self.read_attempt(&mut inner, buf, block, &mut extra_event_absorbed) {
                    Ok(p) => p,
                    Err(e) => return self.fail(&mut inner, e),
                }
            };
            match progress {
                ReadProgress::Done(n) => return Ok(n),
                ReadProgress::Eof => {
                    info!("peer closed, end of stream");
                    self.close();
                    return Ok(0);
                }
                ReadProgress::NoData => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data yet"))
                }
                ReadProgress::Retry => {
                    if let Some(timeout) = self.config.io_timeout {
                        if start.elapsed() > timeout {
                            let mut inner = self.inner.lock();
                            return self.fail(
                                &mut inner,
                                io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
                            );
                        }
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    fn read_attempt(
        &self,
        inner: &mut Inner,
        buf: &mut [u8],
        block: bool,
        extra_event_absorbed: &mut bool,
    ) -> io::Result<ReadProgress> {
        let events = match inner.notifier.as_ref() {
            Some(n) => n.check()?,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "closed")),
        };
        if events.cm {
            inner.handle_cm_events()?;
        }
        if events.cq {
            if let Some(verbs) = inner.verbs.as_ref() {
                // Rearm first so a completion arriving between poll and
                // rearm still raises the channel.
                verbs.absorb_cq_event()?;
            }
        }
        inner.drain_cq()?;

        // Flow control shares the send queue with data; without a credit
        // we cannot ack what we are about to take out.
        if inner.established
            && inner.credits.flow_control_required()
            && !inner.credits.has_control_credit()
        {
            inner.stats.no_control_credit += 1;
            return Ok(ReadProgress::Retry);
        }

        // A completion-channel event may fire with no completion behind
        // it. Absorb exactly one such spurious wakeup before telling a
        // non-blocking caller there is nothing to read.
        if inner.established && !events.buf {
            if *extra_event_absorbed && !block {
                return Ok(ReadProgress::NoData);
            }
            *extra_event_absorbed = true;
            return Ok(ReadProgress::Retry);
        }

        let signalled = if events.buf {
            match inner.notifier.as_ref() {
                Some(n) => n.take_bytes()?,
                None => 0,
            }
        } else {
            0
        };

        let n = (buf.len() as u64).min(inner.sink_cur.available()) as usize;
        if n == 0 {
            if inner.sink_cur.is_empty() && !inner.established {
                return Ok(ReadProgress::Eof);
            }
            inner.stats.buffer_empty += 1;
            return Ok(ReadProgress::Retry);
        }

        {
            let sink = inner.sink.as_ref().expect("sink ring present");
            sink.copy_out(inner.sink_cur.tail_offset(), &mut buf[..n]);
        }
        inner.sink_cur.advance_tail(n as u64);

        // Put back what was not consumed so the notifier stays hot.
        if signalled > n as u64 {
            if let Some(notifier) = inner.notifier.as_ref() {
                notifier.signal_bytes(signalled - n as u64)?;
            }
        }

        if inner.established && inner.credits.flow_control_required() {
            if let Err(e) = inner.post_flow_control(n as u32) {
                warn!("failed to post flow control message: {e}");
            }
        }

        inner.stats.reads += 1;
        Ok(ReadProgress::Done(n))
    }

    /// Write up to `buf.len()` bytes (capped at the immediate-data limit)
    /// into the stream, returning how many were accepted. Partial writes
    /// are normal: the call posts exactly one RDMA write covering whatever
    /// fit into the source ring and the peer's window. Spins with a yield
    /// while credits or space are exhausted, up to the configured timeout.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state() != ConnectionState::Connected {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write requires a connected connection",
            ));
        }
        let can_put = buf.len().min(MAX_BYTES_PER_WRITE as usize);

        let start = Instant::now();
        loop {
            let progress = {
                let mut inner = self.inner.lock();
                match self.write_attempt(&mut inner, &buf[..can_put]) {
                    Ok(p) => p,
                    Err(e) => return self.fail(&mut inner, e),
                }
            };
            match progress {
                WriteProgress::Done(n) => return Ok(n),
                WriteProgress::Retry => {
                    if let Some(timeout) = self.config.io_timeout {
                        if start.elapsed() > timeout {
                            let mut inner = self.inner.lock();
                            return self.fail(
                                &mut inner,
                                io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
                            );
                        }
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    fn write_attempt(&self, inner: &mut Inner, buf: &[u8]) -> io::Result<WriteProgress> {
        inner.handle_cm_events()?;
        if !inner.established {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "disconnected in write",
            ));
        }
        inner.drain_cq()?;

        if !inner.credits.has_write_credit() {
            inner.stats.no_write_credit += 1;
            return Ok(WriteProgress::Retry);
        }

        let fill = (buf.len() as u64)
            .min(inner.source_cur.free())
            .min(inner.remote.free());
        if fill == 0 {
            inner.stats.buffer_full += 1;
            return Ok(WriteProgress::Retry);
        }
        let fill_usize = fill as usize;

        {
            let head = inner.source_cur.head_offset();
            let source = inner.source.as_mut().expect("source ring present");
            source.copy_in(head, &buf[..fill_usize]);
        }
        inner.source_cur.advance_head(fill);

        inner.post_rdma_write()?;
        inner.stats.writes += 1;
        Ok(WriteProgress::Done(fill_usize))
    }

    /// Close the connection and release every native resource. Idempotent
    /// and callable from any state.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.close_locked(&mut inner);
    }

    fn close_locked(&self, inner: &mut Inner) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closing);

        if inner.established {
            if let Some(id) = inner.id.as_ref() {
                if let Err(e) = id.disconnect() {
                    warn!("disconnect failed: {e}");
                }
            }
            inner.established = false;
        }

        let s = inner.stats;
        debug!(
            reads = s.reads,
            writes = s.writes,
            buffer_empty = s.buffer_empty,
            buffer_full = s.buffer_full,
            no_write_credit = s.no_write_credit,
            no_control_credit = s.no_control_credit,
            "closing connection"
        );

        inner.release_resources();
        self.set_state(ConnectionState::Closed);
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// What a connection-manager event carried.
#[derive(Default)]
struct CmEventInfo {
    peer_params: Option<ConnParams>,
    id: Option<Arc<Identifier>>,
}

/// Wait (spinning on the notifier with a yield) for one of `expected`;
/// any other event is a failure. `None` waits forever. Private connect
/// parameters and the request identifier are captured when present.
fn wait_cm_event(
    notifier: &Notifier,
    cm: &EventChannel,
    expected: &[EventType],
    timeout: Option<Duration>,
) -> io::Result<(EventType, CmEventInfo)> {
    let start = Instant::now();
    loop {
        if notifier.check()?.cm {
            let event = cm.get_cm_event().io_err()?;
            let event_type = event.event_type();
            debug!(?event_type, "CM event");

            if expected.contains(&event_type) {
                let mut info = CmEventInfo::default();
                match event_type {
                    EventType::Established
                    | EventType::ConnectResponse
                    | EventType::ConnectRequest => {
                        let data = event.private_data();
                        if !data.is_empty() {
                            info.peer_params = ConnParams::decode(&data).ok();
                        }
                        if event_type == EventType::ConnectRequest {
                            info.id = event.cm_id();
                        }
                    }
                    _ => {}
                }
                return Ok((event_type, info));
            }

            return Err(match event_type {
                EventType::ConnectError | EventType::Rejected | EventType::Unreachable => {
                    io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("connection refused: {event_type:?}"),
                    )
                }
                EventType::AddressError | EventType::RouteError => {
                    io::Error::other(format!("resolution failed: {event_type:?}"))
                }
                EventType::Disconnected => io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "disconnected during establishment",
                ),
                other => io::Error::other(format!("unexpected CM event: {other:?}")),
            });
        }

        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out waiting for {expected:?}"),
                ));
            }
        }
        std::thread::yield_now();
    }
}
