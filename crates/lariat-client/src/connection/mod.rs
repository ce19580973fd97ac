// Connection engine.
//
// # Purpose
// Owns the socket, the write coalescing buffer, the subscription
// registry, the PONG waiter queue, and the lifecycle state machine.
// Two long-running tasks serve each connected transport generation: the
// reader task (protocol dispatch) and the flusher task (socket writes).
//
// # Locking
// One mutex guards the shared connection state. The lock order when a
// subscription lock is also needed is connection first, then
// subscription, never the reverse. Counters are atomics.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};

use lariat_wire::headers::STATUS_NO_RESPONDERS;
use lariat_wire::{ConnectInfo, HeaderMap, PONG_PROTO, PING_PROTO, ServerInfo, subject};

use crate::errors::{Error, Result, classify_server_error};
use crate::inbox::new_inbox;
use crate::message::Message;
use crate::options::{
    DEFAULT_FLUSH_TIMEOUT, ErrorCallback, FLUSH_SIGNAL_CAPACITY, Options,
};
use crate::server::ServerAddr;
use crate::subscription::{
    DrainState, EnqueueOutcome, MessageHandler, SubInner, SubState, Subscription, run_delivery,
};

mod flusher;
mod reader;
mod reconnect;
pub(crate) mod wire_io;

use wire_io::{Established, ServerOp, establish};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connected,
    Closed,
    Reconnecting,
    DrainingSubs,
    DrainingPubs,
}

/// Message and byte counters for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct StatsCells {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

pub(crate) struct ConnState {
    status: Status,
    // Write coalescing buffer; doubles as the pending buffer while
    // reconnecting (pending_mode), where the configured cap applies.
    out: BytesMut,
    pending_mode: bool,
    // Per-generation task handles: dropping the sender stops the task.
    flush_tx: Option<mpsc::Sender<()>>,
    stop_tx: Option<watch::Sender<bool>>,
    // FIFO queue of flush waiters; one inbound PONG releases the head.
    pongs: VecDeque<(u64, oneshot::Sender<()>)>,
    next_pong_id: u64,
    subs: HashMap<u64, Arc<SubInner>>,
    server_info: ServerInfo,
    last_error: Option<Error>,
    error_cb: Option<ErrorCallback>,
    generation: u64,
    server_index: usize,
}

pub(crate) struct ConnCore {
    pub(crate) opts: Options,
    servers: Vec<ServerAddr>,
    sid_counter: AtomicU64,
    stats: StatsCells,
    state: Mutex<ConnState>,
}

/// A handle to a broker connection. Handles are cheap to clone; all
/// clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) core: Arc<ConnCore>,
}

/// Connect with default options. The url may be a comma-separated
/// cluster list.
///
/// ```no_run
/// # async fn run() -> lariat_client::Result<()> {
/// let conn = lariat_client::connect("nats://127.0.0.1:4222").await?;
/// conn.publish("greetings", b"hello")?;
/// conn.flush().await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(url: &str) -> Result<Connection> {
    Options::new().connect(url).await
}

impl Connection {
    pub(crate) async fn connect_with_options(urls: &str, opts: Options) -> Result<Connection> {
        let servers = ServerAddr::parse_list(urls)?;
        let connect_timeout = opts.connect_timeout;
        let core = Arc::new(ConnCore {
            opts,
            servers,
            sid_counter: AtomicU64::new(0),
            stats: StatsCells::default(),
            state: Mutex::new(ConnState {
                status: Status::Disconnected,
                out: BytesMut::new(),
                pending_mode: false,
                flush_tx: None,
                stop_tx: None,
                pongs: VecDeque::new(),
                next_pong_id: 0,
                subs: HashMap::new(),
                server_info: ServerInfo::default(),
                last_error: None,
                error_cb: None,
                generation: 0,
                server_index: 0,
            }),
        });
        {
            let mut state = core.lock_state();
            state.error_cb = core.opts.error_cb.clone();
        }

        let mut last_err = Error::NoServers;
        for _ in 0..core.servers.len() {
            let addr = core.next_server();
            match establish(&core.opts, &addr).await {
                Ok(est) => {
                    core.install_transport(est, &addr)?;
                    let conn = Connection { core: core.clone() };
                    // Round trip the handshake so authentication errors
                    // surface here rather than on first use.
                    if let Err(err) = conn.flush_timeout(connect_timeout).await {
                        let recorded = core.lock_state().last_error.clone();
                        core.close_internal();
                        return Err(recorded.unwrap_or(err));
                    }
                    return Ok(conn);
                }
                Err(err) => {
                    tracing::debug!(error = %err, host = %addr.host, "connect attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Publish `payload` on `subject`. Appends to the write buffer and
    /// returns without touching the network.
    pub fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.core.do_publish(subject, None, None, payload)
    }

    /// Publish with a reply subject for the receiver to respond on.
    pub fn publish_with_reply(&self, subject: &str, reply: &str, payload: &[u8]) -> Result<()> {
        self.core.do_publish(subject, Some(reply), None, payload)
    }

    /// Publish with a header block.
    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<()> {
        self.core.do_publish(subject, None, Some(headers), payload)
    }

    /// Publish a preassembled message value.
    pub fn publish_msg(&self, msg: &Message) -> Result<()> {
        self.core.do_publish(
            &msg.subject,
            msg.reply.as_deref(),
            msg.headers.as_ref(),
            &msg.payload,
        )
    }

    /// Subscribe with an asynchronous handler. The handler runs on a
    /// dedicated delivery task, serialized per subscription.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: impl FnMut(Message) + Send + 'static,
    ) -> Result<Subscription> {
        self.core
            .subscribe_inner(subject, "", Some(Box::new(handler)))
    }

    /// Subscribe for synchronous pulling via [`Subscription::next_msg`].
    pub async fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.core.subscribe_inner(subject, "", None)
    }

    /// Subscribe as a member of a queue group; the broker delivers each
    /// message to one member per group.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        handler: impl FnMut(Message) + Send + 'static,
    ) -> Result<Subscription> {
        self.core
            .subscribe_inner(subject, queue, Some(Box::new(handler)))
    }

    pub async fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.core.subscribe_inner(subject, queue, None)
    }

    /// One-shot request/reply: publish with a fresh inbox reply subject
    /// and wait for the first response.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = new_inbox();
        let sub = self.subscribe_sync(&inbox).await?;
        sub.auto_unsubscribe(1)?;
        // The inbox subscription must not outlive this call on any
        // exit path, including a failed publish.
        if let Err(err) = self.publish_with_reply(subject, &inbox, payload) {
            let _ = sub.unsubscribe();
            return Err(err);
        }
        let result = sub.next_msg(timeout).await;
        let _ = sub.unsubscribe();
        let msg = result?;
        if msg.status() == Some(STATUS_NO_RESPONDERS) {
            return Err(Error::NoResponders);
        }
        Ok(msg)
    }

    /// Round-trip barrier: returns once the broker has acknowledged all
    /// protocol written before this call.
    pub async fn flush(&self) -> Result<()> {
        self.core.flush_barrier(DEFAULT_FLUSH_TIMEOUT).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        self.core.flush_barrier(timeout).await
    }

    /// Drain the whole connection: every subscription is drained, then
    /// pending publishes are flushed, then the connection closes.
    pub async fn drain(&self) -> Result<()> {
        {
            let mut state = self.core.lock_state();
            match state.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingSubs | Status::DrainingPubs => {
                    return Err(Error::ConnectionDraining);
                }
                _ => state.status = Status::DrainingSubs,
            }
        }
        let subs: Vec<Subscription> = {
            let state = self.core.lock_state();
            state
                .subs
                .values()
                .cloned()
                .map(|inner| Subscription { inner })
                .collect()
        };
        let mut first_err = None;
        for sub in subs {
            if let Err(err) = sub.drain().await {
                tracing::warn!(error = %err, subject = sub.subject(), "subscription drain failed");
                first_err.get_or_insert(err);
            }
        }
        {
            let mut state = self.core.lock_state();
            if state.status != Status::Closed {
                state.status = Status::DrainingPubs;
            }
        }
        let _ = self.core.flush_barrier(self.core.opts.drain_timeout).await;
        self.core.close_internal();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the connection, releasing all blocked flush and next_msg
    /// callers. Idempotent.
    pub fn close(&self) {
        self.core.close_internal();
    }

    pub fn status(&self) -> Status {
        self.core.lock_state().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    /// The last error recorded on this connection, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.core.lock_state().last_error.clone()
    }

    pub fn server_info(&self) -> ServerInfo {
        self.core.lock_state().server_info.clone()
    }

    pub fn stats(&self) -> Stats {
        let cells = &self.core.stats;
        Stats {
            in_msgs: cells.in_msgs.load(Ordering::Relaxed),
            out_msgs: cells.out_msgs.load(Ordering::Relaxed),
            in_bytes: cells.in_bytes.load(Ordering::Relaxed),
            out_bytes: cells.out_bytes.load(Ordering::Relaxed),
            reconnects: cells.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Swap the asynchronous error handler, returning the previous one.
    /// The service layer uses this to chain handlers.
    pub fn set_error_handler(&self, handler: Option<ErrorCallback>) -> Option<ErrorCallback> {
        let mut state = self.core.lock_state();
        std::mem::replace(&mut state.error_cb, handler)
    }
}

impl ConnCore {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().expect("connection state lock")
    }

    pub(crate) fn drain_timeout(&self) -> Duration {
        self.opts.drain_timeout
    }

    fn next_server(&self) -> ServerAddr {
        let mut state = self.lock_state();
        let index = state.server_index % self.servers.len();
        state.server_index = state.server_index.wrapping_add(1);
        self.servers[index].clone()
    }

    // Append one encoded protocol unit to the output buffer, honoring
    // the pending cap while disconnected.
    fn write_proto(
        &self,
        state: &mut ConnState,
        encode: impl FnOnce(&mut BytesMut),
    ) -> Result<()> {
        let start = state.out.len();
        encode(&mut state.out);
        if state.pending_mode && state.out.len() > self.opts.pending_capacity {
            state.out.truncate(start);
            return Err(Error::ReconnectBufExceeded);
        }
        Ok(())
    }

    fn kick_flusher(&self, state: &ConnState) {
        if let Some(tx) = &state.flush_tx {
            // A pending signal is sufficient; a full channel means the
            // flusher is already awake.
            let _ = tx.try_send(());
        }
    }

    fn do_publish(
        &self,
        subj: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        if !subject::valid_subject(subj) {
            return Err(Error::BadSubject(subj.to_string()));
        }
        if let Some(reply) = reply {
            if !subject::valid_subject(reply) {
                return Err(Error::BadSubject(reply.to_string()));
            }
        }
        let mut state = self.lock_state();
        match state.status {
            Status::Closed => return Err(Error::ConnectionClosed),
            Status::DrainingPubs => return Err(Error::ConnectionDraining),
            _ => {}
        }
        // Refuse before any bytes hit the buffer.
        if payload.len() > state.server_info.max_payload {
            return Err(Error::MaxPayload);
        }
        self.write_proto(&mut state, |buf| match headers {
            Some(headers) => lariat_wire::encode_hpub(buf, subj, reply, headers, payload),
            None => lariat_wire::encode_pub(buf, subj, reply, payload),
        })?;
        self.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.kick_flusher(&state);
        Ok(())
    }

    fn subscribe_inner(
        self: &Arc<Self>,
        subj: &str,
        queue: &str,
        handler: Option<MessageHandler>,
    ) -> Result<Subscription> {
        if !subject::valid_subject(subj) {
            return Err(Error::BadSubject(subj.to_string()));
        }
        if !queue.is_empty() && !subject::valid_token(queue) {
            return Err(Error::BadQueueName(queue.to_string()));
        }
        let is_async = handler.is_some();
        let (tx, rx) = mpsc::channel(self.opts.mailbox_capacity);
        let (delivery_rx, sync_rx) = if is_async {
            (Some(rx), None)
        } else {
            (None, Some(rx))
        };
        let sid = self.sid_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::new(SubInner {
            sid,
            subject: subj.to_string(),
            queue: queue.to_string(),
            core: Arc::downgrade(self),
            is_async,
            state: Mutex::new(SubState {
                tx: Some(tx),
                max: None,
                slow: false,
                drain: DrainState::Active,
                closed_err: None,
            }),
            delivered: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            pending: std::sync::atomic::AtomicUsize::new(0),
            drained: tokio::sync::Notify::new(),
            receiver: tokio::sync::Mutex::new(sync_rx),
        });
        {
            let mut state = self.lock_state();
            match state.status {
                Status::Closed => return Err(Error::ConnectionClosed),
                Status::DrainingSubs | Status::DrainingPubs => {
                    return Err(Error::ConnectionDraining);
                }
                _ => {}
            }
            state.subs.insert(sid, inner.clone());
            // Suppressed while reconnecting; replay covers registry
            // contents once the transport is back.
            if state.status != Status::Reconnecting {
                if let Err(err) = self.write_proto(&mut state, |buf| {
                    lariat_wire::encode_sub(buf, subj, queue, sid)
                }) {
                    state.subs.remove(&sid);
                    return Err(err);
                }
                self.kick_flusher(&state);
            }
        }
        if let (Some(rx), Some(handler)) = (delivery_rx, handler) {
            tokio::spawn(run_delivery(inner.clone(), rx, handler));
        }
        Ok(Subscription { inner })
    }

    pub(crate) fn unsubscribe(&self, sub: &Arc<SubInner>) -> Result<()> {
        if sub.is_closed() {
            return Err(Error::BadSubscription);
        }
        {
            let mut state = self.lock_state();
            if state.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            if state.subs.remove(&sub.sid).is_some() && state.status != Status::Reconnecting {
                self.write_proto(&mut state, |buf| {
                    lariat_wire::encode_unsub(buf, sub.sid, None)
                })?;
                self.kick_flusher(&state);
            }
        }
        sub.close_mailbox(Error::BadSubscription);
        Ok(())
    }

    pub(crate) fn auto_unsubscribe(&self, sub: &Arc<SubInner>, max: u64) -> Result<()> {
        if max == 0 {
            return self.unsubscribe(sub);
        }
        if sub.is_closed() {
            return Err(Error::BadSubscription);
        }
        let mut state = self.lock_state();
        if state.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        if !state.subs.contains_key(&sub.sid) {
            return Err(Error::BadSubscription);
        }
        sub.state.lock().expect("subscription state lock").max = Some(max);
        if state.status != Status::Reconnecting {
            self.write_proto(&mut state, |buf| {
                lariat_wire::encode_unsub(buf, sub.sid, Some(max))
            })?;
            self.kick_flusher(&state);
        }
        Ok(())
    }

    // Emit a bare UNSUB without touching the registry; drain keeps the
    // subscription registered until its mailbox empties.
    pub(crate) fn send_unsub_proto(&self, sid: u64) -> Result<()> {
        let mut state = self.lock_state();
        if state.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        if state.status != Status::Reconnecting {
            self.write_proto(&mut state, |buf| lariat_wire::encode_unsub(buf, sid, None))?;
            self.kick_flusher(&state);
        }
        Ok(())
    }

    // Remove a subscription from the registry and close its mailbox.
    pub(crate) fn finalize_subscription(&self, sub: &Arc<SubInner>) {
        {
            let mut state = self.lock_state();
            state.subs.remove(&sub.sid);
        }
        sub.close_mailbox(Error::BadSubscription);
    }

    pub(crate) async fn flush_barrier(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::BadTimeout);
        }
        let (tx, rx) = oneshot::channel();
        let id;
        {
            let mut state = self.lock_state();
            if state.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            id = state.next_pong_id;
            state.next_pong_id += 1;
            state.pongs.push_back((id, tx));
            if let Err(err) = self.write_proto(&mut state, |buf| {
                buf.extend_from_slice(PING_PROTO);
            }) {
                state.pongs.retain(|(pong_id, _)| *pong_id != id);
                return Err(err);
            }
            self.kick_flusher(&state);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: the connection closed under us.
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let mut state = self.lock_state();
                state.pongs.retain(|(pong_id, _)| *pong_id != id);
                Err(Error::Timeout)
            }
        }
    }

    fn send_proto(&self, bytes: &'static [u8]) {
        let mut state = self.lock_state();
        let _ = self.write_proto(&mut state, |buf| buf.extend_from_slice(bytes));
        self.kick_flusher(&state);
    }

    fn connect_json(&self, addr: &ServerAddr) -> Result<String> {
        let connect = ConnectInfo {
            verbose: self.opts.verbose,
            pedantic: self.opts.pedantic,
            user: addr.user.clone(),
            pass: addr.pass.clone(),
            tls_required: self.opts.secure || addr.tls,
            name: self.opts.name.clone(),
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            headers: true,
            no_responders: true,
        };
        Ok(connect.to_json()?)
    }

    // Bind a fresh transport: bump the generation, queue CONNECT and
    // subscription replay ahead of any bytes buffered while
    // disconnected, then start this generation's tasks.
    pub(crate) fn install_transport(
        self: &Arc<Self>,
        est: Established,
        addr: &ServerAddr,
    ) -> Result<()> {
        let Established {
            reader,
            writer,
            info,
        } = est;
        let connect_json = self.connect_json(addr)?;
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_SIGNAL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let generation;
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            state.generation += 1;
            generation = state.generation;
            state.server_info = info;

            let buffered = std::mem::take(&mut state.out);
            state.pending_mode = false;
            lariat_wire::encode_connect(&mut state.out, &connect_json);

            let mut exhausted = Vec::new();
            for sub in state.subs.values() {
                let (budget, spent) = sub.replay_budget();
                if spent {
                    exhausted.push(sub.clone());
                    continue;
                }
                lariat_wire::encode_sub(&mut state.out, &sub.subject, &sub.queue, sub.sid);
                if let Some(remaining) = budget {
                    lariat_wire::encode_unsub(&mut state.out, sub.sid, Some(remaining));
                }
            }
            for sub in &exhausted {
                state.subs.remove(&sub.sid);
                sub.close_mailbox(Error::MaxMessages);
            }
            state.out.extend_from_slice(&buffered);

            state.flush_tx = Some(flush_tx);
            state.stop_tx = Some(stop_tx);
            state.status = Status::Connected;
            self.kick_flusher(state);
        }
        tokio::spawn(reader::run_reader(self.clone(), reader, stop_rx, generation));
        tokio::spawn(flusher::run_flusher(
            self.clone(),
            writer,
            flush_rx,
            generation,
        ));
        Ok(())
    }

    // Hand the flusher the buffered bytes for this generation, or
    // nothing when the buffer is empty or owned by a newer generation.
    pub(crate) fn take_buffered(&self, generation: u64, final_flush: bool) -> Option<Bytes> {
        let mut state = self.lock_state();
        if state.generation != generation || state.pending_mode {
            return None;
        }
        if !final_flush
            && !matches!(
                state.status,
                Status::Connected | Status::DrainingSubs | Status::DrainingPubs
            )
        {
            return None;
        }
        if state.out.is_empty() {
            return None;
        }
        Some(state.out.split().freeze())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_state().status == Status::Closed
    }

    pub(crate) fn dispatch_op(self: &Arc<Self>, op: ServerOp, _generation: u64) {
        match op {
            ServerOp::Ok => {}
            ServerOp::Ping => self.send_proto(PONG_PROTO),
            ServerOp::Pong => {
                let waiter = self.lock_state().pongs.pop_front();
                if let Some((_, tx)) = waiter {
                    let _ = tx.send(());
                }
            }
            ServerOp::Info(info) => {
                // Mid-session topology update.
                self.lock_state().server_info = info;
            }
            ServerOp::Err(args) => {
                let err = classify_server_error(&args);
                tracing::warn!(error = %err, "broker reported error");
                self.lock_state().last_error = Some(err);
                self.close_internal();
            }
            ServerOp::Msg(msg) => self.process_msg(msg),
        }
    }

    fn process_msg(self: &Arc<Self>, msg: Message) {
        self.stats.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .in_bytes
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
        let sid = msg.sid;
        let slow = {
            let state = self.lock_state();
            let Some(sub) = state.subs.get(&sid) else {
                // Interest already dropped; the message evaporates.
                return;
            };
            match sub.enqueue(msg) {
                EnqueueOutcome::Enqueued | EnqueueOutcome::Dropped => None,
                EnqueueOutcome::SlowConsumer => Some(sub.clone()),
            }
        };
        if let Some(sub) = slow {
            tracing::warn!(subject = %sub.subject, sid, "slow consumer, message dropped");
            self.notify_async_error(Some(sub), Error::SlowConsumer);
        }
    }

    pub(crate) fn notify_async_error(self: &Arc<Self>, sub: Option<Arc<SubInner>>, err: Error) {
        let cb = {
            let mut state = self.lock_state();
            state.last_error = Some(err.clone());
            state.error_cb.clone()
        };
        let Some(cb) = cb else { return };
        let conn = Connection { core: self.clone() };
        tokio::spawn(async move {
            let handle = sub.map(|inner| Subscription { inner });
            cb(&conn, handle.as_ref(), &err);
        });
    }

    pub(crate) fn close_internal(self: &Arc<Self>) {
        let (subs, had_transport) = {
            let mut state = self.lock_state();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
            let had_transport = state.stop_tx.is_some();
            // Dropping the signal sender makes the flusher do a final
            // best-effort flush and release the socket; dropping the
            // stop sender unblocks the reader.
            state.flush_tx = None;
            state.stop_tx = None;
            // Dropping the waiters releases every pending flush call
            // with a closed-connection indication.
            state.pongs.clear();
            (std::mem::take(&mut state.subs), had_transport)
        };
        for sub in subs.values() {
            sub.close_mailbox(Error::ConnectionClosed);
        }
        let conn = Connection { core: self.clone() };
        if had_transport {
            if let Some(cb) = &self.opts.disconnected_cb {
                cb(&conn);
            }
        }
        if let Some(cb) = &self.opts.closed_cb {
            cb(&conn);
        }
    }
}
