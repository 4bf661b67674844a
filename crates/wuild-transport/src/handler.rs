//! One network channel, driven by a spawned worker task.
//!
//! The worker owns the socket. Callers interact through the cloneable
//! [`FrameHandler`] handle: enqueue frames from any task, register typed
//! readers before start, observe connect/disconnect transitions. A frame
//! queued with a reply notifier gets a fresh transaction id and the
//! notifier fires exactly once with the reply, a timeout, or an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use wuild_core::protocol::{FrameBody, RawFrame, MIN_USER_FRAME_ID, NO_REPLY};

use crate::assembler::{
    ack_segment, conn_options_segment, line_test_segment, segmentize, SegmentAssembler,
    SegmentEvent,
};
use crate::{FrameHandlerSettings, RequestFailure, Result, TransportError};

/// Outcome delivered to a reply notifier.
#[derive(Debug)]
pub enum ReplyOutcome {
    Success(RawFrame),
    Timeout,
    Error,
}

pub type ReplyNotifier = Box<dyn FnOnce(ReplyOutcome) + Send + 'static>;
pub type ChannelNotifier = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Enqueues replies from inside a frame reader, correlated to the frame
/// being processed.
#[derive(Clone)]
pub struct OutputSender {
    shared: Arc<Shared>,
    reply_to: u64,
}

impl OutputSender {
    pub fn send<T: FrameBody>(&self, message: &T) {
        let mut frame = RawFrame::from_body(message);
        frame.reply_to = self.reply_to;
        self.shared.enqueue(frame, None, None);
    }
}

/// Decodes and dispatches incoming frames of one type.
pub trait FrameReader: Send + Sync {
    fn type_id(&self) -> u8;
    /// A decode failure is treated like any other malformed input.
    fn process(&self, frame: RawFrame, output: &OutputSender) -> std::result::Result<(), String>;
}

struct TypedReader<T, F> {
    callback: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> FrameReader for TypedReader<T, F>
where
    T: FrameBody,
    F: Fn(T, &OutputSender) + Send + Sync,
{
    fn type_id(&self) -> u8 {
        T::TYPE_ID
    }

    fn process(&self, frame: RawFrame, output: &OutputSender) -> std::result::Result<(), String> {
        let message = frame
            .to_body::<T>()
            .map_err(|e| format!("frame 0x{:02x} decode: {e}", T::TYPE_ID))?;
        (self.callback)(message, output);
        Ok(())
    }
}

/// Build a reader from a plain closure over the typed message.
pub fn typed_reader<T, F>(callback: F) -> Arc<dyn FrameReader>
where
    T: FrameBody,
    F: Fn(T, &OutputSender) + Send + Sync + 'static,
{
    Arc::new(TypedReader {
        callback,
        _marker: std::marker::PhantomData,
    })
}

struct PendingReply {
    notifier: ReplyNotifier,
    deadline: Option<Instant>,
}

enum Endpoint {
    /// Client mode: dial, optionally retry on failure.
    Connect {
        host: String,
        port: u16,
        retry_on_fail: bool,
    },
    /// Accepted mode: drive an existing socket, never reconnect.
    Accepted(Mutex<Option<TcpStream>>),
}

struct Shared {
    settings: FrameHandlerSettings,
    endpoint: Endpoint,
    frames_out: Mutex<std::collections::VecDeque<RawFrame>>,
    notifiers: Mutex<HashMap<u64, PendingReply>>,
    readers: Mutex<HashMap<u8, Arc<dyn FrameReader>>>,
    state_notifier: Mutex<Option<ChannelNotifier>>,
    next_transaction: AtomicU64,
    connected: AtomicBool,
    stopping: AtomicBool,
    finished: AtomicBool,
    wake: Notify,
    closed: Notify,
    log_context: String,
}

impl Shared {
    fn enqueue(&self, mut frame: RawFrame, notifier: Option<ReplyNotifier>, timeout: Option<Duration>) {
        if self.finished.load(Ordering::Acquire) {
            if let Some(notifier) = notifier {
                notifier(ReplyOutcome::Error);
            }
            return;
        }
        if let Some(notifier) = notifier {
            let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
            frame.transaction_id = transaction_id;
            self.notifiers.lock().unwrap().insert(
                transaction_id,
                PendingReply {
                    notifier,
                    deadline: timeout.map(|t| Instant::now() + t),
                },
            );
        }
        self.frames_out.lock().unwrap().push_back(frame);
        self.wake.notify_one();
    }

    fn notify_state(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        let notifier = self.state_notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            notifier(connected);
        }
    }

    /// Fire every outstanding reply notifier with `Error` and clear the
    /// map. Called on disconnect and on final stop.
    fn fail_pending(&self) {
        let pending: Vec<PendingReply> = {
            let mut notifiers = self.notifiers.lock().unwrap();
            notifiers.drain().map(|(_, p)| p).collect()
        };
        for reply in pending {
            (reply.notifier)(ReplyOutcome::Error);
        }
    }
}

/// Handle to one channel worker.
#[derive(Clone)]
pub struct FrameHandler {
    shared: Arc<Shared>,
}

impl FrameHandler {
    /// Client-mode handler towards `host:port`. Call [`start`] after the
    /// readers are registered.
    pub fn connect(host: impl Into<String>, port: u16, settings: FrameHandlerSettings) -> Self {
        let host = host.into();
        let log_context = format!("->{host}:{port}");
        Self::with_endpoint(
            Endpoint::Connect {
                host,
                port,
                retry_on_fail: true,
            },
            settings,
            log_context,
        )
    }

    /// Accepted-mode handler over a socket from a listener. Connection
    /// failures are final; the listener owns reconnects.
    pub fn accepted(stream: TcpStream, settings: FrameHandlerSettings) -> Self {
        let log_context = stream
            .peer_addr()
            .map(|a| format!("<-{a}"))
            .unwrap_or_else(|_| "<-?".to_string());
        Self::with_endpoint(
            Endpoint::Accepted(Mutex::new(Some(stream))),
            settings,
            log_context,
        )
    }

    fn with_endpoint(endpoint: Endpoint, settings: FrameHandlerSettings, log_context: String) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                endpoint,
                frames_out: Mutex::new(std::collections::VecDeque::new()),
                notifiers: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                state_notifier: Mutex::new(None),
                // 0 is reserved for "no correlation required".
                next_transaction: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                wake: Notify::new(),
                closed: Notify::new(),
                log_context,
            }),
        }
    }

    /// Register a typed reader. Ids below 0x10 are reserved, duplicates
    /// are rejected.
    pub fn register_reader(&self, reader: Arc<dyn FrameReader>) -> Result<()> {
        let type_id = reader.type_id();
        if type_id < MIN_USER_FRAME_ID {
            return Err(TransportError::ReaderRegistration {
                message: format!("frame ids below 0x{MIN_USER_FRAME_ID:02x} are reserved"),
            });
        }
        let mut readers = self.shared.readers.lock().unwrap();
        if readers.contains_key(&type_id) {
            return Err(TransportError::ReaderRegistration {
                message: format!("reader for frame 0x{type_id:02x} already registered"),
            });
        }
        readers.insert(type_id, reader);
        Ok(())
    }

    /// The callback receives every connected/disconnected transition,
    /// including the initial state after `start`.
    pub fn set_channel_notifier(&self, notifier: ChannelNotifier) {
        *self.shared.state_notifier.lock().unwrap() = Some(notifier);
    }

    /// Fire-and-forget enqueue.
    pub fn queue_frame<T: FrameBody>(&self, message: &T) {
        self.shared.enqueue(RawFrame::from_body(message), None, None);
    }

    /// Enqueue expecting a correlated reply. The notifier is invoked
    /// exactly once with Success, Timeout or Error.
    pub fn queue_frame_with_reply<T: FrameBody>(
        &self,
        message: &T,
        notifier: ReplyNotifier,
        timeout: Option<Duration>,
    ) {
        self.shared
            .enqueue(RawFrame::from_body(message), Some(notifier), timeout);
    }

    /// Await a typed reply to `message`.
    pub async fn request<Req: FrameBody, Resp: FrameBody>(
        &self,
        message: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp> {
        let (tx, rx) = oneshot::channel();
        self.queue_frame_with_reply(
            message,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
            timeout,
        );
        match rx.await {
            Ok(ReplyOutcome::Success(frame)) => frame
                .to_body::<Resp>()
                .map_err(|_| TransportError::RequestFailed(RequestFailure::Decode)),
            Ok(ReplyOutcome::Timeout) => {
                Err(TransportError::RequestFailed(RequestFailure::Timeout))
            }
            Ok(ReplyOutcome::Error) | Err(_) => {
                Err(TransportError::RequestFailed(RequestFailure::Error))
            }
        }
    }

    /// Spawn the worker task.
    pub fn start(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            Worker::run(shared).await;
        });
    }

    /// Signal the worker to exit; outstanding replies fire with Error.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Wait until the worker fully terminated.
    pub async fn wait_closed(&self) {
        loop {
            // Register before checking the flag, or the final wakeup can
            // slip between the check and the await.
            let notified = self.shared.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.finished.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
            && !self.shared.stopping.load(Ordering::Acquire)
    }
}

/// Why one connection ended.
enum ConnectionEnd {
    /// Peer gone or channel stale; a client handler may redial.
    Lost,
    /// Unrecoverable (version mismatch, acknowledge timeout, stop).
    Fatal,
}

struct Worker;

impl Worker {
    async fn run(shared: Arc<Shared>) {
        let mut reported_state = false;
        loop {
            if shared.stopping.load(Ordering::Acquire) {
                break;
            }
            let stream = match Self::obtain_stream(&shared).await {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(retry) => {
                    if reported_state {
                        reported_state = false;
                        shared.notify_state(false);
                    }
                    if !retry {
                        break;
                    }
                    Self::interruptible_sleep(&shared, shared.settings.after_disconnect_wait).await;
                    continue;
                }
            };

            info!("{} channel connected", shared.log_context);
            reported_state = true;
            shared.notify_state(true);

            let end = Connection::new(&shared, stream).drive().await;

            reported_state = false;
            shared.notify_state(false);
            shared.fail_pending();

            match end {
                ConnectionEnd::Fatal => break,
                ConnectionEnd::Lost => {
                    let retry = matches!(
                        shared.endpoint,
                        Endpoint::Connect {
                            retry_on_fail: true,
                            ..
                        }
                    ) && !shared.stopping.load(Ordering::Acquire);
                    if !retry {
                        break;
                    }
                    info!("{} channel lost, waiting before reconnect", shared.log_context);
                    Self::interruptible_sleep(&shared, shared.settings.after_disconnect_wait).await;
                }
            }
        }

        shared.finished.store(true, Ordering::Release);
        shared.fail_pending();
        shared.closed.notify_waiters();
        debug!("{} handler finished", shared.log_context);
    }

    /// `Ok(None)` means this endpoint can never produce another stream.
    async fn obtain_stream(shared: &Arc<Shared>) -> std::result::Result<Option<TcpStream>, bool> {
        match &shared.endpoint {
            Endpoint::Accepted(slot) => Ok(slot.lock().unwrap().take()),
            Endpoint::Connect {
                host,
                port,
                retry_on_fail,
            } => {
                let address = format!("{host}:{port}");
                match tokio::time::timeout(
                    shared.settings.connect_timeout,
                    TcpStream::connect(&address),
                )
                .await
                {
                    Ok(Ok(stream)) => Ok(Some(stream)),
                    Ok(Err(e)) => {
                        debug!("{} connect failed: {e}", shared.log_context);
                        Err(*retry_on_fail)
                    }
                    Err(_) => {
                        debug!("{} connect timed out", shared.log_context);
                        Err(*retry_on_fail)
                    }
                }
            }
        }
    }

    async fn interruptible_sleep(shared: &Arc<Shared>, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shared.wake.notified() => {}
        }
    }
}

struct Connection<'a> {
    shared: &'a Arc<Shared>,
    stream: TcpStream,
    assembler: SegmentAssembler,
    out_segments: std::collections::VecDeque<Vec<u8>>,
    front_written: usize,
    /// Bytes we sent that the peer has not yet acknowledged.
    bytes_waiting_ack: usize,
    /// Bytes we received since we last emitted an Ack.
    unacknowledged_reads: usize,
    max_unacked: usize,
    ack_timer: Instant,
    last_read: Instant,
    last_line_activity: Instant,
    ever_read: bool,
}

impl<'a> Connection<'a> {
    fn new(shared: &'a Arc<Shared>, stream: TcpStream) -> Self {
        let now = Instant::now();
        let mut connection = Self {
            assembler: SegmentAssembler::new(shared.settings.segment_size),
            out_segments: std::collections::VecDeque::new(),
            front_written: 0,
            bytes_waiting_ack: 0,
            unacknowledged_reads: 0,
            max_unacked: shared.settings.initial_max_unacked(),
            ack_timer: now,
            last_read: now,
            last_line_activity: now,
            ever_read: false,
            shared,
            stream,
        };
        if connection.shared.settings.has_conn_options {
            let settings = &connection.shared.settings;
            connection.out_segments.push_back(conn_options_segment(
                settings.recommended_receive_buffer_size as u32,
                settings.protocol_version,
                wuild_core::protocol::now_micros(),
            ));
        }
        connection
    }

    async fn drive(mut self) -> ConnectionEnd {
        enum Wakeup {
            Queue,
            Readable(bool),
            Writable(bool),
            Timer,
        }

        loop {
            if self.shared.stopping.load(Ordering::Acquire) {
                return ConnectionEnd::Fatal;
            }
            if let Some(end) = self.pump() {
                return end;
            }

            let want_write = self.writable_segment_ready();
            let deadline = self.next_deadline();
            // Decide first, act after: the handlers below must not touch
            // the connection state while the branch futures borrow it.
            let wakeup = tokio::select! {
                biased;
                _ = self.shared.wake.notified() => Wakeup::Queue,
                ready = self.stream.readable() => Wakeup::Readable(ready.is_ok()),
                ready = self.stream.writable(), if want_write => Wakeup::Writable(ready.is_ok()),
                _ = tokio::time::sleep_until(deadline) => Wakeup::Timer,
            };

            match wakeup {
                Wakeup::Queue | Wakeup::Timer => {}
                Wakeup::Readable(false) | Wakeup::Writable(false) => {
                    return ConnectionEnd::Lost;
                }
                Wakeup::Readable(true) => {
                    match self.stream.try_read_buf(self.assembler.read_buffer()) {
                        Ok(0) => {
                            debug!("{} peer closed the connection", self.shared.log_context);
                            return ConnectionEnd::Lost;
                        }
                        Ok(n) => {
                            self.unacknowledged_reads += n;
                            self.last_read = Instant::now();
                            self.last_line_activity = self.last_read;
                            self.ever_read = true;
                            if let Some(end) = self.process_incoming() {
                                return end;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            debug!("{} read error: {e}", self.shared.log_context);
                            return ConnectionEnd::Lost;
                        }
                    }
                }
                Wakeup::Writable(true) => {
                    if let Some(end) = self.write_segments() {
                        return end;
                    }
                }
            }
        }
    }

    /// Everything that has to happen between suspension points: expire
    /// reply deadlines, check the channel health, emit service segments,
    /// cut queued frames into segments, push bytes while the flow window
    /// allows.
    fn pump(&mut self) -> Option<ConnectionEnd> {
        self.expire_replies();

        let settings = &self.shared.settings;

        // Channel with no read activity at all is stale.
        let activity_timeout = settings.channel_activity_timeout;
        if !activity_timeout.is_zero()
            && self.ever_read
            && self.last_read.elapsed() > activity_timeout
        {
            warn!("{} no channel activity, dropping connection", self.shared.log_context);
            return Some(ConnectionEnd::Lost);
        }

        // Waiting for an acknowledge that never comes is fatal; the bytes
        // are not retried on a fresh connection.
        if settings.has_acknowledges
            && self.bytes_waiting_ack >= self.max_unacked
            && self.ack_timer.elapsed() > settings.acknowledge_timeout
        {
            error!(
                "{} acknowledge not received (waiting {} bytes, window {})",
                self.shared.log_context, self.bytes_waiting_ack, self.max_unacked
            );
            return Some(ConnectionEnd::Fatal);
        }

        // Acks have high priority: front of the queue.
        if settings.has_acknowledges && self.unacknowledged_reads > 0 {
            let idle_output = self.out_segments.is_empty()
                && self.shared.frames_out.lock().unwrap().is_empty();
            if self.unacknowledged_reads > settings.acknowledge_minimal_read_size || idle_output {
                self.out_segments
                    .push_front(ack_segment(self.unacknowledged_reads as u32));
                self.unacknowledged_reads = 0;
            }
        }

        // Keepalive when the line went quiet.
        if settings.has_line_test
            && self.out_segments.is_empty()
            && self.shared.frames_out.lock().unwrap().is_empty()
            && self.last_line_activity.elapsed() > settings.line_test_interval
        {
            self.out_segments.push_back(line_test_segment());
            self.last_line_activity = Instant::now();
        }

        // Segmentize queued frames.
        loop {
            let frame = {
                let mut queue = self.shared.frames_out.lock().unwrap();
                queue.pop_front()
            };
            let Some(frame) = frame else { break };
            trace!("{} outgoing -> type 0x{:02x}", self.shared.log_context, frame.type_id);
            let encoded = frame.encode();
            for segment in segmentize(frame.type_id, &encoded, settings.segment_size) {
                self.out_segments.push_back(segment);
            }
        }

        self.write_segments()
    }

    fn writable_segment_ready(&self) -> bool {
        if self.out_segments.is_empty() {
            return false;
        }
        if !self.shared.settings.has_acknowledges {
            return true;
        }
        let front_len = self.out_segments[0].len() - self.front_written;
        self.bytes_waiting_ack + front_len <= self.max_unacked
    }

    fn write_segments(&mut self) -> Option<ConnectionEnd> {
        while let Some(front) = self.out_segments.front() {
            let remaining = &front[self.front_written..];
            if self.shared.settings.has_acknowledges
                && self.bytes_waiting_ack + remaining.len() > self.max_unacked
            {
                break; // suspended until the peer acknowledges
            }
            match self.stream.try_write(remaining) {
                Ok(n) => {
                    self.front_written += n;
                    if self.shared.settings.has_acknowledges {
                        self.bytes_waiting_ack += n;
                        self.ack_timer = Instant::now();
                    }
                    self.last_line_activity = Instant::now();
                    if self.front_written == front.len() {
                        self.out_segments.pop_front();
                        self.front_written = 0;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("{} write failed: {e}", self.shared.log_context);
                    return Some(ConnectionEnd::Lost);
                }
            }
        }
        None
    }

    fn process_incoming(&mut self) -> Option<ConnectionEnd> {
        let events = match self.assembler.drain_events() {
            Ok(events) => events,
            // Malformed input drained the buffers; the connection lives.
            Err(_) => return None,
        };
        for event in events {
            match event {
                SegmentEvent::Ack(bytes) => {
                    self.bytes_waiting_ack =
                        self.bytes_waiting_ack.saturating_sub(bytes as usize);
                    self.ack_timer = Instant::now();
                }
                SegmentEvent::LineTest => {}
                SegmentEvent::ConnOptions {
                    receive_buffer,
                    protocol_version,
                    timestamp_us,
                } => {
                    let local_version = self.shared.settings.protocol_version;
                    if protocol_version != local_version {
                        error!(
                            "{} remote protocol version is {protocol_version}, but mine is {local_version}",
                            self.shared.log_context
                        );
                        return Some(ConnectionEnd::Fatal);
                    }
                    self.max_unacked = self
                        .shared
                        .settings
                        .negotiated_max_unacked(receive_buffer as usize);
                    let remote_diff_us =
                        wuild_core::protocol::now_micros().saturating_sub(timestamp_us);
                    debug!(
                        "{} peer receive buffer {receive_buffer}, window {}, remote clock {} us behind",
                        self.shared.log_context, self.max_unacked, remote_diff_us
                    );
                }
                SegmentEvent::Frame(frame) => self.dispatch(frame),
            }
        }
        None
    }

    fn dispatch(&mut self, frame: RawFrame) {
        trace!(
            "{} incoming <- type 0x{:02x} txn {} reply_to {}",
            self.shared.log_context,
            frame.type_id,
            frame.transaction_id,
            frame.reply_to
        );
        if frame.reply_to != NO_REPLY {
            let pending = self.shared.notifiers.lock().unwrap().remove(&frame.reply_to);
            match pending {
                Some(reply) => (reply.notifier)(ReplyOutcome::Success(frame)),
                // Late reply after a timeout already fired: drop silently.
                None => debug!(
                    "{} dropping reply to unknown transaction {}",
                    self.shared.log_context, frame.reply_to
                ),
            }
            return;
        }

        let reader = self.shared.readers.lock().unwrap().get(&frame.type_id).cloned();
        let Some(reader) = reader else {
            warn!(
                "{} no reader for frame type 0x{:02x}",
                self.shared.log_context, frame.type_id
            );
            return;
        };
        let output = OutputSender {
            shared: self.shared.clone(),
            reply_to: frame.transaction_id,
        };
        if let Err(message) = reader.process(frame, &output) {
            error!("{} {message}", self.shared.log_context);
        }
    }

    fn expire_replies(&mut self) {
        let now = Instant::now();
        let expired: Vec<PendingReply> = {
            let mut notifiers = self.shared.notifiers.lock().unwrap();
            let expired_ids: Vec<u64> = notifiers
                .iter()
                .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| *id)
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| notifiers.remove(&id))
                .collect()
        };
        for reply in expired {
            (reply.notifier)(ReplyOutcome::Timeout);
        }
    }

    /// Earliest instant anything needs attention: a reply deadline, the
    /// next line test, the acknowledge timeout, the activity check.
    fn next_deadline(&self) -> Instant {
        let settings = &self.shared.settings;
        let mut deadline = Instant::now() + settings.reply_timeout_check_interval;

        {
            let notifiers = self.shared.notifiers.lock().unwrap();
            for pending in notifiers.values() {
                if let Some(reply_deadline) = pending.deadline {
                    deadline = deadline.min(reply_deadline);
                }
            }
        }
        // Only when a line test could actually be emitted; otherwise a
        // stale instant would spin the loop.
        if settings.has_line_test
            && self.out_segments.is_empty()
            && self.shared.frames_out.lock().unwrap().is_empty()
        {
            deadline = deadline.min(self.last_line_activity + settings.line_test_interval);
        }
        if settings.has_acknowledges && self.bytes_waiting_ack >= self.max_unacked {
            deadline = deadline.min(self.ack_timer + settings.acknowledge_timeout);
        }
        if !settings.channel_activity_timeout.is_zero() && self.ever_read {
            deadline = deadline.min(self.last_read + settings.channel_activity_timeout);
        }
        deadline
    }
}
