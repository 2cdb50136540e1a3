//! One connection to a Barst server, shared by every channel opened on it.
//!
//! Requests from any thread are written whole under a short-lived writer
//! lock and tagged with a sequence number. A background thread reads
//! frames and hands each response to the waiter registered under its
//! `(channel, seq)` pair, so replies may arrive in any order and a slow
//! read on one channel never holds up another.

use crate::barst_connector::{BarstConnector, ConnectorError, Endpoint, Transport};
use crate::channel::ChannelState;
use crate::wire::{
    ChannelId, Frame, FrameKind, FrameReader, FrameWriter, Opcode, Status, WireError,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_SIZE, DEFAULT_WRITE_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Oldest server protocol this client talks to.
pub const MIN_SERVER_VERSION: u32 = 20_000;
/// Protocol version announced by this client.
pub const CLIENT_VERSION: u32 = 20_100;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectorError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Server version {found} is older than the minimum supported {minimum}")]
    UnsupportedVersion { found: u32, minimum: u32 },

    #[error("No response to {opcode:?} on {channel} within {timeout:?}")]
    Timeout {
        opcode: Opcode,
        channel: ChannelId,
        timeout: Duration,
    },

    #[error("Server replied {status:?} to {opcode:?}")]
    Rejected { opcode: Opcode, status: Status },

    #[error("Session is disconnected")]
    Disconnected,
}

/// Size limits applied to the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Largest frame, header included. Lowered to the server's limit
    /// during the handshake.
    pub max_message_size: usize,
    /// Bytes requested from the transport per read call.
    pub read_size: usize,
    /// Frames are written in pieces of at most this many bytes.
    pub write_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_size: DEFAULT_READ_SIZE,
            write_size: DEFAULT_WRITE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub limits: SessionLimits,
    pub connect_timeout: Duration,
    /// Default wait for control requests (open, close, set-state).
    pub request_timeout: Duration,
    /// How often the reader thread wakes up to check for shutdown.
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            limits: SessionLimits::default(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// What the server announced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: u32,
    pub max_message_size: usize,
}

/// Reading of the server's clocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerClock {
    /// Seconds on the server's monotonic clock, the time base of sample
    /// timestamps.
    pub monotonic: f64,
    /// Seconds since the Unix epoch.
    pub utc: f64,
}

type PendingKey = (ChannelId, u32);

struct Shared {
    writer: Mutex<FrameWriter<Box<dyn Transport>>>,
    shutdown_handle: Mutex<Box<dyn Transport>>,
    pending: Mutex<HashMap<PendingKey, Sender<Frame>>>,
    channels: Mutex<HashMap<ChannelId, Weak<Mutex<ChannelState>>>>,
    disconnected: AtomicBool,
    closing: AtomicBool,
    next_seq: AtomicU32,
    next_channel: AtomicU32,
}

impl Shared {
    fn write(&self, frame: &Frame) -> Result<(), SessionError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(SessionError::Disconnected);
        }
        let result = self.writer.lock().write_frame(frame);
        match result {
            Ok(()) => Ok(()),
            Err(WireError::Io(e)) => {
                log::warn!("Write to server failed: {}", e);
                self.mark_disconnected();
                Err(SessionError::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Response => {
                let waiter = self.pending.lock().remove(&(frame.channel, frame.seq));
                match waiter {
                    // the waiter may have given up already
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => log::debug!(
                        "Dropping unsolicited {:?} response on {} seq {}",
                        frame.opcode,
                        frame.channel,
                        frame.seq
                    ),
                }
            }
            FrameKind::Notify if frame.opcode == Opcode::Close => {
                log::debug!("Server closed {}", frame.channel);
                let state = self.channels.lock().remove(&frame.channel);
                if let Some(state) = state.and_then(|weak| weak.upgrade()) {
                    *state.lock() = ChannelState::ClosedError;
                }
            }
            _ => log::debug!(
                "Ignoring {:?} {:?} frame from server",
                frame.kind,
                frame.opcode
            ),
        }
    }

    /// Fails every waiter and every open channel. Idempotent.
    fn mark_disconnected(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.closing.load(Ordering::Acquire) {
            log::warn!("Lost connection to Barst server");
        }
        // dropping the senders wakes every waiter with a disconnect
        self.pending.lock().clear();
        let channels: Vec<_> = self.channels.lock().drain().collect();
        for (id, weak) in channels {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock();
                if *state != ChannelState::Closed {
                    log::debug!("{} moves to ClosedError", id);
                    *state = ChannelState::ClosedError;
                }
            }
        }
    }
}

fn reader_loop(shared: &Shared, mut reader: FrameReader<Box<dyn Transport>>) {
    loop {
        if shared.closing.load(Ordering::Acquire) {
            break;
        }
        match reader.read_frame() {
            Ok(Some(frame)) => shared.dispatch(frame),
            Ok(None) => {}
            Err(e) => {
                if !shared.closing.load(Ordering::Acquire) {
                    log::warn!("Reader stopped: {}", e);
                }
                break;
            }
        }
    }
    shared.mark_disconnected();
}

/// A request on its way; the response is collected with
/// [`wait`](Self::wait) or polled with [`poll`](Self::poll).
pub struct PendingResponse {
    key: PendingKey,
    opcode: Opcode,
    rx: Receiver<Frame>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    /// Waits at most `slice` for the response.
    pub fn poll(&self, slice: Duration) -> Result<Option<Frame>, SessionError> {
        match self.rx.recv_timeout(slice) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Disconnected),
        }
    }

    pub fn wait(self, timeout: Duration) -> Result<Frame, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout {
                    opcode: self.opcode,
                    channel: self.key.0,
                    timeout,
                });
            }
            if let Some(frame) = self.poll(deadline - now)? {
                return Ok(frame);
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.key);
    }
}

struct SessionInner {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    info: ServerInfo,
    config: SessionConfig,
}

impl SessionInner {
    fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Closing session to {}", self.config.endpoint);
        if let Err(e) = self.shared.shutdown_handle.lock().shutdown() {
            log::debug!("Transport shutdown failed: {}", e);
        }
        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                log::warn!("Session reader thread panicked");
            }
        }
        self.shared.mark_disconnected();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle on a connected server. Clones share the connection, which is
/// closed when the last clone is dropped or [`close`](Self::close) is
/// called.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.config.endpoint)
            .field("server", &self.inner.info)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    /// Connects, checks the server version and starts the reader thread.
    #[tracing::instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let mut transport = BarstConnector::open(&config.endpoint, config.connect_timeout)?;
        let write_half = transport.try_clone_transport().map_err(ConnectorError::Io)?;
        let shutdown_handle = transport.try_clone_transport().map_err(ConnectorError::Io)?;
        transport
            .set_poll_timeout(config.poll_interval)
            .map_err(ConnectorError::Io)?;

        let limits = config.limits;
        let mut reader = FrameReader::new(transport, limits.read_size, limits.max_message_size);
        let mut writer = FrameWriter::new(write_half, limits.write_size, limits.max_message_size);

        let info = Self::handshake(&mut reader, &mut writer, &config)?;
        log::debug!(
            "Barst server version {}, max message {} bytes",
            info.version,
            info.max_message_size
        );
        reader.set_max_message_size(info.max_message_size);
        writer.set_max_message_size(info.max_message_size);

        let shared = Arc::new(Shared {
            writer: Mutex::new(writer),
            shutdown_handle: Mutex::new(shutdown_handle),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            next_seq: AtomicU32::new(2),
            next_channel: AtomicU32::new(1),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("barst-session-reader".to_string())
            .spawn(move || reader_loop(&thread_shared, reader))
            .map_err(|e| SessionError::Connect(ConnectorError::Io(e)))?;

        Ok(Self {
            inner: Arc::new(SessionInner {
                shared,
                reader: Mutex::new(Some(handle)),
                info,
                config,
            }),
        })
    }

    fn handshake(
        reader: &mut FrameReader<Box<dyn Transport>>,
        writer: &mut FrameWriter<Box<dyn Transport>>,
        config: &SessionConfig,
    ) -> Result<ServerInfo, SessionError> {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(CLIENT_VERSION);
        payload.put_u32_le(config.limits.max_message_size as u32);
        let request = Frame::request(
            Opcode::QueryVersion,
            ChannelId::SERVER,
            1,
            payload.freeze(),
        );
        writer.write_frame(&request)?;

        let deadline = Instant::now() + config.request_timeout;
        let response = loop {
            if let Some(frame) = reader.read_frame()? {
                break frame;
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    opcode: Opcode::QueryVersion,
                    channel: ChannelId::SERVER,
                    timeout: config.request_timeout,
                });
            }
        };

        if response.kind != FrameKind::Response
            || response.opcode != Opcode::QueryVersion
            || response.seq != request.seq
        {
            return Err(SessionError::Handshake(format!(
                "unexpected {:?} {:?} frame",
                response.kind, response.opcode
            )));
        }
        if response.status != Status::Ok {
            return Err(SessionError::Rejected {
                opcode: Opcode::QueryVersion,
                status: response.status,
            });
        }
        let mut body = response.payload;
        if body.remaining() < 8 {
            return Err(SessionError::Handshake("short version reply".to_string()));
        }
        let version = body.get_u32_le();
        let server_max = body.get_u32_le() as usize;
        if version < MIN_SERVER_VERSION {
            return Err(SessionError::UnsupportedVersion {
                found: version,
                minimum: MIN_SERVER_VERSION,
            });
        }
        Ok(ServerInfo {
            version,
            max_message_size: server_max.min(config.limits.max_message_size),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    pub fn server_version(&self) -> u32 {
        self.inner.info.version
    }

    /// Negotiated frame size limit, header included.
    pub fn max_message_size(&self) -> usize {
        self.inner.info.max_message_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.shared.disconnected.load(Ordering::Acquire)
    }

    /// Sends a request and returns without waiting for the answer.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(len = payload.len()))]
    pub fn send_request(
        &self,
        channel: ChannelId,
        opcode: Opcode,
        payload: Bytes,
    ) -> Result<PendingResponse, SessionError> {
        let shared = &self.inner.shared;
        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = (channel, seq);
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let mut pending = shared.pending.lock();
            if shared.disconnected.load(Ordering::Acquire) {
                return Err(SessionError::Disconnected);
            }
            pending.insert(key, tx);
        }
        let response = PendingResponse {
            key,
            opcode,
            rx,
            shared: Arc::clone(shared),
        };
        shared.write(&Frame::request(opcode, channel, seq, payload))?;
        Ok(response)
    }

    /// Round trip with a bounded wait. [`SessionError::Timeout`] leaves the
    /// session usable.
    pub fn request(
        &self,
        channel: ChannelId,
        opcode: Opcode,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Frame, SessionError> {
        self.send_request(channel, opcode, payload)?.wait(timeout)
    }

    /// Fire-and-forget message. Failures are logged, never reported.
    pub fn notify(&self, channel: ChannelId, opcode: Opcode, payload: Bytes) {
        if let Err(e) = self
            .inner
            .shared
            .write(&Frame::notify(opcode, channel, payload))
        {
            log::debug!("Dropping {:?} notification for {}: {}", opcode, channel, e);
        }
    }

    /// Tells the server to release `channel` without waiting for it.
    pub fn notify_close(&self, channel: ChannelId) {
        self.unregister_channel(channel);
        self.notify(channel, Opcode::Close, Bytes::new());
    }

    /// Current reading of the server clocks.
    pub fn server_clock(&self) -> Result<ServerClock, SessionError> {
        let frame = self.request(
            ChannelId::SERVER,
            Opcode::Clock,
            Bytes::new(),
            self.request_timeout(),
        )?;
        if frame.status != Status::Ok {
            return Err(SessionError::Rejected {
                opcode: Opcode::Clock,
                status: frame.status,
            });
        }
        let mut body = frame.payload;
        crate::wire::ensure_remaining(&body, 16)?;
        Ok(ServerClock {
            monotonic: body.get_f64_le(),
            utc: body.get_f64_le(),
        })
    }

    /// Stops the reader thread and fails everything still pending.
    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn allocate_channel_id(&self) -> ChannelId {
        ChannelId(self.inner.shared.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    /// Tracks `state` so a lost connection can move it to `ClosedError`.
    pub(crate) fn register_channel(&self, id: ChannelId, state: &Arc<Mutex<ChannelState>>) {
        let shared = &self.inner.shared;
        let mut channels = shared.channels.lock();
        if shared.disconnected.load(Ordering::Acquire) {
            *state.lock() = ChannelState::ClosedError;
            return;
        }
        channels.insert(id, Arc::downgrade(state));
    }

    pub(crate) fn unregister_channel(&self, id: ChannelId) {
        self.inner.shared.channels.lock().remove(&id);
    }
}
