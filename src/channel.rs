//! Lifecycle of one logical channel to a server-side device.
//!
//! ```text
//! Closed --open--> Opening --ok--> Open <--> Canceling
//!                     |              |
//!                     +--fail--> Closed <--close--+
//! any --lost connection--> ClosedError
//! ```
//!
//! Whether the device is filling its buffer (active) is tracked
//! separately from the lifecycle state.

use crate::adc_config::{AdcConfig, ConfigError};
use crate::barst_session::{Session, SessionError};
use crate::cancel_token::{CancelToken, CANCEL_POLL_INTERVAL};
use crate::sample_block::SampleBlock;
use crate::wire::{put_str, ChannelId, Frame, Opcode, Status, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    /// A cancel was requested and the outstanding read has not returned yet.
    Canceling,
    /// The session was lost while the channel was open.
    ClosedError,
}

/// Kind of device a channel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Adc,
}

impl DeviceFamily {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Adc => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Adc),
            _ => None,
        }
    }
}

/// Device-family specific settings sent with an open request.
pub trait ChannelConfig {
    fn family(&self) -> DeviceFamily;
    fn encode_config(&self, dst: &mut BytesMut);
}

impl ChannelConfig for AdcConfig {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Adc
    }

    fn encode_config(&self, dst: &mut BytesMut) {
        self.encode(dst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Device {device} is unavailable ({status:?})")]
    DeviceUnavailable { device: String, status: Status },

    #[error("Operation timed out")]
    Timeout,

    #[error("Session is disconnected")]
    Disconnected,

    #[error("Another read is already in progress on this channel")]
    ReadInProgress,

    #[error("Channel is not open")]
    NotOpen,

    #[error("Server replied {status:?} to {opcode:?}")]
    Rejected { opcode: Opcode, status: Status },

    #[error("Malformed response: {0}")]
    Malformed(#[from] WireError),

    #[error("Session error: {0}")]
    Session(SessionError),
}

impl From<SessionError> for ChannelError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Timeout { .. } => Self::Timeout,
            SessionError::Disconnected => Self::Disconnected,
            SessionError::Wire(e) => Self::Malformed(e),
            other => Self::Session(other),
        }
    }
}

/// Clears the in-flight flag when the read ends, however it ends.
struct ReadGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ReadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ChannelError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChannelError::ReadInProgress)?;
        Ok(Self { flag })
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ReadControl {
    cancel: CancelToken,
    flush: bool,
}

/// An open channel on a session.
///
/// All methods take `&self`, so one handle can be shared between a thread
/// that reads and a thread that cancels or closes.
#[derive(Debug)]
pub struct Channel {
    session: Session,
    id: ChannelId,
    device: String,
    state: Arc<Mutex<ChannelState>>,
    active: AtomicBool,
    read_in_flight: AtomicBool,
    read_control: Mutex<ReadControl>,
    read_timeout: Mutex<Option<Duration>>,
}

impl Channel {
    /// Claims `device` on the server.
    #[tracing::instrument(skip(session, config), fields(family = ?config.family()))]
    pub fn open(
        session: &Session,
        device: &str,
        config: &impl ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let id = session.allocate_channel_id();
        let state = Arc::new(Mutex::new(ChannelState::Opening));

        let mut payload = BytesMut::new();
        put_str(&mut payload, device);
        payload.put_u8(config.family().as_u8());
        config.encode_config(&mut payload);

        log::debug!("Opening {} on {}", device, id);
        let response = match session.request(
            id,
            Opcode::Open,
            payload.freeze(),
            session.request_timeout(),
        ) {
            Ok(response) => response,
            Err(e) => {
                *state.lock() = ChannelState::Closed;
                if matches!(e, SessionError::Timeout { .. }) {
                    // the server may still complete the open later
                    session.notify_close(id);
                }
                return Err(e.into());
            }
        };

        match response.status {
            Status::Ok => {}
            Status::DeviceUnavailable | Status::DeviceBusy => {
                *state.lock() = ChannelState::Closed;
                return Err(ChannelError::DeviceUnavailable {
                    device: device.to_string(),
                    status: response.status,
                });
            }
            status => {
                *state.lock() = ChannelState::Closed;
                return Err(ChannelError::Rejected {
                    opcode: Opcode::Open,
                    status,
                });
            }
        }

        *state.lock() = ChannelState::Open;
        session.register_channel(id, &state);
        Ok(Self {
            session: session.clone(),
            id,
            device: device.to_string(),
            state,
            active: AtomicBool::new(false),
            read_in_flight: AtomicBool::new(false),
            read_control: Mutex::new(ReadControl::default()),
            read_timeout: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Longest a read waits for data before failing with
    /// [`ChannelError::Timeout`]. `None` waits until data, cancel or close.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open | ChannelState::Canceling => Ok(()),
            ChannelState::ClosedError => Err(ChannelError::Disconnected),
            ChannelState::Closed | ChannelState::Opening => Err(ChannelError::NotOpen),
        }
    }

    fn control(&self, opcode: Opcode, payload: Bytes) -> Result<(), ChannelError> {
        let response =
            self.session
                .request(self.id, opcode, payload, self.session.request_timeout())?;
        match response.status {
            Status::Ok => Ok(()),
            Status::NotOpen | Status::Closed => Err(ChannelError::NotOpen),
            status => Err(ChannelError::Rejected { opcode, status }),
        }
    }

    /// Starts or stops filling the server buffer. Asking for the current
    /// state again is a no-op.
    #[tracing::instrument(skip(self), fields(channel = %self.id))]
    pub fn set_state(&self, active: bool) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if self.is_active() == active {
            log::debug!("{} already {}", self.id, if active { "active" } else { "inactive" });
            return Ok(());
        }
        self.send_state(active, false)
    }

    /// Discards every unread record on the server. The activity state is
    /// left alone.
    pub fn flush(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.send_state(self.is_active(), true)
    }

    fn send_state(&self, active: bool, flush: bool) -> Result<(), ChannelError> {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u8(u8::from(active));
        payload.put_u8(u8::from(flush));
        self.control(Opcode::SetState, payload.freeze())?;
        self.active.store(active, Ordering::Release);
        Ok(())
    }

    /// Fetches up to `max_records` records, blocking until at least one is
    /// available, the read is cancelled, the channel is closed or the read
    /// timeout passes.
    ///
    /// A cancelled read returns what was buffered, possibly nothing. A read
    /// interrupted by close returns a block marked terminal.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(channel = %self.id))]
    pub fn read_block(
        &self,
        max_records: u32,
        cancel: &CancelToken,
    ) -> Result<SampleBlock, ChannelError> {
        let guard = ReadGuard::acquire(&self.read_in_flight)?;
        let result = self
            .ensure_open()
            .and_then(|()| self.exchange_read(max_records, cancel));
        self.finish_read(guard);
        result
    }

    fn exchange_read(
        &self,
        max_records: u32,
        cancel: &CancelToken,
    ) -> Result<SampleBlock, ChannelError> {
        let internal = self.read_control.lock().cancel.clone();
        let read_timeout = *self.read_timeout.lock();

        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(max_records);
        payload.put_u32_le(read_timeout.map_or(0, |t| {
            t.as_millis().clamp(1, u128::from(u32::MAX)) as u32
        }));
        let pending = self
            .session
            .send_request(self.id, Opcode::Read, payload.freeze())?;

        // the server answers a cancel promptly, so the wait after one is bounded
        let mut give_up_at =
            read_timeout.map(|t| Instant::now() + t + self.session.request_timeout());
        let mut cancel_sent = false;
        let frame = loop {
            if !cancel_sent && (cancel.is_cancelled() || internal.is_cancelled()) {
                let flush = self.read_control.lock().flush;
                self.send_cancel(flush);
                cancel_sent = true;
                give_up_at = Some(Instant::now() + self.session.request_timeout());
            }
            if let Some(frame) = pending.poll(CANCEL_POLL_INTERVAL)? {
                break frame;
            }
            if give_up_at.is_some_and(|at| Instant::now() >= at) {
                return Err(ChannelError::Timeout);
            }
        };
        Self::block_from(frame)
    }

    /// Re-arms cancellation for the next read and leaves `Canceling`.
    fn finish_read(&self, guard: ReadGuard<'_>) {
        let mut control = self.read_control.lock();
        *control = ReadControl::default();
        drop(guard);
        let mut state = self.state.lock();
        if *state == ChannelState::Canceling {
            *state = ChannelState::Open;
        }
    }

    fn block_from(frame: Frame) -> Result<SampleBlock, ChannelError> {
        match frame.status {
            Status::Ok | Status::Closed => {
                let mut body = frame.payload;
                let mut block = SampleBlock::decode(&mut body)?;
                block.terminal |= frame.status == Status::Closed;
                Ok(block)
            }
            Status::Timeout => Err(ChannelError::Timeout),
            Status::NotOpen => Err(ChannelError::NotOpen),
            status => Err(ChannelError::Rejected {
                opcode: Opcode::Read,
                status,
            }),
        }
    }

    fn send_cancel(&self, flush: bool) {
        let mut payload = BytesMut::with_capacity(1);
        payload.put_u8(u8::from(flush));
        self.session
            .notify(self.id, Opcode::CancelRead, payload.freeze());
    }

    /// Makes the outstanding read return early with what is buffered. Does
    /// nothing when no read is pending.
    pub fn cancel_read(&self) {
        self.request_cancel(false);
    }

    /// Like [`cancel_read`](Self::cancel_read), and also discards unread
    /// records on the server. Without an outstanding read only the discard
    /// happens.
    pub fn cancel_read_and_flush(&self) {
        self.request_cancel(true);
    }

    fn request_cancel(&self, flush: bool) {
        if self.ensure_open().is_err() {
            return;
        }
        let mut control = self.read_control.lock();
        if self.read_in_flight.load(Ordering::Acquire) {
            control.flush |= flush;
            control.cancel.cancel();
            let mut state = self.state.lock();
            if *state == ChannelState::Open {
                *state = ChannelState::Canceling;
            }
        } else if flush {
            drop(control);
            self.send_cancel(true);
        }
    }

    /// Stops the device and releases it. Closing twice is a no-op.
    #[tracing::instrument(skip(self), fields(channel = %self.id))]
    pub fn close(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock();
            match *state {
                ChannelState::Closed => return Ok(()),
                ChannelState::ClosedError => {
                    *state = ChannelState::Closed;
                    return Ok(());
                }
                _ => *state = ChannelState::Closed,
            }
        }
        self.active.store(false, Ordering::Release);
        self.session.unregister_channel(self.id);
        log::debug!("Closing {} ({})", self.id, self.device);

        match self.control(Opcode::Close, Bytes::new()) {
            Ok(()) | Err(ChannelError::NotOpen | ChannelError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            ChannelState::Open | ChannelState::Canceling | ChannelState::Opening
        ) {
            log::debug!("{} dropped while open, notifying server", self.id);
            self.session.notify_close(self.id);
        }
    }
}
