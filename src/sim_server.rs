//! In-process Barst server over TCP loopback.
//!
//! Implements the server half of the protocol against simulated ADC
//! devices whose samples are pushed in by the caller through a
//! [`SimDevice`]. Every connection gets its own thread and every blocking
//! read its own thread, so reads on different channels never wait on each
//! other. Used by the integration tests and the demos.

use crate::adc_config::AdcConfig;
use crate::barst_connector::Endpoint;
use crate::calibration::Calibrator;
use crate::cancel_token::CancelToken;
use crate::channel::DeviceFamily;
use crate::sample_block::{RawRecord, SampleBlock};
use crate::sample_buffer::{ContinuousSampleBuffer, DrainOutcome};
use crate::wire::{
    get_str, ChannelId, Frame, FrameKind, FrameReader, FrameWriter, Opcode, Status,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_SIZE, DEFAULT_WRITE_SIZE, HEADER_SIZE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const SIM_SERVER_VERSION: u32 = 20_100;

#[derive(Debug, Clone)]
pub struct SimServerOptions {
    /// Version announced in the handshake.
    pub version: u32,
    pub max_message_size: usize,
}

impl Default for SimServerOptions {
    fn default() -> Self {
        Self {
            version: SIM_SERVER_VERSION,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

type Writer = Arc<Mutex<FrameWriter<TcpStream>>>;

struct OpenAdc {
    owner: (u64, ChannelId),
    config: AdcConfig,
    calibrator: Calibrator,
    buffer: ContinuousSampleBuffer<RawRecord>,
    active: AtomicBool,
    read_cancel: Mutex<Option<CancelToken>>,
}

struct DeviceSlot {
    path: String,
    open: Mutex<Option<Arc<OpenAdc>>>,
}

impl DeviceSlot {
    fn current(&self) -> Option<Arc<OpenAdc>> {
        self.open.lock().clone()
    }

    /// Stops the channel owned by `owner`, waking any pending read.
    fn release(&self, owner: (u64, ChannelId)) -> bool {
        let mut open = self.open.lock();
        match open.as_ref() {
            Some(adc) if adc.owner == owner => {
                adc.active.store(false, Ordering::Release);
                adc.buffer.close();
                *open = None;
                log::debug!("Released {} from {}", self.path, owner.1);
                true
            }
            _ => false,
        }
    }
}

struct ServerShared {
    options: SimServerOptions,
    started: Instant,
    devices: Mutex<HashMap<String, Arc<DeviceSlot>>>,
    connections: Mutex<Vec<TcpStream>>,
    stopping: AtomicBool,
    next_connection: AtomicU64,
}

impl ServerShared {
    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Producer side of a simulated device.
#[derive(Clone)]
pub struct SimDevice {
    slot: Arc<DeviceSlot>,
    shared: Arc<ServerShared>,
}

impl SimDevice {
    pub fn path(&self) -> &str {
        &self.slot.path
    }

    pub fn is_open(&self) -> bool {
        self.slot.current().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .current()
            .is_some_and(|adc| adc.active.load(Ordering::Acquire))
    }

    /// Records waiting in the server buffer.
    pub fn buffered(&self) -> usize {
        self.slot.current().map_or(0, |adc| adc.buffer.len())
    }

    /// Pushes offset-binary codes, interleaved across the enabled
    /// sub-channels. Codes at either rail are flagged out of range.
    ///
    /// Returns the number of records stored, which is zero while the
    /// channel is closed or inactive.
    pub fn append(&self, codes: &[u32]) -> usize {
        let Some(adc) = self.slot.current() else {
            return 0;
        };
        let max = adc.calibrator.max_code();
        let records = Self::records_from(&adc, codes.iter().map(|&code| {
            let code = code.min(max);
            (adc.calibrator.to_wire_code(code), code == 0 || code == max)
        }));
        self.push(&adc, records)
    }

    /// Pushes voltages, interleaved like [`append`](Self::append). Values
    /// outside the input range are clamped to the rails and flagged.
    pub fn append_volts(&self, volts: &[f64]) -> usize {
        let Some(adc) = self.slot.current() else {
            return 0;
        };
        let range = adc.config.input_range();
        let records = Self::records_from(&adc, volts.iter().map(|&v| {
            let code = adc.calibrator.volts_to_code(v);
            (
                adc.calibrator.to_wire_code(code),
                v <= range.min() || v >= range.max(),
            )
        }));
        self.push(&adc, records)
    }

    fn records_from(
        adc: &OpenAdc,
        codes: impl Iterator<Item = (u32, bool)>,
    ) -> Vec<RawRecord> {
        let per_record = adc.config.sub_channel_count();
        let flat: Vec<(u32, bool)> = codes.collect();
        flat.chunks_exact(per_record)
            .map(|chunk| {
                let mut record = RawRecord::single(chunk[0].0, chunk[0].1);
                if let Some(&(code, oor)) = chunk.get(1) {
                    record.codes[1] = code;
                    record.out_of_range[1] = oor;
                }
                record
            })
            .collect()
    }

    fn push(&self, adc: &OpenAdc, mut records: Vec<RawRecord>) -> usize {
        if !adc.active.load(Ordering::Acquire) {
            return 0;
        }
        // the batch is taken to have been sampled at the actual rate, ending now
        let transfer = adc.config.transfer_size() as u64;
        let period = 1.0 / adc.config.actual_rate();
        let now = self.shared.elapsed();
        let last = records.len().saturating_sub(1);
        let mut index = adc.buffer.next_index();
        for (i, record) in records.iter_mut().enumerate() {
            if index % transfer == 0 {
                record.anchor = Some(now - (last - i) as f64 * period);
            }
            index += 1;
        }
        let stored = records.len();
        let discarded = adc.buffer.extend(records);
        if discarded > 0 {
            log::debug!("{}: overflow discarded {} records", self.slot.path, discarded);
        }
        stored
    }
}

/// Reference server listening on an ephemeral loopback port.
pub struct SimServer {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn start() -> io::Result<Self> {
        Self::start_with(SimServerOptions::default())
    }

    pub fn start_with(options: SimServerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(ServerShared {
            options,
            started: Instant::now(),
            devices: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("sim-server-accept".to_string())
            .spawn(move || accept_loop(&accept_shared, &listener))?;
        log::debug!("Simulated Barst server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shared,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    /// Registers a device under `path`, or returns the existing one.
    pub fn add_device(&self, path: &str) -> SimDevice {
        let slot = Arc::clone(
            self.shared
                .devices
                .lock()
                .entry(path.to_string())
                .or_insert_with(|| {
                    Arc::new(DeviceSlot {
                        path: path.to_string(),
                        open: Mutex::new(None),
                    })
                }),
        );
        SimDevice {
            slot,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cuts every client connection, as a crashing server would.
    pub fn drop_connections(&self) {
        for stream in self.shared.connections.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn shutdown(&mut self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        // wake the accept loop
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(200));
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
        self.drop_connections();
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(shared: &Arc<ServerShared>, listener: &TcpListener) {
    for stream in listener.incoming() {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                continue;
            }
        };
        let connection = shared.next_connection.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(handle) => shared.connections.lock().push(handle),
            Err(e) => {
                log::warn!("Dropping connection {}: {}", connection, e);
                continue;
            }
        }
        let conn_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("sim-server-conn-{connection}"))
            .spawn(move || {
                if let Err(e) = serve_connection(&conn_shared, connection, stream) {
                    log::debug!("Connection {} ended: {}", connection, e);
                }
            });
        if let Err(e) = spawned {
            log::warn!("Could not spawn connection thread: {}", e);
        }
    }
}

struct Connection<'a> {
    shared: &'a Arc<ServerShared>,
    id: u64,
    writer: Writer,
    owned: HashMap<ChannelId, Arc<DeviceSlot>>,
}

fn serve_connection(shared: &Arc<ServerShared>, id: u64, stream: TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let max = shared.options.max_message_size;
    let writer = Arc::new(Mutex::new(FrameWriter::new(
        stream.try_clone()?,
        DEFAULT_WRITE_SIZE,
        max,
    )));
    let mut reader = FrameReader::new(stream, DEFAULT_READ_SIZE, max);
    let mut connection = Connection {
        shared,
        id,
        writer,
        owned: HashMap::new(),
    };

    let result = loop {
        match reader.read_frame() {
            Ok(Some(frame)) => connection.handle(frame),
            Ok(None) => {}
            Err(e) => break Err(io::Error::other(e)),
        }
    };

    for (channel, slot) in connection.owned.drain() {
        slot.release((id, channel));
    }
    result
}

impl Connection<'_> {
    fn reply(&self, request: &Frame, status: Status, payload: Bytes) {
        send(&self.writer, &Frame::response_to(request, status, payload));
    }

    fn open_adc(&self, channel: ChannelId) -> Option<Arc<OpenAdc>> {
        self.owned
            .get(&channel)
            .and_then(|slot| slot.current())
            .filter(|adc| adc.owner == (self.id, channel))
    }

    fn handle(&mut self, frame: Frame) {
        match (frame.kind, frame.opcode) {
            (FrameKind::Request, Opcode::QueryVersion) => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32_le(self.shared.options.version);
                payload.put_u32_le(self.shared.options.max_message_size as u32);
                self.reply(&frame, Status::Ok, payload.freeze());
            }
            (FrameKind::Request, Opcode::Clock) => {
                let utc = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0.0, |d| d.as_secs_f64());
                let mut payload = BytesMut::with_capacity(16);
                payload.put_f64_le(self.shared.elapsed());
                payload.put_f64_le(utc);
                self.reply(&frame, Status::Ok, payload.freeze());
            }
            (FrameKind::Request, Opcode::Open) => {
                let status = self.open(&frame);
                self.reply(&frame, status, Bytes::new());
            }
            (kind, Opcode::Close) => {
                let released = self
                    .owned
                    .remove(&frame.channel)
                    .is_some_and(|slot| slot.release((self.id, frame.channel)));
                if kind == FrameKind::Request {
                    let status = if released { Status::Ok } else { Status::NotOpen };
                    self.reply(&frame, status, Bytes::new());
                }
            }
            (FrameKind::Request, Opcode::SetState) => {
                let status = self.set_state(&frame);
                self.reply(&frame, status, Bytes::new());
            }
            (FrameKind::Request, Opcode::Read) => self.read(frame),
            (FrameKind::Notify, Opcode::CancelRead) => self.cancel_read(&frame),
            (FrameKind::Request, _) => self.reply(&frame, Status::InvalidRequest, Bytes::new()),
            (kind, opcode) => log::debug!("Ignoring {:?} {:?} from client", kind, opcode),
        }
    }

    fn open(&mut self, frame: &Frame) -> Status {
        let mut body = frame.payload.clone();
        let Ok(path) = get_str(&mut body) else {
            return Status::InvalidRequest;
        };
        if !body.has_remaining()
            || DeviceFamily::from_u8(body.get_u8()) != Some(DeviceFamily::Adc)
        {
            return Status::InvalidRequest;
        }
        let config = match AdcConfig::decode(&mut body) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Rejecting open of {}: {}", path, e);
                return Status::InvalidRequest;
            }
        };
        if self.owned.contains_key(&frame.channel) {
            return Status::InvalidRequest;
        }
        let Some(slot) = self.shared.devices.lock().get(&path).cloned() else {
            return Status::DeviceUnavailable;
        };
        let Ok(buffer) = ContinuousSampleBuffer::new(config.buffer_capacity()) else {
            return Status::InvalidRequest;
        };

        {
            let mut open = slot.open.lock();
            if open.is_some() {
                return Status::DeviceBusy;
            }
            *open = Some(Arc::new(OpenAdc {
                owner: (self.id, frame.channel),
                calibrator: Calibrator::for_config(&config),
                config,
                buffer,
                active: AtomicBool::new(false),
                read_cancel: Mutex::new(None),
            }));
        }
        log::debug!("Opened {} as {}", path, frame.channel);
        self.owned.insert(frame.channel, slot);
        Status::Ok
    }

    fn set_state(&self, frame: &Frame) -> Status {
        let Some(adc) = self.open_adc(frame.channel) else {
            return Status::NotOpen;
        };
        let mut body = frame.payload.clone();
        if body.remaining() < 2 {
            return Status::InvalidRequest;
        }
        let active = body.get_u8() != 0;
        let flush = body.get_u8() != 0;
        if flush {
            adc.buffer.flush();
        }
        adc.active.store(active, Ordering::Release);
        Status::Ok
    }

    fn read(&self, frame: Frame) {
        let Some(adc) = self.open_adc(frame.channel) else {
            self.reply(&frame, Status::NotOpen, Bytes::new());
            return;
        };
        let mut body = frame.payload.clone();
        if body.remaining() < 8 {
            self.reply(&frame, Status::InvalidRequest, Bytes::new());
            return;
        }
        let requested = body.get_u32_le() as usize;
        let wait_ms = body.get_u32_le();
        let wait = (wait_ms > 0).then(|| Duration::from_millis(u64::from(wait_ms)));

        let sub_channels = adc.config.sub_channel_count();
        let bytes_per_code = adc.config.bytes_per_code();
        let fits = SampleBlock::max_records(
            self.shared.options.max_message_size.saturating_sub(HEADER_SIZE),
            sub_channels,
            bytes_per_code,
            adc.config.transfer_size(),
        );
        let max_records = requested.min(fits).max(1);

        let token = CancelToken::new();
        *adc.read_cancel.lock() = Some(token.clone());
        let writer = Arc::clone(&self.writer);
        let spawned = thread::Builder::new()
            .name(format!("sim-server-read-{}", frame.channel))
            .spawn(move || {
                let drained = adc.buffer.drain_blocking(max_records, wait, &token);
                adc.read_cancel.lock().take();
                if drained.outcome == DrainOutcome::TimedOut && drained.records.is_empty() {
                    send(&writer, &Frame::response_to(&frame, Status::Timeout, Bytes::new()));
                    return;
                }
                let mut block = SampleBlock::from_records(
                    drained.first_index,
                    sub_channels as u8,
                    bytes_per_code as u8,
                    &drained.records,
                );
                block.dropped = drained.dropped;
                block.fullness = drained.fullness;
                block.terminal = drained.outcome == DrainOutcome::Closed;
                let mut payload = BytesMut::new();
                block.encode(&mut payload);
                send(
                    &writer,
                    &Frame::response_to(&frame, Status::Ok, payload.freeze()),
                );
            });
        if let Err(e) = spawned {
            log::warn!("Could not spawn read thread: {}", e);
        }
    }

    fn cancel_read(&self, frame: &Frame) {
        let Some(adc) = self.open_adc(frame.channel) else {
            return;
        };
        let flush = frame.payload.first().is_some_and(|&b| b != 0);
        if flush {
            adc.buffer.flush();
        }
        if let Some(token) = adc.read_cancel.lock().as_ref() {
            token.cancel();
        }
        adc.buffer.wake_all();
    }
}

fn send(writer: &Writer, frame: &Frame) {
    if let Err(e) = writer.lock().write_frame(frame) {
        log::debug!("Reply to {:?} on {} failed: {}", frame.opcode, frame.channel, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_ignored_until_open_and_active() {
        let server = SimServer::start().unwrap();
        let device = server.add_device("/dev/adc0");
        assert!(!device.is_open());
        assert_eq!(device.append(&[1, 2, 3]), 0);
        assert_eq!(device.buffered(), 0);
    }

    #[test]
    fn test_add_device_is_idempotent() {
        let server = SimServer::start().unwrap();
        let first = server.add_device("/dev/adc0");
        let second = server.add_device("/dev/adc0");
        assert!(Arc::ptr_eq(&first.slot, &second.slot));
        assert_eq!(server.endpoint().to_string(), format!("tcp://{}", server.local_addr()));
    }
}
