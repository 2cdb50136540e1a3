use crate::adc_config::{AdcConfig, AdcConfigBuilder};
use crate::barst_session::Session;
use crate::calibration::Calibrator;
use crate::cancel_token::CancelToken;
use crate::channel::{Channel, ChannelError, ChannelState};
use crate::decoder::Decoder;
use crate::read_result::{ReadRates, ReadResult};
use crate::sample_block::SampleBlock;
use crate::wire::{ChannelId, HEADER_SIZE};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Client side of a continuously sampling two-input ADC.
///
/// The device starts inactive; call [`set_state(true)`](Self::set_state)
/// to begin filling the server buffer, then [`read`](Self::read)
/// repeatedly.
///
/// ```rust,no_run
/// use barst_rs::{AdcChannel, AdcConfig, Session, SessionConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let session = Session::connect(SessionConfig::new("tcp://127.0.0.1:4000".parse()?))?;
/// let config = AdcConfig::builder()
///     .sampling_rate(1000.0)
///     .bit_depth(16)
///     .input_range(-10.0, 10.0)
///     .chan_b(true)
///     .build()?;
/// let adc = AdcChannel::open(&session, "/dev/adc0", config)?;
/// adc.set_state(true)?;
/// let result = adc.read(500)?;
/// println!("{} scans, {} dropped", result.count(), result.dropped_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AdcChannel {
    channel: Channel,
    config: AdcConfig,
    decoder: Mutex<Decoder>,
    /// When records were last accounted for, for the rate estimate.
    rate_mark: Mutex<Option<Instant>>,
}

impl AdcChannel {
    pub fn open(session: &Session, device: &str, config: AdcConfig) -> Result<Self, ChannelError> {
        let channel = Channel::open(session, device, &config)?;
        log::debug!(
            "Opened ADC {} as {}: requested {} Hz, sampling at {} Hz",
            device,
            channel.id(),
            config.requested_rate(),
            config.actual_rate()
        );
        Ok(Self {
            decoder: Mutex::new(Decoder::new(&config)),
            channel,
            config,
            rate_mark: Mutex::new(None),
        })
    }

    /// Validates `builder` before contacting the server.
    pub fn open_with(
        session: &Session,
        device: &str,
        builder: AdcConfigBuilder,
    ) -> Result<Self, ChannelError> {
        Self::open(session, device, builder.build()?)
    }

    pub fn config(&self) -> &AdcConfig {
        &self.config
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    pub fn calibrator(&self) -> Calibrator {
        *self.decoder.lock().calibrator()
    }

    /// `(scale, zero_offset)` such that `volts = (code - zero_offset) * scale`.
    pub fn conversion_factors(&self) -> (f64, f64) {
        self.calibrator().conversion_factors()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.channel.set_read_timeout(timeout);
    }

    pub fn set_state(&self, active: bool) -> Result<(), ChannelError> {
        let was_active = self.channel.is_active();
        self.channel.set_state(active)?;
        if active && !was_active {
            *self.rate_mark.lock() = Some(Instant::now());
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ChannelError> {
        self.channel.flush()
    }

    /// Reads up to `max_samples` scans, blocking until at least one raw
    /// record is available or the read is cancelled or closed.
    pub fn read(&self, max_samples: usize) -> Result<ReadResult, ChannelError> {
        self.read_with(max_samples, &CancelToken::new())
    }

    /// [`read`](Self::read) that also returns early when `cancel` fires.
    pub fn read_with(
        &self,
        max_samples: usize,
        cancel: &CancelToken,
    ) -> Result<ReadResult, ChannelError> {
        let block = self
            .channel
            .read_block(self.records_for(max_samples), cancel)?;
        self.finish(&block)
    }

    /// Raw records to ask for so at most `max_samples` scans come out of the
    /// rate filter, capped by what fits in one message.
    fn records_for(&self, max_samples: usize) -> u32 {
        let factor = self.config.rate_filter().map_or(1, |f| f.factor() as usize);
        let budget = self
            .channel
            .session()
            .max_message_size()
            .saturating_sub(HEADER_SIZE);
        let fits = SampleBlock::max_records(
            budget,
            self.config.sub_channel_count(),
            self.config.bytes_per_code(),
            self.config.transfer_size(),
        );
        max_samples
            .saturating_mul(factor)
            .min(fits)
            .min(u32::MAX as usize)
            .max(1) as u32
    }

    fn finish(&self, block: &SampleBlock) -> Result<ReadResult, ChannelError> {
        let samples = self.decoder.lock().decode(block)?;
        if block.dropped > 0 {
            log::warn!(
                "{}: {} records lost to buffer overflow (fullness {:.2})",
                self.channel.id(),
                block.dropped,
                block.fullness
            );
        }

        let delivered = block.record_count() as u64;
        let now = Instant::now();
        let elapsed = {
            let mut mark = self.rate_mark.lock();
            let elapsed = mark
                .map(|since| now.duration_since(since).as_secs_f64())
                .filter(|secs| *secs > 0.0);
            if mark.is_some() {
                *mark = Some(now);
            }
            elapsed
        };
        let rates = elapsed.map(|secs| ReadRates {
            delivered: delivered as f64 / secs,
            produced: (delivered + block.dropped) as f64 / secs,
        });

        Ok(ReadResult::new(
            samples,
            self.config.sub_channel_count(),
            block.first_index,
            block.dropped,
            block.fullness,
            rates,
            block.terminal,
        ))
    }

    /// Makes the outstanding read return with what is buffered.
    pub fn cancel_read(&self) {
        self.channel.cancel_read();
    }

    /// Cancels the outstanding read and discards unread samples.
    pub fn cancel_read_and_flush(&self) {
        self.channel.cancel_read_and_flush();
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        *self.rate_mark.lock() = None;
        self.channel.close()
    }
}
