use crate::rate_filter::RateFilter;
use crate::wire::{ensure_remaining, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Sampling rate {requested} Hz is not a positive finite number")]
    InvalidRate { requested: f64 },

    #[error("Sampling rate {requested} Hz is below the hardware minimum of {minimum} Hz")]
    RateBelowMinimum { requested: f64, minimum: f64 },

    #[error("Clock of {base_hz} Hz with divisors {min_divisor}..={max_divisor} is not usable")]
    InvalidClock {
        base_hz: f64,
        min_divisor: u32,
        max_divisor: u32,
    },

    #[error("Bit depth {0} is outside 1..=24")]
    InvalidBitDepth(u8),

    #[error("Input range [{min}, {max}] V is empty or not finite")]
    InvalidRange { min: f64, max: f64 },

    #[error("At least one sub-channel must be enabled")]
    NoSubChannels,

    #[error("Transfer size must be at least one record")]
    ZeroTransferSize,

    #[error("Buffer of {capacity} records cannot hold one transfer block of {transfer_size}")]
    BufferTooSmall { capacity: usize, transfer_size: usize },

    #[error("Rate filter factor must be at least 1")]
    InvalidFilterFactor,

    #[error("Unknown code encoding {0}")]
    UnknownEncoding(u8),

    #[error("Unknown rate filter kind {0}")]
    UnknownFilter(u8),

    #[error("Malformed configuration payload: {0}")]
    Malformed(#[from] WireError),
}

/// One of the two analog inputs of the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubChannel {
    A,
    B,
}

impl SubChannel {
    pub fn position(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

/// How the converter represents a code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeEncoding {
    /// 0 is the lowest rail, `2^bits - 1` the highest.
    OffsetBinary,
    /// Signed, `-2^(bits-1)` is the lowest rail.
    TwosComplement,
}

impl CodeEncoding {
    fn as_u8(self) -> u8 {
        match self {
            Self::OffsetBinary => 0,
            Self::TwosComplement => 1,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::OffsetBinary),
            1 => Some(Self::TwosComplement),
            _ => None,
        }
    }
}

/// Input voltage range of the converter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputRange {
    min: f64,
    max: f64,
}

impl InputRange {
    pub fn new(min: f64, max: f64) -> Result<Self, ConfigError> {
        if !(min.is_finite() && max.is_finite() && max > min) {
            return Err(ConfigError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// `[-volts, +volts]`
    pub fn bipolar(volts: f64) -> Result<Self, ConfigError> {
        Self::new(-volts, volts)
    }

    /// `[0, +volts]`
    pub fn unipolar(volts: f64) -> Result<Self, ConfigError> {
        Self::new(0.0, volts)
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn is_bipolar(&self) -> bool {
        self.min < 0.0 && self.max > 0.0
    }
}

/// Sample clock of the converter: the achievable rates are
/// `base_hz / divisor` for an integer divisor in
/// `min_divisor..=max_divisor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcClock {
    pub base_hz: f64,
    pub min_divisor: u32,
    pub max_divisor: u32,
}

impl Default for AdcClock {
    fn default() -> Self {
        Self {
            base_hz: 6_000_000.0,
            min_divisor: 200,
            max_divisor: 65_535,
        }
    }
}

impl AdcClock {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_hz.is_finite() && self.base_hz > 0.0)
            || self.min_divisor == 0
            || self.min_divisor > self.max_divisor
        {
            return Err(ConfigError::InvalidClock {
                base_hz: self.base_hz,
                min_divisor: self.min_divisor,
                max_divisor: self.max_divisor,
            });
        }
        Ok(())
    }

    pub fn max_rate(&self) -> f64 {
        self.rate_for_divisor(self.min_divisor)
    }

    pub fn min_rate(&self) -> f64 {
        self.rate_for_divisor(self.max_divisor)
    }

    pub fn rate_for_divisor(&self, divisor: u32) -> f64 {
        self.base_hz / f64::from(divisor)
    }

    /// Smallest divisor whose rate does not exceed `requested`.
    pub fn divisor_for(&self, requested: f64) -> Result<u32, ConfigError> {
        self.validate()?;
        if !(requested.is_finite() && requested > 0.0) {
            return Err(ConfigError::InvalidRate { requested });
        }
        // keeps base_hz / requested within the divisor range before the cast
        if requested < self.min_rate() {
            return Err(ConfigError::RateBelowMinimum {
                requested,
                minimum: self.min_rate(),
            });
        }

        let min = u64::from(self.min_divisor);
        let mut divisor = ((self.base_hz / requested).ceil() as u64).max(min);
        // the division may land a hair above an exact integer
        if divisor > min && self.base_hz / (divisor - 1) as f64 <= requested {
            divisor -= 1;
        }
        if self.base_hz / divisor as f64 > requested {
            divisor += 1;
        }

        if divisor > u64::from(self.max_divisor) {
            return Err(ConfigError::RateBelowMinimum {
                requested,
                minimum: self.min_rate(),
            });
        }
        Ok(divisor as u32)
    }

    /// Fastest achievable rate at or below `requested`.
    pub fn nearest_achievable(&self, requested: f64) -> Result<f64, ConfigError> {
        Ok(self.rate_for_divisor(self.divisor_for(requested)?))
    }
}

/// Configuration of a two-input analog acquisition channel.
///
/// Only constructible through [`AdcConfig::builder`], which checks every
/// field, so a value of this type is always valid.
#[derive(Debug, Clone, PartialEq)]
pub struct AdcConfig {
    requested_rate: f64,
    clock: AdcClock,
    divisor: u32,
    bit_depth: u8,
    encoding: CodeEncoding,
    input_range: InputRange,
    buffer_capacity: usize,
    transfer_size: usize,
    chan_a: bool,
    chan_b: bool,
    rate_filter: Option<RateFilter>,
}

impl AdcConfig {
    pub fn builder() -> AdcConfigBuilder {
        AdcConfigBuilder::new()
    }

    pub fn requested_rate(&self) -> f64 {
        self.requested_rate
    }

    /// Rate the hardware will actually sample at.
    pub fn actual_rate(&self) -> f64 {
        self.clock.rate_for_divisor(self.divisor)
    }

    pub fn clock(&self) -> AdcClock {
        self.clock
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn encoding(&self) -> CodeEncoding {
        self.encoding
    }

    pub fn input_range(&self) -> InputRange {
        self.input_range
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    pub fn rate_filter(&self) -> Option<RateFilter> {
        self.rate_filter
    }

    pub fn is_enabled(&self, sub_channel: SubChannel) -> bool {
        match sub_channel {
            SubChannel::A => self.chan_a,
            SubChannel::B => self.chan_b,
        }
    }

    /// Enabled sub-channels in interleave order.
    pub fn sub_channels(&self) -> Vec<SubChannel> {
        [SubChannel::A, SubChannel::B]
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }

    pub fn sub_channel_count(&self) -> usize {
        usize::from(self.chan_a) + usize::from(self.chan_b)
    }

    /// Bytes one code occupies on the wire.
    pub fn bytes_per_code(&self) -> usize {
        usize::from(self.bit_depth).div_ceil(8)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_f64_le(self.requested_rate);
        dst.put_f64_le(self.clock.base_hz);
        dst.put_u32_le(self.clock.min_divisor);
        dst.put_u32_le(self.clock.max_divisor);
        dst.put_u8(self.bit_depth);
        dst.put_u8(self.encoding.as_u8());
        dst.put_f64_le(self.input_range.min);
        dst.put_f64_le(self.input_range.max);
        dst.put_u32_le(self.buffer_capacity as u32);
        dst.put_u32_le(self.transfer_size as u32);
        dst.put_u8(u8::from(self.chan_a) | (u8::from(self.chan_b) << 1));
        let (kind, factor) = self.rate_filter.map_or((0, 0), RateFilter::as_wire);
        dst.put_u8(kind);
        dst.put_u32_le(factor);
    }

    /// Parses and re-validates a configuration sent by [`encode`](Self::encode).
    pub fn decode(src: &mut Bytes) -> Result<Self, ConfigError> {
        ensure_remaining(&*src, 8 + 8 + 4 + 4 + 1 + 1 + 8 + 8 + 4 + 4 + 1 + 1 + 4)?;
        let requested_rate = src.get_f64_le();
        let clock = AdcClock {
            base_hz: src.get_f64_le(),
            min_divisor: src.get_u32_le(),
            max_divisor: src.get_u32_le(),
        };
        let bit_depth = src.get_u8();
        let encoding_raw = src.get_u8();
        let range_min = src.get_f64_le();
        let range_max = src.get_f64_le();
        let buffer_capacity = src.get_u32_le() as usize;
        let transfer_size = src.get_u32_le() as usize;
        let mask = src.get_u8();
        let filter_kind = src.get_u8();
        let filter_factor = src.get_u32_le();

        let encoding = CodeEncoding::from_u8(encoding_raw)
            .ok_or(ConfigError::UnknownEncoding(encoding_raw))?;
        let rate_filter = RateFilter::from_wire(filter_kind, filter_factor)
            .ok_or(ConfigError::UnknownFilter(filter_kind))?;

        AdcConfigBuilder {
            sampling_rate: requested_rate,
            clock,
            bit_depth,
            encoding,
            range_min,
            range_max,
            buffer_capacity,
            transfer_size,
            chan_a: mask & 1 != 0,
            chan_b: mask & 2 != 0,
            rate_filter,
        }
        .build()
    }
}

#[derive(Debug, Clone)]
pub struct AdcConfigBuilder {
    sampling_rate: f64,
    clock: AdcClock,
    bit_depth: u8,
    encoding: CodeEncoding,
    range_min: f64,
    range_max: f64,
    buffer_capacity: usize,
    transfer_size: usize,
    chan_a: bool,
    chan_b: bool,
    rate_filter: Option<RateFilter>,
}

impl AdcConfigBuilder {
    pub fn new() -> Self {
        Self {
            sampling_rate: 1000.0,
            clock: AdcClock::default(),
            bit_depth: 16,
            encoding: CodeEncoding::OffsetBinary,
            range_min: -10.0,
            range_max: 10.0,
            buffer_capacity: 16_384,
            transfer_size: 100,
            chan_a: true,
            chan_b: false,
            rate_filter: None,
        }
    }

    pub fn sampling_rate(mut self, hz: f64) -> Self {
        self.sampling_rate = hz;
        self
    }

    pub fn clock(mut self, clock: AdcClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn bit_depth(mut self, bits: u8) -> Self {
        self.bit_depth = bits;
        self
    }

    pub fn encoding(mut self, encoding: CodeEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn input_range(mut self, min: f64, max: f64) -> Self {
        self.range_min = min;
        self.range_max = max;
        self
    }

    pub fn buffer_capacity(mut self, records: usize) -> Self {
        self.buffer_capacity = records;
        self
    }

    pub fn transfer_size(mut self, records: usize) -> Self {
        self.transfer_size = records;
        self
    }

    pub fn chan_a(mut self, enabled: bool) -> Self {
        self.chan_a = enabled;
        self
    }

    pub fn chan_b(mut self, enabled: bool) -> Self {
        self.chan_b = enabled;
        self
    }

    pub fn rate_filter(mut self, filter: Option<RateFilter>) -> Self {
        self.rate_filter = filter;
        self
    }

    pub fn build(self) -> Result<AdcConfig, ConfigError> {
        if !(1..=24).contains(&self.bit_depth) {
            return Err(ConfigError::InvalidBitDepth(self.bit_depth));
        }
        let input_range = InputRange::new(self.range_min, self.range_max)?;
        if !(self.chan_a || self.chan_b) {
            return Err(ConfigError::NoSubChannels);
        }
        if self.transfer_size == 0 {
            return Err(ConfigError::ZeroTransferSize);
        }
        if self.buffer_capacity < self.transfer_size {
            return Err(ConfigError::BufferTooSmall {
                capacity: self.buffer_capacity,
                transfer_size: self.transfer_size,
            });
        }
        if self.rate_filter.is_some_and(|f| f.factor() == 0) {
            return Err(ConfigError::InvalidFilterFactor);
        }
        let divisor = self.clock.divisor_for(self.sampling_rate)?;

        Ok(AdcConfig {
            requested_rate: self.sampling_rate,
            clock: self.clock,
            divisor,
            bit_depth: self.bit_depth,
            encoding: self.encoding,
            input_range,
            buffer_capacity: self.buffer_capacity,
            transfer_size: self.transfer_size,
            chan_a: self.chan_a,
            chan_b: self.chan_b,
            rate_filter: self.rate_filter,
        })
    }
}

impl Default for AdcConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actual_rate_never_exceeds_request() {
        let clock = AdcClock::default();
        for requested in [91.6, 100.0, 999.9, 1000.0, 1234.5, 11_000.0, 29_999.0, 50_000.0] {
            let actual = clock.nearest_achievable(requested).unwrap();
            assert!(actual <= requested, "{actual} > {requested}");
            let divisor = clock.divisor_for(requested).unwrap();
            // the next faster divisor would overshoot, unless we are at the top
            if divisor > clock.min_divisor {
                assert!(clock.rate_for_divisor(divisor - 1) > requested);
            }
        }
    }

    #[test]
    fn test_exact_rates_are_kept() {
        let clock = AdcClock::default();
        assert_eq!(clock.nearest_achievable(1000.0).unwrap(), 1000.0);
        assert_eq!(clock.nearest_achievable(30_000.0).unwrap(), 30_000.0);
    }

    #[test]
    fn test_rate_above_max_clamps_to_max() {
        let clock = AdcClock::default();
        assert_eq!(clock.nearest_achievable(1e9).unwrap(), clock.max_rate());
    }

    #[test]
    fn test_rate_below_minimum_rejected() {
        let err = AdcConfig::builder().sampling_rate(10.0).build().unwrap_err();
        assert!(matches!(err, ConfigError::RateBelowMinimum { .. }));
        for tiny in [1e-300, f64::MIN_POSITIVE, 1e-3] {
            assert!(matches!(
                AdcConfig::builder().sampling_rate(tiny).build(),
                Err(ConfigError::RateBelowMinimum { .. })
            ));
        }
        let clock = AdcClock::default();
        assert_eq!(clock.divisor_for(clock.min_rate()).unwrap(), clock.max_divisor);
        assert!(matches!(
            AdcConfig::builder().sampling_rate(f64::NAN).build(),
            Err(ConfigError::InvalidRate { .. })
        ));
    }

    #[test]
    fn test_buffer_must_hold_a_transfer_block() {
        let err = AdcConfig::builder()
            .buffer_capacity(50)
            .transfer_size(100)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BufferTooSmall { capacity: 50, transfer_size: 100 }
        ));
    }

    #[test]
    fn test_field_invariants() {
        assert!(matches!(
            AdcConfig::builder().bit_depth(0).build(),
            Err(ConfigError::InvalidBitDepth(0))
        ));
        assert!(matches!(
            AdcConfig::builder().bit_depth(25).build(),
            Err(ConfigError::InvalidBitDepth(25))
        ));
        assert!(matches!(
            AdcConfig::builder().input_range(5.0, 5.0).build(),
            Err(ConfigError::InvalidRange { .. })
        ));
        assert!(matches!(
            AdcConfig::builder().chan_a(false).chan_b(false).build(),
            Err(ConfigError::NoSubChannels)
        ));
        assert!(matches!(
            AdcConfig::builder().transfer_size(0).build(),
            Err(ConfigError::ZeroTransferSize)
        ));
        assert!(matches!(
            AdcConfig::builder()
                .rate_filter(Some(RateFilter::Average(0)))
                .build(),
            Err(ConfigError::InvalidFilterFactor)
        ));
    }

    #[test]
    fn test_wire_encoding_preserves_config() {
        let config = AdcConfig::builder()
            .sampling_rate(2500.0)
            .bit_depth(10)
            .encoding(CodeEncoding::TwosComplement)
            .input_range(-5.0, 5.0)
            .buffer_capacity(4096)
            .transfer_size(64)
            .chan_b(true)
            .rate_filter(Some(RateFilter::Average(4)))
            .build()
            .unwrap();
        let mut buf = BytesMut::new();
        config.encode(&mut buf);
        let decoded = AdcConfig::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.sub_channels(), vec![SubChannel::A, SubChannel::B]);
        assert_eq!(decoded.bytes_per_code(), 2);
    }
}
