//! Turns raw sample blocks into calibrated, timestamped samples.

use crate::adc_config::{AdcConfig, SubChannel};
use crate::calibration::Calibrator;
use crate::rate_filter::{FilterStage, RawSample};
use crate::read_result::Sample;
use crate::sample_block::{Anchor, SampleBlock};
use crate::wire::WireError;

/// Per-channel decoding state.
///
/// Holds what must survive between reads: the most recent timestamp
/// anchor and partial rate filter windows.
#[derive(Debug, Clone)]
pub struct Decoder {
    sub_channels: Vec<SubChannel>,
    calibrator: Calibrator,
    filter: FilterStage,
    sample_rate: f64,
    last_anchor: Option<Anchor>,
}

impl Decoder {
    pub fn new(config: &AdcConfig) -> Self {
        Self {
            sub_channels: config.sub_channels(),
            calibrator: Calibrator::for_config(config),
            filter: FilterStage::new(config.rate_filter()),
            sample_rate: config.actual_rate(),
            last_anchor: None,
        }
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    /// Decodes one block. Samples come out ordered by index, sub-channel A
    /// before B within an index.
    ///
    /// A block whose record layout does not match the open configuration
    /// is rejected and leaves the decoder state untouched.
    pub fn decode(&mut self, block: &SampleBlock) -> Result<Vec<Sample>, WireError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("decode_block"), 0));

        let raw = self.demultiplex(block)?;
        let filtered = self.filter.apply(block.first_index, raw);

        let carried = self.last_anchor;
        let timeline = Timeline {
            carried,
            anchors: &block.anchors,
            period: 1.0 / self.sample_rate,
        };
        let samples = filtered
            .into_iter()
            .map(|raw| Sample {
                sub_channel: raw.sub_channel,
                index: raw.index,
                raw: raw.code,
                value: self.calibrator.code_to_volts(raw.code),
                out_of_range: raw.out_of_range,
                timestamp: timeline.time_of(raw.index),
            })
            .collect();

        if let Some(last) = block.anchors.last() {
            self.last_anchor = Some(*last);
        }
        Ok(samples)
    }

    fn demultiplex(&self, block: &SampleBlock) -> Result<Vec<RawSample>, WireError> {
        let per_record = self.sub_channels.len();
        if usize::from(block.sub_channels) != per_record {
            return Err(WireError::SubChannelMismatch {
                expected: per_record,
                found: block.sub_channels,
            });
        }
        Ok(block
            .codes
            .iter()
            .zip(&block.out_of_range)
            .enumerate()
            .map(|(i, (&code, &out_of_range))| RawSample {
                sub_channel: self.sub_channels[i % per_record],
                index: block.first_index + (i / per_record) as u64,
                code: f64::from(self.calibrator.to_offset_binary(code)),
                out_of_range,
            })
            .collect())
    }
}

struct Timeline<'a> {
    carried: Option<Anchor>,
    anchors: &'a [Anchor],
    period: f64,
}

impl Timeline<'_> {
    /// Wall-clock time of `index` from the closest anchor at or before it,
    /// or extrapolated back from the first anchor when none precedes it.
    fn time_of(&self, index: u64) -> Option<f64> {
        let preceding = self
            .anchors
            .iter()
            .rev()
            .find(|a| a.index <= index)
            .copied()
            .or(self.carried.filter(|a| a.index <= index));
        let anchor = preceding.or_else(|| self.anchors.first().copied())?;
        let offset = index as f64 - anchor.index as f64;
        Some(anchor.time + offset * self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_filter::RateFilter;
    use crate::sample_block::RawRecord;

    fn two_channel_config(filter: Option<RateFilter>) -> AdcConfig {
        AdcConfig::builder()
            .sampling_rate(1000.0)
            .bit_depth(10)
            .input_range(-5.0, 5.0)
            .buffer_capacity(4096)
            .transfer_size(10)
            .chan_b(true)
            .rate_filter(filter)
            .build()
            .unwrap()
    }

    #[test]
    fn test_demultiplexes_by_parity() {
        let config = two_channel_config(None);
        let mut decoder = Decoder::new(&config);
        let records = [
            RawRecord::pair(0, true, 1023, true),
            RawRecord::pair(1023, true, 0, true),
        ];
        let block = SampleBlock::from_records(7, 2, 2, &records);
        let samples = decoder.decode(&block).unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].sub_channel, SubChannel::A);
        assert_eq!(samples[1].sub_channel, SubChannel::B);
        assert_eq!(samples[0].index, 7);
        assert_eq!(samples[1].index, 7);
        assert_eq!(samples[2].index, 8);
        assert!((samples[0].value + 5.0).abs() < 1e-9);
        assert!((samples[1].value - 5.0).abs() < 1e-9);
        assert!(samples.iter().all(|s| s.out_of_range));
    }

    #[test]
    fn test_timestamps_follow_anchors_and_carry_over() {
        let config = two_channel_config(None);
        let mut decoder = Decoder::new(&config);

        let first: Vec<RawRecord> = (0..5)
            .map(|i| {
                let r = RawRecord::pair(512, false, 512, false);
                if i == 2 {
                    r.with_anchor(100.0)
                } else {
                    r
                }
            })
            .collect();
        let samples = decoder.decode(&SampleBlock::from_records(0, 2, 2, &first)).unwrap();
        // index 0 is before the first anchor, extrapolated backwards
        assert!((samples[0].timestamp.unwrap() - 99.998).abs() < 1e-9);
        assert!((samples[8].timestamp.unwrap() - 100.002).abs() < 1e-9);

        // no anchor in the second block, the carried one is used
        let second = vec![RawRecord::pair(512, false, 512, false); 3];
        let samples = decoder.decode(&SampleBlock::from_records(5, 2, 2, &second)).unwrap();
        assert!((samples[0].timestamp.unwrap() - 100.003).abs() < 1e-9);
    }

    #[test]
    fn test_no_anchor_means_no_timestamp() {
        let config = two_channel_config(None);
        let mut decoder = Decoder::new(&config);
        let records = vec![RawRecord::pair(1, false, 2, false); 2];
        let samples = decoder.decode(&SampleBlock::from_records(0, 2, 2, &records)).unwrap();
        assert!(samples.iter().all(|s| s.timestamp.is_none()));
    }

    #[test]
    fn test_averaging_happens_before_calibration() {
        let config = two_channel_config(Some(RateFilter::Average(2)));
        let mut decoder = Decoder::new(&config);
        let records = [
            RawRecord::pair(0, true, 100, false),
            RawRecord::pair(1023, true, 300, false),
        ];
        let samples = decoder.decode(&SampleBlock::from_records(0, 2, 2, &records)).unwrap();
        assert_eq!(samples.len(), 2);
        assert!((samples[0].raw - 511.5).abs() < 1e-9);
        assert!(samples[0].value.abs() < 1e-9);
        assert!(samples[0].out_of_range);
        assert!((samples[1].raw - 200.0).abs() < 1e-9);
        assert!(!samples[1].out_of_range);
    }

    #[test]
    fn test_layout_mismatch_is_rejected_without_losing_state() {
        let config = two_channel_config(Some(RateFilter::Average(2)));
        let mut decoder = Decoder::new(&config);
        let first = [RawRecord::pair(100, false, 10, false)];
        assert!(decoder
            .decode(&SampleBlock::from_records(0, 2, 2, &first))
            .unwrap()
            .is_empty());

        let single = [RawRecord::single(7, false), RawRecord::single(7, false)];
        let err = decoder
            .decode(&SampleBlock::from_records(1, 1, 2, &single))
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::SubChannelMismatch {
                expected: 2,
                found: 1
            }
        ));

        // the partial window from the first block is still pending
        let second = [RawRecord::pair(300, false, 30, false)];
        let samples = decoder
            .decode(&SampleBlock::from_records(1, 2, 2, &second))
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].index, 0);
        assert!((samples[0].raw - 200.0).abs() < 1e-9);
        assert!((samples[1].raw - 20.0).abs() < 1e-9);
    }
}
