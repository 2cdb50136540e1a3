//! Optional decimation or averaging applied to raw codes before
//! calibration.

use crate::adc_config::SubChannel;

/// Rate reduction chosen when the channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateFilter {
    /// Keep records whose index is a multiple of the factor.
    Decimate(u32),
    /// Mean of the raw codes of this many consecutive records.
    Average(u32),
}

impl RateFilter {
    pub fn factor(&self) -> u32 {
        match self {
            Self::Decimate(n) | Self::Average(n) => *n,
        }
    }

    pub(crate) fn as_wire(self) -> (u8, u32) {
        match self {
            Self::Decimate(n) => (1, n),
            Self::Average(n) => (2, n),
        }
    }

    pub(crate) fn from_wire(kind: u8, factor: u32) -> Option<Option<Self>> {
        match kind {
            0 => Some(None),
            1 => Some(Some(Self::Decimate(factor))),
            2 => Some(Some(Self::Average(factor))),
            _ => None,
        }
    }
}

/// One raw reading of one sub-channel, before calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub sub_channel: SubChannel,
    pub index: u64,
    /// Offset-binary code. Averaged samples carry the mean, not rounded.
    pub code: f64,
    pub out_of_range: bool,
}

#[derive(Debug, Default, Clone)]
struct Window {
    first_index: u64,
    sum: f64,
    len: u32,
    saturated: bool,
}

/// Running filter for one channel.
///
/// Averaging windows may straddle reads; a partial window is kept until
/// the next block completes it, and thrown away when the next block does
/// not continue the index sequence.
#[derive(Debug, Clone)]
pub struct FilterStage {
    filter: Option<RateFilter>,
    windows: [Window; 2],
    next_index: Option<u64>,
}

impl FilterStage {
    pub fn new(filter: Option<RateFilter>) -> Self {
        Self {
            filter,
            windows: Default::default(),
            next_index: None,
        }
    }

    pub fn filter(&self) -> Option<RateFilter> {
        self.filter
    }

    /// Filters one block of samples ordered by index, sub-channel A first.
    ///
    /// `first_index` is the index of the first record of the block, which
    /// may differ from the first sample's index when the block is empty.
    pub fn apply(&mut self, first_index: u64, samples: Vec<RawSample>) -> Vec<RawSample> {
        if self.next_index.is_some_and(|next| next != first_index) {
            log::debug!(
                "Index gap before {} (expected {:?}), dropping partial filter windows",
                first_index,
                self.next_index
            );
            self.windows = Default::default();
        }
        self.next_index = Some(samples.last().map_or(first_index, |last| last.index + 1));

        match self.filter {
            None => samples,
            Some(RateFilter::Decimate(n)) => {
                let n = u64::from(n.max(1));
                samples.into_iter().filter(|s| s.index % n == 0).collect()
            }
            Some(RateFilter::Average(n)) => self.average(n.max(1), samples),
        }
    }

    fn average(&mut self, n: u32, samples: Vec<RawSample>) -> Vec<RawSample> {
        let mut out = Vec::with_capacity(samples.len() / n as usize + 2);
        for sample in samples {
            let window = &mut self.windows[sample.sub_channel.position()];
            if window.len == 0 {
                window.first_index = sample.index;
            }
            window.sum += sample.code;
            window.len += 1;
            window.saturated |= sample.out_of_range;

            if window.len == n {
                out.push(RawSample {
                    sub_channel: sample.sub_channel,
                    index: window.first_index,
                    code: window.sum / f64::from(n),
                    out_of_range: window.saturated,
                });
                *window = Window::default();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(first: u64, codes: &[(f64, bool)]) -> Vec<RawSample> {
        codes
            .iter()
            .enumerate()
            .map(|(i, &(code, out_of_range))| RawSample {
                sub_channel: SubChannel::A,
                index: first + i as u64,
                code,
                out_of_range,
            })
            .collect()
    }

    #[test]
    fn test_passthrough_without_filter() {
        let mut stage = FilterStage::new(None);
        let input = mono(0, &[(1.0, false), (2.0, false)]);
        assert_eq!(stage.apply(0, input.clone()), input);
    }

    #[test]
    fn test_decimation_keeps_multiples_across_reads() {
        let mut stage = FilterStage::new(Some(RateFilter::Decimate(3)));
        let codes: Vec<(f64, bool)> = (0..5).map(|c| (f64::from(c), false)).collect();
        let first = stage.apply(0, mono(0, &codes));
        let second = stage.apply(5, mono(5, &codes));
        let kept: Vec<u64> = first.iter().chain(&second).map(|s| s.index).collect();
        assert_eq!(kept, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_average_propagates_saturation_for_whole_window() {
        let mut stage = FilterStage::new(Some(RateFilter::Average(4)));
        let out = stage.apply(
            0,
            mono(
                0,
                &[
                    (100.0, false),
                    (1023.0, true),
                    (100.0, false),
                    (101.0, false),
                    (10.0, false),
                    (20.0, false),
                    (30.0, false),
                    (40.0, false),
                ],
            ),
        );
        assert_eq!(out.len(), 2);
        assert!((out[0].code - 331.0).abs() < 1e-9);
        assert!(out[0].out_of_range);
        assert_eq!(out[0].index, 0);
        assert!((out[1].code - 25.0).abs() < 1e-9);
        assert!(!out[1].out_of_range);
        assert_eq!(out[1].index, 4);
    }

    #[test]
    fn test_average_window_spans_reads() {
        let mut stage = FilterStage::new(Some(RateFilter::Average(2)));
        assert!(stage.apply(0, mono(0, &[(2.0, false)])).is_empty());
        let out = stage.apply(1, mono(1, &[(4.0, false)]));
        assert_eq!(out.len(), 1);
        assert!((out[0].code - 3.0).abs() < 1e-9);
        assert_eq!(out[0].index, 0);
    }

    #[test]
    fn test_gap_discards_partial_window() {
        let mut stage = FilterStage::new(Some(RateFilter::Average(2)));
        assert!(stage.apply(0, mono(0, &[(2.0, true)])).is_empty());
        // index 1 was lost to overflow
        let out = stage.apply(2, mono(2, &[(4.0, false), (6.0, false)]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, 2);
        assert!(!out[0].out_of_range);
    }

    #[test]
    fn test_sub_channels_averaged_independently() {
        let mut stage = FilterStage::new(Some(RateFilter::Average(2)));
        let input = vec![
            RawSample { sub_channel: SubChannel::A, index: 0, code: 1.0, out_of_range: false },
            RawSample { sub_channel: SubChannel::B, index: 0, code: 10.0, out_of_range: false },
            RawSample { sub_channel: SubChannel::A, index: 1, code: 3.0, out_of_range: false },
            RawSample { sub_channel: SubChannel::B, index: 1, code: 30.0, out_of_range: true },
        ];
        let out = stage.apply(0, input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sub_channel, SubChannel::A);
        assert!((out[0].code - 2.0).abs() < 1e-9);
        assert_eq!(out[1].sub_channel, SubChannel::B);
        assert!((out[1].code - 20.0).abs() < 1e-9);
        assert!(out[1].out_of_range);
    }
}
