use crate::adc_config::SubChannel;
use polars::prelude::*;

const INDEX_COLUMN_NAME: &str = "index";
const SUB_CHANNEL_COLUMN_NAME: &str = "sub_channel";
const RAW_COLUMN_NAME: &str = "raw";
const VALUE_COLUMN_NAME: &str = "value";
const OUT_OF_RANGE_COLUMN_NAME: &str = "out_of_range";
const TIME_COLUMN_NAME: &str = "time";

/// One decoded reading of one sub-channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub sub_channel: SubChannel,
    /// Position in the channel's sample sequence.
    pub index: u64,
    /// Offset-binary code, the window mean when averaging.
    pub raw: f64,
    /// Calibrated value in volts, never clipped.
    pub value: f64,
    pub out_of_range: bool,
    /// Server wall-clock seconds, `None` until a timestamp anchor is seen.
    pub timestamp: Option<f64>,
}

/// Per-read rate estimates in raw records per second, measured over the
/// wall time since the previous read or since activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ReadRates {
    /// Records delivered by this read.
    pub delivered: f64,
    /// Records delivered plus records lost to overflow.
    pub produced: f64,
}

/// Outcome of one read on an acquisition channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    samples: Vec<Sample>,
    sub_channel_count: usize,
    first_index: u64,
    dropped_count: u64,
    fullness: f64,
    rates: Option<ReadRates>,
    terminal: bool,
}

impl ReadResult {
    pub(crate) fn new(
        samples: Vec<Sample>,
        sub_channel_count: usize,
        first_index: u64,
        dropped_count: u64,
        fullness: f64,
        rates: Option<ReadRates>,
        terminal: bool,
    ) -> Self {
        Self {
            samples,
            sub_channel_count: sub_channel_count.max(1),
            first_index,
            dropped_count,
            fullness,
            rates,
            terminal,
        }
    }

    /// Every sample, ordered by index with sub-channel A first.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Number of scans (one sample per enabled sub-channel) delivered.
    pub fn count(&self) -> usize {
        self.samples.len() / self.sub_channel_count
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Index of the first record the server delivered for this read.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Records lost to buffer overflow since the previous read.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Server buffer occupancy in `[0, 1]` just before this read drained it.
    pub fn fullness(&self) -> f64 {
        self.fullness
    }

    /// Sampling rate estimated from the raw records this read delivered
    /// and the wall time since the previous read (or since activation).
    /// Records lost to overflow are not counted, so the estimate drops
    /// below the device rate while the reader falls behind.
    ///
    /// `None` until the channel has been activated.
    pub fn sample_rate(&self) -> Option<f64> {
        self.rates.map(|r| r.delivered)
    }

    /// Like [`sample_rate`](Self::sample_rate), but also counting the
    /// records discarded by overflow. Tracks the rate the device actually
    /// produced at.
    pub fn production_rate(&self) -> Option<f64> {
        self.rates.map(|r| r.produced)
    }

    /// The channel was closed while this read was pending; no more data
    /// will follow.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn sub_channel(&self, sub_channel: SubChannel) -> impl Iterator<Item = &Sample> + '_ {
        self.samples
            .iter()
            .filter(move |s| s.sub_channel == sub_channel)
    }

    /// Calibrated values of one sub-channel.
    pub fn values(&self, sub_channel: SubChannel) -> Vec<f64> {
        self.sub_channel(sub_channel).map(|s| s.value).collect()
    }

    /// All samples as a long-format table.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let columns: Vec<Column> = vec![
            Series::new(
                INDEX_COLUMN_NAME.into(),
                self.samples.iter().map(|s| s.index).collect::<Vec<u64>>(),
            )
            .into(),
            Series::new(
                SUB_CHANNEL_COLUMN_NAME.into(),
                self.samples
                    .iter()
                    .map(|s| s.sub_channel.as_str())
                    .collect::<Vec<&str>>(),
            )
            .into(),
            Series::new(
                RAW_COLUMN_NAME.into(),
                self.samples.iter().map(|s| s.raw).collect::<Vec<f64>>(),
            )
            .into(),
            Series::new(
                VALUE_COLUMN_NAME.into(),
                self.samples.iter().map(|s| s.value).collect::<Vec<f64>>(),
            )
            .into(),
            Series::new(
                OUT_OF_RANGE_COLUMN_NAME.into(),
                self.samples
                    .iter()
                    .map(|s| s.out_of_range)
                    .collect::<Vec<bool>>(),
            )
            .into(),
            Series::new(
                TIME_COLUMN_NAME.into(),
                self.samples
                    .iter()
                    .map(|s| s.timestamp)
                    .collect::<Vec<Option<f64>>>(),
            )
            .into(),
        ];
        DataFrame::new(columns)
    }

    /// Samples of one sub-channel with the sub-channel column dropped.
    pub fn sub_channel_frame(&self, sub_channel: SubChannel) -> Result<DataFrame, PolarsError> {
        self.to_dataframe()?
            .lazy()
            .filter(col(SUB_CHANNEL_COLUMN_NAME).eq(lit(sub_channel.as_str())))
            .select([
                col(INDEX_COLUMN_NAME),
                col(TIME_COLUMN_NAME),
                col(RAW_COLUMN_NAME),
                col(VALUE_COLUMN_NAME),
                col(OUT_OF_RANGE_COLUMN_NAME),
            ])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sub_channel: SubChannel, index: u64, value: f64) -> Sample {
        Sample {
            sub_channel,
            index,
            raw: value * 100.0,
            value,
            out_of_range: value > 4.0,
            timestamp: Some(index as f64 * 0.5),
        }
    }

    fn two_scans() -> ReadResult {
        ReadResult::new(
            vec![
                sample(SubChannel::A, 10, 1.0),
                sample(SubChannel::B, 10, 4.5),
                sample(SubChannel::A, 11, 2.0),
                sample(SubChannel::B, 11, 3.0),
            ],
            2,
            10,
            3,
            0.5,
            Some(ReadRates {
                delivered: 800.0,
                produced: 1000.0,
            }),
            false,
        )
    }

    #[test]
    fn test_count_is_scans_not_samples() {
        let result = two_scans();
        assert_eq!(result.count(), 2);
        assert_eq!(result.values(SubChannel::B), vec![4.5, 3.0]);
        assert_eq!(result.dropped_count(), 3);
        assert_eq!(result.sample_rate(), Some(800.0));
        assert_eq!(result.production_rate(), Some(1000.0));
    }

    #[test]
    fn test_dataframe_export() {
        let df = two_scans().to_dataframe().unwrap();
        assert_eq!(df.height(), 4);
        assert_eq!(df.width(), 6);

        let b = two_scans().sub_channel_frame(SubChannel::B).unwrap();
        assert_eq!(b.height(), 2);
        let values: Vec<f64> = b
            .column(VALUE_COLUMN_NAME)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(values, vec![4.5, 3.0]);
        let flags: Vec<Option<bool>> = b
            .column(OUT_OF_RANGE_COLUMN_NAME)
            .unwrap()
            .bool()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(flags, vec![Some(true), Some(false)]);
    }

    #[test]
    fn test_empty_result_exports_empty_frame() {
        let result = ReadResult::new(Vec::new(), 1, 0, 0, 0.0, None, true);
        assert!(result.is_empty());
        assert!(result.is_terminal());
        assert_eq!(result.to_dataframe().unwrap().height(), 0);
    }
}
