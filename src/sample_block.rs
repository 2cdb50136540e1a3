//! Payload of a read response.
//!
//! Records are sent as a flat run of codes in interleave order
//! (A, B, A, B, ... when both sub-channels are enabled), each packed into
//! `bytes_per_code` little-endian bytes, followed by a bitmap holding one
//! out-of-range bit per code. Sample indices are implicit: record `i` of
//! the block has index `first_index + i`. Only a few records carry a
//! wall-clock anchor.

use crate::wire::{ensure_remaining, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const BLOCK_HEADER_SIZE: usize = 8 + 8 + 8 + 4 + 1 + 1 + 1 + 4;
const ANCHOR_SIZE: usize = 4 + 8;
/// Codes are at most 24 bits wide.
const MAX_BYTES_PER_CODE: u8 = 4;

/// One record as the device produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRecord {
    /// Wire codes, one per enabled sub-channel in interleave order.
    /// Unused slots are zero.
    pub codes: [u32; 2],
    pub out_of_range: [bool; 2],
    /// Server wall-clock time in seconds, present on some records only.
    pub anchor: Option<f64>,
}

impl RawRecord {
    pub fn single(code: u32, out_of_range: bool) -> Self {
        Self {
            codes: [code, 0],
            out_of_range: [out_of_range, false],
            anchor: None,
        }
    }

    pub fn pair(a: u32, a_oor: bool, b: u32, b_oor: bool) -> Self {
        Self {
            codes: [a, b],
            out_of_range: [a_oor, b_oor],
            anchor: None,
        }
    }

    pub fn with_anchor(mut self, time: f64) -> Self {
        self.anchor = Some(time);
        self
    }
}

/// Wall-clock time correlated with one sample index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub index: u64,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub first_index: u64,
    pub sub_channels: u8,
    pub bytes_per_code: u8,
    pub dropped: u64,
    pub fullness: f64,
    /// The channel closed while this block was being collected.
    pub terminal: bool,
    /// Interleaved wire codes, `record_count() * sub_channels` long.
    pub codes: Vec<u32>,
    pub out_of_range: Vec<bool>,
    pub anchors: Vec<Anchor>,
}

impl SampleBlock {
    pub fn from_records(
        first_index: u64,
        sub_channels: u8,
        bytes_per_code: u8,
        records: &[RawRecord],
    ) -> Self {
        let per_record = usize::from(sub_channels);
        let mut codes = Vec::with_capacity(records.len() * per_record);
        let mut out_of_range = Vec::with_capacity(records.len() * per_record);
        let mut anchors = Vec::new();
        for (offset, record) in records.iter().enumerate() {
            codes.extend_from_slice(&record.codes[..per_record]);
            out_of_range.extend_from_slice(&record.out_of_range[..per_record]);
            if let Some(time) = record.anchor {
                anchors.push(Anchor {
                    index: first_index + offset as u64,
                    time,
                });
            }
        }
        Self {
            first_index,
            sub_channels,
            bytes_per_code,
            dropped: 0,
            fullness: 0.0,
            terminal: false,
            codes,
            out_of_range,
            anchors,
        }
    }

    pub fn record_count(&self) -> usize {
        match self.sub_channels {
            0 => 0,
            n => self.codes.len() / usize::from(n),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Largest record count whose block is guaranteed to fit in `budget`
    /// payload bytes when anchors come once per `transfer_size` records.
    pub fn max_records(
        budget: usize,
        sub_channels: usize,
        bytes_per_code: usize,
        transfer_size: usize,
    ) -> usize {
        let fixed = BLOCK_HEADER_SIZE + ANCHOR_SIZE + 1;
        let per_record =
            sub_channels * bytes_per_code + 1 + ANCHOR_SIZE.div_ceil(transfer_size.max(1));
        budget.saturating_sub(fixed) / per_record.max(1)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let bpc = usize::from(self.bytes_per_code);
        dst.reserve(
            BLOCK_HEADER_SIZE
                + self.anchors.len() * ANCHOR_SIZE
                + self.codes.len() * bpc
                + self.codes.len().div_ceil(8),
        );
        dst.put_u64_le(self.first_index);
        dst.put_u64_le(self.dropped);
        dst.put_f64_le(self.fullness);
        dst.put_u32_le(self.record_count() as u32);
        dst.put_u8(self.sub_channels);
        dst.put_u8(self.bytes_per_code);
        dst.put_u8(u8::from(self.terminal));
        dst.put_u32_le(self.anchors.len() as u32);
        for anchor in &self.anchors {
            dst.put_u32_le((anchor.index - self.first_index) as u32);
            dst.put_f64_le(anchor.time);
        }
        for &code in &self.codes {
            dst.put_uint_le(u64::from(code), bpc);
        }
        for chunk in self.out_of_range.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, &flag)| acc | (u8::from(flag) << bit));
            dst.put_u8(byte);
        }
    }

    pub fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        ensure_remaining(&*src, BLOCK_HEADER_SIZE)?;
        let first_index = src.get_u64_le();
        let dropped = src.get_u64_le();
        let fullness = src.get_f64_le();
        let records = src.get_u32_le() as usize;
        let sub_channels = src.get_u8();
        let bytes_per_code = src.get_u8();
        let terminal = src.get_u8() != 0;
        let anchor_count = src.get_u32_le() as usize;
        if !(1..=2).contains(&sub_channels)
            || !(1..=MAX_BYTES_PER_CODE).contains(&bytes_per_code)
        {
            return Err(WireError::BadBlockLayout {
                sub_channels,
                bytes_per_code,
            });
        }

        ensure_remaining(&*src, anchor_count * ANCHOR_SIZE)?;
        let anchors = (0..anchor_count)
            .map(|_| {
                let offset = u64::from(src.get_u32_le());
                Anchor {
                    index: first_index.saturating_add(offset),
                    time: src.get_f64_le(),
                }
            })
            .collect();

        let code_count = records * usize::from(sub_channels);
        let bpc = usize::from(bytes_per_code);
        ensure_remaining(&*src, code_count * bpc + code_count.div_ceil(8))?;
        let codes = (0..code_count).map(|_| src.get_uint_le(bpc) as u32).collect();
        let bitmap = src.split_to(code_count.div_ceil(8));
        let out_of_range = (0..code_count)
            .map(|i| (bitmap[i / 8] >> (i % 8)) & 1 == 1)
            .collect();

        Ok(Self {
            first_index,
            sub_channels,
            bytes_per_code,
            dropped,
            fullness,
            terminal,
            codes,
            out_of_range,
            anchors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_block_survives_the_wire() {
        let records: Vec<RawRecord> = (0..11u32)
            .map(|i| {
                let record = RawRecord::pair(i, i == 0, 0xABCDE + i, i % 3 == 0);
                if i % 5 == 0 {
                    record.with_anchor(f64::from(i) * 0.5)
                } else {
                    record
                }
            })
            .collect();
        let mut block = SampleBlock::from_records(100, 2, 3, &records);
        block.dropped = 17;
        block.fullness = 0.25;
        block.terminal = true;

        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        let decoded = SampleBlock::decode(&mut buf.freeze()).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.record_count(), 11);
        assert_eq!(decoded.codes[3], 0xABCDE + 1);
        assert_eq!(
            decoded.anchors.iter().map(|a| a.index).collect::<Vec<_>>(),
            vec![100, 105, 110]
        );
    }

    #[test]
    fn test_single_channel_uses_one_code_per_record() {
        let records = [RawRecord::single(5, false), RawRecord::single(1023, true)];
        let block = SampleBlock::from_records(0, 1, 2, &records);
        assert_eq!(block.codes, vec![5, 1023]);
        assert_eq!(block.out_of_range, vec![false, true]);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let block = SampleBlock::from_records(0, 1, 2, &[RawRecord::single(5, false)]);
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        let mut short = buf.freeze().slice(..BLOCK_HEADER_SIZE + 1);
        assert!(matches!(
            SampleBlock::decode(&mut short),
            Err(WireError::Truncated { .. })
        ));
    }

    fn header(sub_channels: u8, bytes_per_code: u8) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u64_le(0);
        buf.put_u64_le(0);
        buf.put_f64_le(0.0);
        buf.put_u32_le(1);
        buf.put_u8(sub_channels);
        buf.put_u8(bytes_per_code);
        buf.put_u8(0);
        buf.put_u32_le(0);
        buf.put_bytes(0, 10);
        buf
    }

    #[test]
    fn test_impossible_layout_is_an_error() {
        for (sub_channels, bytes_per_code) in [(1, 9), (1, 5), (1, 0), (0, 2), (3, 2)] {
            let mut payload = header(sub_channels, bytes_per_code).freeze();
            assert!(matches!(
                SampleBlock::decode(&mut payload),
                Err(WireError::BadBlockLayout { .. })
            ));
        }
        let mut payload = header(1, 4).freeze();
        let block = SampleBlock::decode(&mut payload).unwrap();
        assert_eq!(block.codes, vec![0]);
    }

    #[test]
    fn test_max_records_fits_budget() {
        let budget = 4096;
        let n = SampleBlock::max_records(budget, 2, 2, 100);
        let records = vec![RawRecord::pair(1, false, 2, false).with_anchor(0.0); n];
        // worst case: every record anchored is beyond the estimate, so use
        // one anchor per transfer block like the server does
        let records: Vec<RawRecord> = records
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                if i % 100 != 0 {
                    r.anchor = None;
                }
                r
            })
            .collect();
        let mut buf = BytesMut::new();
        SampleBlock::from_records(0, 2, 2, &records).encode(&mut buf);
        assert!(buf.len() <= budget);
    }
}
