use crate::adc_config::{AdcConfig, CodeEncoding, InputRange};

/// Linear raw-code to volts conversion for one open channel.
///
/// `volts = (code - zero_offset) * scale` where `code` is in offset
/// binary. For a symmetric bipolar range the zero offset is the code
/// midpoint, for a unipolar range it is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrator {
    scale: f64,
    zero_offset: f64,
    bit_depth: u8,
    encoding: CodeEncoding,
}

impl Calibrator {
    pub fn new(bit_depth: u8, encoding: CodeEncoding, range: InputRange) -> Self {
        let full_scale = f64::from((1u32 << bit_depth) - 1);
        let scale = range.span() / full_scale;
        Self {
            scale,
            zero_offset: -range.min() / scale,
            bit_depth,
            encoding,
        }
    }

    pub fn for_config(config: &AdcConfig) -> Self {
        Self::new(config.bit_depth(), config.encoding(), config.input_range())
    }

    /// `(scale, zero_offset)` as used by [`code_to_volts`](Self::code_to_volts).
    pub fn conversion_factors(&self) -> (f64, f64) {
        (self.scale, self.zero_offset)
    }

    pub fn max_code(&self) -> u32 {
        (1u32 << self.bit_depth) - 1
    }

    /// Maps a code as received on the wire to offset binary.
    ///
    /// Two's complement codes are sign-extended from `bit_depth` bits and
    /// shifted up by half the code space.
    pub fn to_offset_binary(&self, wire_code: u32) -> u32 {
        let mask = self.max_code();
        let code = wire_code & mask;
        match self.encoding {
            CodeEncoding::OffsetBinary => code,
            CodeEncoding::TwosComplement => code ^ (1 << (self.bit_depth - 1)),
        }
    }

    /// Inverse of [`to_offset_binary`](Self::to_offset_binary).
    pub fn to_wire_code(&self, offset_code: u32) -> u32 {
        let code = offset_code & self.max_code();
        match self.encoding {
            CodeEncoding::OffsetBinary => code,
            CodeEncoding::TwosComplement => code ^ (1 << (self.bit_depth - 1)),
        }
    }

    /// Converts an offset-binary code (possibly fractional after averaging)
    /// to volts. Codes are not clipped.
    pub fn code_to_volts(&self, code: f64) -> f64 {
        (code - self.zero_offset) * self.scale
    }

    /// Nearest offset-binary code for `volts`, clamped to the code space.
    pub fn volts_to_code(&self, volts: f64) -> u32 {
        let code = (volts / self.scale + self.zero_offset).round();
        code.clamp(0.0, f64::from(self.max_code())) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_bit_bipolar() -> Calibrator {
        Calibrator::new(
            10,
            CodeEncoding::OffsetBinary,
            InputRange::bipolar(5.0).unwrap(),
        )
    }

    #[test]
    fn test_rails_map_to_range_ends() {
        let cal = ten_bit_bipolar();
        assert!((cal.code_to_volts(0.0) + 5.0).abs() < 1e-12);
        assert!((cal.code_to_volts(1023.0) - 5.0).abs() < 1e-12);
        let (scale, zero) = cal.conversion_factors();
        assert!((scale - 10.0 / 1023.0).abs() < 1e-15);
        assert!((zero - 511.5).abs() < 1e-9);
    }

    #[test]
    fn test_unipolar_zero_offset_is_zero() {
        let cal = Calibrator::new(
            12,
            CodeEncoding::OffsetBinary,
            InputRange::unipolar(3.3).unwrap(),
        );
        assert_eq!(cal.conversion_factors().1, 0.0);
        assert_eq!(cal.code_to_volts(0.0), 0.0);
        assert!((cal.code_to_volts(4095.0) - 3.3).abs() < 1e-12);
    }

    #[test]
    fn test_round_trip_within_one_lsb() {
        let cal = Calibrator::new(
            16,
            CodeEncoding::OffsetBinary,
            InputRange::new(-2.5, 7.5).unwrap(),
        );
        for code in (0..=65_535u32).step_by(97) {
            let volts = cal.code_to_volts(f64::from(code));
            let back = cal.volts_to_code(volts);
            assert!(back.abs_diff(code) <= 1, "{code} -> {volts} -> {back}");
        }
    }

    #[test]
    fn test_twos_complement_codes() {
        let cal = Calibrator::new(
            10,
            CodeEncoding::TwosComplement,
            InputRange::bipolar(5.0).unwrap(),
        );
        // -512 in 10-bit two's complement is 0x200, the low rail
        assert_eq!(cal.to_offset_binary(0x200), 0);
        // 511 is the high rail
        assert_eq!(cal.to_offset_binary(0x1FF), 1023);
        assert_eq!(cal.to_wire_code(0), 0x200);
        assert!((cal.code_to_volts(f64::from(cal.to_offset_binary(0x200))) + 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_values_are_not_clipped() {
        let cal = ten_bit_bipolar();
        assert!(cal.code_to_volts(2000.0) > 5.0);
    }
}
