use crate::error::SensorError;

pub const DEFAULT_ADDRESS: u8 = 0x44;

// single shot, clock stretching, medium repeatability
pub const MEASURE_COMMAND: [u8; 2] = [0x2C, 0x0D];

pub const FRAME_LEN: usize = 3;

const CRC_INIT: u8 = 0xFF;
const CRC_POLY: u8 = 0x31;

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC_INIT;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn raw_to_celsius(raw: u16) -> f32 {
    -45.0 + 175.0 * (raw as f32 / 65_535.0)
}

pub fn decode_temperature(frame: &[u8]) -> Result<f32, SensorError> {
    let [msb, lsb, crc] = frame else {
        return Err(SensorError::ShortRead { len: frame.len() });
    };

    let expected = crc8(&[*msb, *lsb]);
    if expected != *crc {
        return Err(SensorError::Checksum {
            expected,
            actual: *crc,
        });
    }

    Ok(raw_to_celsius(u16::from_be_bytes([*msb, *lsb])))
}

pub fn encode_temperature(celsius: f32) -> [u8; FRAME_LEN] {
    let clamped = celsius.clamp(-45.0, 130.0);
    let raw = (((clamped + 45.0) / 175.0) * 65_535.0).round() as u16;
    let [msb, lsb] = raw.to_be_bytes();
    [msb, lsb, crc8(&[msb, lsb])]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_datasheet_example() {
        // Sensirion datasheet: CRC(0xBEEF) = 0x92
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn decodes_valid_frame() {
        let frame = [0x66, 0x66, crc8(&[0x66, 0x66])];
        let temp = decode_temperature(&frame).unwrap();
        assert!((temp - 25.0).abs() < 0.01, "got {temp}");
    }

    #[test]
    fn checksum_mismatch_is_a_failed_reading() {
        let good = crc8(&[0x66, 0x66]);
        let frame = [0x66, 0x66, good ^ 0x01];
        assert_eq!(
            decode_temperature(&frame),
            Err(SensorError::Checksum {
                expected: good,
                actual: good ^ 0x01,
            })
        );
    }

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(
            decode_temperature(&[0x66, 0x66]),
            Err(SensorError::ShortRead { len: 2 })
        );
    }

    #[test]
    fn encoded_frames_decode_back_within_resolution() {
        for celsius in [-10.0_f32, 0.0, 18.0, 22.0, 24.5] {
            let decoded = decode_temperature(&encode_temperature(celsius)).unwrap();
            assert!((decoded - celsius).abs() < 0.01, "{celsius} -> {decoded}");
        }
    }
}
