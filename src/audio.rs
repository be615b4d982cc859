//! µ-law / base64 audio framing helpers shared by the STT, TTS, and telephony
//! WebSocket code.
//!
//! The telephony side speaks 8 kHz mono G.711 µ-law (PCMU), base64-framed
//! inside JSON `media` events. Deepgram's STT/TTS wire protocols accept and
//! emit the same µ-law bytes directly, so frames pass through this module
//! largely untouched — the two conversions that actually happen are the
//! base64 envelope around the telephony JSON payload and, for diagnostics and
//! to mirror `original_source/audio_utils.py`'s interface, µ-law/linear PCM
//! conversion.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Samples per 20 ms frame at 8 kHz mono µ-law (`160` samples ≈ `160` bytes).
pub const FRAME_SAMPLES_8KHZ_20MS: usize = 160;

/// Decode a base64 telephony media payload into raw µ-law bytes.
pub fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

/// Encode raw µ-law bytes into a base64 telephony media payload.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// µ-law to 16-bit linear PCM decode table (ITU-T G.711).
fn ulaw_to_linear(u: u8) -> i16 {
    const BIAS: i16 = 0x84;
    let u = !u;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0f;
    let mut sample = ((mantissa as i16) << 3) + BIAS;
    sample <<= exponent;
    sample -= BIAS;
    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Linear 16-bit PCM to µ-law encode (ITU-T G.711).
fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i16 = 0x84;
    const CLIP: i16 = 32635;

    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut sample = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if sample > CLIP {
        sample = CLIP;
    }
    sample += BIAS;

    let exponent = (15 - sample.leading_zeros() as i16 + 1).clamp(0, 7);
    let mantissa = (sample >> (exponent + 3)) & 0x0f;
    let byte = sign | ((exponent as u8) << 4) | (mantissa as u8);
    !byte
}

/// Decode a buffer of µ-law bytes into 16-bit linear PCM samples.
pub fn decode_mulaw(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| ulaw_to_linear(b)).collect()
}

/// Encode 16-bit linear PCM samples into µ-law bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_ulaw(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips_mulaw_bytes() {
        let frame = vec![0xffu8; FRAME_SAMPLES_8KHZ_20MS];
        let encoded = base64_encode(&frame);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn mulaw_round_trip_preserves_sign_and_silence() {
        let samples = vec![0i16, 2000, -2000, 20000, -20000];
        let encoded = encode_mulaw(&samples);
        let decoded = decode_mulaw(&encoded);
        assert_eq!(decoded.len(), samples.len());
        assert!(decoded[0].abs() < 50);
        for (orig, rt) in samples.iter().skip(1).zip(decoded.iter().skip(1)) {
            assert_eq!(orig.signum(), rt.signum());
        }
    }

    #[test]
    fn silence_byte_decodes_near_zero() {
        // 0xFF is the canonical µ-law "silence" byte.
        let decoded = decode_mulaw(&[0xFF]);
        assert!(decoded[0].abs() < 10);
    }
}
