//! WAV container encode/decode on top of `hound`.
//!
//! Raw PCM in this crate is little-endian, signed for 16/24/32-bit and
//! unsigned (offset 128) for 8-bit, matching the WAV data chunk layout.

use std::io::Cursor;

use anyhow::{Context, Result, bail};

use voxloop_core::types::AudioFormat;

/// Whether `data` starts with a RIFF/WAVE header.
pub fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

fn spec_for(format: AudioFormat) -> Result<hound::WavSpec> {
    if !matches!(format.sample_width, 8 | 16 | 24 | 32) {
        bail!("unsupported sample width: {} bits", format.sample_width);
    }
    if format.channels == 0 || format.sample_rate == 0 {
        bail!("invalid format: {format:?}");
    }
    Ok(hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.sample_width,
        sample_format: hound::SampleFormat::Int,
    })
}

/// Wrap raw PCM in a WAV container.
pub fn encode(pcm: &[u8], format: AudioFormat) -> Result<Vec<u8>> {
    let spec = spec_for(format)?;
    let width = format.bytes_per_sample();
    if pcm.len() % format.bytes_per_frame() != 0 {
        bail!(
            "PCM length {} is not a whole number of {}-byte frames",
            pcm.len(),
            format.bytes_per_frame()
        );
    }

    let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("WAV header")?;
        for s in pcm.chunks_exact(width) {
            match width {
                1 => writer.write_sample((s[0] as i16 - 128) as i8)?,
                2 => writer.write_sample(i16::from_le_bytes([s[0], s[1]]))?,
                3 => {
                    let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                    writer.write_sample(v)?
                }
                _ => writer.write_sample(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))?,
            }
        }
        writer.finalize().context("WAV finalize")?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV container into its format descriptor and raw PCM.
pub fn decode(data: &[u8]) -> Result<(AudioFormat, Vec<u8>)> {
    let reader = hound::WavReader::new(Cursor::new(data)).context("Failed to parse WAV")?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int {
        bail!("floating-point WAV is not supported");
    }
    let format = AudioFormat::new(spec.sample_rate, spec.channels, spec.bits_per_sample);
    let mut pcm = Vec::with_capacity(reader.len() as usize * format.bytes_per_sample());

    match spec.bits_per_sample {
        8 => {
            for s in reader.into_samples::<i8>() {
                pcm.push((s? as i16 + 128) as u8);
            }
        }
        16 => {
            for s in reader.into_samples::<i16>() {
                pcm.extend_from_slice(&s?.to_le_bytes());
            }
        }
        24 => {
            for s in reader.into_samples::<i32>() {
                pcm.extend_from_slice(&s?.to_le_bytes()[..3]);
            }
        }
        32 => {
            for s in reader.into_samples::<i32>() {
                pcm.extend_from_slice(&s?.to_le_bytes());
            }
        }
        other => bail!("unsupported sample width: {other} bits"),
    }

    Ok((format, pcm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_wav_header_generation() {
        let pcm = pcm16(&vec![0i16; 16000]); // 1 second at 16kHz
        let wav = encode(&pcm, AudioFormat::speech_16k()).unwrap();

        assert_eq!(wav.len(), 44 + 16000 * 2);
        assert!(is_wav(&wav));
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 16000);
    }

    #[test]
    fn test_decode_recovers_pcm() {
        let pcm = pcm16(&[-300, 0, 300, i16::MAX, i16::MIN, 7]);
        let format = AudioFormat::new(22_050, 2, 16);
        let wav = encode(&pcm, format).unwrap();

        let (decoded_format, decoded) = decode(&wav).unwrap();
        assert_eq!(decoded_format, format);
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn test_eight_and_twenty_four_bit() {
        let pcm8 = vec![0u8, 128, 255, 64];
        let wav = encode(&pcm8, AudioFormat::new(8_000, 1, 8)).unwrap();
        assert_eq!(decode(&wav).unwrap().1, pcm8);

        // -1, 1, 0x123456
        let pcm24 = vec![0xff, 0xff, 0xff, 0x01, 0x00, 0x00, 0x56, 0x34, 0x12];
        let wav = encode(&pcm24, AudioFormat::new(48_000, 1, 24)).unwrap();
        assert_eq!(decode(&wav).unwrap().1, pcm24);
    }

    #[test]
    fn test_rejects_partial_frames() {
        assert!(encode(&[1, 2, 3], AudioFormat::speech_16k()).is_err());
        assert!(encode(&[1, 2], AudioFormat::new(16_000, 1, 12)).is_err());
    }

    #[test]
    fn test_malformed_wav() {
        assert!(!is_wav(b"XXXX\x00\x00\x00\x00WAVE"));
        assert!(decode(b"RIFF\x00\x00\x00\x00WAVEfmt ").is_err());
    }
}
