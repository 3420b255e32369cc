//! Sample-format conversion: channel remix, resampling, re-quantization, container.

use rubato::{FftFixedIn, Resampler};
use tracing::warn;

use voxloop_core::error::{PipelineError, Result};
use voxloop_core::types::{AudioContainer, AudioFormat, AudioPayload, TargetFormat};

use crate::wav;

/// Accepted sample rates, in Hz.
pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Accepted channel counts.
pub const CHANNEL_RANGE: std::ops::RangeInclusive<u16> = 1..=8;

/// Inputs shorter than this many frames are resampled linearly.
const MIN_FFT_FRAMES: usize = 64;

const FFT_CHUNK_FRAMES: usize = 1024;

fn conversion_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::FormatConversion(msg.into())
}

fn check_format(format: AudioFormat, what: &str) -> Result<()> {
    if !SAMPLE_RATE_RANGE.contains(&format.sample_rate) {
        return Err(conversion_error(format!(
            "{what} sample rate {} Hz is outside {}..={} Hz",
            format.sample_rate,
            SAMPLE_RATE_RANGE.start(),
            SAMPLE_RATE_RANGE.end()
        )));
    }
    if !CHANNEL_RANGE.contains(&format.channels) {
        return Err(conversion_error(format!(
            "{what} channel count {} is outside {}..={}",
            format.channels,
            CHANNEL_RANGE.start(),
            CHANNEL_RANGE.end()
        )));
    }
    if !matches!(format.sample_width, 8 | 16 | 24 | 32) {
        return Err(conversion_error(format!(
            "{what} sample width {} bits is not supported",
            format.sample_width
        )));
    }
    Ok(())
}

/// Check that `target` is a format [`transcode`] can produce.
pub fn check_target(target: &TargetFormat) -> Result<()> {
    check_format(target.format(), "target")
}

/// Convert `audio` to `target`.
///
/// Pure: the output descriptor depends only on `target`, and the same input
/// always produces the same bytes.
pub fn transcode(audio: &AudioPayload, target: &TargetFormat) -> Result<AudioPayload> {
    check_target(target)?;
    let out_format = target.format();

    let (in_format, pcm) = match audio.container {
        AudioContainer::Wav => wav::decode(&audio.data).map_err(|e| conversion_error(e.to_string()))?,
        AudioContainer::Raw => (audio.format, audio.data.clone()),
    };
    check_format(in_format, "source")?;

    if pcm.is_empty() {
        return Err(conversion_error("source audio is empty"));
    }
    if pcm.len() % in_format.bytes_per_frame() != 0 {
        return Err(conversion_error(format!(
            "source length {} is not a whole number of {}-byte frames",
            pcm.len(),
            in_format.bytes_per_frame()
        )));
    }

    let converted = if in_format == out_format {
        pcm
    } else {
        let samples = decode_samples(&pcm, in_format.sample_width);
        let remixed = remix(&samples, in_format.channels as usize, out_format.channels as usize);
        let resampled = resample(
            &remixed,
            out_format.channels as usize,
            in_format.sample_rate,
            out_format.sample_rate,
        );
        encode_samples(&resampled, out_format.sample_width)
    };

    let data = match target.container {
        AudioContainer::Raw => converted,
        AudioContainer::Wav => {
            wav::encode(&converted, out_format).map_err(|e| conversion_error(e.to_string()))?
        }
    };

    Ok(AudioPayload {
        format: out_format,
        container: target.container,
        data,
    })
}

/// Decode little-endian PCM into interleaved samples in [-1.0, 1.0).
fn decode_samples(pcm: &[u8], width: u16) -> Vec<f64> {
    match width {
        8 => pcm.iter().map(|&b| (b as f64 - 128.0) / 128.0).collect(),
        16 => pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64 / 32_768.0)
            .collect(),
        24 => pcm
            .chunks_exact(3)
            .map(|c| (i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8) as f64 / 8_388_608.0)
            .collect(),
        _ => pcm
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2_147_483_648.0)
            .collect(),
    }
}

fn encode_samples(samples: &[f64], width: u16) -> Vec<u8> {
    let bytes = (width as usize).div_ceil(8);
    let mut out = Vec::with_capacity(samples.len() * bytes);
    for &x in samples {
        match width {
            8 => out.push(((x * 128.0).round() + 128.0).clamp(0.0, 255.0) as u8),
            16 => {
                let v = (x * 32_768.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            24 => {
                let v = (x * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
                out.extend_from_slice(&v.to_le_bytes()[..3]);
            }
            _ => {
                let v = (x * 2_147_483_648.0)
                    .round()
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    out
}

/// Change the channel count of interleaved samples.
///
/// Down to mono averages all channels; up from mono duplicates; otherwise
/// output channel `c` takes input channel `c % from`.
fn remix(samples: &[f64], from: usize, to: usize) -> Vec<f64> {
    if from == to {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f64>() / from as f64);
        } else {
            for c in 0..to {
                out.push(frame[c % from]);
            }
        }
    }
    out
}

/// Resample interleaved frames from `from_rate` to `to_rate`.
///
/// Produces `ceil(frames * to_rate / from_rate)` frames. Uses rubato's FFT
/// resampler, falling back to linear interpolation for very short inputs or
/// if the resampler cannot be built.
fn resample(samples: &[f64], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f64> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let frames = samples.len() / channels;
    let output_frames = (frames as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;
    if frames < MIN_FFT_FRAMES {
        return resample_linear(samples, channels, from_rate, to_rate, output_frames);
    }

    match resample_fft(samples, channels, from_rate, to_rate, output_frames) {
        Ok(out) => out,
        Err(e) => {
            warn!(from_rate, to_rate, "FFT resampling failed, using linear: {e}");
            resample_linear(samples, channels, from_rate, to_rate, output_frames)
        }
    }
}

fn resample_fft(
    samples: &[f64],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    output_frames: usize,
) -> anyhow::Result<Vec<f64>> {
    let planes: Vec<Vec<f64>> = (0..channels)
        .map(|c| samples.iter().skip(c).step_by(channels).copied().collect())
        .collect();
    let frames = planes[0].len();

    let mut resampler = FftFixedIn::<f64>::new(
        from_rate as usize,
        to_rate as usize,
        FFT_CHUNK_FRAMES,
        2,
        channels,
    )?;
    let delay = resampler.output_delay();
    let mut out: Vec<Vec<f64>> = vec![Vec::with_capacity(output_frames + delay); channels];

    let mut pos = 0;
    loop {
        let needed = resampler.input_frames_next();
        if frames - pos < needed {
            break;
        }
        let chunk: Vec<&[f64]> = planes.iter().map(|p| &p[pos..pos + needed]).collect();
        append_planes(&mut out, resampler.process(&chunk, None)?);
        pos += needed;
    }
    if pos < frames {
        let tail: Vec<&[f64]> = planes.iter().map(|p| &p[pos..]).collect();
        append_planes(&mut out, resampler.process_partial(Some(&tail), None)?);
    }

    // Flush the filter delay.
    while out[0].len() < delay + output_frames {
        let flushed = resampler.process_partial::<Vec<f64>>(None, None)?;
        if flushed[0].is_empty() {
            break;
        }
        append_planes(&mut out, flushed);
    }

    let mut interleaved = Vec::with_capacity(output_frames * channels);
    for i in 0..output_frames {
        for plane in &out {
            interleaved.push(plane.get(delay + i).copied().unwrap_or(0.0));
        }
    }
    Ok(interleaved)
}

fn append_planes(out: &mut [Vec<f64>], chunk: Vec<Vec<f64>>) {
    for (plane, part) in out.iter_mut().zip(chunk) {
        plane.extend_from_slice(&part);
    }
}

/// Linear interpolation between neighbouring frames.
fn resample_linear(
    samples: &[f64],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    output_frames: usize,
) -> Vec<f64> {
    let frames = samples.len() / channels;
    let ratio = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(output_frames * channels);

    for i in 0..output_frames {
        let source_pos = i as f64 * ratio;
        let idx = (source_pos.floor() as usize).min(frames - 1);
        let fraction = source_pos - idx as f64;
        for c in 0..channels {
            let left = samples[idx * channels + c];
            let value = if idx + 1 >= frames {
                left
            } else {
                let right = samples[(idx + 1) * channels + c];
                left + (right - left) * fraction
            };
            out.push(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_core::types::FormatRequest;

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_i16(pcm: &[u8]) -> Vec<i16> {
        pcm.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn speech(samples: &[i16]) -> AudioPayload {
        AudioPayload::raw(AudioFormat::speech_16k(), pcm16(samples))
    }

    #[test]
    fn test_mono_16k_to_stereo_22k() {
        let audio = speech(&vec![1000i16; 1600]);
        let target = TargetFormat {
            sample_rate: 22_050,
            channels: 2,
            sample_width: 16,
            container: AudioContainer::Raw,
        };

        let out = transcode(&audio, &target).unwrap();
        assert_eq!(out.format, AudioFormat::new(22_050, 2, 16));
        // ceil(1600 * 22050 / 16000) = 2205 frames of 4 bytes
        assert_eq!(out.data.len(), 2205 * 4);

        // Away from the edges a constant signal stays constant on both channels.
        let samples = to_i16(&out.data);
        for frame in samples[1200..3200].chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!((frame[0] - 1000).abs() <= 20, "sample {}", frame[0]);
        }
    }

    #[test]
    fn test_resampling_preserves_a_tone() {
        // 440 Hz at 16 kHz, 0.5 s
        let tone: Vec<i16> = (0..8000)
            .map(|i| ((i as f64 * 2.0 * std::f64::consts::PI * 440.0 / 16_000.0).sin() * 10_000.0) as i16)
            .collect();
        let target = TargetFormat {
            sample_rate: 44_100,
            channels: 1,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        let out = to_i16(&transcode(&speech(&tone), &target).unwrap().data);
        assert_eq!(out.len(), 22_050);

        let rms = |s: &[i16]| (s.iter().map(|&x| (x as f64).powi(2)).sum::<f64>() / s.len() as f64).sqrt();
        let ratio = rms(&out[5_000..17_000]) / rms(&tone[2_000..6_000]);
        assert!((0.9..1.1).contains(&ratio), "rms ratio {ratio}");
    }

    #[test]
    fn test_rejects_out_of_range_targets() {
        let audio = speech(&[1, 2]);
        let huge_rate = TargetFormat {
            sample_rate: u32::MAX,
            channels: 2,
            sample_width: 32,
            container: AudioContainer::Raw,
        };
        assert!(matches!(
            transcode(&audio, &huge_rate),
            Err(PipelineError::FormatConversion(_))
        ));

        let many_channels = TargetFormat {
            sample_rate: 16_000,
            channels: 65_535,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        assert!(check_target(&many_channels).is_err());

        let edge = TargetFormat {
            sample_rate: 192_000,
            channels: 8,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        assert!(check_target(&edge).is_ok());
    }

    #[test]
    fn test_descriptor_is_deterministic() {
        let audio = speech(&[0, 500, -500, 1200, -1200, 90]);
        let target = TargetFormat {
            sample_rate: 8_000,
            channels: 1,
            sample_width: 8,
            container: AudioContainer::Wav,
        };
        let a = transcode(&audio, &target).unwrap();
        let b = transcode(&audio, &target).unwrap();
        assert_eq!(a.format, b.format);
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_identity_is_lossless() {
        let audio = speech(&[-32768, -1, 0, 1, 32767]);
        let target = FormatRequest::native().resolve(audio.format);
        assert_eq!(transcode(&audio, &target).unwrap().data, audio.data);
    }

    #[test]
    fn test_wav_output_and_wav_input() {
        let audio = speech(&[10, 20, 30, 40]);
        let wav_target = FormatRequest::wav().resolve(audio.format);
        let wav_out = transcode(&audio, &wav_target).unwrap();
        assert!(wav::is_wav(&wav_out.data));

        // And back to raw stereo.
        let raw_target = TargetFormat {
            sample_rate: 16_000,
            channels: 2,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        let raw = transcode(&wav_out, &raw_target).unwrap();
        assert_eq!(to_i16(&raw.data), vec![10, 10, 20, 20, 30, 30, 40, 40]);
    }

    #[test]
    fn test_stereo_downmix_averages() {
        let audio = AudioPayload::raw(AudioFormat::new(16_000, 2, 16), pcm16(&[-100, 100, 300, 100]));
        let target = TargetFormat {
            sample_rate: 16_000,
            channels: 1,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        let out = transcode(&audio, &target).unwrap();
        assert_eq!(to_i16(&out.data), vec![0, 200]);
    }

    #[test]
    fn test_downsample_halves_frames() {
        let audio = speech(&vec![0i16; 3200]);
        let target = TargetFormat {
            sample_rate: 8_000,
            channels: 1,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        let out = transcode(&audio, &target).unwrap();
        assert_eq!(out.data.len(), 1600 * 2);
    }

    #[test]
    fn test_width_conversion() {
        let audio = speech(&[i16::MAX, 0, i16::MIN]);
        let target = TargetFormat {
            sample_rate: 16_000,
            channels: 1,
            sample_width: 24,
            container: AudioContainer::Raw,
        };
        let out = transcode(&audio, &target).unwrap();
        assert_eq!(out.data.len(), 9);
        // 0x7fff << 8 == 0x7fff00
        assert_eq!(&out.data[0..3], &[0x00, 0xff, 0x7f]);
        assert_eq!(&out.data[6..9], &[0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_invalid_inputs() {
        let ok_target = TargetFormat {
            sample_rate: 22_050,
            channels: 2,
            sample_width: 16,
            container: AudioContainer::Raw,
        };

        let empty = speech(&[]);
        assert!(matches!(
            transcode(&empty, &ok_target),
            Err(PipelineError::FormatConversion(_))
        ));

        let ragged = AudioPayload::raw(AudioFormat::speech_16k(), vec![1, 2, 3]);
        assert!(transcode(&ragged, &ok_target).is_err());

        let bad_target = TargetFormat {
            sample_width: 20,
            ..ok_target
        };
        assert!(transcode(&speech(&[1, 2]), &bad_target).is_err());

        let zero_rate = TargetFormat {
            sample_rate: 0,
            ..ok_target
        };
        assert!(transcode(&speech(&[1, 2]), &zero_rate).is_err());

        let telephone_rate = TargetFormat {
            sample_rate: 4_000,
            ..ok_target
        };
        assert!(check_target(&telephone_rate).is_err());

        let garbage_wav = AudioPayload {
            format: AudioFormat::speech_16k(),
            container: AudioContainer::Wav,
            data: b"not a wav".to_vec(),
        };
        assert!(transcode(&garbage_wav, &ok_target).is_err());
    }
}
