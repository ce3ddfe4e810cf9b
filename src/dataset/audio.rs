use std::path::Path;

use claxon::FlacReader;

use crate::error::FinetuneError;

/// Decoded mono waveform with its native sampling rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
}

/// Decodes a WAV or FLAC file to mono f32 samples in [-1, 1].
/// The container is picked from the file extension; multi-channel audio
/// is averaged down to one channel.
pub fn read_audio(path: &Path) -> Result<DecodedAudio, FinetuneError> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    match ext.as_deref() {
        Some("flac") => read_flac_mono(path),
        Some("wav") => read_wav_mono(path),
        _ => Err(FinetuneError::runtime(
            "decode audio",
            format!("unsupported audio container: '{}'", path.display()),
        )),
    }
}

fn read_flac_mono(path: &Path) -> Result<DecodedAudio, FinetuneError> {
    let mut reader =
        FlacReader::open(path).map_err(|e| FinetuneError::runtime("open FLAC", e))?;
    let streaminfo = reader.streaminfo();
    let channels = streaminfo.channels as usize;
    let bits_per_sample = streaminfo.bits_per_sample as i32;
    let scale = if bits_per_sample > 1 {
        ((1_i64 << (bits_per_sample - 1)) - 1) as f32
    } else {
        1.0
    };
    let sample_rate_hz = streaminfo.sample_rate;

    if channels == 0 {
        return Err(FinetuneError::data(format!(
            "FLAC has zero channels: {}",
            path.display()
        )));
    }

    let mut mono = Vec::new();
    let mut frame = Vec::with_capacity(channels);
    for sample in reader.samples() {
        let sample = sample.map_err(|e| FinetuneError::runtime("read FLAC sample", e))?;
        frame.push(sample as f32 / scale);
        if frame.len() == channels {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
            frame.clear();
        }
    }

    Ok(DecodedAudio {
        samples: mono,
        sample_rate_hz,
    })
}

fn read_wav_mono(path: &Path) -> Result<DecodedAudio, FinetuneError> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| FinetuneError::runtime("open WAV", e))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(FinetuneError::data(format!(
            "WAV has zero channels: {}",
            path.display()
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| FinetuneError::runtime("read WAV sample", e))?,
        hound::SampleFormat::Int => {
            let scale = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| FinetuneError::runtime("read WAV sample", e))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate_hz: spec.sample_rate,
    })
}

/// Linear-interpolation resampling. Adequate for speech-rate conversion
/// between the common 8/16/22.05/44.1 kHz rates.
pub fn resample_linear(samples: &[f32], from_hz: u32, to_hz: u32) -> Vec<f32> {
    if from_hz == to_hz || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_hz as f64 / to_hz as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, samples: &[f32], channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for &s in samples {
            writer
                .write_sample((s * i16::MAX as f32) as i16)
                .expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn reads_mono_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        write_wav(&path, 16_000, &[0.0, 0.5, -0.5, 0.25], 1);
        let audio = read_audio(&path).unwrap();
        assert_eq!(audio.sample_rate_hz, 16_000);
        assert_eq!(audio.samples.len(), 4);
        assert!((audio.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn downmixes_stereo_wav() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        // interleaved L/R pairs
        write_wav(&path, 8_000, &[0.5, -0.5, 0.25, 0.25], 2);
        let audio = read_audio(&path).unwrap();
        assert_eq!(audio.samples.len(), 2);
        assert!(audio.samples[0].abs() < 1e-3);
        assert!((audio.samples[1] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = read_audio(Path::new("clip.mp3")).unwrap_err();
        assert!(matches!(err, FinetuneError::Runtime { .. }));
    }

    #[test]
    fn missing_file_propagates_as_error() {
        assert!(read_audio(Path::new("/nonexistent/clip.wav")).is_err());
    }

    #[test]
    fn resample_halves_and_doubles_lengths() {
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 / 100.0).sin()).collect();
        assert_eq!(resample_linear(&samples, 16_000, 8_000).len(), 800);
        assert_eq!(resample_linear(&samples, 8_000, 16_000).len(), 3200);
        assert_eq!(resample_linear(&samples, 16_000, 16_000).len(), 1600);
    }

    #[test]
    fn resample_preserves_constant_signals() {
        let samples = vec![0.7f32; 100];
        for s in resample_linear(&samples, 22_050, 16_000) {
            assert!((s - 0.7).abs() < 1e-6);
        }
    }
}
