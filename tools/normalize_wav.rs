use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use loudness_normalizer::dsp::utils::{frame_rms, lin_to_db};
use loudness_normalizer::{
    AttachOutcome, EngineConfig, EngineSession, InProcessHost, SourceHandle, LATENCY_FRAMES,
};
use std::path::PathBuf;

const BLOCK: usize = 512;
const FILE_SOURCE: SourceHandle = SourceHandle::new(1);

fn read_interleaved(reader: WavReader<std::io::BufReader<std::fs::File>>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to decode float samples"),
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to decode integer samples")
        }
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .map(PathBuf::from)
        .context("usage: normalize_wav <input.wav> <output.wav> [config.json]")?;
    let output = args
        .next()
        .map(PathBuf::from)
        .context("usage: normalize_wav <input.wav> <output.wav> [config.json]")?;
    let config = match args.next() {
        Some(path) => EngineConfig::from_file(&PathBuf::from(path))?,
        None => EngineConfig::default(),
    };

    let reader = WavReader::open(&input)
        .with_context(|| format!("failed to open input WAV '{}'", input.display()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        anyhow::bail!("'{}' has no audio channels", input.display());
    }
    let interleaved = read_interleaved(reader)?;
    let frames = interleaved.len() / channels;

    // Zero tail flushes the renderer's one-quantum delay.
    let padded = frames + LATENCY_FRAMES;
    let mut planar_in = vec![vec![0.0f32; padded]; channels];
    for (i, frame) in interleaved.chunks_exact(channels).enumerate() {
        for (ch, &s) in frame.iter().enumerate() {
            planar_in[ch][i] = s;
        }
    }

    let host = InProcessHost::new(spec.sample_rate as f32, channels);
    let mut session = EngineSession::new(host, config);
    match session.attach_to(FILE_SOURCE)? {
        AttachOutcome::Unavailable => anyhow::bail!(
            "normalizer unavailable: {}",
            session.unavailable_reason().unwrap_or("unknown reason")
        ),
        AttachOutcome::Attached(_) | AttachOutcome::AlreadyAttached(_) => {}
    }
    session.enable()?;

    let mut planar_out = vec![vec![0.0f32; padded]; channels];
    let mut max_reduction_db = 0.0f32;
    let mut start = 0;
    while start < padded {
        let end = (start + BLOCK).min(padded);
        let inputs: Vec<&[f32]> = planar_in.iter().map(|c| &c[start..end]).collect();
        let mut outputs: Vec<&mut [f32]> =
            planar_out.iter_mut().map(|c| &mut c[start..end]).collect();
        if let Some(runtime) = session.runtime_mut() {
            runtime.render(FILE_SOURCE, &inputs, &mut outputs);
        }
        if let Some(meters) = session.meters() {
            max_reduction_db = max_reduction_db.max(meters.limiter_reduction_db);
        }
        start = end;
    }
    let events = session.drain_render_events();
    for ch in planar_out.iter_mut() {
        ch.drain(..LATENCY_FRAMES);
    }
    for ch in planar_in.iter_mut() {
        ch.truncate(frames);
    }

    let out_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(&output, out_spec)
        .with_context(|| format!("failed to create output WAV '{}'", output.display()))?;
    for i in 0..frames {
        for ch in planar_out.iter() {
            writer.write_sample(ch[i])?;
        }
    }
    writer.finalize().context("failed to finalize output WAV")?;

    let meters = session.meters().unwrap_or_default();
    println!("Normalized '{}' -> '{}':", input.display(), output.display());
    println!("  frames processed  : {}", frames);
    println!(
        "  input RMS (ch 0)  : {:.1} dBFS",
        lin_to_db(frame_rms(planar_in.first().map(|c| c.as_slice()).unwrap_or(&[])))
    );
    println!(
        "  output RMS (ch 0) : {:.1} dBFS",
        lin_to_db(frame_rms(planar_out.first().map(|c| c.as_slice()).unwrap_or(&[])))
    );
    println!("  final gain        : {:.2} dB", meters.current_gain_db);
    println!("  max limiting      : {:.2} dB", max_reduction_db);
    println!("  render events     : {}", events.len());
    Ok(())
}
