pub mod config;
pub mod dsp;
pub mod engine;
pub mod meters;
pub mod routing;
pub mod runtime;

pub use config::EngineConfig;
pub use dsp::{GainParameters, LimiterConfig, ProcessorState};
pub use engine::{
    log_render_event, AttachOutcome, AudioHost, AudioRuntime, EngineError, EngineSession,
    EngineState, RuntimeState,
};
pub use meters::MeterSnapshot;
pub use routing::{RenderEvent, SourceHandle, LATENCY_FRAMES};
pub use runtime::{InProcessHost, InProcessRuntime};

use crate::dsp::gain_controller::{
    ParamRange, ATTACK_SECONDS_RANGE, FLOOR_BOOST_DB_RANGE, MAX_BOOST_DB_RANGE, MAX_CUT_DB_RANGE,
    RELEASE_SECONDS_RANGE, TARGET_RMS_RANGE,
};
use crate::dsp::utils::lin_to_db;
use assert_no_alloc::permit_alloc;
use log::{error, info, warn};
use nih_plug::prelude::*;
use std::sync::Arc;

/// A plugin instance only ever sees one source: the DAW's main input bus.
const HOST_INPUT: SourceHandle = SourceHandle::new(0);
const MAX_PLUGIN_CHANNELS: usize = 2;

// -----------------------------------------------------------------------------
// PARAMETERS
// -----------------------------------------------------------------------------
#[derive(Params)]
pub struct NormalizerParams {
    #[id = "enabled"]
    pub enabled: BoolParam,

    #[id = "target_rms"]
    pub target_rms: FloatParam,

    #[id = "max_boost_db"]
    pub max_boost_db: FloatParam,

    #[id = "max_cut_db"]
    pub max_cut_db: FloatParam,

    #[id = "floor_boost_db"]
    pub floor_boost_db: FloatParam,

    #[id = "attack_seconds"]
    pub attack_seconds: FloatParam,

    #[id = "release_seconds"]
    pub release_seconds: FloatParam,
}

fn format_db(v: f32) -> String {
    format!("{:.1} dB", v)
}

fn format_rms(v: f32) -> String {
    format!("{:.1} dBFS", lin_to_db(v))
}

fn format_seconds(v: f32) -> String {
    format!("{:.0} ms", v * 1000.0)
}

fn db_param(name: &str, default: f32, range: ParamRange) -> FloatParam {
    FloatParam::new(
        name,
        default,
        FloatRange::Linear {
            min: range.min,
            max: range.max,
        },
    )
    .with_value_to_string(Arc::new(format_db))
}

fn seconds_param(name: &str, default: f32, range: ParamRange) -> FloatParam {
    FloatParam::new(
        name,
        default,
        FloatRange::Skewed {
            min: range.min,
            max: range.max,
            factor: FloatRange::skew_factor(-1.0),
        },
    )
    .with_value_to_string(Arc::new(format_seconds))
}

impl Default for NormalizerParams {
    fn default() -> Self {
        let d = GainParameters::DEFAULT;
        Self {
            enabled: BoolParam::new("Enabled", true),
            target_rms: FloatParam::new(
                "Target RMS",
                d.target_rms,
                FloatRange::Skewed {
                    min: TARGET_RMS_RANGE.min,
                    max: TARGET_RMS_RANGE.max,
                    factor: FloatRange::skew_factor(-2.0),
                },
            )
            .with_value_to_string(Arc::new(format_rms)),
            max_boost_db: db_param("Max Boost", d.max_boost_db, MAX_BOOST_DB_RANGE),
            max_cut_db: db_param("Max Cut", d.max_cut_db, MAX_CUT_DB_RANGE),
            floor_boost_db: db_param("Floor Boost", d.floor_boost_db, FLOOR_BOOST_DB_RANGE),
            attack_seconds: seconds_param("Attack", d.attack_seconds, ATTACK_SECONDS_RANGE),
            release_seconds: seconds_param("Release", d.release_seconds, RELEASE_SECONDS_RANGE),
        }
    }
}

impl NormalizerParams {
    /// Block-rate snapshot of the gain controls.
    pub fn gain_parameters(&self) -> GainParameters {
        GainParameters {
            target_rms: self.target_rms.value(),
            max_boost_db: self.max_boost_db.value(),
            max_cut_db: self.max_cut_db.value(),
            floor_boost_db: self.floor_boost_db.value(),
            attack_seconds: self.attack_seconds.value(),
            release_seconds: self.release_seconds.value(),
        }
        .clamped()
    }
}

// -----------------------------------------------------------------------------
// BACKGROUND TASKS
// -----------------------------------------------------------------------------
/// Reports from `process()`. Logging happens on the background thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginTask {
    EnabledChanged { enabled: bool, at_seconds: f64 },
    EnableFailed(EngineError),
    Render(SourceHandle, RenderEvent),
}

fn run_task(task: PluginTask) {
    match task {
        PluginTask::EnabledChanged { enabled, at_seconds } => info!(
            "Normalizer {} at {at_seconds:.3} s.",
            if enabled { "enabled" } else { "disabled" }
        ),
        PluginTask::EnableFailed(e) => warn!("Normalizer enabled, but {e}"),
        PluginTask::Render(source, event) => log_render_event(source, event),
    }
}

// -----------------------------------------------------------------------------
// PLUGIN STRUCT
// -----------------------------------------------------------------------------
struct LoudnessNormalizerPlugin {
    params: Arc<NormalizerParams>,
    session: Option<EngineSession<InProcessHost>>,
    // The buffer is processed in place; the raw path needs the untouched input.
    input_scratch: Vec<Vec<f32>>,
}

impl Default for LoudnessNormalizerPlugin {
    fn default() -> Self {
        Self {
            params: Arc::new(NormalizerParams::default()),
            session: None,
            input_scratch: Vec::new(),
        }
    }
}

impl Plugin for LoudnessNormalizerPlugin {
    const NAME: &'static str = "Loudness Normalizer";
    const VENDOR: &'static str = "Andrzej Marczewski";
    const URL: &'static str = "";
    const EMAIL: &'static str = "";
    const VERSION: &'static str = "0.1.0";

    const AUDIO_IO_LAYOUTS: &'static [AudioIOLayout] = &[
        AudioIOLayout {
            main_input_channels: NonZeroU32::new(2),
            main_output_channels: NonZeroU32::new(2),
            ..AudioIOLayout::const_default()
        },
        AudioIOLayout {
            main_input_channels: NonZeroU32::new(1),
            main_output_channels: NonZeroU32::new(1),
            ..AudioIOLayout::const_default()
        },
    ];

    const MIDI_INPUT: MidiConfig = MidiConfig::None;
    const SAMPLE_ACCURATE_AUTOMATION: bool = false;

    type SysExMessage = ();
    type BackgroundTask = PluginTask;

    fn params(&self) -> Arc<dyn Params> {
        self.params.clone()
    }

    fn initialize(
        &mut self,
        audio_io_layout: &AudioIOLayout,
        buffer_config: &BufferConfig,
        context: &mut impl InitContext<Self>,
    ) -> bool {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let channels = audio_io_layout
                .main_output_channels
                .map(|c| c.get() as usize)
                .unwrap_or(MAX_PLUGIN_CHANNELS)
                .min(MAX_PLUGIN_CHANNELS);

            let host = InProcessHost::new(buffer_config.sample_rate, channels);
            let config = EngineConfig {
                gain: self.params.gain_parameters(),
                ..EngineConfig::default()
            };
            let mut session = EngineSession::new(host, config);

            match session.attach_to(HOST_INPUT) {
                Ok(AttachOutcome::Unavailable) => {
                    error!(
                        "Normalizer unavailable: {}",
                        session.unavailable_reason().unwrap_or("unknown reason")
                    );
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to attach normalizer to the input bus: {e}");
                    return false;
                }
            }

            if self.params.enabled.value() {
                if let Err(e) = session.enable() {
                    warn!("{e}");
                }
            }

            context.set_latency_samples(LATENCY_FRAMES as u32);

            self.input_scratch =
                vec![vec![0.0; buffer_config.max_buffer_size as usize]; channels];
            self.session = Some(session);
            info!(
                "Loudness normalizer initialized ({channels} ch @ {} Hz).",
                buffer_config.sample_rate
            );
            true
        }))
        .unwrap_or(false)
    }

    fn process(
        &mut self,
        buffer: &mut Buffer,
        _aux: &mut AuxiliaryBuffers,
        context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process_internal(buffer, context)
        }))
        .unwrap_or(ProcessStatus::Normal)
    }

    fn task_executor(&mut self) -> TaskExecutor<Self> {
        Box::new(run_task)
    }

    fn reset(&mut self) {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            // A fresh graph starts the controller from zero state.
            permit_alloc(|| {
                session.detach();
                if let Err(e) = session.attach_to(HOST_INPUT) {
                    error!("Failed to re-attach normalizer after reset: {e}");
                }
            });
        }))
        .unwrap_or(());
    }
}

impl LoudnessNormalizerPlugin {
    fn process_internal(
        &mut self,
        buffer: &mut Buffer,
        context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        let Some(session) = self.session.as_mut() else {
            return ProcessStatus::Normal;
        };

        let want_enabled = self.params.enabled.value();
        if want_enabled != session.is_enabled() {
            // A failed resume may format an error message.
            match permit_alloc(|| session.apply_enabled(want_enabled)) {
                Ok(true) => context.execute_background(PluginTask::EnabledChanged {
                    enabled: want_enabled,
                    at_seconds: session.current_time().unwrap_or(0.0),
                }),
                Ok(false) => {}
                Err(e) => context.execute_background(PluginTask::EnableFailed(e)),
            }
        }

        let frames = buffer.samples();
        if self.input_scratch.iter().any(|c| c.len() < frames) {
            permit_alloc(|| {
                for ch in self.input_scratch.iter_mut() {
                    ch.resize(frames, 0.0);
                }
            });
        }

        let channels = buffer.as_slice();
        let mut inputs: [&[f32]; MAX_PLUGIN_CHANNELS] = [&[]; MAX_PLUGIN_CHANNELS];
        let mut input_count = 0;
        for ((slot, scratch), src) in inputs
            .iter_mut()
            .zip(self.input_scratch.iter_mut())
            .zip(channels.iter())
        {
            let n = frames.min(src.len());
            scratch[..n].copy_from_slice(&src[..n]);
            *slot = &scratch[..n];
            input_count += 1;
        }

        let params = self.params.gain_parameters();
        if let Some(runtime) = session.runtime_mut() {
            if let Some(graph) = runtime.graph_mut(HOST_INPUT) {
                graph.set_parameters(params);
            }
            runtime.render(HOST_INPUT, &inputs[..input_count], channels);
        }

        while let Some((source, event)) = session.pop_render_event() {
            context.execute_background(PluginTask::Render(source, event));
        }

        ProcessStatus::Normal
    }
}

impl ClapPlugin for LoudnessNormalizerPlugin {
    const CLAP_ID: &'static str = "com.andrzej.loudness-normalizer";
    const CLAP_DESCRIPTION: Option<&'static str> =
        Some("Real-time loudness normalizer with output limiter");
    const CLAP_MANUAL_URL: Option<&'static str> = None;
    const CLAP_SUPPORT_URL: Option<&'static str> = None;
    const CLAP_FEATURES: &'static [ClapFeature] = &[
        ClapFeature::AudioEffect,
        ClapFeature::Stereo,
        ClapFeature::Mono,
        ClapFeature::Limiter,
    ];
}

impl Vst3Plugin for LoudnessNormalizerPlugin {
    const VST3_CLASS_ID: [u8; 16] = *b"LoudnessNormlzr1";
    const VST3_SUBCATEGORIES: &'static [Vst3SubCategory] = &[
        Vst3SubCategory::Fx,
        Vst3SubCategory::Dynamics,
    ];
}

nih_export_clap!(LoudnessNormalizerPlugin);
nih_export_vst3!(LoudnessNormalizerPlugin);
