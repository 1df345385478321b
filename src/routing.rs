//! Dual-Path Routing
//!
//! ```text
//! source ──┬──> raw_gain ─────────────────────────────────┐
//!          └──> GainController ─> LimiterStage ─> proc_gain ─┴──> sink
//! ```
//!
//! The graph is split in two halves:
//! - [`DualPathGraph`] stays on the control side. It holds the shared path
//!   gains, the meters and the consumer end of the render-event queue.
//! - [`GraphRenderer`] is mounted into the runtime and runs on the audio
//!   thread. It owns the gain controller state, the limiter and all scratch
//!   buffers, and never allocates or locks.
//!
//! The renderer buffers the source through a one-quantum FIFO, so the gain
//! controller always sees complete [`RENDER_QUANTUM`]-frame blocks whatever
//! the host block size is. Both paths are delayed by [`LATENCY_FRAMES`].
//!
//! The control side only ever stores the two path gains. Both gains are read
//! once per render quantum; with a zero ramp they jump at the next quantum
//! boundary.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};
use ringbuf::{Consumer, Producer, RingBuffer};

use crate::config::EngineConfig;
use crate::dsp::utils::db_to_lin;
use crate::dsp::{
    AudioBlockProcessor, BlockStatus, GainController, GainParameters, LimiterStage, SilenceReason,
};
use crate::engine::{AudioRuntime, EngineError};
use crate::meters::{GainMeters, MeterSnapshot};

/// Frames per gain-controller block, independent of the host buffer size.
pub const RENDER_QUANTUM: usize = 128;

/// Delay the renderer adds to both paths.
pub const LATENCY_FRAMES: usize = RENDER_QUANTUM;

/// Widest bus the processed path supports.
pub const MAX_CHANNELS: usize = 8;

/// Extra level of the processed path while enabled (dB).
pub const EXTRA_BOOST_DB: f32 = 2.0;

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Linear form of [`EXTRA_BOOST_DB`] (about 1.2589).
pub fn extra_boost_linear() -> f32 {
    db_to_lin(EXTRA_BOOST_DB)
}

/// `(raw, processed)` path gains for the given enabled flag.
pub fn path_gains_for(enabled: bool) -> (f32, f32) {
    if enabled {
        (0.0, extra_boost_linear())
    } else {
        (1.0, 0.0)
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Identity of an external media source. Equal handles are the same source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle(u64);

impl SourceHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphId(u64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

// =============================================================================
// Shared path gain
// =============================================================================

/// Scalar path gain written by the control side, read by the renderer.
#[derive(Debug)]
pub struct PathGain {
    bits: AtomicU32,
}

impl PathGain {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Per-sample linear ramp toward the latest path gain.
#[derive(Clone, Copy, Debug)]
struct GainRamp {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
}

impl GainRamp {
    fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
        }
    }

    fn retarget(&mut self, target: f32, ramp_samples: u32) {
        if target == self.target {
            return;
        }
        self.target = target;
        if ramp_samples == 0 {
            self.current = target;
            self.remaining = 0;
        } else {
            self.step = (target - self.current) / ramp_samples as f32;
            self.remaining = ramp_samples;
        }
    }

    #[inline]
    fn next(&mut self) -> f32 {
        if self.remaining > 0 {
            self.current += self.step;
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            }
        }
        self.current
    }
}

// =============================================================================
// Render events
// =============================================================================

/// Notifications from the audio thread. Only state changes are reported, so a
/// long stretch of missing input produces a single event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderEvent {
    Silenced(SilenceReason),
    Recovered,
}

fn report_status(
    events: &mut Producer<RenderEvent>,
    last_silence: &mut Option<SilenceReason>,
    status: BlockStatus,
) {
    let event = match (status, *last_silence) {
        (BlockStatus::Silenced(reason), last) if last != Some(reason) => {
            *last_silence = Some(reason);
            RenderEvent::Silenced(reason)
        }
        (BlockStatus::Processed { .. }, Some(_)) => {
            *last_silence = None;
            RenderEvent::Recovered
        }
        _ => return,
    };
    // A full queue drops the event; the renderer never waits on the consumer.
    let _ = events.push(event);
}

// =============================================================================
// Audio-side half
// =============================================================================

pub struct GraphRenderer {
    id: GraphId,
    source: SourceHandle,
    controller: GainController,
    limiter: LimiterStage,
    params: GainParameters,
    raw_gain: Arc<PathGain>,
    proc_gain: Arc<PathGain>,
    raw_ramp: GainRamp,
    proc_ramp: GainRamp,
    ramp_samples: u32,
    // One quantum of source audio, one quantum of mixed output, and the
    // processed path in between. All sized `channels x RENDER_QUANTUM`.
    in_fifo: Vec<Vec<f32>>,
    out_fifo: Vec<Vec<f32>>,
    scratch: Vec<Vec<f32>>,
    fill: usize,
    // Some frame of the pending quantum had no source sample.
    quantum_missing: bool,
    meters: Arc<GainMeters>,
    events: Producer<RenderEvent>,
    last_silence: Option<SilenceReason>,
}

impl GraphRenderer {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn source(&self) -> SourceHandle {
        self.source
    }

    /// Replace the block-rate parameters. Takes effect at the next quantum.
    pub fn set_parameters(&mut self, params: GainParameters) {
        self.params = params;
    }

    /// Render one host block of any length. `output` decides the block length;
    /// input channels that are missing reuse channel 0, and input beyond the
    /// graph's channel count is ignored.
    pub fn render(&mut self, input: &[&[f32]], output: &mut [&mut [f32]]) {
        let frames = output.iter().map(|c| c.len()).max().unwrap_or(0);
        let reference: &[f32] = input.first().copied().unwrap_or(&[]);

        let mut pos = 0;
        while pos < frames {
            let n = (RENDER_QUANTUM - self.fill).min(frames - pos);
            let at = self.fill;

            if reference.len() < pos + n {
                self.quantum_missing = true;
            }
            for (ch, fifo) in self.in_fifo.iter_mut().enumerate() {
                let src = match input.get(ch) {
                    Some(c) if !c.is_empty() => *c,
                    _ => reference,
                };
                for (k, s) in fifo[at..at + n].iter_mut().enumerate() {
                    *s = src.get(pos + k).copied().unwrap_or(0.0);
                }
            }

            let out_channels = self.out_fifo.len();
            for (ch, out) in output.iter_mut().enumerate() {
                let fifo = &self.out_fifo[if ch < out_channels { ch } else { 0 }];
                for (k, o) in out.iter_mut().skip(pos).take(n).enumerate() {
                    *o = fifo[at + k];
                }
            }

            self.fill += n;
            pos += n;
            if self.fill == RENDER_QUANTUM {
                self.process_quantum();
                self.fill = 0;
            }
        }
    }

    fn process_quantum(&mut self) {
        let channels = self.in_fifo.len();

        let mut quantum_in: [&[f32]; MAX_CHANNELS] = [&[]; MAX_CHANNELS];
        for (dst, src) in quantum_in.iter_mut().zip(self.in_fifo.iter()) {
            *dst = src.as_slice();
        }
        let in_count = if self.quantum_missing { 0 } else { channels };
        self.quantum_missing = false;

        // Processed path: controller -> limiter, into scratch
        let mut proc_out: [&mut [f32]; MAX_CHANNELS] = Default::default();
        for (dst, buf) in proc_out.iter_mut().zip(self.scratch.iter_mut()) {
            *dst = buf.as_mut_slice();
        }

        let status = self.controller.process_block(
            &quantum_in[..in_count],
            &mut proc_out[..channels],
            &self.params,
        );
        report_status(&mut self.events, &mut self.last_silence, status);
        self.limiter.process(&mut proc_out[..channels]);
        self.meters
            .publish(&self.controller.state(), self.limiter.gain_reduction_db());

        // Sum both paths into the output FIFO
        self.raw_ramp.retarget(self.raw_gain.value(), self.ramp_samples);
        self.proc_ramp
            .retarget(self.proc_gain.value(), self.ramp_samples);

        for i in 0..RENDER_QUANTUM {
            let raw_g = self.raw_ramp.next();
            let proc_g = self.proc_ramp.next();
            for ((out, raw), processed) in self
                .out_fifo
                .iter_mut()
                .zip(self.in_fifo.iter())
                .zip(proc_out.iter())
            {
                // A muted path contributes nothing, even if it carries NaN.
                let raw_part = if raw_g == 0.0 { 0.0 } else { raw[i] * raw_g };
                let proc_part = if proc_g == 0.0 { 0.0 } else { processed[i] * proc_g };
                out[i] = raw_part + proc_part;
            }
        }
    }
}

// =============================================================================
// Control-side half
// =============================================================================

pub struct DualPathGraph {
    id: GraphId,
    source: SourceHandle,
    raw_gain: Arc<PathGain>,
    proc_gain: Arc<PathGain>,
    meters: Arc<GainMeters>,
    events: Consumer<RenderEvent>,
}

impl DualPathGraph {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn source(&self) -> SourceHandle {
        self.source
    }

    /// Current `(raw, processed)` path gains.
    pub fn path_gains(&self) -> (f32, f32) {
        (self.raw_gain.value(), self.proc_gain.value())
    }

    pub fn set_enabled(&self, enabled: bool) {
        let (raw, processed) = path_gains_for(enabled);
        self.raw_gain.set(raw);
        self.proc_gain.set(processed);
    }

    pub fn meters(&self) -> MeterSnapshot {
        self.meters.snapshot()
    }

    pub fn pop_event(&mut self) -> Option<RenderEvent> {
        self.events.pop()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(GraphId),
    AlreadyAttached(GraphId),
    StageNotLoaded,
}

/// Owns the single [`DualPathGraph`] of a session.
#[derive(Default)]
pub struct RoutingManager {
    graph: Option<DualPathGraph>,
    next_graph_id: u64,
}

impl RoutingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> Option<&DualPathGraph> {
        self.graph.as_ref()
    }

    pub fn graph_mut(&mut self) -> Option<&mut DualPathGraph> {
        self.graph.as_mut()
    }

    /// Build the dual-path graph for `source` and mount its renderer.
    ///
    /// Does nothing when the processing stage is not loaded or when a graph
    /// for this exact source already exists. A graph for another source is
    /// torn down first.
    pub fn build<R: AudioRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        stage_loaded: bool,
        source: SourceHandle,
        enabled: bool,
        config: &EngineConfig,
    ) -> Result<BuildOutcome, EngineError> {
        if !stage_loaded {
            debug!("Processing stage not loaded, not building a graph for {source}.");
            return Ok(BuildOutcome::StageNotLoaded);
        }

        if let Some(graph) = &self.graph {
            if graph.source == source {
                debug!("{} already built for {source}, keeping it.", graph.id);
                return Ok(BuildOutcome::AlreadyAttached(graph.id));
            }
        }

        self.teardown(runtime);

        self.next_graph_id += 1;
        let id = GraphId(self.next_graph_id);
        let sample_rate = runtime.sample_rate();
        let channels = runtime.channels().clamp(1, MAX_CHANNELS);

        let (raw, processed) = path_gains_for(enabled);
        let raw_gain = Arc::new(PathGain::new(raw));
        let proc_gain = Arc::new(PathGain::new(processed));
        let meters = Arc::new(GainMeters::new());
        let (producer, consumer) = RingBuffer::<RenderEvent>::new(EVENT_QUEUE_CAPACITY).split();

        let ramp_samples = (config.switch_ramp_seconds.max(0.0) * sample_rate).round() as u32;

        let renderer = GraphRenderer {
            id,
            source,
            controller: GainController::new(sample_rate),
            limiter: LimiterStage::new(sample_rate),
            params: config.gain,
            raw_gain: Arc::clone(&raw_gain),
            proc_gain: Arc::clone(&proc_gain),
            raw_ramp: GainRamp::new(raw),
            proc_ramp: GainRamp::new(processed),
            ramp_samples,
            in_fifo: vec![vec![0.0; RENDER_QUANTUM]; channels],
            out_fifo: vec![vec![0.0; RENDER_QUANTUM]; channels],
            scratch: vec![vec![0.0; RENDER_QUANTUM]; channels],
            fill: 0,
            quantum_missing: false,
            meters: Arc::clone(&meters),
            events: producer,
            last_silence: None,
        };

        runtime.connect(renderer)?;

        self.graph = Some(DualPathGraph {
            id,
            source,
            raw_gain,
            proc_gain,
            meters,
            events: consumer,
        });

        info!(
            "{id} built for {source} ({channels} ch @ {sample_rate} Hz, raw={raw}, processed={processed:.4})."
        );
        Ok(BuildOutcome::Built(id))
    }

    /// Unmount and forget the current graph. Safe to call at any time.
    pub fn teardown<R: AudioRuntime + ?Sized>(&mut self, runtime: &mut R) {
        let Some(graph) = self.graph.take() else {
            return;
        };
        if let Err(e) = runtime.disconnect(graph.id) {
            debug!("Ignoring disconnect failure for {}: {e}", graph.id);
        }
        info!("{} for {} torn down.", graph.id, graph.source);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InProcessRuntime;

    const SR: f32 = 48_000.0;
    const A: SourceHandle = SourceHandle::new(1);
    const B: SourceHandle = SourceHandle::new(2);

    fn runtime() -> InProcessRuntime {
        InProcessRuntime::new(SR, 2)
    }

    fn render(rt: &mut InProcessRuntime, source: SourceHandle, input: &[f32], frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        {
            let mut outs: [&mut [f32]; 2] = [&mut left, &mut right];
            rt.render(source, &[input], &mut outs);
        }
        (left, right)
    }

    #[test]
    fn test_no_graph_without_stage() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        let outcome = routing
            .build(&mut rt, false, A, false, &EngineConfig::default())
            .unwrap();
        assert_eq!(outcome, BuildOutcome::StageNotLoaded);
        assert!(routing.graph().is_none());
        assert_eq!(rt.mounted_graphs(), 0);
    }

    #[test]
    fn test_initial_gains_follow_enabled_flag() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing
            .build(&mut rt, true, A, false, &EngineConfig::default())
            .unwrap();
        assert_eq!(routing.graph().unwrap().path_gains(), (1.0, 0.0));

        routing.teardown(&mut rt);
        routing
            .build(&mut rt, true, A, true, &EngineConfig::default())
            .unwrap();
        let (raw, processed) = routing.graph().unwrap().path_gains();
        assert_eq!(raw, 0.0);
        assert!((processed - 1.2589).abs() < 1e-4);
    }

    #[test]
    fn test_same_source_is_not_rebuilt() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        let cfg = EngineConfig::default();
        let first = routing.build(&mut rt, true, A, true, &cfg).unwrap();
        let id = match first {
            BuildOutcome::Built(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        };

        render(&mut rt, A, &[0.05; 512], 512);
        let before = routing.graph().unwrap().meters();

        let second = routing.build(&mut rt, true, A, true, &cfg).unwrap();
        assert_eq!(second, BuildOutcome::AlreadyAttached(id));
        assert_eq!(rt.mounted_graphs(), 1);
        assert_eq!(rt.connect_calls(), 1);
        assert_eq!(routing.graph().unwrap().meters(), before);
    }

    #[test]
    fn test_new_source_replaces_graph() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        let cfg = EngineConfig::default();
        routing.build(&mut rt, true, A, true, &cfg).unwrap();
        let old = routing.graph().unwrap().id();
        render(&mut rt, A, &[0.05; 512], 512);

        routing.build(&mut rt, true, B, true, &cfg).unwrap();
        let graph = routing.graph().unwrap();
        assert_ne!(graph.id(), old);
        assert_eq!(graph.source(), B);
        assert_eq!(graph.meters().quanta_processed, 0);
        assert_eq!(rt.mounted_graphs(), 1);
        assert!(rt.is_mounted(B));
        assert!(!rt.is_mounted(A));
    }

    #[test]
    fn test_teardown_is_always_safe() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing.teardown(&mut rt);
        routing
            .build(&mut rt, true, A, false, &EngineConfig::default())
            .unwrap();
        routing.teardown(&mut rt);
        routing.teardown(&mut rt);
        assert!(routing.graph().is_none());
        assert_eq!(rt.mounted_graphs(), 0);
    }

    #[test]
    fn test_disabled_graph_passes_raw_signal() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing
            .build(&mut rt, true, A, false, &EngineConfig::default())
            .unwrap();

        let input: Vec<f32> = (0..300).map(|i| ((i as f32) * 0.05).sin() * 0.3).collect();
        let (left, right) = render(&mut rt, A, &input, 300);
        assert!(left[..LATENCY_FRAMES].iter().all(|&s| s == 0.0));
        assert_eq!(&left[LATENCY_FRAMES..], &input[..300 - LATENCY_FRAMES]);
        assert_eq!(left, right);

        // 300 frames = 128 + 128 + 44 pending
        assert_eq!(routing.graph().unwrap().meters().quanta_processed, 2);
        render(&mut rt, A, &[0.0; 84], 84);
        assert_eq!(routing.graph().unwrap().meters().quanta_processed, 3);
    }

    #[test]
    fn test_enabled_graph_outputs_boosted_processed_path() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing
            .build(&mut rt, true, A, true, &EngineConfig::default())
            .unwrap();

        render(&mut rt, A, &[0.02; 128], 128);
        let snap = routing.graph().unwrap().meters();
        let (left, _) = render(&mut rt, A, &[0.02; 128], 128);
        let want = 0.02 * db_to_lin(snap.current_gain_db) * extra_boost_linear();
        assert!(snap.current_gain_db > 0.0);
        assert!((left[127] - want).abs() < 1e-6);
    }

    #[test]
    fn test_gain_switch_is_instant_by_default() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing
            .build(&mut rt, true, A, false, &EngineConfig::default())
            .unwrap();
        render(&mut rt, A, &[0.1; 128], 128);

        routing.graph().unwrap().set_enabled(true);
        // The quantum already in flight was mixed before the switch.
        let (before, _) = render(&mut rt, A, &[0.1; 128], 128);
        assert!((before[0] - 0.1).abs() < 1e-7);

        let snap = routing.graph().unwrap().meters();
        let (after, _) = render(&mut rt, A, &[0.1; 128], 128);
        // No raw signal leaks into the first frame of the switched quantum.
        let want = 0.1 * db_to_lin(snap.current_gain_db) * extra_boost_linear();
        assert!((after[0] - want).abs() < 1e-5);
    }

    #[test]
    fn test_configured_ramp_spreads_the_switch() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        let cfg = EngineConfig {
            switch_ramp_seconds: 128.0 / SR,
            ..EngineConfig::default()
        };
        routing.build(&mut rt, true, A, true, &cfg).unwrap();
        render(&mut rt, A, &[0.1; 128], 128);

        routing.graph().unwrap().set_enabled(false);
        render(&mut rt, A, &[0.1; 128], 128);
        let processed = 0.1 * db_to_lin(routing.graph().unwrap().meters().current_gain_db);
        let (left, _) = render(&mut rt, A, &[0.1; 256], 256);

        // Halfway through the ramp both paths contribute.
        let mid = left[63];
        assert!(mid > 0.1 * 0.4 && mid < processed * extra_boost_linear());
        // After the ramp only the raw path is left.
        assert!((left[200] - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_dynamics_do_not_depend_on_host_block_size() {
        let input: Vec<f32> = (0..12_000)
            .map(|i| 0.02 + ((i as f32) * 0.01).sin() * 0.01)
            .collect();

        let run = |block: usize| {
            let mut rt = runtime();
            let mut routing = RoutingManager::new();
            routing
                .build(&mut rt, true, A, true, &EngineConfig::default())
                .unwrap();
            let mut out = Vec::with_capacity(input.len());
            for chunk in input.chunks(block) {
                let (left, _) = render(&mut rt, A, chunk, chunk.len());
                out.extend_from_slice(&left);
            }
            (routing.graph().unwrap().meters(), out)
        };

        let (reference, reference_out) = run(RENDER_QUANTUM);
        assert_eq!(reference.quanta_processed, 12_000 / RENDER_QUANTUM as u64);
        for block in [64, 200, 441, 1000] {
            let (snap, out) = run(block);
            assert_eq!(snap.quanta_processed, reference.quanta_processed, "block {block}");
            assert!(
                (snap.current_gain_db - reference.current_gain_db).abs() < 1e-6,
                "block {block}"
            );
            assert_eq!(out, reference_out, "block {block}");
        }
    }

    #[test]
    fn test_missing_input_reports_once() {
        let mut rt = runtime();
        let mut routing = RoutingManager::new();
        routing
            .build(&mut rt, true, A, true, &EngineConfig::default())
            .unwrap();

        let (left, right) = render(&mut rt, A, &[], 512);
        assert!(left.iter().chain(right.iter()).all(|&s| s == 0.0));
        render(&mut rt, A, &[0.05; 256], 256);

        let graph = routing.graph_mut().unwrap();
        assert_eq!(
            graph.pop_event(),
            Some(RenderEvent::Silenced(SilenceReason::MissingInput))
        );
        assert_eq!(graph.pop_event(), Some(RenderEvent::Recovered));
        assert_eq!(graph.pop_event(), None);
    }
}
