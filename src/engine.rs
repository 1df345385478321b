//! Engine Session
//!
//! Control surface of the normalizer: lazily creates the audio runtime, loads
//! the processing stage, attaches the dual-path graph to a source and flips
//! the path gains on enable/disable.
//!
//! # Lifecycle
//! ```text
//! Uninitialized -> RuntimeReady -> StageLoaded -> GraphAttached(source)
//!        \______________\______________\______> Unavailable (permanent)
//! ```
//! The enabled flag is orthogonal to the state above. It only ever changes
//! the two path gains and never rebuilds or tears down the graph.
//!
//! A missing facility (no runtime, no module support) puts the session into
//! `Unavailable` for good; every later call is a logged no-op. A module that
//! exists but fails to load is retried on the next attach.

use std::fmt;

use log::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dsp::SilenceReason;
use crate::meters::MeterSnapshot;
use crate::routing::{
    BuildOutcome, DualPathGraph, GraphId, GraphRenderer, RenderEvent, RoutingManager,
    SourceHandle,
};

/// Name under which the processing stage is registered with the runtime.
pub const PROCESSOR_MODULE: &str = "loudness-processor";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The host lacks the runtime or module facility altogether.
    Unavailable(String),
    /// The processing module exists but failed to install.
    LoadFailure(String),
    ResumeFailed(String),
    ConnectFailed(String),
    NotConnected(GraphId),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable(reason) => write!(f, "audio runtime unavailable: {reason}"),
            EngineError::LoadFailure(reason) => {
                write!(f, "failed to load processing module: {reason}")
            }
            EngineError::ResumeFailed(reason) => {
                write!(f, "failed to resume audio runtime: {reason}")
            }
            EngineError::ConnectFailed(reason) => write!(f, "failed to connect graph: {reason}"),
            EngineError::NotConnected(graph) => write!(f, "{graph} is not connected"),
        }
    }
}

impl std::error::Error for EngineError {}

// =============================================================================
// Runtime seam
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Suspended,
    Closed,
}

/// The audio runtime a session drives. Renderers handed to [`connect`] run
/// on the runtime's audio thread.
///
/// [`connect`]: AudioRuntime::connect
pub trait AudioRuntime {
    fn sample_rate(&self) -> f32;
    fn channels(&self) -> usize;
    fn state(&self) -> RuntimeState;
    /// Seconds of audio rendered so far.
    fn current_time(&self) -> f64;
    fn resume(&mut self) -> Result<(), EngineError>;
    /// Returns [`EngineError::Unavailable`] when the runtime cannot host
    /// processing modules at all, [`EngineError::LoadFailure`] otherwise.
    fn load_processor_module(&mut self, name: &str) -> Result<(), EngineError>;
    fn connect(&mut self, renderer: GraphRenderer) -> Result<(), EngineError>;
    fn disconnect(&mut self, graph: GraphId) -> Result<(), EngineError>;
}

pub trait AudioHost {
    type Runtime: AudioRuntime;

    fn create_runtime(&mut self) -> Result<Self::Runtime, EngineError>;
}

// =============================================================================
// Session
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Unavailable,
    RuntimeReady,
    StageLoaded,
    GraphAttached(SourceHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(GraphId),
    /// A graph for this source already existed and was kept as is.
    AlreadyAttached(GraphId),
    /// The session is permanently unavailable; nothing was done.
    Unavailable,
}

pub struct EngineSession<H: AudioHost> {
    host: H,
    config: EngineConfig,
    runtime: Option<H::Runtime>,
    unavailable: Option<String>,
    stage_loaded: bool,
    routing: RoutingManager,
    enabled: bool,
}

impl<H: AudioHost> EngineSession<H> {
    pub fn new(host: H, config: EngineConfig) -> Self {
        Self {
            host,
            config: config.validated(),
            runtime: None,
            unavailable: None,
            stage_loaded: false,
            routing: RoutingManager::new(),
            enabled: false,
        }
    }

    /// Attach the normalizer to `source`, building the graph if needed.
    pub fn attach_to(&mut self, source: SourceHandle) -> Result<AttachOutcome, EngineError> {
        if let Some(reason) = &self.unavailable {
            debug!("Engine unavailable ({reason}), ignoring attach to {source}.");
            return Ok(AttachOutcome::Unavailable);
        }

        let ready = match self.ensure_runtime() {
            Ok(()) => self.ensure_stage_loaded(),
            Err(e) => Err(e),
        };
        match ready {
            Ok(()) => {}
            Err(EngineError::Unavailable(_)) => return Ok(AttachOutcome::Unavailable),
            Err(e) => return Err(e),
        }

        let Some(runtime) = self.runtime.as_mut() else {
            return Ok(AttachOutcome::Unavailable);
        };

        let outcome = self.routing.build(
            runtime,
            self.stage_loaded,
            source,
            self.enabled,
            &self.config,
        )?;

        match outcome {
            BuildOutcome::Built(id) => Ok(AttachOutcome::Attached(id)),
            BuildOutcome::AlreadyAttached(id) => Ok(AttachOutcome::AlreadyAttached(id)),
            BuildOutcome::StageNotLoaded => Err(EngineError::LoadFailure(format!(
                "{PROCESSOR_MODULE} not loaded"
            ))),
        }
    }

    /// Drop the graph. Always safe, including before any attach.
    pub fn detach(&mut self) {
        if let Some(runtime) = self.runtime.as_mut() {
            self.routing.teardown(runtime);
        }
    }

    /// Switch output to the processed path.
    ///
    /// A failed resume is logged and returned, but the path gains are updated
    /// regardless.
    pub fn enable(&mut self) -> Result<(), EngineError> {
        match self.apply_enabled(true) {
            Ok(true) => {
                info!("Normalizer enabled at {:.3} s.", self.current_time().unwrap_or(0.0));
                Ok(())
            }
            Ok(false) => {
                debug!("Normalizer already enabled.");
                Ok(())
            }
            Err(e) => {
                warn!("Normalizer enabled, but {e}");
                Err(e)
            }
        }
    }

    /// Switch output back to the raw path.
    pub fn disable(&mut self) {
        match self.apply_enabled(false) {
            Ok(true) => info!(
                "Normalizer disabled at {:.3} s.",
                self.current_time().unwrap_or(0.0)
            ),
            _ => debug!("Normalizer already disabled."),
        }
    }

    /// Set the enabled flag and the path gains without logging, so it can run
    /// on the audio thread once the runtime exists. Returns whether the flag
    /// changed. A failed resume is returned after the gains were switched.
    pub fn apply_enabled(&mut self, enabled: bool) -> Result<bool, EngineError> {
        if self.enabled == enabled {
            return Ok(false);
        }
        self.enabled = enabled;

        let result = if enabled {
            match self.ensure_runtime() {
                Ok(()) => self.resume_if_suspended(),
                // Already reported when the session went unavailable.
                Err(EngineError::Unavailable(_)) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        if let Some(graph) = self.routing.graph() {
            graph.set_enabled(enabled);
        }
        result.map(|()| true)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> EngineState {
        if self.unavailable.is_some() {
            return EngineState::Unavailable;
        }
        if let Some(graph) = self.routing.graph() {
            return EngineState::GraphAttached(graph.source());
        }
        if self.stage_loaded {
            EngineState::StageLoaded
        } else if self.runtime.is_some() {
            EngineState::RuntimeReady
        } else {
            EngineState::Uninitialized
        }
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    /// Runtime clock in seconds, once a runtime exists.
    pub fn current_time(&self) -> Option<f64> {
        self.runtime.as_ref().map(|rt| rt.current_time())
    }

    /// `(raw, processed)` path gains of the attached graph.
    pub fn path_gains(&self) -> Option<(f32, f32)> {
        self.routing.graph().map(|g| g.path_gains())
    }

    pub fn meters(&self) -> Option<MeterSnapshot> {
        self.routing.graph().map(|g| g.meters())
    }

    /// Next event reported by the renderer, without logging.
    pub fn pop_render_event(&mut self) -> Option<(SourceHandle, RenderEvent)> {
        let graph = self.routing.graph_mut()?;
        graph.pop_event().map(|event| (graph.source(), event))
    }

    /// Collect and log everything the renderer reported since the last call.
    pub fn drain_render_events(&mut self) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        while let Some((source, event)) = self.pop_render_event() {
            log_render_event(source, event);
            events.push(event);
        }
        events
    }

    pub fn graph(&self) -> Option<&DualPathGraph> {
        self.routing.graph()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn runtime(&self) -> Option<&H::Runtime> {
        self.runtime.as_ref()
    }

    pub fn runtime_mut(&mut self) -> Option<&mut H::Runtime> {
        self.runtime.as_mut()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn mark_unavailable(&mut self, reason: String) -> EngineError {
        error!("Loudness normalizer unavailable: {reason}");
        self.unavailable = Some(reason.clone());
        EngineError::Unavailable(reason)
    }

    fn ensure_runtime(&mut self) -> Result<(), EngineError> {
        if let Some(reason) = &self.unavailable {
            return Err(EngineError::Unavailable(reason.clone()));
        }
        if self.runtime.is_some() {
            return Ok(());
        }

        match self.host.create_runtime() {
            Ok(runtime) => {
                info!(
                    "Audio runtime created ({} ch @ {} Hz).",
                    runtime.channels(),
                    runtime.sample_rate()
                );
                self.runtime = Some(runtime);
                Ok(())
            }
            Err(EngineError::Unavailable(reason)) => Err(self.mark_unavailable(reason)),
            Err(e) => {
                warn!("Failed to create audio runtime: {e}");
                Err(e)
            }
        }
    }

    fn ensure_stage_loaded(&mut self) -> Result<(), EngineError> {
        if self.stage_loaded {
            return Ok(());
        }
        let Some(runtime) = self.runtime.as_mut() else {
            return Err(EngineError::LoadFailure("no audio runtime".into()));
        };

        match runtime.load_processor_module(PROCESSOR_MODULE) {
            Ok(()) => {
                self.stage_loaded = true;
                info!("Processing module '{PROCESSOR_MODULE}' loaded.");
                Ok(())
            }
            Err(EngineError::Unavailable(reason)) => Err(self.mark_unavailable(reason)),
            Err(e) => {
                warn!("{e}; retrying on next attach.");
                Err(e)
            }
        }
    }

    fn resume_if_suspended(&mut self) -> Result<(), EngineError> {
        let Some(runtime) = self.runtime.as_mut() else {
            return Ok(());
        };
        if runtime.state() != RuntimeState::Suspended {
            return Ok(());
        }

        runtime.resume().map_err(|e| match e {
            EngineError::ResumeFailed(_) => e,
            other => EngineError::ResumeFailed(other.to_string()),
        })
    }
}

pub fn log_render_event(source: SourceHandle, event: RenderEvent) {
    match event {
        RenderEvent::Silenced(SilenceReason::MissingInput) => {
            warn!("{source}: input block missing, rendering silence.")
        }
        RenderEvent::Silenced(SilenceReason::NonFiniteInput) => {
            warn!("{source}: non-finite input samples, rendering silence.")
        }
        RenderEvent::Recovered => info!("{source}: input recovered."),
    }
}

// =============================================================================
// Tests
// =============================================================================
