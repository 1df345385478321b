//! In-process audio runtime.
//!
//! Pull-driven: whoever owns the audio callback (the plugin, the offline
//! tool, a test) calls [`InProcessRuntime::render`] with the source's input
//! block and the sink buffers. Everything on that path is allocation free.

use log::debug;

use crate::engine::{AudioHost, AudioRuntime, EngineError, RuntimeState, PROCESSOR_MODULE};
use crate::routing::{GraphId, GraphRenderer, SourceHandle, MAX_CHANNELS};

pub struct InProcessHost {
    sample_rate: f32,
    channels: usize,
}

impl InProcessHost {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl AudioHost for InProcessHost {
    type Runtime = InProcessRuntime;

    fn create_runtime(&mut self) -> Result<InProcessRuntime, EngineError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::Unavailable(format!(
                "unsupported sample rate {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(EngineError::Unavailable(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        Ok(InProcessRuntime::new(self.sample_rate, self.channels))
    }
}

pub struct InProcessRuntime {
    sample_rate: f32,
    channels: usize,
    state: RuntimeState,
    frames_rendered: u64,
    module_loaded: bool,
    graphs: Vec<GraphRenderer>,
    connect_calls: usize,
}

impl InProcessRuntime {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            state: RuntimeState::Running,
            frames_rendered: 0,
            module_loaded: false,
            graphs: Vec::with_capacity(1),
            connect_calls: 0,
        }
    }

    /// Render one block for `source`. Output is silent while the runtime is
    /// not running or when no graph is mounted for the source.
    ///
    /// The clock advances by the block length on every call while running,
    /// mounted or not.
    pub fn render(&mut self, source: SourceHandle, input: &[&[f32]], output: &mut [&mut [f32]]) {
        let frames = output.iter().map(|c| c.len()).max().unwrap_or(0);

        let renderer = if self.state == RuntimeState::Running {
            self.graphs.iter_mut().find(|g| g.source() == source)
        } else {
            None
        };

        match renderer {
            Some(renderer) => renderer.render(input, output),
            None => {
                for ch in output.iter_mut() {
                    ch.fill(0.0);
                }
            }
        }

        if self.state == RuntimeState::Running {
            self.frames_rendered += frames as u64;
        }
    }

    /// Mounted renderer for `source`, for block-rate parameter updates.
    pub fn graph_mut(&mut self, source: SourceHandle) -> Option<&mut GraphRenderer> {
        self.graphs.iter_mut().find(|g| g.source() == source)
    }

    pub fn mounted_graphs(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_mounted(&self, source: SourceHandle) -> bool {
        self.graphs.iter().any(|g| g.source() == source)
    }

    pub fn module_loaded(&self) -> bool {
        self.module_loaded
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls
    }

    pub fn suspend(&mut self) {
        if self.state == RuntimeState::Running {
            self.state = RuntimeState::Suspended;
        }
    }

    /// Close for good. Mounted graphs are dropped.
    pub fn close(&mut self) {
        self.state = RuntimeState::Closed;
        self.graphs.clear();
    }
}

impl AudioRuntime for InProcessRuntime {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn state(&self) -> RuntimeState {
        self.state
    }

    fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        match self.state {
            RuntimeState::Closed => Err(EngineError::ResumeFailed("runtime closed".into())),
            _ => {
                self.state = RuntimeState::Running;
                Ok(())
            }
        }
    }

    fn load_processor_module(&mut self, name: &str) -> Result<(), EngineError> {
        if self.state == RuntimeState::Closed {
            return Err(EngineError::LoadFailure("runtime closed".into()));
        }
        if name != PROCESSOR_MODULE {
            return Err(EngineError::LoadFailure(format!("unknown module '{name}'")));
        }
        self.module_loaded = true;
        Ok(())
    }

    fn connect(&mut self, renderer: GraphRenderer) -> Result<(), EngineError> {
        self.connect_calls += 1;
        if self.state == RuntimeState::Closed {
            return Err(EngineError::ConnectFailed("runtime closed".into()));
        }
        debug!("Mounting {} for {}.", renderer.id(), renderer.source());
        self.graphs.push(renderer);
        Ok(())
    }

    fn disconnect(&mut self, graph: GraphId) -> Result<(), EngineError> {
        let idx = self
            .graphs
            .iter()
            .position(|g| g.id() == graph)
            .ok_or(EngineError::NotConnected(graph))?;
        self.graphs.remove(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{AttachOutcome, EngineSession, EngineState};

    const SRC: SourceHandle = SourceHandle::new(7);

    #[test]
    fn test_host_rejects_unusable_formats() {
        assert!(matches!(
            InProcessHost::new(0.0, 2).create_runtime(),
            Err(EngineError::Unavailable(_))
        ));
        assert!(matches!(
            InProcessHost::new(48_000.0, 0).create_runtime(),
            Err(EngineError::Unavailable(_))
        ));
        assert!(InProcessHost::new(44_100.0, 2).create_runtime().is_ok());
    }

    #[test]
    fn test_unavailable_host_session() {
        let mut session = EngineSession::new(InProcessHost::new(f32::NAN, 2), EngineConfig::default());
        assert_eq!(session.attach_to(SRC).unwrap(), AttachOutcome::Unavailable);
        assert_eq!(session.state(), EngineState::Unavailable);
    }

    #[test]
    fn test_unknown_module_is_a_load_failure() {
        let mut rt = InProcessRuntime::new(48_000.0, 2);
        assert!(matches!(
            rt.load_processor_module("other"),
            Err(EngineError::LoadFailure(_))
        ));
        assert!(!rt.module_loaded());
        assert!(rt.load_processor_module(PROCESSOR_MODULE).is_ok());
        assert!(rt.module_loaded());
    }

    #[test]
    fn test_unknown_graph_disconnect() {
        let mut session = EngineSession::new(InProcessHost::new(48_000.0, 2), EngineConfig::default());
        let id = match session.attach_to(SRC).unwrap() {
            AttachOutcome::Attached(id) => id,
            other => panic!("unexpected outcome {other:?}"),
        };
        let rt = session.runtime_mut().unwrap();
        assert!(rt.disconnect(id).is_ok());
        assert_eq!(rt.disconnect(id), Err(EngineError::NotConnected(id)));
    }

    #[test]
    fn test_render_silent_unless_running_and_mounted() {
        let mut session = EngineSession::new(InProcessHost::new(48_000.0, 1), EngineConfig::default());
        session.attach_to(SRC).unwrap();
        let rt = session.runtime_mut().unwrap();
        let input = [0.25f32; 128];
        let mut out = [1.0f32; 128];

        // Unmounted source: silence, but the clock still runs.
        rt.render(SourceHandle::new(99), &[&input], &mut [&mut out[..]]);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!((rt.current_time() - 128.0 / 48_000.0).abs() < 1e-12);

        // Mounted source: the first quantum is still in the renderer.
        rt.render(SRC, &[&input], &mut [&mut out[..]]);
        assert!(out.iter().all(|&s| s == 0.0));
        rt.render(SRC, &[&input], &mut [&mut out[..]]);
        assert!(out.iter().all(|&s| s == 0.25));
        assert!((rt.current_time() - 384.0 / 48_000.0).abs() < 1e-12);

        rt.suspend();
        rt.render(SRC, &[&input], &mut [&mut out[..]]);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!((rt.current_time() - 384.0 / 48_000.0).abs() < 1e-12);
    }

    #[test]
    fn test_enable_resumes_suspended_runtime() {
        let mut session = EngineSession::new(InProcessHost::new(48_000.0, 1), EngineConfig::default());
        session.attach_to(SRC).unwrap();
        session.runtime_mut().unwrap().suspend();
        session.enable().unwrap();
        assert_eq!(session.runtime().unwrap().state(), RuntimeState::Running);
    }

    #[test]
    fn test_closed_runtime_rejects_resume() {
        let mut session = EngineSession::new(InProcessHost::new(48_000.0, 1), EngineConfig::default());
        session.attach_to(SRC).unwrap();
        {
            let rt = session.runtime_mut().unwrap();
            rt.close();
            assert_eq!(rt.mounted_graphs(), 0);
        }
        // Closed is not Suspended, so enable does not try to resume.
        assert!(session.enable().is_ok());
        let rt = session.runtime_mut().unwrap();
        assert!(matches!(rt.resume(), Err(EngineError::ResumeFailed(_))));
        session.detach();
        assert!(session.graph().is_none());
    }
}
