//! Frame loop driving the pipeline once per display tick.
//!
//! The loop is `Idle` until a frame source with known dimensions and an
//! inference session are attached. It then sizes the display surface to the
//! source and runs one strictly sequential cycle per tick:
//! capture, preprocess, await inference, postprocess, render.
use std::{future::Future, time::Duration};

use common::frame::{Frame, FrameSource};
use image::RgbaImage;
use smallvec::smallvec;
use tokio::{
    task::{JoinError, JoinHandle},
    time::{Interval, MissedTickBehavior},
};

use crate::{
    config::PipelineConfig,
    meter::METER,
    overlay::{AlertSignal, OverlayRenderer, OverlayState},
    postproc::Postprocessor,
    preproc::Preprocessor,
    session::{InferSession, NamedTensors},
    Result, ScanError,
};

type InferJoin<S> = std::result::Result<(S, Result<NamedTensors>), JoinError>;

/// Scheduler of frame loop cycles.
pub trait Ticker {
    /// Wait for the next display refresh.
    fn tick(&mut self) -> impl Future<Output = ()>;
}

impl Ticker for Interval {
    async fn tick(&mut self) {
        Interval::tick(self).await;
    }
}

/// Ticker firing `rate` times per second.
///
/// Missed ticks are not caught up with, a slow model lowers the frame rate
/// instead of queuing cycles.
pub fn display_ticker(rate: f32) -> Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(1.0 / rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

/// Outcome of one loop cycle.
#[derive(Debug)]
pub enum Cycle {
    /// Source or session not ready, nothing was done.
    Idle,
    /// The cycle was abandoned.
    Skipped(ScanError),
    Rendered { frame: Frame, state: OverlayState },
}

/// Owner of the frame source, the inference session and the display surface.
pub struct FrameLoop<F, S> {
    input_name: String,
    preproc: Preprocessor,
    postproc: Postprocessor,
    renderer: OverlayRenderer,
    source: Option<F>,
    session: Option<S>,
    surface: Option<RgbaImage>,
    state: LoopState,
    watchdog: Option<Duration>,
    abandoned: Option<JoinHandle<(S, Result<NamedTensors>)>>,
}

impl<F: FrameSource, S: InferSession + Send + 'static> FrameLoop<F, S> {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            input_name: config.input_name.clone(),
            preproc: Preprocessor::new(config),
            postproc: Postprocessor::new(config),
            renderer: OverlayRenderer::new(config),
            source: None,
            session: None,
            surface: None,
            state: LoopState::Idle,
            watchdog: None,
            abandoned: None,
        }
    }

    /// Abandon cycles whose inference takes longer than `timeout`.
    ///
    /// Cycles are skipped until an abandoned run resolves.
    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog = Some(timeout);
        self
    }

    /// Toggle `signal` with the alert flag of every rendered frame.
    pub fn with_signal(mut self, signal: Box<dyn AlertSignal>) -> Self {
        self.renderer = self.renderer.with_signal(signal);
        self
    }

    pub fn attach_source(&mut self, source: F) {
        self.source = Some(source);
    }

    pub fn attach_session(&mut self, session: S) {
        self.session = Some(session);
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Display surface, sized once the loop is running.
    pub fn surface(&self) -> Option<&RgbaImage> {
        self.surface.as_ref()
    }

    /// Run cycles forever, one per tick of `ticker`.
    pub async fn run<T: Ticker>(
        &mut self,
        ticker: &mut T,
        mut on_cycle: impl FnMut(&Self, Cycle),
    ) {
        loop {
            ticker.tick().await;
            let cycle = self.step().await;
            on_cycle(self, cycle);
        }
    }

    /// Run a single cycle.
    pub async fn step(&mut self) -> Cycle {
        if !self.poll_ready() {
            log::debug!("Frame loop not ready, skipping cycle");
            return Cycle::Idle;
        }

        match self.run_cycle().await {
            Ok((frame, state)) => {
                METER.tick_rendered();
                Cycle::Rendered { frame, state }
            }
            Err(err) => {
                METER.tick_skipped();
                log::warn!("Skipping frame: {err}");
                Cycle::Skipped(err)
            }
        }
    }

    /// Switch to `Running` once source and session are ready.
    fn poll_ready(&mut self) -> bool {
        if self.state == LoopState::Running {
            return true;
        }

        let (Some(source), Some(_)) = (self.source.as_ref(), self.session.as_ref()) else {
            return false;
        };
        let Some((width, height)) = source.dimensions().filter(|(w, h)| *w > 0 && *h > 0) else {
            return false;
        };

        self.surface = Some(RgbaImage::new(width, height));
        self.state = LoopState::Running;
        log::info!("Frame loop running on a {width}x{height} display surface");

        true
    }

    async fn run_cycle(&mut self) -> Result<(Frame, OverlayState)> {
        self.collect_abandoned_run().await?;

        let source = self
            .source
            .as_mut()
            .ok_or_else(|| ScanError::InvalidFrame("frame loop is not running".to_owned()))?;
        let frame = source
            .capture()
            .map_err(|err| ScanError::InvalidFrame(format!("capture failed: {err}")))?;
        let (tensor, crop) = self.preproc.run(&frame)?;

        let output_name = match self.session.as_ref() {
            Some(session) => session
                .output_names()
                .first()
                .cloned()
                .ok_or_else(|| ScanError::Postprocess("model has no outputs".to_owned()))?,
            None => return Err(ScanError::Inference("no inference session".to_owned())),
        };
        let inputs = smallvec![(self.input_name.clone(), tensor)];
        let outputs = self.infer(inputs).await?;

        let output = outputs
            .into_iter()
            .find(|(name, _)| *name == output_name)
            .map(|(_, tensor)| tensor)
            .ok_or_else(|| ScanError::Postprocess(format!("missing output {output_name}")))?;
        let inference = self.postproc.run(&output)?;

        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| ScanError::InvalidFrame("frame loop is not running".to_owned()))?;
        let state = self.renderer.render(surface, inference, Some(crop));
        log::debug!("Rendered frame, alert: {}", state.alert);

        Ok((frame, state))
    }

    /// Run the session on its own task, bounded by the watchdog.
    ///
    /// The session travels with the task. A run abandoned by the watchdog keeps
    /// it until the run resolves, no other run is issued meanwhile.
    async fn infer(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ScanError::Inference("no inference session".to_owned()))?;
        let mut run = tokio::spawn(async move {
            let outputs = session.run(inputs).await;
            (session, outputs)
        });

        let joined = match self.watchdog {
            Some(timeout) => match tokio::time::timeout(timeout, &mut run).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.abandoned = Some(run);
                    return Err(ScanError::Inference(format!(
                        "no result within {} ms",
                        timeout.as_millis()
                    )));
                }
            },
            None => run.await,
        };

        self.restore_session(joined)
    }

    /// Take the session back from an abandoned run once it has resolved.
    async fn collect_abandoned_run(&mut self) -> Result<()> {
        match self.abandoned.take() {
            None => Ok(()),
            Some(run) if !run.is_finished() => {
                self.abandoned = Some(run);
                Err(ScanError::Inference(
                    "abandoned inference is still running".to_owned(),
                ))
            }
            Some(run) => {
                // Outputs belong to an earlier frame
                if let Err(err) = self.restore_session(run.await) {
                    log::debug!("Abandoned inference failed: {err}");
                }
                Ok(())
            }
        }
    }

    fn restore_session(&mut self, joined: InferJoin<S>) -> Result<NamedTensors> {
        let (session, outputs) = joined.map_err(|err| {
            log::error!("Inference task failed, the session is lost: {err}");
            ScanError::Inference(format!("inference task failed: {err}"))
        })?;
        self.session = Some(session);

        outputs
    }
}
