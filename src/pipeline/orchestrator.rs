//! Duplex pipeline that runs from startup until shutdown.
//!
//! Wires capture → VAD → transcription → (turn orchestrator) → batching →
//! synthesis → ordered playback. Every stage but the orchestrator runs on
//! its own OS thread; the orchestrator is returned to the caller to drive on
//! a tokio runtime.

use crate::audio::player::AudioSink;
use crate::audio::recorder::AudioSource;
use crate::audio::vad::SpeechClassifier;
use crate::config::{Config, LiveSettings};
use crate::conversation::{Conversation, History};
use crate::error::Result;
use crate::llm::model::LanguageModel;
use crate::pipeline::batcher::TextBatcher;
use crate::pipeline::captions::CaptionSink;
use crate::pipeline::dispatcher::{SynthesisDispatcher, run_synthesis};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::playback::Reassembler;
use crate::pipeline::station::StationRunner;
use crate::pipeline::transcriber_station::TranscriberStation;
use crate::pipeline::turn::{TurnChannels, TurnOrchestrator};
use crate::pipeline::types::{AudioFrame, SpeechRequest};
use crate::pipeline::vad_station::{VadStation, WindowShape};
use crate::session::SessionContext;
use crate::stt::transcriber::Transcriber;
use crate::tts::synthesizer::Synthesizer;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Consecutive capture read failures before the device is given up on.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Sleep between reads of a live source.
const CAPTURE_POLL: Duration = Duration::from_millis(16);

/// The external collaborators the pipeline is built around.
pub struct Backends {
    pub source: Box<dyn AudioSource>,
    pub classifier: Box<dyn SpeechClassifier>,
    pub transcriber: Arc<dyn Transcriber>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Box<dyn AudioSink>,
    pub captions: Box<dyn CaptionSink>,
}

/// Handle to the running stage threads.
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    speech_tx: Sender<SpeechRequest>,
    session: SessionContext,
    settings: LiveSettings,
}

impl PipelineHandle {
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Live tunables; updates apply from the next unit of work.
    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop capture and synthesis, then wait up to `timeout` for the stage
    /// threads. Threads still running after that are detached.
    pub fn stop(mut self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        // Synthesis may already be gone
        let _unused = self.speech_tx.send(SpeechRequest::Shutdown);

        let deadline = Instant::now() + timeout;
        loop {
            let (finished, remaining): (Vec<_>, Vec<_>) =
                self.threads.drain(..).partition(|handle| handle.is_finished());
            for handle in finished {
                join_logged(handle);
            }
            self.threads = remaining;

            if self.threads.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    threads = self.threads.len(),
                    "shutdown timeout, detaching remaining stage threads"
                );
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        tracing::info!("pipeline stopped");
    }

    /// Wait for every stage to finish on its own, e.g. after a finite source
    /// ran dry and the orchestrator returned.
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            join_logged(handle);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn join_logged(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if let Err(panic_info) = handle.join() {
        let msg = panic_info
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");
        tracing::error!(thread = %name, "pipeline thread panicked: {}", msg);
    }
}

fn spawn_stage<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(format!("duplexvox-{}", name)).spawn(f)?)
}

/// Send a captured frame; when the queue is full the oldest frame makes room.
fn send_dropping_oldest(tx: &Sender<AudioFrame>, rx: &Receiver<AudioFrame>, frame: AudioFrame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            if let Ok(dropped) = rx.try_recv() {
                tracing::debug!(sequence = dropped.sequence, "capture queue full, dropped oldest frame");
            }
            !matches!(tx.try_send(frame), Err(TrySendError::Disconnected(_)))
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

struct Capture {
    source: Box<dyn AudioSource>,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    tx: Sender<AudioFrame>,
    overflow_rx: Receiver<AudioFrame>,
}

impl Capture {
    /// Re-chunk whatever the source delivers into fixed-size frames.
    ///
    /// Live sources drop the oldest frame when the VAD falls behind; finite
    /// sources block instead, since nothing is lost by waiting.
    fn run(mut self) {
        let finite = self.source.is_finite();
        let mut pending: Vec<i16> = Vec::with_capacity(self.frame_samples * 2);
        let mut sequence = 0u64;
        let mut consecutive_errors = 0u32;

        'capture: while self.running.load(Ordering::SeqCst) {
            let samples = match self.source.read_samples() {
                Ok(samples) => {
                    consecutive_errors = 0;
                    samples
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        tracing::error!(error = %e, attempts = consecutive_errors, "audio capture failed");
                        break;
                    }
                    thread::sleep(CAPTURE_POLL);
                    continue;
                }
            };

            if samples.is_empty() {
                if finite {
                    break;
                }
                thread::sleep(CAPTURE_POLL);
                continue;
            }

            pending.extend_from_slice(&samples);
            while pending.len() >= self.frame_samples {
                let rest = pending.split_off(self.frame_samples);
                let frame = AudioFrame::new(std::mem::replace(&mut pending, rest), Instant::now(), sequence);
                sequence += 1;
                if !self.send(frame, finite) {
                    break 'capture;
                }
            }
            if !finite {
                thread::sleep(CAPTURE_POLL);
            }
        }

        if finite && !pending.is_empty() {
            let frame = AudioFrame::new(pending, Instant::now(), sequence);
            self.send(frame, finite);
        }
        if let Err(e) = self.source.stop() {
            tracing::warn!(error = %e, "failed to stop audio capture");
        }
        tracing::debug!(frames = sequence, "capture stopped");
    }

    fn send(&self, frame: AudioFrame, finite: bool) -> bool {
        if finite {
            self.tx.send(frame).is_ok()
        } else {
            send_dropping_oldest(&self.tx, &self.overflow_rx, frame)
        }
    }
}

/// Builds and starts the duplex pipeline.
pub struct Pipeline {
    config: Config,
    settings: LiveSettings,
    session: SessionContext,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl Pipeline {
    /// Validates `config`; invalid values are fatal here and nowhere else.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let settings = LiveSettings::new(config.tunables());
        Ok(Self {
            config,
            settings,
            session: SessionContext::new(),
            error_reporter: Arc::new(LogReporter),
        })
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Start every stage with an in-memory history seeded with the configured
    /// system prompt.
    pub fn start(self, backends: Backends) -> Result<(PipelineHandle, TurnOrchestrator)> {
        let history = Conversation::with_system_prompt(&self.config.turn.system_prompt);
        self.start_with_history(backends, history)
    }

    /// Start every stage; the orchestrator is returned for the caller to run.
    pub fn start_with_history<H: History>(
        self,
        mut backends: Backends,
        history: H,
    ) -> Result<(PipelineHandle, TurnOrchestrator<H>)> {
        let config = &self.config;
        let running = Arc::new(AtomicBool::new(true));

        let (frame_tx, frame_rx) = bounded(config.channels.capture_buffer);
        let (segment_tx, segment_rx) = unbounded();
        let (transcript_tx, transcript_rx) = unbounded();
        let (speech_tx, speech_rx) = unbounded();
        let (event_tx, event_rx) = bounded(config.channels.playback_buffer);
        let (notice_tx, notice_rx) = unbounded();

        backends.source.start()?;

        let vad = VadStation::new(
            backends.classifier,
            self.session.clone(),
            self.settings.clone(),
            WindowShape {
                sample_rate: config.vad.sample_rate,
                frames_per_window: config.vad.frames_per_window,
                classifier_window: config.vad.classifier_window,
            },
        );
        let vad_runner = StationRunner::spawn(vad, frame_rx.clone(), segment_tx, self.error_reporter.clone());
        let transcriber_runner = StationRunner::spawn(
            TranscriberStation::new(backends.transcriber),
            segment_rx,
            transcript_tx,
            self.error_reporter.clone(),
        );

        let reassembler = Reassembler::new(
            backends.sink,
            backends.captions,
            self.session.clone(),
            self.settings.clone(),
            notice_tx,
        )
        .with_strict_protocol(config.playback.strict_protocol());
        let batcher = TextBatcher::new(speech_rx, self.settings.clone(), reassembler.talking_flag());
        let dispatcher = SynthesisDispatcher::new(
            backends.synthesizer,
            self.session.clone(),
            event_tx,
            config.synthesis.parallelism,
            config.synthesis.archive_dir.clone(),
        );

        let mut threads = Vec::new();
        threads.push(spawn_stage("playback", move || {
            if let Err(e) = reassembler.run(event_rx) {
                tracing::error!(error = %e, "playback stage failed");
            }
        })?);
        threads.push(spawn_stage("synthesis", move || run_synthesis(batcher, dispatcher))?);
        threads.push(spawn_stage("vad-join", move || {
            if let Err(msg) = vad_runner.join() {
                tracing::error!("{}", msg);
            }
        })?);
        threads.push(spawn_stage("transcriber-join", move || {
            if let Err(msg) = transcriber_runner.join() {
                tracing::error!("{}", msg);
            }
        })?);

        let capture = Capture {
            source: backends.source,
            frame_samples: config.vad.frame_samples,
            running: running.clone(),
            tx: frame_tx,
            overflow_rx: frame_rx,
        };
        threads.push(spawn_stage("capture", move || capture.run())?);

        let orchestrator = TurnOrchestrator::new(
            backends.model,
            history,
            self.session.clone(),
            TurnChannels {
                transcripts: transcript_rx,
                speech: speech_tx.clone(),
                notices: notice_rx,
            },
            &config.turn,
        );

        tracing::info!(
            sample_rate = config.vad.sample_rate,
            parallelism = config.synthesis.parallelism,
            "pipeline started"
        );
        let handle = PipelineHandle {
            running,
            threads,
            speech_tx,
            session: self.session,
            settings: self.settings,
        };
        Ok((handle, orchestrator))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("config", &self.config).finish_non_exhaustive()
    }
}
