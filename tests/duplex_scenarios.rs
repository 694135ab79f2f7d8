use crossbeam_channel::{Sender, bounded, unbounded};
use duplexvox::audio::player::{AudioSink, CollectorAudioSink};
use duplexvox::audio::vad::EnergyClassifier;
use duplexvox::config::{LiveSettings, TurnConfig, Tunables};
use duplexvox::conversation::{Conversation, History, Message, Role};
use duplexvox::llm::model::ScriptedModel;
use duplexvox::pipeline::captions::MemoryCaptionSink;
use duplexvox::pipeline::dispatcher::{SynthesisDispatcher, run_synthesis};
use duplexvox::pipeline::error::LogReporter;
use duplexvox::pipeline::playback::Reassembler;
use duplexvox::pipeline::station::StationRunner;
use duplexvox::pipeline::turn::{TurnChannels, TurnOrchestrator};
use duplexvox::pipeline::types::{AudioFrame, Transcript, UtteranceSegment};
use duplexvox::pipeline::vad_station::{VadStation, WindowShape};
use duplexvox::pipeline::batcher::TextBatcher;
use duplexvox::session::SessionContext;
use duplexvox::tts::synthesizer::MockSynthesizer;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RATE: usize = 16_000;
const FRAME: usize = 1024;
const WINDOW: usize = 2048;
const LOUD: i16 = 8000;

fn run_vad(settings: LiveSettings, session: SessionContext, signal: &[i16]) -> Vec<UtteranceSegment> {
    let vad = VadStation::new(
        Box::new(EnergyClassifier::default()),
        session,
        settings,
        WindowShape {
            sample_rate: RATE as u32,
            frames_per_window: WINDOW / FRAME,
            classifier_window: 512,
        },
    );
    let (frame_tx, frame_rx) = unbounded();
    let (segment_tx, segment_rx) = unbounded();
    let runner = StationRunner::spawn(vad, frame_rx, segment_tx, Arc::new(LogReporter));

    for (sequence, chunk) in signal.chunks(FRAME).enumerate() {
        frame_tx
            .send(AudioFrame::new(chunk.to_vec(), Instant::now(), sequence as u64))
            .unwrap();
    }
    drop(frame_tx);
    runner.join().unwrap();
    segment_rx.try_iter().collect()
}

#[test]
fn vad_emits_one_segment_for_one_second_of_speech() {
    let hysteresis = Tunables::default().silence_hysteresis_count as usize;
    let mut signal = vec![0i16; 3 * RATE];
    signal.extend(std::iter::repeat_n(LOUD, RATE));
    signal.extend(std::iter::repeat_n(0i16, (hysteresis + 1) * WINDOW));

    let session = SessionContext::new();
    let segments = run_vad(LiveSettings::default(), session.clone(), &signal);

    assert_eq!(segments.len(), 1);
    let segment = &segments[0];
    assert!(!segment.split);
    let speech = segment.samples.iter().filter(|&&s| s == LOUD).count();
    assert_eq!(speech, RATE);
    // Only the windows the speech touched, never the leading silence
    assert!(segment.samples.len() <= RATE + 2 * WINDOW);
    assert!(!session.is_interrupted());
}

#[test]
fn vad_splits_long_utterance_without_losing_samples() {
    let settings = LiveSettings::new(Tunables {
        max_utterance_duration: Duration::from_millis(700),
        ..Tunables::default()
    });
    let speech: Vec<i16> = (0..24 * WINDOW).map(|i| 3000 + (i % 2000) as i16).collect();
    let mut signal = speech.clone();
    signal.extend(std::iter::repeat_n(0i16, 4 * WINDOW));

    let segments = run_vad(settings, SessionContext::new(), &signal);

    // 700 ms rounds up to six windows per piece
    assert_eq!(segments.len(), 4);
    assert!(segments.iter().all(|s| s.split && s.samples.len() == 6 * WINDOW));
    let rebuilt: Vec<i16> = segments.iter().flat_map(|s| s.samples.iter().copied()).collect();
    assert_eq!(rebuilt, speech);
}

#[test]
fn vad_hysteresis_needs_the_full_count() {
    let hysteresis = Tunables::default().silence_hysteresis_count as usize;
    let mut signal = vec![LOUD; WINDOW];
    signal.extend(std::iter::repeat_n(0i16, (hysteresis - 1) * WINDOW));
    signal.extend(std::iter::repeat_n(LOUD, WINDOW));

    // Closed only by the end-of-stream flush, as one segment
    let session = SessionContext::new();
    let segments = run_vad(LiveSettings::default(), session, &signal);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].samples.len(), 2 * WINDOW);
}

struct SpeakingRig {
    orchestrator: TurnOrchestrator,
    transcripts: Option<Sender<Transcript>>,
    stages: Vec<JoinHandle<()>>,
}

impl SpeakingRig {
    fn new(
        model: ScriptedModel,
        synthesizer: MockSynthesizer,
        sink: Box<dyn AudioSink>,
        captions: MemoryCaptionSink,
        session: SessionContext,
    ) -> Self {
        let settings = LiveSettings::new(Tunables {
            batch_delay_floor: Duration::from_millis(10),
            lead_in_trim: Duration::ZERO,
            trail_out_trim: Duration::ZERO,
            ..Tunables::default()
        });
        let (transcript_tx, transcripts) = unbounded();
        let (speech_tx, speech_rx) = unbounded();
        let (event_tx, event_rx) = bounded(8);
        let (notice_tx, notices) = unbounded();

        let reassembler = Reassembler::new(
            sink,
            Box::new(captions),
            session.clone(),
            settings.clone(),
            notice_tx,
        )
        .with_strict_protocol(true);
        let batcher = TextBatcher::new(speech_rx, settings, reassembler.talking_flag());
        let dispatcher = SynthesisDispatcher::new(Arc::new(synthesizer), session.clone(), event_tx, 2, None);

        let stages = vec![
            thread::spawn(move || run_synthesis(batcher, dispatcher)),
            thread::spawn(move || reassembler.run(event_rx).unwrap()),
        ];
        let orchestrator = TurnOrchestrator::new(
            Arc::new(model),
            Conversation::new(),
            session,
            TurnChannels {
                transcripts,
                speech: speech_tx,
                notices,
            },
            &TurnConfig {
                debounce_per_char_ms: 0.0,
                ..TurnConfig::default()
            },
        );
        Self {
            orchestrator,
            transcripts: Some(transcript_tx),
            stages,
        }
    }

    async fn shutdown(mut self) -> Conversation {
        drop(self.transcripts.take());
        self.orchestrator.run().await.unwrap();
        for stage in self.stages.drain(..) {
            stage.join().unwrap();
        }
        self.orchestrator.into_history()
    }
}

#[tokio::test]
async fn sequence_one_plays_first_even_when_two_finishes_first() {
    let captions = MemoryCaptionSink::new();
    let synthesizer = MockSynthesizer::new().with_delay_for("Hi there", Duration::from_millis(300));
    let model = ScriptedModel::from_text("Hi there. How are you?").with_token_delay(Duration::from_millis(30));
    let sink = CollectorAudioSink::new();
    let mut rig = SpeakingRig::new(
        model,
        synthesizer.clone(),
        Box::new(sink.clone()),
        captions.clone(),
        SessionContext::new(),
    );

    let outcome = rig.orchestrator.run_turn("hello").await.unwrap();
    assert!(!outcome.aborted);
    assert_eq!(outcome.spoken, vec!["Hi there.", "How are you?"]);
    assert_eq!(synthesizer.calls(), vec!["Hi there.", "How are you?"]);

    let history = rig.shutdown().await;
    assert_eq!(sink.played().len(), 2);
    assert_eq!(
        captions.published(),
        vec!["Hi there.", "", "How are you?", ""]
    );
    assert_eq!(
        history.history(),
        vec![
            Message::new(Role::User, "hello"),
            Message::new(Role::Assistant, "Hi there. How are you?"),
        ]
    );
}

// Signals barge-in as soon as the first buffer starts playing
struct BargeInSink {
    inner: CollectorAudioSink,
    session: SessionContext,
}

impl AudioSink for BargeInSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> duplexvox::Result<()> {
        self.session.signal_interrupt();
        self.inner.play(samples, sample_rate)
    }
}

#[tokio::test]
async fn barge_in_during_first_sentence_keeps_only_that_sentence() {
    let session = SessionContext::new();
    let synthesizer = MockSynthesizer::new();
    let model = ScriptedModel::from_text("Hi there. How are you?").with_token_delay(Duration::from_millis(50));
    let played = CollectorAudioSink::new().with_play_delay(Duration::from_millis(100));
    let sink = BargeInSink {
        inner: played.clone(),
        session: session.clone(),
    };
    let mut rig = SpeakingRig::new(
        model,
        synthesizer.clone(),
        Box::new(sink),
        MemoryCaptionSink::new(),
        session,
    );

    let outcome = rig.orchestrator.run_turn("hello").await.unwrap();
    assert!(outcome.aborted);
    assert_eq!(outcome.sentences.len(), 1);
    assert_eq!(outcome.spoken, vec!["Hi there."]);
    assert_eq!(synthesizer.calls(), vec!["Hi there."]);

    let history = rig.shutdown().await;
    assert_eq!(played.played().len(), 1);
    assert_eq!(
        history.history(),
        vec![
            Message::new(Role::User, "hello"),
            Message::new(Role::Assistant, "Hi there."),
        ]
    );
}

#[tokio::test]
async fn failed_synthesis_leaves_a_gap_not_a_stall() {
    let synthesizer = MockSynthesizer::new().with_failure_for("Hi there");
    let model = ScriptedModel::from_text("Hi there. How are you?").with_token_delay(Duration::from_millis(30));
    let sink = CollectorAudioSink::new();
    let mut rig = SpeakingRig::new(
        model,
        synthesizer,
        Box::new(sink.clone()),
        MemoryCaptionSink::new(),
        SessionContext::new(),
    );

    let outcome = rig.orchestrator.run_turn("hello").await.unwrap();
    assert_eq!(outcome.sentences.len(), 2);
    assert_eq!(outcome.spoken, vec!["How are you?"]);

    let second = rig.orchestrator.run_turn("and now").await.unwrap();
    assert_eq!(second.id, 2);
    rig.shutdown().await;
    assert_eq!(sink.played().len(), 2);
}
