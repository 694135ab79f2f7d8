//! Turn orchestrator: transcripts in, spoken sentences out.
//!
//! One [`Turn`] drives a single model call. Sentences are numbered, sent to
//! the batcher and handed back to the caller; once the turn ends the
//! orchestrator waits for playback to finish it and records what was
//! actually heard.

use crate::config::TurnConfig;
use crate::conversation::{Conversation, History, Role};
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::llm::model::{LanguageModel, TokenStream};
use crate::pipeline::sentence::SentenceSplitter;
use crate::pipeline::types::{PlaybackNotice, SeqNo, SpeechRequest, Transcript, TurnId};
use crate::session::SessionContext;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A sentence of the current turn, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub seq: SeqNo,
    pub text: String,
}

/// Summary of a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub id: TurnId,
    /// Every sentence handed to synthesis.
    pub sentences: Vec<Sentence>,
    /// Sentences playback confirmed, in order.
    pub spoken: Vec<String>,
    pub aborted: bool,
}

/// Channel ends the orchestrator talks through.
pub struct TurnChannels {
    pub transcripts: Receiver<Transcript>,
    pub speech: Sender<SpeechRequest>,
    pub notices: Receiver<PlaybackNotice>,
}

#[derive(Debug, Clone, Copy)]
struct OpenTurn {
    id: TurnId,
    ended: bool,
}

/// Owns the chat history and the model connection for the session.
pub struct TurnOrchestrator<H: History = Conversation> {
    model: Arc<dyn LanguageModel>,
    history: H,
    session: SessionContext,
    channels: TurnChannels,
    debounce_per_char_ms: f64,
    debounce_cap: Duration,
    poll_interval: Duration,
    last_turn: TurnId,
    open_turn: Option<OpenTurn>,
}

impl<H: History> TurnOrchestrator<H> {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        history: H,
        session: SessionContext,
        channels: TurnChannels,
        config: &TurnConfig,
    ) -> Self {
        Self {
            model,
            history,
            session,
            channels,
            debounce_per_char_ms: config.debounce_per_char_ms.max(0.0),
            debounce_cap: Duration::from_millis(config.debounce_cap_ms),
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            last_turn: 0,
            open_turn: None,
        }
    }

    /// How often channel state is re-checked while waiting.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn into_history(self) -> H {
        self.history
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Id of the most recent turn, 0 before the first one.
    pub fn last_turn(&self) -> TurnId {
        self.last_turn
    }

    fn should_abort(&self) -> bool {
        self.session.is_interrupted() || !self.channels.transcripts.is_empty()
    }

    fn debounce_for(&self, transcript: &str) -> Duration {
        let ms = transcript.chars().count() as f64 * self.debounce_per_char_ms;
        Duration::from_secs_f64(ms / 1000.0).min(self.debounce_cap)
    }

    fn send(&self, request: SpeechRequest) -> Result<()> {
        self.channels
            .speech
            .send(request)
            .map_err(|_| VoxError::PipelineClosed {
                stage: "synthesis".to_string(),
            })
    }

    /// Start a turn answering `transcript`.
    ///
    /// The transcript is recorded as a user message even if the turn ends up
    /// aborted, so it joins the next prompt. A previous turn that was dropped
    /// before completing is finished first.
    pub async fn begin_turn(&mut self, transcript: &str) -> Result<Turn<'_, H>> {
        if let Some(open) = self.open_turn.take() {
            tracing::debug!(turn = open.id, "finishing abandoned turn");
            if !open.ended {
                self.send(SpeechRequest::EndTurn { turn: open.id })?;
            }
            let spoken = self.await_completion(open.id).await?;
            self.history.append(Role::Assistant, &spoken.join(" "));
        }

        self.history.append(Role::User, transcript);
        self.last_turn += 1;
        let id = self.last_turn;
        self.open_turn = Some(OpenTurn { id, ended: false });
        let debounce = self.debounce_for(transcript);

        tracing::debug!(turn = id, chars = transcript.len(), "turn started");
        Ok(Turn {
            orchestrator: self,
            id,
            debounce,
            state: TurnState::Pending,
            stream: None,
            splitter: SentenceSplitter::new(),
            ready: VecDeque::new(),
            next_seq: 1,
            sentences: Vec::new(),
            spoken: Vec::new(),
            aborted: false,
        })
    }

    /// Collect `Spoken` notices for `turn` until playback reports it complete.
    async fn await_completion(&mut self, turn: TurnId) -> Result<Vec<String>> {
        let mut spoken = Vec::new();
        loop {
            match self.channels.notices.try_recv() {
                Ok(PlaybackNotice::Spoken { turn: t, text }) if t == turn => spoken.push(text),
                Ok(PlaybackNotice::TurnComplete { turn: t }) if t == turn => break,
                Ok(stale) => {
                    tracing::debug!(turn, ?stale, "ignoring notice for another turn");
                }
                Err(TryRecvError::Empty) => tokio::time::sleep(self.poll_interval).await,
                Err(TryRecvError::Disconnected) => {
                    return Err(VoxError::PipelineClosed {
                        stage: "playback".to_string(),
                    });
                }
            }
        }
        if let Some(open) = self.open_turn
            && open.id == turn
        {
            self.open_turn = None;
        }
        Ok(spoken)
    }

    /// Run one turn to completion.
    pub async fn run_turn(&mut self, transcript: &str) -> Result<TurnOutcome> {
        let mut turn = self.begin_turn(transcript).await?;
        while turn.next_sentence().await?.is_some() {}
        Ok(turn.into_outcome())
    }

    /// Wait for the next transcript; `None` once the transcription stage is gone.
    pub async fn next_transcript(&mut self) -> Option<Transcript> {
        loop {
            match self.channels.transcripts.try_recv() {
                Ok(transcript) => return Some(transcript),
                Err(TryRecvError::Empty) => tokio::time::sleep(self.poll_interval).await,
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Answer transcripts until the transcription stage shuts down, then stop
    /// the synthesis stage.
    pub async fn run(&mut self) -> Result<()> {
        while let Some(transcript) = self.next_transcript().await {
            let outcome = self.run_turn(&transcript.text).await?;
            tracing::info!(
                turn = outcome.id,
                sentences = outcome.sentences.len(),
                spoken = outcome.spoken.len(),
                aborted = outcome.aborted,
                "turn finished"
            );
        }
        // Synthesis may already be down
        let _unused = self.channels.speech.send(SpeechRequest::Shutdown);
        Ok(())
    }
}

enum TurnState {
    Pending,
    Generating,
    Finishing,
    Done,
}

/// One chat turn in progress.
///
/// Dropping a turn before [`Turn::next_sentence`] returned `None` leaves it
/// open; the next `begin_turn` finishes it.
pub struct Turn<'a, H: History> {
    orchestrator: &'a mut TurnOrchestrator<H>,
    id: TurnId,
    debounce: Duration,
    state: TurnState,
    stream: Option<TokenStream>,
    splitter: SentenceSplitter,
    ready: VecDeque<String>,
    next_seq: SeqNo,
    sentences: Vec<Sentence>,
    spoken: Vec<String>,
    aborted: bool,
}

impl<H: History> Turn<'_, H> {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// What playback confirmed; complete once the turn is done.
    pub fn spoken(&self) -> &[String] {
        &self.spoken
    }

    pub fn into_outcome(self) -> TurnOutcome {
        TurnOutcome {
            id: self.id,
            sentences: self.sentences,
            spoken: self.spoken,
            aborted: self.aborted,
        }
    }

    fn abort(&mut self, reason: &'static str) {
        tracing::info!(turn = self.id, reason, "turn aborted");
        self.aborted = true;
        self.stream = None;
        self.splitter.discard();
        self.ready.clear();
        self.state = TurnState::Finishing;
    }

    fn end_of_stream(&mut self) {
        self.stream = None;
        if let Some(rest) = self.splitter.finish() {
            self.ready.push_back(rest);
        }
    }

    fn dispatch(&mut self, text: String) -> Result<Sentence> {
        self.orchestrator.send(SpeechRequest::Text {
            turn: self.id,
            text: text.clone(),
        })?;
        let sentence = Sentence {
            seq: self.next_seq,
            text,
        };
        self.next_seq += 1;
        tracing::debug!(turn = self.id, seq = sentence.seq, "sentence: {}", sentence.text);
        self.sentences.push(sentence.clone());
        Ok(sentence)
    }

    /// Produce the next sentence, or `None` once the turn is over and its
    /// spoken text is in the history.
    pub async fn next_sentence(&mut self) -> Result<Option<Sentence>> {
        loop {
            match self.state {
                TurnState::Pending => {
                    if self.orchestrator.should_abort() {
                        self.abort("input pending before start");
                        continue;
                    }
                    if !self.debounce.is_zero() {
                        tokio::time::sleep(self.debounce).await;
                        if self.orchestrator.should_abort() {
                            self.abort("input pending after debounce");
                            continue;
                        }
                    }
                    let history = self.orchestrator.history.history();
                    match self.orchestrator.model.stream(history).await {
                        Ok(stream) => {
                            self.stream = Some(stream);
                            self.state = TurnState::Generating;
                        }
                        Err(e) => {
                            tracing::warn!(turn = self.id, error = %e, "model call failed");
                            self.state = TurnState::Finishing;
                        }
                    }
                }
                TurnState::Generating => {
                    if self.orchestrator.should_abort() {
                        self.abort("barge-in");
                        continue;
                    }
                    if let Some(text) = self.ready.pop_front() {
                        return self.dispatch(text).map(Some);
                    }
                    let Some(stream) = self.stream.as_mut() else {
                        self.state = TurnState::Finishing;
                        continue;
                    };

                    let poll = self.orchestrator.poll_interval;
                    let next = tokio::select! {
                        token = stream.next() => Some(token),
                        _ = tokio::time::sleep(poll) => None,
                    };
                    match next {
                        None => {}
                        Some(Some(Ok(token))) => {
                            let completed = self.splitter.push(&token);
                            self.ready.extend(completed);
                        }
                        Some(Some(Err(e))) => {
                            tracing::warn!(turn = self.id, error = %e, "model stream failed");
                            self.end_of_stream();
                        }
                        Some(None) => self.end_of_stream(),
                    }
                }
                TurnState::Finishing => {
                    self.orchestrator.send(SpeechRequest::EndTurn { turn: self.id })?;
                    if let Some(open) = self.orchestrator.open_turn.as_mut() {
                        open.ended = true;
                    }
                    self.spoken = self.orchestrator.await_completion(self.id).await?;
                    self.orchestrator
                        .history
                        .append(Role::Assistant, &self.spoken.join(" "));
                    tracing::debug!(turn = self.id, spoken = self.spoken.len(), "turn complete");
                    self.state = TurnState::Done;
                }
                TurnState::Done => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use crate::llm::model::ScriptedModel;
    use crossbeam_channel::unbounded;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;
    use tokio::sync::Notify;

    struct Harness {
        orchestrator: TurnOrchestrator,
        transcript_tx: Sender<Transcript>,
        playback: JoinHandle<Vec<SpeechRequest>>,
    }

    fn turn_config() -> TurnConfig {
        TurnConfig {
            debounce_per_char_ms: 0.0,
            ..TurnConfig::default()
        }
    }

    // Speaks every sentence as soon as it arrives
    fn echo_playback(rx: Receiver<SpeechRequest>, tx: Sender<PlaybackNotice>) -> JoinHandle<Vec<SpeechRequest>> {
        thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(request) = rx.recv() {
                match &request {
                    SpeechRequest::Text { turn, text } => {
                        let _ = tx.send(PlaybackNotice::Spoken {
                            turn: *turn,
                            text: text.clone(),
                        });
                    }
                    SpeechRequest::EndTurn { turn } => {
                        let _ = tx.send(PlaybackNotice::TurnComplete { turn: *turn });
                    }
                    SpeechRequest::Shutdown => {}
                }
                seen.push(request);
            }
            seen
        })
    }

    fn harness(model: ScriptedModel, session: SessionContext, config: TurnConfig) -> Harness {
        let (transcript_tx, transcripts) = unbounded();
        let (speech, speech_rx) = unbounded();
        let (notice_tx, notices) = unbounded();
        let playback = echo_playback(speech_rx, notice_tx);
        let orchestrator = TurnOrchestrator::new(
            Arc::new(model),
            Conversation::new(),
            session,
            TurnChannels {
                transcripts,
                speech,
                notices,
            },
            &config,
        )
        .with_poll_interval(Duration::from_millis(2));
        Harness {
            orchestrator,
            transcript_tx,
            playback,
        }
    }

    fn finish(harness: Harness) -> (Conversation, Vec<SpeechRequest>) {
        let Harness {
            orchestrator,
            transcript_tx,
            playback,
        } = harness;
        drop(transcript_tx);
        let history = orchestrator.into_history();
        (history, playback.join().unwrap())
    }

    fn text(turn: TurnId, text: &str) -> SpeechRequest {
        SpeechRequest::Text {
            turn,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sentences_numbered_and_dispatched() {
        let model = ScriptedModel::from_text("Hi there. How are you?");
        let mut h = harness(model, SessionContext::new(), turn_config());

        let outcome = h.orchestrator.run_turn("hello").await.unwrap();
        assert_eq!(outcome.id, 1);
        assert!(!outcome.aborted);
        assert_eq!(
            outcome.sentences,
            vec![
                Sentence {
                    seq: 1,
                    text: "Hi there.".to_string()
                },
                Sentence {
                    seq: 2,
                    text: "How are you?".to_string()
                },
            ]
        );
        assert_eq!(outcome.spoken, vec!["Hi there.", "How are you?"]);

        let (history, requests) = finish(h);
        assert_eq!(
            history.history(),
            vec![
                Message::new(Role::User, "hello"),
                Message::new(Role::Assistant, "Hi there. How are you?"),
            ]
        );
        assert_eq!(
            requests,
            vec![
                text(1, "Hi there."),
                text(1, "How are you?"),
                SpeechRequest::EndTurn { turn: 1 }
            ]
        );
    }

    #[tokio::test]
    async fn test_pending_transcript_aborts_before_model_call() {
        let model = ScriptedModel::from_text("Never said.");
        let mut h = harness(model.clone(), SessionContext::new(), turn_config());
        h.transcript_tx.send(Transcript::new("and also")).unwrap();

        let outcome = h.orchestrator.run_turn("tell me").await.unwrap();
        assert!(outcome.aborted);
        assert!(outcome.sentences.is_empty());
        assert!(model.requests().is_empty());

        // The aborted user text joins the next prompt
        let next = h.orchestrator.next_transcript().await.unwrap();
        h.orchestrator.run_turn(&next.text).await.unwrap();
        let prompt = &model.requests()[0];
        assert_eq!(prompt, &vec![Message::new(Role::User, "tell me and also")]);

        let (_, requests) = finish(h);
        assert_eq!(requests[0], SpeechRequest::EndTurn { turn: 1 });
    }

    #[tokio::test]
    async fn test_interrupt_before_start_aborts() {
        let session = SessionContext::new();
        session.signal_interrupt();
        let model = ScriptedModel::from_text("Never said.");
        let mut h = harness(model.clone(), session, turn_config());

        let outcome = h.orchestrator.run_turn("hi").await.unwrap();
        assert!(outcome.aborted);
        assert!(model.requests().is_empty());
        assert!(outcome.spoken.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_mid_stream_keeps_spoken_prefix() {
        let session = SessionContext::new();
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::from_text("Hi there. How are you?").with_gate(3, gate);
        let mut h = harness(model, session.clone(), turn_config());

        let mut turn = h.orchestrator.begin_turn("hello").await.unwrap();
        let first = turn.next_sentence().await.unwrap().unwrap();
        assert_eq!(first.text, "Hi there.");

        let barge_in = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            barge_in.signal_interrupt();
        });
        assert!(turn.next_sentence().await.unwrap().is_none());
        assert!(turn.was_aborted());
        assert_eq!(turn.spoken(), ["Hi there."]);
        drop(turn);

        let (history, requests) = finish(h);
        assert_eq!(history.messages()[1], Message::new(Role::Assistant, "Hi there."));
        assert_eq!(requests, vec![text(1, "Hi there."), SpeechRequest::EndTurn { turn: 1 }]);
    }

    #[tokio::test]
    async fn test_stream_failure_flushes_partial_sentence() {
        let model = ScriptedModel::new(["Hi there. ", "How are"]).with_failure_after(2);
        let mut h = harness(model, SessionContext::new(), turn_config());

        let outcome = h.orchestrator.run_turn("hello").await.unwrap();
        assert!(!outcome.aborted);
        assert_eq!(outcome.spoken, vec!["Hi there.", "How are"]);
    }

    #[tokio::test]
    async fn test_model_open_failure_ends_turn_quietly() {
        let model = ScriptedModel::from_text("unused").with_open_failure();
        let mut h = harness(model, SessionContext::new(), turn_config());

        let outcome = h.orchestrator.run_turn("hello").await.unwrap();
        assert!(!outcome.aborted);
        assert!(outcome.sentences.is_empty());

        let (history, _) = finish(h);
        assert_eq!(history.history(), vec![Message::new(Role::User, "hello")]);
    }

    #[tokio::test]
    async fn test_dropped_turn_is_finished_by_next_turn() {
        let model = ScriptedModel::from_text("Hi there. How are you?");
        let mut h = harness(model, SessionContext::new(), turn_config());

        let mut turn = h.orchestrator.begin_turn("hello").await.unwrap();
        turn.next_sentence().await.unwrap().unwrap();
        drop(turn);

        let second = h.orchestrator.begin_turn("again").await.unwrap();
        assert_eq!(second.id(), 2);
        drop(second);

        let (history, requests) = finish(h);
        assert_eq!(
            history.history(),
            vec![
                Message::new(Role::User, "hello"),
                Message::new(Role::Assistant, "Hi there."),
                Message::new(Role::User, "again"),
            ]
        );
        assert_eq!(requests, vec![text(1, "Hi there."), SpeechRequest::EndTurn { turn: 1 }]);
    }

    #[tokio::test]
    async fn test_playback_gone_is_pipeline_closed() {
        let (_transcript_tx, transcripts) = unbounded();
        let (speech, _speech_rx) = unbounded();
        let (notice_tx, notices) = unbounded::<PlaybackNotice>();
        drop(notice_tx);
        let mut orchestrator = TurnOrchestrator::new(
            Arc::new(ScriptedModel::from_text("Hi.")),
            Conversation::new(),
            SessionContext::new(),
            TurnChannels {
                transcripts,
                speech,
                notices,
            },
            &turn_config(),
        );

        let err = orchestrator.run_turn("hello").await.unwrap_err();
        assert!(matches!(err, VoxError::PipelineClosed { stage } if stage == "playback"));
    }

    #[tokio::test]
    async fn test_debounce_is_capped() {
        let config = TurnConfig {
            debounce_per_char_ms: 10.0,
            debounce_cap_ms: 40,
            ..TurnConfig::default()
        };
        let mut h = harness(ScriptedModel::from_text("Ok."), SessionContext::new(), config);

        let start = Instant::now();
        h.orchestrator.run_turn(&"x".repeat(200)).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_run_stops_when_transcripts_close() {
        let model = ScriptedModel::from_text("Sure.");
        let mut h = harness(model, SessionContext::new(), turn_config());
        h.transcript_tx.send(Transcript::new("one")).unwrap();
        let transcript_tx = std::mem::replace(&mut h.transcript_tx, unbounded().0);
        drop(transcript_tx);

        h.orchestrator.run().await.unwrap();
        assert_eq!(h.orchestrator.last_turn(), 1);

        let (_, requests) = finish(h);
        assert_eq!(requests.last(), Some(&SpeechRequest::Shutdown));
    }
}
