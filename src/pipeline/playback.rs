//! Ordered playback: reassembles out-of-order synthesis results per turn.

use crate::audio::player::AudioSink;
use crate::config::LiveSettings;
use crate::error::{Result, VoxError};
use crate::pipeline::captions::CaptionSink;
use crate::pipeline::types::{AudioResult, PlaybackEvent, PlaybackNotice, SeqNo, TurnId};
use crate::session::SessionContext;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    chunks: VecDeque<AudioResult>,
    done: bool,
}

/// Plays each turn's audio strictly in sequence order.
///
/// The cursor's batch plays chunk by chunk as it arrives and the cursor moves
/// on at its `BatchDone`. Later batches wait in their slots. `TurnSealed`
/// lets the cursor skip numbers that will never arrive, after which the turn
/// is reported complete. Once the interrupt is seen before a chunk, the rest
/// of the turn is dropped unplayed.
pub struct Reassembler {
    sink: Box<dyn AudioSink>,
    captions: Box<dyn CaptionSink>,
    session: SessionContext,
    settings: LiveSettings,
    notices: Sender<PlaybackNotice>,
    talking: Arc<AtomicBool>,
    strict: bool,
    turn: TurnId,
    completed: TurnId,
    cursor: SeqNo,
    slots: BTreeMap<SeqNo, Slot>,
    sealed: Option<SeqNo>,
    cut_off: bool,
}

impl Reassembler {
    pub fn new(
        sink: Box<dyn AudioSink>,
        captions: Box<dyn CaptionSink>,
        session: SessionContext,
        settings: LiveSettings,
        notices: Sender<PlaybackNotice>,
    ) -> Self {
        Self {
            sink,
            captions,
            session,
            settings,
            notices,
            talking: Arc::new(AtomicBool::new(false)),
            strict: cfg!(debug_assertions),
            turn: 0,
            completed: 0,
            cursor: 1,
            slots: BTreeMap::new(),
            sealed: None,
            cut_off: false,
        }
    }

    /// Panic on protocol violations instead of logging and skipping them.
    pub fn with_strict_protocol(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Raised while audio is going out.
    pub fn talking_flag(&self) -> Arc<AtomicBool> {
        self.talking.clone()
    }

    /// Next sequence number eligible to play.
    pub fn cursor(&self) -> SeqNo {
        self.cursor
    }

    pub fn current_turn(&self) -> TurnId {
        self.turn
    }

    fn violation(&self, message: String) {
        let error = VoxError::ProtocolViolation { message };
        if self.strict {
            panic!("{}", error);
        }
        tracing::error!(turn = self.turn, error = %error, "event skipped");
    }

    fn start_turn(&mut self, turn: TurnId) {
        if self.turn > self.completed {
            tracing::warn!(old = self.turn, new = turn, "turn started before the previous one completed");
        }
        tracing::debug!(turn, "playback turn started");
        self.turn = turn;
        self.cursor = 1;
        self.slots.clear();
        self.sealed = None;
        self.cut_off = false;
    }

    /// Take one event, then play everything that became playable.
    ///
    /// Only a device failure is an error.
    pub fn handle(&mut self, event: PlaybackEvent) -> Result<()> {
        let turn = event.turn();
        if turn <= self.completed || turn < self.turn {
            tracing::debug!(turn, current = self.turn, "dropping stale event");
            return Ok(());
        }
        if turn > self.turn {
            self.start_turn(turn);
        }

        match event {
            PlaybackEvent::Audio(result) => {
                let seq = result.seq;
                if seq < self.cursor || self.slots.get(&seq).is_some_and(|s| s.done) {
                    self.violation(format!("audio for seq {} after it finished", seq));
                    return Ok(());
                }
                if self.sealed.is_some_and(|last| seq > last) {
                    self.violation(format!("audio for seq {} after the turn was sealed", seq));
                    return Ok(());
                }
                self.slots.entry(seq).or_default().chunks.push_back(result);
            }
            PlaybackEvent::BatchDone { seq, .. } => {
                if seq < self.cursor || self.slots.get(&seq).is_some_and(|s| s.done) {
                    self.violation(format!("duplicate completion for seq {}", seq));
                    return Ok(());
                }
                self.slots.entry(seq).or_default().done = true;
            }
            PlaybackEvent::TurnSealed { last_seq, .. } => {
                if self.sealed.is_some() {
                    self.violation(format!("turn {} sealed twice", turn));
                    return Ok(());
                }
                self.sealed = Some(last_seq);
            }
        }

        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let Some(slot) = self.slots.get_mut(&self.cursor) else {
                match self.sealed {
                    Some(last) if self.cursor <= last => {
                        tracing::warn!(turn = self.turn, seq = self.cursor, "skipping missing batch");
                        self.cursor += 1;
                        continue;
                    }
                    Some(_) => self.complete_turn(),
                    None => {}
                }
                return Ok(());
            };

            if let Some(chunk) = slot.chunks.pop_front() {
                self.play_chunk(chunk)?;
            } else if slot.done {
                self.slots.remove(&self.cursor);
                self.cursor += 1;
            } else {
                return Ok(());
            }
        }
    }

    fn complete_turn(&mut self) {
        tracing::debug!(turn = self.turn, cut_off = self.cut_off, "playback turn complete");
        self.completed = self.turn;
        self.slots.clear();
        if self.notices.send(PlaybackNotice::TurnComplete { turn: self.turn }).is_err() {
            tracing::debug!(turn = self.turn, "orchestrator gone, completion not delivered");
        }
    }

    fn play_chunk(&mut self, chunk: AudioResult) -> Result<()> {
        if self.cut_off {
            return Ok(());
        }
        if self.session.is_interrupted() {
            tracing::info!(turn = chunk.turn, seq = chunk.seq, "barge-in, cutting off turn");
            self.cut_off = true;
            return Ok(());
        }

        let tunables = self.settings.snapshot();
        let samples = trim(&chunk.samples, chunk.sample_rate, tunables.lead_in_trim, tunables.trail_out_trim);
        let rate = (chunk.sample_rate as f32 * tunables.playback_rate).round().max(1.0) as u32;

        self.talking.store(true, Ordering::SeqCst);
        self.publish_caption(&chunk.text);
        let played = self.sink.play(samples, rate);
        self.publish_caption("");
        if let Err(e) = played {
            self.talking.store(false, Ordering::SeqCst);
            tracing::error!(sink = self.sink.name(), error = %e, "playback device failed");
            return Err(e);
        }

        tracing::debug!(turn = chunk.turn, seq = chunk.seq, samples = samples.len(), "played");
        let spoken = PlaybackNotice::Spoken {
            turn: chunk.turn,
            text: chunk.text,
        };
        if self.notices.send(spoken).is_err() {
            tracing::debug!(turn = self.turn, "orchestrator gone, spoken text not delivered");
        }
        Ok(())
    }

    fn publish_caption(&mut self, text: &str) {
        if let Err(e) = self.captions.publish(text) {
            tracing::warn!(error = %e, "caption update failed");
        }
    }

    /// Consume events until the channel closes or the device fails.
    pub fn run(mut self, events: Receiver<PlaybackEvent>) -> Result<()> {
        tracing::debug!(sink = self.sink.name(), "playback started");
        loop {
            let event = match events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => {
                    self.talking.store(false, Ordering::SeqCst);
                    match events.recv() {
                        Ok(event) => event,
                        Err(_) => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };
            self.handle(event)?;
        }
        self.talking.store(false, Ordering::SeqCst);
        tracing::debug!("playback stopped");
        Ok(())
    }
}

/// Cut `lead` from the front and `trail` from the back when the chunk is
/// long enough to lose both.
fn trim(samples: &[f32], sample_rate: u32, lead: Duration, trail: Duration) -> &[f32] {
    let to_samples = |d: Duration| (d.as_secs_f64() * sample_rate as f64) as usize;
    let (lead, trail) = (to_samples(lead), to_samples(trail));
    if samples.len() > lead + trail {
        &samples[lead..samples.len() - trail]
    } else {
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::player::CollectorAudioSink;
    use crate::config::Tunables;
    use crate::pipeline::captions::MemoryCaptionSink;
    use crossbeam_channel::unbounded;

    struct Rig {
        reassembler: Reassembler,
        sink: CollectorAudioSink,
        captions: MemoryCaptionSink,
        notices: Receiver<PlaybackNotice>,
        session: SessionContext,
    }

    fn untrimmed() -> LiveSettings {
        LiveSettings::new(Tunables {
            lead_in_trim: Duration::ZERO,
            trail_out_trim: Duration::ZERO,
            ..Tunables::default()
        })
    }

    fn rig_with(settings: LiveSettings, sink: CollectorAudioSink, captions: MemoryCaptionSink) -> Rig {
        let (tx, notices) = unbounded();
        let session = SessionContext::new();
        let reassembler = Reassembler::new(
            Box::new(sink.clone()),
            Box::new(captions.clone()),
            session.clone(),
            settings,
            tx,
        )
        .with_strict_protocol(false);
        Rig {
            reassembler,
            sink,
            captions,
            notices,
            session,
        }
    }

    fn rig() -> Rig {
        rig_with(untrimmed(), CollectorAudioSink::new(), MemoryCaptionSink::new())
    }

    // Sample value encodes the sequence number so played order is visible
    fn audio(turn: TurnId, seq: SeqNo, text: &str) -> PlaybackEvent {
        PlaybackEvent::Audio(AudioResult {
            turn,
            seq,
            samples: vec![seq as f32; 4],
            sample_rate: 24000,
            text: text.to_string(),
        })
    }

    fn done(turn: TurnId, seq: SeqNo) -> PlaybackEvent {
        PlaybackEvent::BatchDone { turn, seq }
    }

    fn sealed(turn: TurnId, last_seq: SeqNo) -> PlaybackEvent {
        PlaybackEvent::TurnSealed { turn, last_seq }
    }

    fn played_seqs(sink: &CollectorAudioSink) -> Vec<f32> {
        sink.played().iter().map(|b| b.samples[0]).collect()
    }

    fn drain_notices(rx: &Receiver<PlaybackNotice>) -> Vec<PlaybackNotice> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_plays_in_sequence_for_every_completion_order() {
        let names = ["one", "two", "three"];
        let orders: [[SeqNo; 3]; 6] = [[1, 2, 3], [1, 3, 2], [2, 1, 3], [2, 3, 1], [3, 1, 2], [3, 2, 1]];

        for order in orders {
            let mut rig = rig();
            for seq in order {
                rig.reassembler.handle(audio(1, seq, names[seq as usize - 1])).unwrap();
                rig.reassembler.handle(done(1, seq)).unwrap();
            }
            rig.reassembler.handle(sealed(1, 3)).unwrap();
            assert_eq!(played_seqs(&rig.sink), vec![1.0, 2.0, 3.0], "order {:?}", order);
            assert_eq!(
                drain_notices(&rig.notices).last(),
                Some(&PlaybackNotice::TurnComplete { turn: 1 })
            );
        }
    }

    #[test]
    fn test_interleaved_chunks_of_two_batches() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 2, "two a")).unwrap();
        rig.reassembler.handle(audio(1, 1, "one a")).unwrap();
        rig.reassembler.handle(audio(1, 2, "two b")).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(audio(1, 1, "one b")).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();

        let spoken: Vec<String> = drain_notices(&rig.notices)
            .into_iter()
            .filter_map(|n| match n {
                PlaybackNotice::Spoken { text, .. } => Some(text),
                PlaybackNotice::TurnComplete { .. } => None,
            })
            .collect();
        assert_eq!(spoken, vec!["one a", "one b", "two a", "two b"]);
    }

    #[test]
    fn test_later_batch_waits_for_cursor() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 2, "two")).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        assert!(rig.sink.played().is_empty());
        assert_eq!(rig.reassembler.cursor(), 1);

        rig.reassembler.handle(audio(1, 1, "one")).unwrap();
        assert_eq!(played_seqs(&rig.sink), vec![1.0]);
        rig.reassembler.handle(done(1, 1)).unwrap();
        assert_eq!(played_seqs(&rig.sink), vec![1.0, 2.0]);
        assert_eq!(rig.reassembler.cursor(), 3);
    }

    #[test]
    fn test_failed_batch_is_skipped() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 2, "two")).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();
        rig.reassembler.handle(sealed(1, 2)).unwrap();

        assert_eq!(played_seqs(&rig.sink), vec![2.0]);
        assert_eq!(
            drain_notices(&rig.notices),
            vec![
                PlaybackNotice::Spoken {
                    turn: 1,
                    text: "two".to_string()
                },
                PlaybackNotice::TurnComplete { turn: 1 }
            ]
        );
    }

    #[test]
    fn test_seal_skips_numbers_that_never_arrive() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 2, "two")).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(sealed(1, 2)).unwrap();
        assert_eq!(played_seqs(&rig.sink), vec![2.0]);
        assert_eq!(rig.reassembler.cursor(), 3);
    }

    #[test]
    fn test_empty_turn_completes_on_seal() {
        let mut rig = rig();
        rig.reassembler.handle(sealed(4, 0)).unwrap();
        assert_eq!(drain_notices(&rig.notices), vec![PlaybackNotice::TurnComplete { turn: 4 }]);
    }

    #[test]
    fn test_interrupt_cuts_off_rest_of_turn() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 1, "Hi there.")).unwrap();
        rig.session.signal_interrupt();
        rig.reassembler.handle(audio(1, 1, "More.")).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();
        rig.session.clear_interrupt();
        rig.reassembler.handle(audio(1, 2, "How are you?")).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(sealed(1, 2)).unwrap();

        assert_eq!(rig.sink.played().len(), 1);
        assert_eq!(
            drain_notices(&rig.notices),
            vec![
                PlaybackNotice::Spoken {
                    turn: 1,
                    text: "Hi there.".to_string()
                },
                PlaybackNotice::TurnComplete { turn: 1 }
            ]
        );
    }

    #[test]
    fn test_new_turn_resets_cursor_and_drops_stale_audio() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 1, "old")).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();
        rig.reassembler.handle(sealed(1, 1)).unwrap();
        assert_eq!(rig.reassembler.cursor(), 2);

        rig.reassembler.handle(audio(1, 1, "late")).unwrap();
        rig.reassembler.handle(audio(2, 1, "new")).unwrap();
        assert_eq!(rig.reassembler.current_turn(), 2);
        assert_eq!(played_seqs(&rig.sink), vec![1.0, 1.0]);
        assert_eq!(rig.sink.played().len(), 2);
    }

    #[test]
    fn test_duplicate_done_is_skipped_when_lenient() {
        let mut rig = rig();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(done(1, 2)).unwrap();
        rig.reassembler.handle(audio(1, 2, "late")).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();
        assert!(rig.sink.played().is_empty());
        assert_eq!(rig.reassembler.cursor(), 3);
    }

    #[test]
    #[should_panic(expected = "Protocol violation")]
    fn test_duplicate_done_panics_when_strict() {
        let mut rig = rig();
        rig.reassembler.strict = true;
        rig.reassembler.handle(done(1, 1)).unwrap();
        rig.reassembler.handle(done(1, 1)).unwrap();
    }

    #[test]
    fn test_trim_and_playback_rate() {
        let settings = LiveSettings::new(Tunables {
            lead_in_trim: Duration::from_millis(1),
            trail_out_trim: Duration::from_millis(2),
            playback_rate: 1.5,
            ..Tunables::default()
        });
        let mut rig = rig_with(settings, CollectorAudioSink::new(), MemoryCaptionSink::new());

        rig.reassembler
            .handle(PlaybackEvent::Audio(AudioResult {
                turn: 1,
                seq: 1,
                samples: (0..100).map(|i| i as f32).collect(),
                sample_rate: 10_000,
                text: "long".to_string(),
            }))
            .unwrap();
        rig.reassembler.handle(audio(1, 1, "short")).unwrap();

        let played = rig.sink.played();
        assert_eq!(played[0].samples.len(), 70);
        assert_eq!(played[0].samples[0], 10.0);
        assert_eq!(played[0].sample_rate, 15_000);
        // Too short to lose 3ms at 24kHz
        assert_eq!(played[1].samples.len(), 4);
    }

    #[test]
    fn test_caption_set_and_cleared() {
        let mut rig = rig();
        rig.reassembler.handle(audio(1, 1, "Hi there.")).unwrap();
        assert_eq!(rig.captions.published(), vec!["Hi there.".to_string(), String::new()]);
    }

    #[test]
    fn test_caption_failure_does_not_stop_playback() {
        let captions = MemoryCaptionSink::new().with_failure();
        let mut rig = rig_with(untrimmed(), CollectorAudioSink::new(), captions);
        rig.reassembler.handle(audio(1, 1, "still spoken")).unwrap();
        assert_eq!(rig.sink.played().len(), 1);
    }

    #[test]
    fn test_device_failure_ends_run() {
        let sink = CollectorAudioSink::new().with_failure_after(0);
        let rig = rig_with(untrimmed(), sink, MemoryCaptionSink::new());
        let (tx, rx) = unbounded();
        tx.send(audio(1, 1, "x")).unwrap();

        let err = rig.reassembler.run(rx).unwrap_err();
        assert!(matches!(err, VoxError::Device { .. }));
    }

    #[test]
    fn test_talking_flag_follows_queue() {
        let sink = CollectorAudioSink::new().with_play_delay(Duration::from_millis(100));
        let rig = rig_with(untrimmed(), sink, MemoryCaptionSink::new());
        let talking = rig.reassembler.talking_flag();
        let (tx, rx) = unbounded();
        let player = std::thread::spawn(move || rig.reassembler.run(rx));

        tx.send(audio(1, 1, "x")).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(talking.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(150));
        assert!(!talking.load(Ordering::SeqCst));
        drop(tx);
        player.join().unwrap().unwrap();
        assert!(!talking.load(Ordering::SeqCst));
    }
}
