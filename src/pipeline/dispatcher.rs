//! Synthesis dispatcher: a fixed pool of workers turning batches into audio.

use crate::audio::wav::write_wav;
use crate::error::{Result, VoxError};
use crate::pipeline::batcher::{BatchEvent, TextBatcher};
use crate::pipeline::types::{AudioResult, PlaybackEvent, SeqNo, TextBatch, TurnId};
use crate::session::SessionContext;
use crate::tts::synthesizer::Synthesizer;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

#[derive(Debug, Default)]
struct TurnLedger {
    in_flight: usize,
    ended: bool,
    last_seq: SeqNo,
}

/// Bookkeeping that decides when a turn can be sealed.
///
/// Events are sent while the lock is held so that a turn's `TurnSealed`
/// always follows its last `BatchDone`.
#[derive(Debug)]
struct Ledger {
    turns: Mutex<HashMap<TurnId, TurnLedger>>,
    output: Sender<PlaybackEvent>,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, HashMap<TurnId, TurnLedger>> {
        match self.turns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn closed() -> VoxError {
        VoxError::PipelineClosed {
            stage: "playback".to_string(),
        }
    }

    fn started(&self, turn: TurnId, seq: SeqNo) {
        let mut turns = self.lock();
        let entry = turns.entry(turn).or_default();
        entry.in_flight += 1;
        entry.last_seq = entry.last_seq.max(seq);
    }

    fn finished(&self, turn: TurnId, seq: SeqNo) -> Result<()> {
        let mut turns = self.lock();
        self.output
            .send(PlaybackEvent::BatchDone { turn, seq })
            .map_err(|_| Self::closed())?;

        let Some(entry) = turns.get_mut(&turn) else {
            return Ok(());
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.ended && entry.in_flight == 0 {
            let last_seq = entry.last_seq;
            turns.remove(&turn);
            self.seal(turn, last_seq)?;
        }
        Ok(())
    }

    fn ended(&self, turn: TurnId) -> Result<()> {
        let mut turns = self.lock();
        let entry = turns.entry(turn).or_default();
        entry.ended = true;
        if entry.in_flight == 0 {
            let last_seq = entry.last_seq;
            turns.remove(&turn);
            self.seal(turn, last_seq)?;
        }
        Ok(())
    }

    fn seal(&self, turn: TurnId, last_seq: SeqNo) -> Result<()> {
        tracing::debug!(turn, last_seq, "turn sealed");
        self.output
            .send(PlaybackEvent::TurnSealed { turn, last_seq })
            .map_err(|_| Self::closed())
    }
}

/// Reports a job as done however the worker leaves it.
struct BatchGuard<'a> {
    ledger: &'a Ledger,
    turn: TurnId,
    seq: SeqNo,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ledger.finished(self.turn, self.seq) {
            tracing::debug!(turn = self.turn, seq = self.seq, error = %e, "could not report batch done");
        }
    }
}

struct WorkerContext {
    synthesizer: Arc<dyn Synthesizer>,
    session: SessionContext,
    ledger: Arc<Ledger>,
    archive_dir: Option<PathBuf>,
}

impl WorkerContext {
    /// Synthesize one batch, emitting chunks until done or interrupted.
    fn synthesize(&self, batch: &TextBatch) -> Result<usize> {
        if self.session.is_interrupted() {
            tracing::debug!(turn = batch.turn, seq = batch.seq, "interrupted before synthesis");
            return Ok(0);
        }

        let sample_rate = self.synthesizer.sample_rate();
        let mut emitted = 0;
        for chunk in self.synthesizer.synthesize(&batch.text)? {
            let chunk = chunk?;
            if self.session.is_interrupted() {
                tracing::debug!(turn = batch.turn, seq = batch.seq, emitted, "interrupted mid-batch");
                break;
            }
            if let Some(dir) = &self.archive_dir {
                self.archive(dir, batch, emitted, &chunk.samples, sample_rate);
            }
            let result = AudioResult {
                turn: batch.turn,
                seq: batch.seq,
                samples: chunk.samples,
                sample_rate,
                text: chunk.text,
            };
            self.ledger
                .output
                .send(PlaybackEvent::Audio(result))
                .map_err(|_| Ledger::closed())?;
            emitted += 1;
        }
        Ok(emitted)
    }

    fn archive(&self, dir: &std::path::Path, batch: &TextBatch, index: usize, samples: &[f32], rate: u32) {
        let path = dir.join(format!("turn{:04}_seq{:04}_{:02}.wav", batch.turn, batch.seq, index));
        if let Err(e) = write_wav(&path, samples, rate) {
            tracing::warn!(path = %path.display(), error = %e, "failed to archive synthesized audio");
        }
    }
}

fn worker_loop(index: usize, jobs: Receiver<TextBatch>, ctx: Arc<WorkerContext>) {
    tracing::debug!(worker = index, "synthesis worker started");
    while let Ok(batch) = jobs.recv() {
        let _done = BatchGuard {
            ledger: &ctx.ledger,
            turn: batch.turn,
            seq: batch.seq,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.synthesize(&batch)));
        match outcome {
            Ok(Ok(chunks)) => {
                tracing::debug!(turn = batch.turn, seq = batch.seq, chunks, "batch synthesized");
            }
            Ok(Err(VoxError::PipelineClosed { stage })) => {
                tracing::debug!(worker = index, stage = %stage, "output closed, worker exiting");
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(turn = batch.turn, seq = batch.seq, error = %e, "synthesis failed, batch dropped");
            }
            Err(_) => {
                tracing::error!(turn = batch.turn, seq = batch.seq, "synthesis backend panicked, batch dropped");
            }
        }
    }
    tracing::debug!(worker = index, "synthesis worker stopped");
}

/// Runs batches on up to `parallelism` workers and tags every chunk with its
/// batch's turn and sequence number.
///
/// Chunks of different batches interleave arbitrarily; chunks of one batch
/// stay in order. Each batch ends with `BatchDone`, success or not.
pub struct SynthesisDispatcher {
    jobs: Option<Sender<TextBatch>>,
    workers: Vec<JoinHandle<()>>,
    ledger: Arc<Ledger>,
}

impl SynthesisDispatcher {
    /// Spawn the worker pool.
    ///
    /// A backend that is not reentrant is limited to one worker.
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        session: SessionContext,
        output: Sender<PlaybackEvent>,
        parallelism: usize,
        archive_dir: Option<PathBuf>,
    ) -> Self {
        let mut parallelism = parallelism.max(1);
        if parallelism > 1 && !synthesizer.is_reentrant() {
            tracing::warn!(
                backend = synthesizer.name(),
                requested = parallelism,
                "synthesis backend is not reentrant, using one worker"
            );
            parallelism = 1;
        }

        if let Some(dir) = &archive_dir
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            tracing::warn!(path = %dir.display(), error = %e, "cannot create archive directory");
        }

        let ledger = Arc::new(Ledger {
            turns: Mutex::new(HashMap::new()),
            output,
        });
        let ctx = Arc::new(WorkerContext {
            synthesizer,
            session,
            ledger: ledger.clone(),
            archive_dir,
        });

        let (jobs, job_rx) = unbounded();
        let workers = (0..parallelism)
            .filter_map(|index| {
                let job_rx = job_rx.clone();
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name(format!("duplexvox-synth-{}", index))
                    .spawn(move || worker_loop(index, job_rx, ctx))
                    .map_err(|e| tracing::error!(worker = index, error = %e, "failed to spawn synthesis worker"))
                    .ok()
            })
            .collect();

        Self {
            jobs: Some(jobs),
            workers,
            ledger,
        }
    }

    /// Number of running workers.
    pub fn parallelism(&self) -> usize {
        self.workers.len()
    }

    /// Queue a batch for synthesis.
    pub fn dispatch(&self, batch: TextBatch) -> Result<()> {
        let Some(jobs) = &self.jobs else {
            return Err(VoxError::PipelineClosed {
                stage: "synthesis".to_string(),
            });
        };
        if self.workers.is_empty() {
            return Err(VoxError::PipelineClosed {
                stage: "synthesis".to_string(),
            });
        }
        self.ledger.started(batch.turn, batch.seq);
        tracing::debug!(turn = batch.turn, seq = batch.seq, "batch dispatched");
        jobs.send(batch).map_err(|_| VoxError::PipelineClosed {
            stage: "synthesis".to_string(),
        })
    }

    /// No more batches will be dispatched for `turn`. Playback is told once
    /// the last in-flight batch of the turn is done.
    pub fn end_turn(&self, turn: TurnId) -> Result<()> {
        self.ledger.ended(turn)
    }

    /// Let queued jobs finish and wait for the workers.
    pub fn shutdown(mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("synthesis worker thread panicked");
            }
        }
    }
}

/// Feed batches from `batcher` into `dispatcher` until shutdown.
pub fn run_synthesis(mut batcher: TextBatcher, dispatcher: SynthesisDispatcher) {
    tracing::debug!(workers = dispatcher.parallelism(), "synthesis stage started");
    loop {
        let result = match batcher.next_batch() {
            BatchEvent::Batch(batch) => dispatcher.dispatch(batch),
            BatchEvent::EndTurn(turn) => dispatcher.end_turn(turn),
            BatchEvent::Shutdown => break,
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "synthesis stage stopping");
            break;
        }
    }
    dispatcher.shutdown();
    tracing::debug!("synthesis stage stopped");
}
