//! Stations: single-threaded pipeline stages joined by channels.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One stage of the duplex pipeline.
///
/// A station sees its inputs one at a time on its own thread. It may keep
/// state between inputs (the VAD keeps the open utterance) and hand it over
/// in [`Station::flush`] when the upstream stage goes away.
pub trait Station: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Handle one input; `Ok(None)` means nothing goes downstream for it.
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError>;

    /// Used for the thread name and in error reports.
    fn name(&self) -> &'static str;

    /// Called once the input channel has closed, before `shutdown`.
    fn flush(&mut self) -> Option<Self::Output> {
        None
    }

    fn shutdown(&mut self) {}
}

/// Owns the thread a station runs on.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Start `station` on a thread named `duplexvox-{name}`.
    ///
    /// A closed input channel drains the station; a closed output channel or
    /// a fatal error stops it.
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("duplexvox-{}", station_name))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            })
            .map_err(|e| tracing::error!(station = station_name, error = %e, "failed to spawn station thread"))
            .ok();

        Self {
            handle,
            station_name,
            _phantom: PhantomData,
        }
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let name = station.name();
        tracing::debug!(station = name, "station started");
        let mut drained = true;

        for input in input_rx.iter() {
            let error = match station.process(input) {
                Ok(None) => continue,
                Ok(Some(output)) => {
                    if output_tx.send(output).is_ok() {
                        continue;
                    }
                    tracing::debug!(station = name, "downstream closed");
                    drained = false;
                    break;
                }
                Err(error) => error,
            };
            error_reporter.report(name, &error);
            if matches!(error, StationError::Fatal(_)) {
                drained = false;
                break;
            }
        }

        if drained && let Some(output) = station.flush() {
            // Receiver may already be gone during teardown
            let _unused = output_tx.send(output);
        }

        station.shutdown();
        tracing::debug!(station = name, drained, "station stopped");
    }

    /// Wait for the thread; a panic comes back as a message.
    pub fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("{} station panicked", self.station_name)),
            None => Ok(()),
        }
    }

    /// Whether the station thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}
