//! Core station abstraction and runner.
//!
//! A station owns some state, receives inputs over a bounded crossbeam
//! channel and runs on its own thread. The channel is the single point where
//! inputs from many producer threads are serialized, so the station itself
//! never needs a lock.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A processing station.
pub trait Station: Send + 'static {
    /// The input type this station receives.
    type Input: Send + 'static;
    /// The output type this station produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - Successfully processed and produced output
    /// - `Ok(None)` - Successfully processed but no output
    /// - `Err(StationError)` - Processing failed
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError>;

    /// Called when no input arrived within the runner's tick interval.
    fn tick(&mut self) -> Result<Option<Self::Output>, StationError> {
        Ok(None)
    }

    /// Returns the name of this station for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Called when the station is shutting down.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    running: Arc<AtomicBool>,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns a station that only wakes up for inputs.
    ///
    /// Outputs go to `output_tx` when given; if that channel is closed the
    /// station shuts down. Without an output channel results are dropped
    /// (the station is expected to publish through its own observers).
    pub fn spawn(
        station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self::spawn_with_tick(station, input_rx, output_tx, error_reporter, None)
    }

    /// Spawns a station that is also ticked whenever `tick` elapses without input.
    pub fn spawn_with_tick(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
        tick: Option<Duration>,
    ) -> Self {
        let station_name = station.name();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new()
            .name(format!("station-{station_name}"))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter, tick, &flag);
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(
                    station = station_name,
                    error = %e,
                    "failed to spawn station thread"
                );
                running.store(false, Ordering::SeqCst);
                None
            }
        };

        Self {
            handle,
            station_name,
            running,
            _phantom: PhantomData,
        }
    }

    /// Main processing loop for the station.
    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
        tick: Option<Duration>,
        running: &AtomicBool,
    ) {
        let station_name = station.name();
        tracing::debug!(station = station_name, ?tick, "station started");

        while running.load(Ordering::SeqCst) {
            let result = match tick {
                Some(interval) => match input_rx.recv_timeout(interval) {
                    Ok(input) => station.process(input),
                    Err(RecvTimeoutError::Timeout) => station.tick(),
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match input_rx.recv() {
                    Ok(input) => station.process(input),
                    Err(_) => break,
                },
            };

            // Stop requested while processing: discard, no more outputs.
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match result {
                Ok(Some(output)) => {
                    if let Some(tx) = &output_tx
                        && tx.send(output).is_err()
                    {
                        // Output channel closed, shutdown
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    error_reporter.report(station_name, &error);
                    if error.is_fatal() {
                        break;
                    }
                }
            }
        }

        running.store(false, Ordering::SeqCst);
        station.shutdown();
        tracing::debug!(station = station_name, "station stopped");
    }

    /// Asks the station loop to exit at its next wake-up.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Returns true while the station loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| format!("Station '{}' thread panicked", self.station_name))
        } else {
            Ok(())
        }
    }

    /// Returns the name of the station.
    pub fn name(&self) -> &'static str {
        self.station_name
    }
}

impl<S: Station> Drop for StationRunner<S> {
    fn drop(&mut self) {
        // Dropping detaches the thread; make sure it winds down on its own.
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::RecordingReporter;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicUsize;

    /// Trims recognized text and drops lines that are only whitespace.
    struct TrimStation {
        shutdown_called: Arc<AtomicBool>,
    }

    impl Station for TrimStation {
        type Input = String;
        type Output = String;

        fn process(&mut self, input: String) -> Result<Option<String>, StationError> {
            let trimmed = input.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }

        fn name(&self) -> &'static str {
            "trim"
        }

        fn shutdown(&mut self) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    struct TickCounter {
        ticks: Arc<AtomicUsize>,
    }

    impl Station for TickCounter {
        type Input = ();
        type Output = usize;

        fn process(&mut self, _input: ()) -> Result<Option<usize>, StationError> {
            Ok(None)
        }

        fn tick(&mut self) -> Result<Option<usize>, StationError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(n))
        }

        fn name(&self) -> &'static str {
            "ticker"
        }
    }

    struct FailingStation {
        fail_on: i32,
        fatal_on: i32,
    }

    impl Station for FailingStation {
        type Input = i32;
        type Output = i32;

        fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError> {
            if input == self.fail_on {
                Err(StationError::Recoverable(format!("Failed on {}", input)))
            } else if input == self.fatal_on {
                Err(StationError::Fatal(format!("Fatal on {}", input)))
            } else {
                Ok(Some(input))
            }
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_station_runner_basic_processing() {
        let (input_tx, input_rx) = bounded(10);
        let (output_tx, output_rx) = bounded(10);
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let station = TrimStation {
            shutdown_called: shutdown_flag.clone(),
        };
        let runner = StationRunner::spawn(
            station,
            input_rx,
            Some(output_tx),
            Arc::new(RecordingReporter::new()),
        );
        assert_eq!(runner.name(), "trim");

        for raw in [" STOP ", "   ", "EXIT\n"] {
            input_tx.send(raw.to_string()).unwrap();
        }
        drop(input_tx);

        let outputs: Vec<String> = output_rx.iter().collect();
        assert_eq!(outputs, vec!["STOP".to_string(), "EXIT".to_string()]);

        runner.join().unwrap();
        assert!(shutdown_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_station_runner_without_output_channel() {
        let (input_tx, input_rx) = bounded(10);
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let station = TrimStation {
            shutdown_called: shutdown_flag.clone(),
        };
        let runner =
            StationRunner::spawn(station, input_rx, None, Arc::new(RecordingReporter::new()));

        input_tx.send("exit".to_string()).unwrap();
        drop(input_tx);
        runner.join().unwrap();
        assert!(shutdown_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_station_runner_ticks_when_idle() {
        let (_input_tx, input_rx) = bounded::<()>(1);
        let (output_tx, output_rx) = bounded(10);
        let ticks = Arc::new(AtomicUsize::new(0));

        let runner = StationRunner::spawn_with_tick(
            TickCounter {
                ticks: ticks.clone(),
            },
            input_rx,
            Some(output_tx),
            Arc::new(RecordingReporter::new()),
            Some(Duration::from_millis(5)),
        );

        let first = output_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = output_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((first, second), (1, 2));

        // Unblock a pending send before asking the loop to stop.
        drop(output_rx);
        runner.stop();
        runner.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_station_runner_error_handling() {
        let (input_tx, input_rx) = bounded(10);
        let (output_tx, output_rx) = bounded(10);
        let reporter = Arc::new(RecordingReporter::new());

        let station = FailingStation {
            fail_on: 2,
            fatal_on: 4,
        };
        let runner = StationRunner::spawn(station, input_rx, Some(output_tx), reporter.clone());

        for i in 1..=5 {
            input_tx.send(i).unwrap();
        }
        drop(input_tx);

        let outputs: Vec<i32> = output_rx.iter().collect();
        // 2 is reported and skipped, 4 is fatal so 5 is never processed.
        assert_eq!(outputs, vec![1, 3]);

        let reported = reporter.reports();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, "failing");
        assert_eq!(reported[0].1, StationError::Recoverable("Failed on 2".to_string()));
        assert!(reported[1].1.is_fatal());

        runner.join().unwrap();
    }

    #[test]
    fn test_station_runner_output_channel_closed() {
        let (input_tx, input_rx) = bounded(10);
        let (output_tx, output_rx) = bounded(10);
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let station = TrimStation {
            shutdown_called: shutdown_flag.clone(),
        };
        let runner = StationRunner::spawn(
            station,
            input_rx,
            Some(output_tx),
            Arc::new(RecordingReporter::new()),
        );

        drop(output_rx);
        input_tx.send("open".to_string()).unwrap();

        runner.join().unwrap();
        assert!(shutdown_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_ends_ticking_station() {
        let (_input_tx, input_rx) = bounded::<()>(1);
        let runner = StationRunner::spawn_with_tick(
            TickCounter {
                ticks: Arc::new(AtomicUsize::new(0)),
            },
            input_rx,
            None,
            Arc::new(RecordingReporter::new()),
            Some(Duration::from_millis(5)),
        );
        assert!(runner.is_running());
        runner.stop();
        runner.join().unwrap();
    }
}
