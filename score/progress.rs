use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::thread;
use std::time::Duration;

// ========================================================================================
//                                  Progress events
// ========================================================================================

/// The stages a run reports. The discriminants are part of the event contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProgressKind {
    ParsingStarted = 0,
    ProfilesExpected = 1,
    ProfileParsed = 2,
    ParsingComplete = 3,
    ProfileIndexed = 4,
    ScoreCalculated = 5,
    ScoringComplete = 6,
    CachedScoresExpected = 7,
    ClusteringStarted = 8,
    ClusteringComplete = 9,
    ResultsToSave = 10,
    SavedResult = 11,
    Exit = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub n: u64,
}

pub type ProgressSink = Sender<ProgressEvent>;

/// A fire-and-forget handle on an optional progress consumer.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    sink: Option<ProgressSink>,
}

impl Progress {
    pub fn new(sink: ProgressSink) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Sends an event. A consumer that has gone away is not an error for the producer.
    #[inline]
    pub fn emit(&self, kind: ProgressKind, n: u64) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(ProgressEvent { kind, n });
        }
    }
}

// ========================================================================================
//                             Folding events into a percentage
// ========================================================================================

const PARSING_WEIGHT: f64 = 8.0;
const INDEXING_WEIGHT: f64 = 14.0;
const SCORING_WEIGHT: f64 = 52.0;
const SAVING_WEIGHT: f64 = 17.0;
const ONE_SHOT_WEIGHT: f64 = 1.0;
const CEILING: f64 = 99.999;

#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    expected: u64,
    parsed: u64,
    indexed: u64,
    calculated: u64,
    to_save: Option<u64>,
    saved: u64,
    one_shots: u32,
    message: &'static str,
    exited: bool,
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    done.min(total) as f64 / total as f64
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            message: "Loading data",
            ..Self::default()
        }
    }

    pub fn observe(&mut self, event: ProgressEvent) {
        match event.kind {
            ProgressKind::ParsingStarted => {
                self.message = "Loading data";
                self.one_shots += 1;
            }
            ProgressKind::ProfilesExpected => {
                self.expected = event.n;
                self.one_shots += 1;
            }
            ProgressKind::ProfileParsed => {
                self.message = "Loading data";
                self.parsed += event.n;
            }
            ProgressKind::ParsingComplete => self.one_shots += 1,
            ProgressKind::ProfileIndexed => {
                self.message = "Indexing data";
                self.indexed += event.n;
            }
            ProgressKind::ScoreCalculated => {
                self.message = "Calculating distances";
                self.calculated += event.n;
            }
            ProgressKind::CachedScoresExpected => {
                self.calculated += event.n;
                self.one_shots += 1;
            }
            ProgressKind::ScoringComplete => self.one_shots += 1,
            ProgressKind::ClusteringStarted | ProgressKind::ClusteringComplete => {
                self.message = "Clustering";
                self.one_shots += 1;
            }
            ProgressKind::ResultsToSave => {
                self.message = "Saving results";
                self.to_save = Some(event.n);
                self.one_shots += 1;
            }
            ProgressKind::SavedResult => {
                self.message = "Saving results";
                self.saved += event.n;
            }
            ProgressKind::Exit => {
                self.one_shots += 1;
                self.exited = true;
            }
        }
    }

    /// Overall completion in percent, held below 100 until the run exits.
    pub fn percent(&self) -> f64 {
        if self.exited {
            return 100.0;
        }
        let n_scores = self.expected * self.expected.saturating_sub(1) / 2;
        let progress = f64::from(self.one_shots) * ONE_SHOT_WEIGHT
            + PARSING_WEIGHT * fraction(self.parsed, self.expected)
            + INDEXING_WEIGHT * fraction(self.indexed, self.expected)
            + SCORING_WEIGHT * fraction(self.calculated, n_scores)
            + SAVING_WEIGHT * fraction(self.saved, self.to_save.unwrap_or(self.expected));
        progress.min(CEILING)
    }

    pub fn message(&self) -> &'static str {
        self.message
    }

    pub fn exited(&self) -> bool {
        self.exited
    }
}

// ========================================================================================
//                                  Terminal rendering
// ========================================================================================

const BAR_RESOLUTION: u64 = 100_000;

fn create_progress_bar() -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(BAR_RESOLUTION), draw_target);
    let style = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb
}

/// Drains `events` on a background thread and draws them on stderr. The thread ends
/// when every sender is dropped or an `Exit` event arrives.
pub fn spawn_progress_bar(events: Receiver<ProgressEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let pb = create_progress_bar();
        pb.enable_steady_tick(Duration::from_millis(250));
        let mut tracker = ProgressTracker::new();
        for event in events.iter() {
            tracker.observe(event);
            pb.set_position((tracker.percent() / 100.0 * BAR_RESOLUTION as f64) as u64);
            pb.set_message(tracker.message());
            if tracker.exited() {
                break;
            }
        }
        pb.finish_and_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn event(kind: ProgressKind, n: u64) -> ProgressEvent {
        ProgressEvent { kind, n }
    }

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(ProgressKind::ParsingStarted as u8, 0);
        assert_eq!(ProgressKind::ScoreCalculated as u8, 5);
        assert_eq!(ProgressKind::CachedScoresExpected as u8, 7);
        assert_eq!(ProgressKind::Exit as u8, 12);
    }

    #[test]
    fn a_full_run_adds_up_and_caps_before_exit() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(event(ProgressKind::ParsingStarted, 0));
        tracker.observe(event(ProgressKind::ProfilesExpected, 4));
        assert!((tracker.percent() - 2.0).abs() < 1e-9);

        for _ in 0..4 {
            tracker.observe(event(ProgressKind::ProfileParsed, 1));
        }
        tracker.observe(event(ProgressKind::ParsingComplete, 0));
        assert!((tracker.percent() - 11.0).abs() < 1e-9);

        for _ in 0..4 {
            tracker.observe(event(ProgressKind::ProfileIndexed, 1));
        }
        assert_eq!(tracker.message(), "Indexing data");
        tracker.observe(event(ProgressKind::CachedScoresExpected, 3));
        assert!((tracker.percent() - (26.0 + 26.0)).abs() < 1e-9);
        tracker.observe(event(ProgressKind::ScoreCalculated, 3));
        tracker.observe(event(ProgressKind::ScoringComplete, 0));
        assert_eq!(tracker.message(), "Calculating distances");
        assert!((tracker.percent() - 79.0).abs() < 1e-9);

        tracker.observe(event(ProgressKind::ClusteringStarted, 0));
        tracker.observe(event(ProgressKind::ClusteringComplete, 0));
        assert_eq!(tracker.message(), "Clustering");
        tracker.observe(event(ProgressKind::ResultsToSave, 2));
        tracker.observe(event(ProgressKind::SavedResult, 1));
        assert!((tracker.percent() - 90.5).abs() < 1e-9);
        tracker.observe(event(ProgressKind::SavedResult, 5));
        assert!((tracker.percent() - 99.0).abs() < 1e-9);
        tracker.observe(event(ProgressKind::ScoringComplete, 0));
        tracker.observe(event(ProgressKind::ScoringComplete, 0));
        assert_eq!(tracker.percent(), CEILING);
        assert_eq!(tracker.message(), "Saving results");

        tracker.observe(event(ProgressKind::ParsingStarted, 0));
        assert_eq!(tracker.message(), "Loading data");
        assert_eq!(tracker.percent(), CEILING);

        tracker.observe(event(ProgressKind::Exit, 0));
        assert_eq!(tracker.percent(), 100.0);
    }

    #[test]
    fn emitting_without_a_consumer_is_silent() {
        Progress::disabled().emit(ProgressKind::ParsingStarted, 0);
        let (tx, rx) = unbounded();
        let progress = Progress::new(tx);
        drop(rx);
        progress.emit(ProgressKind::Exit, 0);
    }

    #[test]
    fn the_renderer_stops_on_exit() {
        let (tx, rx) = unbounded();
        let handle = spawn_progress_bar(rx);
        let progress = Progress::new(tx);
        progress.emit(ProgressKind::ProfilesExpected, 2);
        progress.emit(ProgressKind::Exit, 0);
        handle.join().unwrap();
    }
}
