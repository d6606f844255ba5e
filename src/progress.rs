//! Progress reporting from the engines to a front-end.
//!
//! Engines push [`ProgressEvent`]s into a [`ProgressSink`]; the
//! channel-backed sink feeds an out-of-tree UI thread, the discarding
//! sink is for library callers who only want the final result record.

use std::path::PathBuf;

/// One reportable step of a running operation.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// The scanner could not read a directory entry and skipped it.
    ScanError { path: PathBuf, message: String },
    FileStarted { path: String },
    FileDone { path: String, bytes: u64 },
    /// A per-file failure; the operation continues.
    FileError { path: String, message: String },
    FileSkipped { path: String },
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Sink that drops every event.
pub struct DiscardProgress;

impl ProgressSink for DiscardProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Sink forwarding events into a crossbeam channel.
///
/// Send failures are ignored: a vanished consumer must not abort a
/// running backup.
pub struct ChannelProgress {
    sender: crossbeam_channel::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: crossbeam_channel::Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Tracker for progress of operations iterating over a known file set.
#[derive(Debug, Default)]
pub struct OpProgress {
    /// Completed items
    pub done: u64,
    /// Total items
    pub total: u64,
}

impl OpProgress {
    pub fn new(total: u64) -> Self {
        OpProgress { total, done: 0 }
    }

    /// Relative progress based on current counters.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64) / (self.total as f64)
        }
    }
}

impl std::fmt::Display for OpProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2}% ({}/{})",
            self.percentage() * 100.0,
            self.done,
            self.total,
        )
    }
}
