use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use crate::provisioner::{BATCH_FINISHED, LogSink};

const MAX_LOG_LINES: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Ready,
    Retry,
    Failure,
    Finished,
    Normal,
}

pub fn classify_progress_line(line: &str) -> ProgressEvent {
    let lower = line.to_lowercase();

    if line == BATCH_FINISHED {
        return ProgressEvent::Finished;
    }
    if lower.ends_with("] ready.") {
        return ProgressEvent::Ready;
    }
    if lower.contains("] error:") || lower.contains("failed to") {
        return ProgressEvent::Failure;
    }
    if lower.contains("retrying") {
        return ProgressEvent::Retry;
    }
    ProgressEvent::Normal
}

#[derive(Clone, Debug)]
pub struct ProgressLine {
    pub at: DateTime<Local>,
    pub text: String,
    pub event: ProgressEvent,
}

impl ProgressLine {
    pub fn render(&self) -> String {
        format!("{} {}", self.at.format("%H:%M:%S"), self.text)
    }
}

/// Running view of a provisioning batch, safe to feed from its thread.
#[derive(Default)]
pub struct ProgressLog {
    pub lines: Vec<ProgressLine>,
    pub ready: usize,
    pub failed: usize,
    pub retries: usize,
    pub finished: bool,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn push_line(&mut self, text: &str) -> ProgressLine {
        let event = classify_progress_line(text);
        match event {
            ProgressEvent::Ready => self.ready += 1,
            ProgressEvent::Failure => self.failed += 1,
            ProgressEvent::Retry => self.retries += 1,
            ProgressEvent::Finished => self.finished = true,
            ProgressEvent::Normal => {}
        }

        let line = ProgressLine {
            at: Local::now(),
            text: text.to_string(),
            event,
        };
        self.lines.push(line.clone());
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.remove(0);
        }
        line
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ready, {} failed, {} retries",
            self.ready, self.failed, self.retries
        )
    }

    /// Sink that records into `progress` and hands each stamped line to `echo`.
    pub fn sink(
        progress: Arc<Mutex<ProgressLog>>,
        echo: impl Fn(&ProgressLine) + Send + Sync + 'static,
    ) -> LogSink {
        Arc::new(move |text: &str| {
            let line = match progress.lock() {
                Ok(mut locked) => locked.push_line(text),
                Err(poisoned) => poisoned.into_inner().push_line(text),
            };
            echo(&line);
        })
    }
}
