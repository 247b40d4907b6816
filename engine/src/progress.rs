//! Structured progress events for install observers.
//!
//! Macro-steps emit begin/end pairs; `copy_image` is the only source of
//! continuous percentages. The [`StepGuard`] ends its step as failed unless
//! explicitly marked successful, so every exit path produces a matching end
//! event.

use std::sync::Arc;

use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    StepStarted {
        name: &'static str,
        label: String,
        substeps: usize,
    },
    StepFinished {
        name: &'static str,
        success: bool,
    },
    StepPercentage {
        name: &'static str,
        percent: u8,
    },
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<ProgressSink>,
}

impl Progress {
    pub fn new(sink: ProgressSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// No observer; percentage reporting is suppressed entirely.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn begin_step(
        &self,
        name: &'static str,
        label: &str,
        substeps: usize,
    ) -> StepGuard<'_> {
        debug!("step `{name}` started: {label}");
        self.emit(ProgressEvent::StepStarted {
            name,
            label: label.to_string(),
            substeps,
        });
        StepGuard {
            progress: self,
            name,
            success: false,
        }
    }

    pub fn step_percentage(&self, name: &'static str, percent: u8) {
        self.emit(ProgressEvent::StepPercentage { name, percent });
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }
}

/// Ends its step on drop; failed unless [`StepGuard::succeed`] was called.
pub struct StepGuard<'a> {
    progress: &'a Progress,
    name: &'static str,
    success: bool,
}

impl StepGuard<'_> {
    pub fn succeed(mut self) {
        self.success = true;
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        debug!(
            "step `{}` finished: {}",
            self.name,
            if self.success { "success" } else { "failed" }
        );
        self.progress.emit(ProgressEvent::StepFinished {
            name: self.name,
            success: self.success,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{Progress, ProgressEvent};

    fn recording() -> (Progress, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let progress = Progress::new(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        (progress, events)
    }

    #[test]
    fn explicit_success_is_reported() {
        let (progress, events) = recording();
        progress.begin_step("copy_image", "Copying image", 0).succeed();
        let events = events.lock().unwrap();
        assert_eq!(
            ProgressEvent::StepFinished {
                name: "copy_image",
                success: true
            },
            events[1]
        );
    }

    #[test]
    fn dropped_guard_reports_failure() {
        let (progress, events) = recording();
        {
            let _guard = progress.begin_step("check_slot", "Checking slot", 0);
            // error path: guard dropped without succeed()
        }
        let events = events.lock().unwrap();
        assert_eq!(
            ProgressEvent::StepFinished {
                name: "check_slot",
                success: false
            },
            events[1]
        );
    }
}
