//! Progress reporting and cooperative cancellation.
//!
//! Observers are synchronous and best-effort: implementations must not
//! block, and a slow observer may simply drop events. The cancel token is
//! polled at frame and stage boundaries; cancellation latency is bounded by
//! one frame's work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// Pipeline stages in per-FOV execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Copy,
    Segment,
    Background,
    Track,
    Extract,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Copy => "copy",
            Stage::Segment => "segment",
            Stage::Background => "background",
            Stage::Track => "track",
            Stage::Extract => "extract",
        }
    }
}

#[derive(Debug)]
pub enum Event<'a> {
    BatchStarted { index: usize, fovs: &'a [usize] },
    StageStarted { fov: usize, stage: Stage },
    StageFinished {
        fov: usize,
        stage: Stage,
        ok: bool,
        message: &'a str,
    },
    BatchFinished { index: usize },
    Warning { kind: &'a str, message: &'a str },
}

pub trait Observer: Send + Sync {
    fn event(&self, event: &Event);
}

/// Discards all events.
pub struct NullObserver;

impl Observer for NullObserver {
    fn event(&self, _event: &Event) {}
}

/// Shared cancellation flag. Cloning is cheap; all clones observe the same
/// flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the token has fired.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
