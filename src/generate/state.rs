//! Generation state machine:
//! Composing → Invoking → Fingerprinting → DedupCheck → Accepted,
//! with Retrying (back to Composing) and Fallback as the exits from failure.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::RequestIds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GenerationState {
    Composing,
    Invoking,
    Fingerprinting,
    DedupCheck,
    Retrying,
    Accepted,
    Fallback,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Composing => "Composing",
            GenerationState::Invoking => "Invoking",
            GenerationState::Fingerprinting => "Fingerprinting",
            GenerationState::DedupCheck => "DedupCheck",
            GenerationState::Retrying => "Retrying",
            GenerationState::Accepted => "Accepted",
            GenerationState::Fallback => "Fallback",
        };
        f.write_str(name)
    }
}

impl GenerationState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: GenerationState) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Composing, Invoking)
                | (Composing, Fallback) // no generative provider
                | (Invoking, Fingerprinting)
                | (Invoking, Retrying) // call failed or output unusable
                | (Invoking, Fallback) // failed on the last attempt
                | (Fingerprinting, DedupCheck)
                | (DedupCheck, Accepted)
                | (DedupCheck, Retrying) // near-duplicate
                | (DedupCheck, Fallback) // near-duplicate on the last attempt
                | (Retrying, Composing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationState::Accepted | GenerationState::Fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: GenerationState,
    pub to: GenerationState,
}

/// One step of a run's trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceStep {
    pub state: GenerationState,
    pub attempt: u32,
    /// Time since the run started.
    pub at: Duration,
}

/// Per-request state plus an inspectable trace of every transition.
#[derive(Debug, Clone)]
pub struct GenerationRun {
    ids: RequestIds,
    state: GenerationState,
    attempt: u32,
    pub duplicates: u32,
    pub failures: u32,
    started: Instant,
    trace: Vec<TraceStep>,
}

impl GenerationRun {
    pub fn new(ids: RequestIds) -> Self {
        let started = Instant::now();
        Self {
            ids,
            state: GenerationState::Composing,
            attempt: 0,
            duplicates: 0,
            failures: 0,
            started,
            trace: vec![TraceStep {
                state: GenerationState::Composing,
                attempt: 0,
                at: Duration::ZERO,
            }],
        }
    }

    pub fn ids(&self) -> &RequestIds {
        &self.ids
    }

    pub fn current(&self) -> GenerationState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn trace(&self) -> &[TraceStep] {
        &self.trace
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<GenerationState> {
        self.trace.iter().map(|s| s.state).collect()
    }

    /// Attempt a state transition. Entering `Invoking` starts a new attempt.
    pub fn transition(
        &mut self,
        next: GenerationState,
    ) -> Result<GenerationState, InvalidTransition> {
        let current = self.state;
        if !current.can_transition_to(next) {
            let err = InvalidTransition { from: current, to: next };
            warn!(trace_id = %self.ids.trace_id, "{}", err);
            return Err(err);
        }
        if next == GenerationState::Invoking {
            self.attempt += 1;
        }
        self.state = next;
        self.trace.push(TraceStep {
            state: next,
            attempt: self.attempt,
            at: self.started.elapsed(),
        });
        debug!(from = %current, to = %next, attempt = self.attempt, "generation_transition");
        Ok(next)
    }
}
