//! Session State Machine: explicit states and legal transition guards.
//!
//! Every repair session starts at `Init` and ends in one of three terminal
//! states. The controller calls `advance()` to move between states; each call
//! validates the edge and appends it to the transition log, so a finished
//! session can be audited from its [`SessionReport`](crate::orchestrator::SessionReport).
//!
//! ```text
//! Init ──► PreBuild ──► Iterating ──► Succeeded | Exhausted | Fatal
//!              │
//!              └──► Succeeded | Exhausted
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Applying one-off transforms before the first build.
    Init,
    /// Measuring the baseline and applying zero-cost rules.
    PreBuild,
    /// Model-driven repair iterations.
    Iterating,
    /// The build is green (terminal).
    Succeeded,
    /// Iteration or wall-clock budget consumed (terminal).
    Exhausted,
    /// Unrecoverable collaborator failure (terminal).
    Fatal,
}

impl SessionState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Fatal)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::PreBuild => write!(f, "PreBuild"),
            Self::Iterating => write!(f, "Iterating"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Exhausted => write!(f, "Exhausted"),
            Self::Fatal => write!(f, "Fatal"),
        }
    }
}

/// ```text
/// Init      → PreBuild
/// PreBuild  → Iterating | Succeeded | Exhausted
/// Iterating → Succeeded | Exhausted
/// any non-terminal → Fatal
/// ```
fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    if to == Fatal && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Init, PreBuild)
            | (PreBuild, Iterating)
            | (PreBuild, Succeeded)
            // Zero iteration budget
            | (PreBuild, Exhausted)
            | (Iterating, Succeeded)
            | (Iterating, Exhausted)
    )
}

/// One audited edge of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    /// Iteration in progress when the edge was taken (0 before the loop).
    pub iteration: u32,
    /// Diagnostics outstanding when the edge was taken.
    pub errors: usize,
    pub at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Error)]
#[error("Illegal session transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Current session state plus the counters every transition is stamped with.
pub struct StateMachine {
    current: SessionState,
    iteration: u32,
    errors: usize,
    started: Instant,
    log: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::starting_at(SessionState::Init)
    }

    fn starting_at(current: SessionState) -> Self {
        Self {
            current,
            iteration: 0,
            errors: 0,
            started: Instant::now(),
            log: Vec::new(),
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Latest measured diagnostic count.
    pub fn note_errors(&mut self, errors: usize) {
        self.errors = errors;
    }

    pub fn advance(&mut self, to: SessionState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        let from = self.current;
        if !is_legal_transition(from, to) {
            return Err(IllegalTransition { from, to });
        }

        if to.is_terminal() {
            tracing::info!(%from, %to, iteration = self.iteration, errors = self.errors, "Session settled");
        } else {
            tracing::debug!(%from, %to, iteration = self.iteration, errors = self.errors, "Session transition");
        }
        self.log.push(TransitionRecord {
            from,
            to,
            iteration: self.iteration,
            errors: self.errors,
            at_ms: self.started.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Move to `Fatal`; refused once the session has settled.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(SessionState::Fatal, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.log
    }

    /// `Exhausted after 3 iterations, 2 errors left (41ms): PreBuild → Iterating → Exhausted`
    pub fn summary(&self) -> String {
        let path: Vec<String> = self.log.iter().map(|t| t.to.to_string()).collect();
        let plural = if self.iteration == 1 { "" } else { "s" };
        let mut summary = format!(
            "{} after {} iteration{plural}, {} errors left ({}ms)",
            self.current,
            self.iteration,
            self.errors,
            self.started.elapsed().as_millis(),
        );
        if !path.is_empty() {
            summary.push_str(": ");
            summary.push_str(&path.join(" → "));
        }
        summary
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), SessionState::Init);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_repair_path() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::PreBuild, None).unwrap();
        sm.note_errors(3);
        sm.advance(SessionState::Iterating, Some("3 errors")).unwrap();
        sm.set_iteration(4);
        sm.note_errors(0);
        sm.advance(SessionState::Succeeded, None).unwrap();

        assert!(sm.is_terminal());
        let log = sm.transitions();
        assert_eq!(log.len(), 3);
        assert_eq!((log[1].iteration, log[1].errors), (0, 3));
        assert_eq!((log[2].iteration, log[2].errors), (4, 0));
        assert_eq!(log[1].reason.as_deref(), Some("3 errors"));
    }

    #[test]
    fn test_green_baseline_skips_iterating() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::PreBuild, None).unwrap();
        sm.advance(SessionState::Succeeded, Some("build already passes")).unwrap();
        assert_eq!(sm.current(), SessionState::Succeeded);
    }

    #[test]
    fn test_fatal_from_any_non_terminal_state() {
        for state in [SessionState::Init, SessionState::PreBuild, SessionState::Iterating] {
            let mut sm = StateMachine::starting_at(state);
            assert!(sm.fail("model credentials rejected").is_ok());
            assert_eq!(sm.current(), SessionState::Fatal);
        }
    }

    #[test]
    fn test_cannot_leave_terminal() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::PreBuild, None).unwrap();
        sm.advance(SessionState::Iterating, None).unwrap();
        sm.advance(SessionState::Exhausted, Some("iteration budget")).unwrap();

        let err = sm.advance(SessionState::Iterating, None).unwrap_err();
        assert_eq!(err.from, SessionState::Exhausted);
        assert!(sm.fail("late").is_err());
    }

    #[test]
    fn test_illegal_skip() {
        let mut sm = StateMachine::new();
        let err = sm.advance(SessionState::Iterating, None).unwrap_err();
        assert_eq!(err.to_string(), "Illegal session transition: Init → Iterating");
    }

    #[test]
    fn test_summary() {
        let mut sm = StateMachine::new();
        sm.advance(SessionState::PreBuild, None).unwrap();
        sm.note_errors(2);
        sm.set_iteration(1);
        sm.fail("build runner crashed").unwrap();
        let summary = sm.summary();
        assert!(summary.starts_with("Fatal after 1 iteration, 2 errors left"), "{summary}");
        assert!(summary.ends_with(": PreBuild → Fatal"), "{summary}");
    }
}
