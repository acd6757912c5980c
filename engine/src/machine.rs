//! Generic table-driven finite-state machine.
//!
//! The machine owns a current state and a table of transitions. Firing an
//! action looks up the row matching `(action, current_state)`; if none
//! matches the call is a silent no-op - actions that do not apply to the
//! current lifecycle phase are ignored by design, not an error.
//!
//! Handlers are opaque tags executed by the owner, which keeps the table a
//! closed, compile-time-checkable enum mapping instead of dynamic dispatch.
//! Ordering contract: the state update is visible *before* the owner runs
//! the returned handler; observer notification happens after the handler,
//! all within the owner's single `transition` call.

use tracing::trace;

/// One row of the transition table.
#[derive(Debug, Clone)]
pub struct Transition<S, A, H> {
    /// Action that fires this row.
    pub action: A,
    /// State the machine must currently be in.
    pub from: S,
    /// State the machine moves to.
    pub to: S,
    /// Optional handler tag for the owner to execute.
    pub handler: Option<H>,
}

/// A fired transition, returned to the owner for handler execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<S, H> {
    /// State before the transition.
    pub from: S,
    /// State after the transition.
    pub to: S,
    /// Handler tag of the matched row, if any.
    pub handler: Option<H>,
}

/// A table-driven state machine with terminal-state detection.
#[derive(Debug, Clone)]
pub struct StateMachine<S, A, H> {
    state: S,
    transitions: Vec<Transition<S, A, H>>,
    terminal: Vec<S>,
}

impl<S, A, H> StateMachine<S, A, H>
where
    S: Copy + PartialEq + std::fmt::Debug,
    A: Copy + PartialEq + std::fmt::Debug,
    H: Copy,
{
    /// Create a machine in `initial` with the given table and terminal set.
    pub fn new(initial: S, transitions: Vec<Transition<S, A, H>>, terminal: Vec<S>) -> Self {
        Self {
            state: initial,
            transitions,
            terminal,
        }
    }

    /// The current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Whether the machine has reached a state it can never leave.
    pub fn is_in_terminal_state(&self) -> bool {
        self.terminal.contains(&self.state)
    }

    /// Fire `action`. Returns the matched row with the state already
    /// updated, or `None` when no row matches the current state (ignored).
    pub fn transition(&mut self, action: A) -> Option<Fired<S, H>> {
        let row = self
            .transitions
            .iter()
            .find(|t| t.action == action && t.from == self.state)?;

        let fired = Fired {
            from: row.from,
            to: row.to,
            handler: row.handler,
        };
        trace!(action = ?action, from = ?fired.from, to = ?fired.to, "transition");
        self.state = fired.to;
        Some(fired)
    }
}
