// src/solver/failure.rs

//! Rendering of unsolvable constraint sets.
//!
//! When conflict resolution derives the terminal incompatibility, the
//! solver packages it together with a snapshot of the incompatibility arena
//! into a [`SolveFailure`]. The failure renders as a blame chain: the
//! derivation DAG is walked depth-first and each derived incompatibility is
//! stated in terms of the two facts it was resolved from.

use std::fmt;

use crate::solver::incompatibility::{Cause, IncompatId, Incompatibility};

/// An unsatisfiable resolution, carrying its derivation DAG.
#[derive(Debug, Clone)]
pub struct SolveFailure {
    /// Snapshot of the solver's incompatibility arena.
    arena: Vec<Incompatibility>,
    /// The terminal `{root}` incompatibility.
    root: IncompatId,
}

impl SolveFailure {
    pub(crate) fn new(arena: Vec<Incompatibility>, root: IncompatId) -> Self {
        Self { arena, root }
    }

    /// The incompatibility that proved resolution impossible.
    pub fn root_incompatibility(&self) -> &Incompatibility {
        &self.arena[self.root]
    }

    /// Render the blame chain.
    pub fn explanation(&self) -> String {
        let mut lines = Vec::new();
        self.explain(self.root, &mut lines);
        if lines.is_empty() {
            lines.push(format!("{}.", self.arena[self.root].describe()));
        }
        let mut out = String::from("version solving failed:\n");
        for line in lines {
            out.push_str("  ");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// Post-order walk: external causes first, then the statement each
    /// derived incompatibility adds.
    fn explain(&self, id: IncompatId, lines: &mut Vec<String>) {
        let incompatibility = &self.arena[id];
        match incompatibility.cause {
            Cause::Conflict { left, right } => {
                self.explain(left, lines);
                self.explain(right, lines);
                let because = format!(
                    "because {} and {}, {}.",
                    self.arena[left].describe(),
                    self.arena[right].describe(),
                    incompatibility.describe()
                );
                // Keep the chain minimal: drop restatements the two causes
                // already make obvious at depth.
                if lines.last().map_or(true, |last| *last != because) {
                    lines.push(because);
                }
            }
            _ => {
                // External facts appear only through the derived statements
                // that combine them; stating each alone adds noise.
            }
        }
    }
}

impl fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.explanation().trim_end())
    }
}

impl std::error::Error for SolveFailure {}
