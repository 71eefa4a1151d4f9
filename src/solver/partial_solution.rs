// src/solver/partial_solution.rs

//! The partial solution: the ordered assignment list the solver builds up.
//!
//! An assignment is either a decision (a concrete package selection) or a
//! derivation (a term forced by an incompatibility). Assignments carry the
//! decision level at which they were made so conflict resolution can
//! backjump, and derivations record the incompatibility that forced them so
//! failures can be explained.

use std::collections::HashMap;

use crate::package::{Description, PackageId, PackageRange};
use crate::solver::incompatibility::IncompatId;
use crate::solver::term::{SetRelation, Term};

/// One entry of the partial solution.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub term: Term,
    /// Number of decisions made before this assignment.
    pub decision_level: usize,
    /// Position in the assignment order.
    pub index: usize,
    /// The incompatibility that forced this derivation; `None` for
    /// decisions.
    pub cause: Option<IncompatId>,
}

impl Assignment {
    pub fn is_decision(&self) -> bool {
        self.cause.is_none()
    }
}

/// The ordered assignment stack plus per-package accumulators.
#[derive(Debug, Default)]
pub struct PartialSolution {
    assignments: Vec<Assignment>,
    decisions: HashMap<String, PackageId>,
    /// Accumulated positive term per package, once any positive assignment
    /// exists for it.
    positive: HashMap<String, Term>,
    /// Accumulated negative term per package that has only negative
    /// assignments.
    negative: HashMap<String, Term>,
    attempted_solutions: u64,
    backtracking: bool,
}

impl PartialSolution {
    pub fn new() -> Self {
        Self {
            attempted_solutions: 1,
            ..Self::default()
        }
    }

    pub fn decision_level(&self) -> usize {
        self.decisions.len()
    }

    /// How many distinct solutions were attempted: one plus the number of
    /// times a decision was made after backtracking.
    pub fn attempted_solutions(&self) -> u64 {
        self.attempted_solutions
    }

    pub fn decisions(&self) -> &HashMap<String, PackageId> {
        &self.decisions
    }

    pub fn decision(&self, name: &str) -> Option<&PackageId> {
        self.decisions.get(name)
    }

    /// Record a decision: select a concrete package version.
    pub fn decide(&mut self, package: PackageId) {
        if self.backtracking {
            self.attempted_solutions += 1;
        }
        self.backtracking = false;
        self.decisions.insert(package.name.clone(), package.clone());
        let assignment = Assignment {
            term: Term::positive(package.as_range()),
            decision_level: self.decision_level(),
            index: self.assignments.len(),
            cause: None,
        };
        self.register(&assignment);
        self.assignments.push(assignment);
    }

    /// Record a derivation forced by `cause`.
    pub fn derive(&mut self, package: PackageRange, positive: bool, cause: IncompatId) {
        let term = if positive {
            Term::positive(package)
        } else {
            Term::negative(package)
        };
        let assignment = Assignment {
            term,
            decision_level: self.decision_level(),
            index: self.assignments.len(),
            cause: Some(cause),
        };
        self.register(&assignment);
        self.assignments.push(assignment);
    }

    /// Fold an assignment into the per-package accumulators.
    fn register(&mut self, assignment: &Assignment) {
        let name = assignment.term.package.name.clone();
        if let Some(old) = self.positive.get(&name) {
            let combined = old
                .intersect(&assignment.term)
                .expect("assignments never contradict the accumulated positive term");
            self.positive.insert(name, combined);
            return;
        }
        let term = match self.negative.get(&name) {
            None => assignment.term.clone(),
            Some(old) => assignment
                .term
                .intersect(old)
                .expect("assignments never contradict the accumulated negative term"),
        };
        if term.positive {
            self.negative.remove(&name);
            self.positive.insert(name, term);
        } else {
            self.negative.insert(name, term);
        }
    }

    /// Undo all assignments above `decision_level`.
    pub fn backtrack(&mut self, decision_level: usize) {
        self.backtracking = true;
        let mut touched: Vec<String> = Vec::new();
        while self
            .assignments
            .last()
            .map_or(false, |a| a.decision_level > decision_level)
        {
            let removed = self.assignments.pop().expect("checked non-empty");
            let is_decision = removed.is_decision();
            let name = removed.term.package.name;
            if is_decision {
                self.decisions.remove(&name);
            }
            touched.push(name);
        }
        for name in &touched {
            self.positive.remove(name);
            self.negative.remove(name);
        }
        // Rebuild the accumulators for the packages that lost assignments.
        let remaining: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|a| touched.contains(&a.term.package.name))
            .cloned()
            .collect();
        for assignment in &remaining {
            self.register(assignment);
        }
    }

    /// The relation of the accumulated knowledge about a package to `term`.
    pub fn relation(&self, term: &Term) -> SetRelation {
        let name = &term.package.name;
        if let Some(positive) = self.positive.get(name) {
            return positive.relation(term);
        }
        match self.negative.get(name) {
            Some(negative) => negative.relation(term),
            None => SetRelation::Overlapping,
        }
    }

    /// Whether the accumulated assignments imply `term`.
    pub fn satisfies(&self, term: &Term) -> bool {
        self.relation(term) == SetRelation::Subset
    }

    /// The earliest assignment such that all assignments up to and including
    /// it collectively satisfy `term`.
    pub fn satisfier(&self, term: &Term) -> Assignment {
        let mut accumulated: Option<Term> = None;
        for assignment in &self.assignments {
            if assignment.term.package.name != term.package.name {
                continue;
            }
            let same_source = assignment.term.package.description == Description::Root
                || assignment.term.package.description == term.package.description;
            if !same_source {
                // A positive selection from another source satisfies any
                // negative term about this one.
                if assignment.term.positive {
                    return assignment.clone();
                }
                continue;
            }
            let combined = match &accumulated {
                None => assignment.term.clone(),
                Some(prev) => prev
                    .intersect(&assignment.term)
                    .expect("assignments about one package always intersect"),
            };
            if combined.satisfies(term) {
                return assignment.clone();
            }
            accumulated = Some(combined);
        }
        unreachable!("asked for the satisfier of {term}, which is not satisfied")
    }

    /// Packages required by the accumulated positive terms that have no
    /// decision yet; the next decision is picked among these.
    pub fn unsatisfied(&self) -> Vec<PackageRange> {
        let mut ranges: Vec<PackageRange> = self
            .positive
            .values()
            .filter(|term| !self.decisions.contains_key(&term.package.name))
            .map(|term| term.package.clone())
            .collect();
        ranges.sort_by(|a, b| a.name.cmp(&b.name));
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::ResolvedDescription;
    use crate::version::{Version, VersionConstraint};

    fn hosted_range(name: &str, constraint: &str) -> PackageRange {
        PackageRange::new(
            name,
            Description::Hosted {
                name: name.to_string(),
                url: "https://packages.test".to_string(),
            },
            VersionConstraint::parse(constraint).unwrap(),
        )
    }

    fn hosted_id(name: &str, version: &str) -> PackageId {
        PackageId::new(
            name,
            Version::parse(version).unwrap(),
            ResolvedDescription::Hosted {
                name: name.to_string(),
                url: "https://packages.test".to_string(),
                sha256: None,
            },
        )
    }

    #[test]
    fn test_derivations_accumulate() {
        let mut solution = PartialSolution::new();
        solution.derive(hosted_range("foo", ">=1.0.0"), true, 0);
        solution.derive(hosted_range("foo", "<2.0.0"), true, 1);

        // foo must now be within [1.0.0, 2.0.0).
        assert!(solution.satisfies(&Term::positive(hosted_range("foo", ">=0.1.0"))));
        assert_eq!(
            solution.relation(&Term::positive(hosted_range("foo", "^2.0.0"))),
            SetRelation::Disjoint
        );
        assert_eq!(solution.unsatisfied().len(), 1);
    }

    #[test]
    fn test_decide_clears_unsatisfied() {
        let mut solution = PartialSolution::new();
        solution.derive(hosted_range("foo", "^1.0.0"), true, 0);
        assert_eq!(solution.unsatisfied().len(), 1);

        solution.decide(hosted_id("foo", "1.2.0"));
        assert!(solution.unsatisfied().is_empty());
        assert_eq!(solution.decision_level(), 1);
    }

    #[test]
    fn test_backtrack_restores_state() {
        let mut solution = PartialSolution::new();
        solution.derive(hosted_range("foo", "^1.0.0"), true, 0);
        solution.decide(hosted_id("foo", "1.2.0"));
        solution.derive(hosted_range("bar", "^1.0.0"), true, 1);
        solution.decide(hosted_id("bar", "1.0.0"));

        solution.backtrack(1);
        assert!(solution.decision("foo").is_some());
        assert!(solution.decision("bar").is_none());
        // bar's accumulated term survives only if assigned at level <= 1;
        // the derivation happened at level 1, so it is still known.
        assert_eq!(solution.unsatisfied().len(), 1);

        solution.backtrack(0);
        assert!(solution.decision("foo").is_none());
    }

    #[test]
    fn test_attempted_solutions_counts_backtracks() {
        let mut solution = PartialSolution::new();
        assert_eq!(solution.attempted_solutions(), 1);
        solution.decide(hosted_id("foo", "1.2.0"));
        solution.backtrack(0);
        solution.decide(hosted_id("foo", "1.1.0"));
        assert_eq!(solution.attempted_solutions(), 2);
    }

    #[test]
    fn test_satisfier_finds_earliest_sufficient_assignment() {
        let mut solution = PartialSolution::new();
        solution.derive(hosted_range("foo", ">=1.0.0"), true, 0);
        solution.derive(hosted_range("foo", "<2.0.0"), true, 1);

        // ">=1.0.0" alone satisfies ">=0.5.0", so the first assignment is
        // the satisfier.
        let satisfier = solution.satisfier(&Term::positive(hosted_range("foo", ">=0.5.0")));
        assert_eq!(satisfier.index, 0);

        // "^1.0.0" needs both bounds.
        let satisfier = solution.satisfier(&Term::positive(hosted_range("foo", ">=1.0.0 <2.0.0")));
        assert_eq!(satisfier.index, 1);
    }
}
