// src/solver/term.rs

//! Terms: signed package constraints.
//!
//! A positive term asserts that a package selection satisfying the range
//! must hold; a negative term asserts that it must not. Incompatibilities
//! are conjunctions of terms, and the partial solution accumulates terms per
//! package, so the solver needs a small set algebra over them: relation,
//! intersection, and difference.
//!
//! Two ranges with the same package name but different source descriptions
//! denote disjoint selection sets; the algebra below encodes that rule.

use std::fmt;

use crate::package::{Description, PackageRange};
use crate::version::VersionConstraint;

/// How the set allowed by one term relates to the set allowed by another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRelation {
    /// Every selection satisfying the first term satisfies the second.
    Subset,
    /// No selection satisfies both.
    Disjoint,
    /// Some selections satisfy both, some only one.
    Overlapping,
}

/// A signed package constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub package: PackageRange,
    pub positive: bool,
}

impl Term {
    pub fn positive(package: PackageRange) -> Self {
        Self {
            package,
            positive: true,
        }
    }

    pub fn negative(package: PackageRange) -> Self {
        Self {
            package,
            positive: false,
        }
    }

    pub fn inverse(&self) -> Term {
        Term {
            package: self.package.clone(),
            positive: !self.positive,
        }
    }

    fn constraint(&self) -> &VersionConstraint {
        &self.package.constraint
    }

    /// Whether both terms talk about the same package from the same source.
    fn compatible_package(&self, other: &PackageRange) -> bool {
        self.package.description == Description::Root
            || other.description == Description::Root
            || self.package.description == other.description
    }

    /// Whether every selection satisfying `self` also satisfies `other`.
    pub fn satisfies(&self, other: &Term) -> bool {
        self.package.name == other.package.name
            && self.relation(other) == SetRelation::Subset
    }

    /// The relation of `self`'s satisfying set to `other`'s. Both terms must
    /// name the same package.
    pub fn relation(&self, other: &Term) -> SetRelation {
        debug_assert_eq!(self.package.name, other.package.name);
        let own = self.constraint();
        let theirs = other.constraint();
        match (self.positive, other.positive) {
            (true, true) => {
                if !self.compatible_package(&other.package) {
                    SetRelation::Disjoint
                } else if theirs.allows_all(own) {
                    SetRelation::Subset
                } else if !own.allows_any(theirs) {
                    SetRelation::Disjoint
                } else {
                    SetRelation::Overlapping
                }
            }
            (false, true) => {
                if !self.compatible_package(&other.package) {
                    SetRelation::Overlapping
                } else if own.allows_all(theirs) {
                    SetRelation::Disjoint
                } else {
                    SetRelation::Overlapping
                }
            }
            (true, false) => {
                if !self.compatible_package(&other.package) {
                    SetRelation::Subset
                } else if !theirs.allows_any(own) {
                    SetRelation::Subset
                } else if theirs.allows_all(own) {
                    SetRelation::Disjoint
                } else {
                    SetRelation::Overlapping
                }
            }
            (false, false) => {
                if !self.compatible_package(&other.package) {
                    SetRelation::Overlapping
                } else if own.allows_all(theirs) {
                    SetRelation::Subset
                } else {
                    SetRelation::Overlapping
                }
            }
        }
    }

    /// The term satisfied by exactly the selections satisfying both input
    /// terms, or `None` when that set is not expressible as one term (both
    /// negative about different sources) or empty.
    pub fn intersect(&self, other: &Term) -> Option<Term> {
        debug_assert_eq!(self.package.name, other.package.name);
        if self.compatible_package(&other.package) {
            match (self.positive, other.positive) {
                (true, true) => self.non_empty(
                    self.constraint().intersect(other.constraint()),
                    true,
                ),
                (false, false) => self.non_empty(
                    self.constraint().union(other.constraint()),
                    false,
                ),
                _ => {
                    let (positive, negative) = if self.positive {
                        (self, other)
                    } else {
                        (other, self)
                    };
                    positive.non_empty(
                        positive.constraint().difference(negative.constraint()),
                        true,
                    )
                }
            }
        } else if self.positive != other.positive {
            // A positive selection from one source already excludes every
            // other source, so it subsumes the negative term.
            Some(if self.positive {
                self.clone()
            } else {
                other.clone()
            })
        } else {
            None
        }
    }

    /// Selections satisfying `self` but not `other`.
    pub fn difference(&self, other: &Term) -> Option<Term> {
        self.intersect(&other.inverse())
    }

    fn non_empty(&self, constraint: VersionConstraint, positive: bool) -> Option<Term> {
        if constraint.is_empty() {
            return None;
        }
        Some(Term {
            package: self.package.with_constraint(constraint),
            positive,
        })
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.positive {
            write!(f, "{}", self.package)
        } else {
            write!(f, "not {}", self.package)
        }
    }
}
