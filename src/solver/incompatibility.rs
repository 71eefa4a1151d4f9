// src/solver/incompatibility.rs

//! Incompatibilities: conjunctions of terms asserted never to hold jointly.
//!
//! Incompatibilities live in an arena owned by the solver and are referred
//! to by insertion-order ids; derived incompatibilities record the two ids
//! they were resolved from, forming the derivation DAG that failure
//! reporting walks.

use std::collections::HashMap;
use std::fmt;

use crate::package::Description;
use crate::solver::term::Term;
use crate::version::VersionConstraint;

/// Arena index of an incompatibility.
pub type IncompatId = usize;

/// Why an incompatibility exists.
#[derive(Debug, Clone)]
pub enum Cause {
    /// The root package must be selected.
    Root,
    /// A package version depends on another package.
    Dependency,
    /// No versions of a package satisfy a constraint.
    NoVersions,
    /// The package does not exist at its source.
    NotFound { reason: String },
    /// A package version requires an SDK the environment cannot provide.
    Sdk {
        sdk: String,
        constraint: VersionConstraint,
    },
    /// An externally supplied constraint, with its stated reason.
    Custom { reason: String },
    /// Derived during conflict resolution from two prior incompatibilities.
    Conflict { left: IncompatId, right: IncompatId },
}

/// A set of terms that cannot all be satisfied at once.
#[derive(Debug, Clone)]
pub struct Incompatibility {
    pub terms: Vec<Term>,
    pub cause: Cause,
}

impl Incompatibility {
    /// Build an incompatibility, coalescing terms that talk about the same
    /// package and source into a single term.
    pub fn new(terms: Vec<Term>, cause: Cause) -> Self {
        if terms.len() <= 1 {
            return Self { terms, cause };
        }
        let mut merged: Vec<Term> = Vec::with_capacity(terms.len());
        let mut index: HashMap<(String, Description), usize> = HashMap::new();
        for term in terms {
            let key = (term.package.name.clone(), term.package.description.clone());
            match index.get(&key) {
                Some(&at) => {
                    if let Some(combined) = merged[at].intersect(&term) {
                        merged[at] = combined;
                    }
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(term);
                }
            }
        }
        Self {
            terms: merged,
            cause,
        }
    }

    /// The terminal incompatibility: nothing at all can hold, or the root
    /// package itself cannot be selected.
    pub fn is_failure(&self) -> bool {
        self.terms.is_empty()
            || (self.terms.len() == 1
                && self.terms[0].positive
                && self.terms[0].package.description == Description::Root)
    }

    /// A short statement of what this incompatibility asserts.
    pub fn describe(&self) -> String {
        match &self.cause {
            Cause::Root => "version solving failed".to_string(),
            Cause::Dependency => {
                // Terms are [positive depender, negative dependency].
                let depender = &self.terms[0];
                match self.terms.get(1) {
                    Some(dependency) => format!(
                        "{} depends on {}",
                        depender.package, dependency.package
                    ),
                    None => format!("{} cannot be used", depender.package),
                }
            }
            Cause::NoVersions => format!(
                "no versions of {} match {}",
                self.terms[0].package.name, self.terms[0].package.constraint
            ),
            Cause::NotFound { reason } => {
                format!("{} doesn't exist ({reason})", self.terms[0].package.name)
            }
            Cause::Sdk { sdk, constraint } => format!(
                "{} requires the {sdk} SDK {constraint}",
                self.terms[0].package
            ),
            Cause::Custom { reason } => {
                format!("{} is not allowed ({reason})", self.terms[0].package)
            }
            Cause::Conflict { .. } => self.describe_derived(),
        }
    }

    fn describe_derived(&self) -> String {
        if self.is_failure() {
            return "version solving failed".to_string();
        }
        let positive: Vec<&Term> = self.terms.iter().filter(|t| t.positive).collect();
        let negative: Vec<&Term> = self.terms.iter().filter(|t| !t.positive).collect();
        match (positive.as_slice(), negative.as_slice()) {
            ([only], []) => format!("{} is forbidden", only.package),
            ([], [only]) => format!("{} is required", only.package),
            ([first], [second]) => format!(
                "{} requires {}",
                first.package, second.package
            ),
            ([first, rest @ ..], []) => {
                let mut out = format!("{}", first.package);
                for term in rest {
                    out.push_str(&format!(" is incompatible with {}", term.package));
                }
                out
            }
            _ => {
                let parts: Vec<String> =
                    self.terms.iter().map(|t| t.to_string()).collect();
                format!("one of {} must not hold", parts.join(", "))
            }
        }
    }
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
