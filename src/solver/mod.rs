// src/solver/mod.rs

//! The version solver.
//!
//! A conflict-driven solver in the PubGrub family: it maintains a partial
//! solution (an ordered list of decisions and derived terms) and a growing
//! arena of incompatibilities (term sets that can never hold jointly).
//! Unit propagation derives consequences of the current decisions; when an
//! incompatibility is fully satisfied, conflict resolution derives a new,
//! strictly more general incompatibility and backjumps. When every
//! positively-constrained package has a decision, the decisions are the
//! solution.
//!
//! The solver consults the previous lock file according to the
//! [`SolveType`] and unlock set, asks the [`SourceRegistry`] for version
//! listings and manifests, and never performs retries of its own: sources
//! either answer or fail the solve.

mod failure;
mod incompatibility;
mod partial_solution;
mod term;

pub use failure::SolveFailure;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::FetchError;
use crate::lockfile::{DependencyKind, LockFile, LockedPackage, DEFAULT_SDK};
use crate::manifest::Manifest;
use crate::package::{Description, PackageId, PackageRange, PackageRef};
use crate::source::SourceRegistry;
use crate::version::{Version, VersionConstraint};

use incompatibility::{Cause, IncompatId, Incompatibility};
use partial_solution::PartialSolution;
use term::{SetRelation, Term};

/// What the caller wants from the solve, which controls how the previous
/// lock file is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveType {
    /// Bring the project to a consistent state, preferring locked versions.
    Get,
    /// Move packages to the newest allowed versions.
    Upgrade,
    /// Move packages to the oldest allowed versions.
    Downgrade,
}

/// An extra constraint injected by a caller, with a human-readable reason
/// used in failure explanations.
#[derive(Debug, Clone)]
pub struct ConstraintAndCause {
    pub range: PackageRange,
    pub cause: String,
}

/// A successful resolution.
#[derive(Debug)]
pub struct SolveResult {
    /// The selected packages, sorted by name. Never contains the root.
    pub packages: Vec<PackageId>,
    /// Resolved manifest per selected package.
    pub manifests: BTreeMap<String, Manifest>,
    /// Versions that were available per package. For a package satisfied
    /// straight from the lock file this is just the pinned version; the
    /// full listing was never fetched.
    pub available_versions: BTreeMap<String, Vec<Version>>,
    /// How many solutions were attempted before the answer.
    pub attempted_solutions: u64,
    /// Wall-clock time the solve took.
    pub duration: Duration,
}

impl SolveResult {
    /// The id selected for `name`, if any.
    pub fn package(&self, name: &str) -> Option<&PackageId> {
        self.packages.iter().find(|id| id.name == name)
    }

    /// Build the lock file for this resolution: dependency kinds from the
    /// root manifest, SDK constraints intersected across all selected
    /// packages.
    pub fn lock_file(&self, root: &Manifest) -> LockFile {
        let mut lock = LockFile::empty();
        for id in &self.packages {
            let kind = if root.dependency_overrides.contains_key(&id.name) {
                DependencyKind::DirectOverridden
            } else if root.dependencies.contains_key(&id.name) {
                DependencyKind::DirectMain
            } else if root.dev_dependencies.contains_key(&id.name) {
                DependencyKind::DirectDev
            } else {
                DependencyKind::Transitive
            };
            lock.packages
                .insert(id.name.clone(), LockedPackage { id: id.clone(), kind });
        }

        let mut sdks: BTreeMap<String, VersionConstraint> = BTreeMap::new();
        sdks.insert(DEFAULT_SDK.to_string(), VersionConstraint::any());
        let environments = std::iter::once(&root.environment)
            .chain(self.manifests.values().map(|m| &m.environment));
        for environment in environments {
            for (sdk, constraint) in environment {
                let merged = match sdks.get(sdk) {
                    Some(existing) => existing.intersect(constraint),
                    None => constraint.clone(),
                };
                sdks.insert(sdk.clone(), merged);
            }
        }
        lock.sdks = sdks;
        lock
    }
}

/// Resolve the root manifest's dependency graph to concrete versions.
pub fn resolve_versions(
    solve_type: SolveType,
    registry: &SourceRegistry,
    root: &Manifest,
    lock: Option<&LockFile>,
    unlock: &[String],
    extra_constraints: Vec<ConstraintAndCause>,
) -> Result<SolveResult> {
    VersionSolver::new(solve_type, registry, root, lock, unlock, extra_constraints).solve()
}

/// The outcome of evaluating one incompatibility against the partial
/// solution.
enum Propagation {
    /// Irrelevant under the current assignments.
    None,
    /// Every term is satisfied.
    Conflict,
    /// Every term but one is satisfied; its negation was derived.
    Almost(String),
}

/// The candidate chosen (or not) for the next decision.
enum BestVersion {
    Chosen(PackageId),
    NoneAllowed,
    NotFound(String),
}

/// The cached result of listing a package's versions.
#[derive(Clone)]
enum Listing {
    Found(Arc<Vec<PackageId>>),
    NotFound(String),
}

struct VersionSolver<'a> {
    solve_type: SolveType,
    registry: &'a SourceRegistry,
    root: &'a Manifest,
    root_id: PackageId,
    lock: Option<&'a LockFile>,
    unlock: HashSet<String>,
    sdk_versions: BTreeMap<String, Version>,
    extra_constraints: Vec<ConstraintAndCause>,

    solution: PartialSolution,
    incompatibilities: Vec<Incompatibility>,
    by_package: HashMap<String, Vec<IncompatId>>,
    listings: HashMap<PackageRef, Listing>,
    manifest_cache: HashMap<(String, Version, Description), Manifest>,
}

impl<'a> VersionSolver<'a> {
    fn new(
        solve_type: SolveType,
        registry: &'a SourceRegistry,
        root: &'a Manifest,
        lock: Option<&'a LockFile>,
        unlock: &[String],
        extra_constraints: Vec<ConstraintAndCause>,
    ) -> Self {
        Self {
            solve_type,
            registry,
            root_id: PackageId::root(root.name.clone(), root.version_or_zero()),
            root,
            lock,
            unlock: unlock.iter().cloned().collect(),
            sdk_versions: registry.sdk_versions(),
            extra_constraints,
            solution: PartialSolution::new(),
            incompatibilities: Vec::new(),
            by_package: HashMap::new(),
            listings: HashMap::new(),
            manifest_cache: HashMap::new(),
        }
    }

    fn solve(mut self) -> Result<SolveResult> {
        let started = Instant::now();
        debug!(
            "resolving {} ({:?}, {} unlocked)",
            self.root.name,
            self.solve_type,
            self.unlock.len()
        );

        let root_range = PackageRange::root(&self.root.name, &self.root_id.version);
        self.add_incompatibility(Incompatibility::new(
            vec![Term::negative(root_range)],
            Cause::Root,
        ));
        for constraint in std::mem::take(&mut self.extra_constraints) {
            // Forbid selecting the package outside the allowed set.
            let outside = VersionConstraint::any().difference(&constraint.range.constraint);
            self.add_incompatibility(Incompatibility::new(
                vec![Term::positive(constraint.range.with_constraint(outside))],
                Cause::Custom {
                    reason: constraint.cause,
                },
            ));
        }

        let mut next = Some(self.root.name.clone());
        while let Some(package) = next {
            self.propagate(package)?;
            next = self.choose_package_version()?;
        }

        self.result(started.elapsed())
    }

    fn result(&mut self, duration: Duration) -> Result<SolveResult> {
        let mut ids: Vec<PackageId> = self
            .solution
            .decisions()
            .values()
            .filter(|id| !id.is_root())
            .cloned()
            .collect();
        ids.sort_by(|a, b| a.name.cmp(&b.name));

        let mut manifests = BTreeMap::new();
        let mut available_versions = BTreeMap::new();
        for id in &ids {
            manifests.insert(id.name.clone(), self.manifest_for(id)?);
            let versions = match self.listings.get(&id.to_ref()) {
                Some(Listing::Found(listing)) => {
                    listing.iter().map(|id| id.version.clone()).collect()
                }
                // Locked and never unlocked: the listing was never fetched.
                _ => vec![id.version.clone()],
            };
            available_versions.insert(id.name.clone(), versions);
        }

        debug!(
            "resolved {} packages in {:?} ({} attempted solutions)",
            ids.len(),
            duration,
            self.solution.attempted_solutions()
        );
        Ok(SolveResult {
            packages: ids,
            manifests,
            available_versions,
            attempted_solutions: self.solution.attempted_solutions(),
            duration,
        })
    }

    fn add_incompatibility(&mut self, incompatibility: Incompatibility) -> IncompatId {
        let id = self.push_unindexed(incompatibility);
        for term in &self.incompatibilities[id].terms {
            self.by_package
                .entry(term.package.name.clone())
                .or_default()
                .push(id);
        }
        id
    }

    /// Add to the arena without indexing; intermediate products of conflict
    /// resolution stay out of propagation but remain addressable for the
    /// derivation DAG.
    fn push_unindexed(&mut self, incompatibility: Incompatibility) -> IncompatId {
        self.incompatibilities.push(incompatibility);
        self.incompatibilities.len() - 1
    }

    /// Unit propagation from `package` until a fixpoint.
    fn propagate(&mut self, package: String) -> Result<()> {
        let mut changed: Vec<String> = vec![package];
        while let Some(name) = changed.pop() {
            let ids: Vec<IncompatId> = self.by_package.get(&name).cloned().unwrap_or_default();
            // Newer incompatibilities tend to be more specific; visiting
            // them first finds conflicts sooner.
            for &id in ids.iter().rev() {
                match self.propagate_incompatibility(id) {
                    Propagation::None => {}
                    Propagation::Almost(derived) => changed.push(derived),
                    Propagation::Conflict => {
                        let root_cause = self.resolve_conflict(id)?;
                        changed.clear();
                        match self.propagate_incompatibility(root_cause) {
                            Propagation::Almost(derived) => changed.push(derived),
                            _ => unreachable!(
                                "the incompatibility produced by conflict resolution \
                                 always derives a term after backjumping"
                            ),
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn propagate_incompatibility(&mut self, id: IncompatId) -> Propagation {
        let incompatibility = self.incompatibilities[id].clone();
        let mut unsatisfied: Option<&Term> = None;
        for term in &incompatibility.terms {
            match self.solution.relation(term) {
                SetRelation::Disjoint => return Propagation::None,
                SetRelation::Overlapping => {
                    if unsatisfied.is_some() {
                        return Propagation::None;
                    }
                    unsatisfied = Some(term);
                }
                SetRelation::Subset => {}
            }
        }
        match unsatisfied {
            None => Propagation::Conflict,
            Some(term) => {
                debug!("derived: {}", term.inverse());
                self.solution
                    .derive(term.package.clone(), !term.positive, id);
                Propagation::Almost(term.package.name.clone())
            }
        }
    }

    /// Conflict-driven learning: combine the conflicting incompatibility
    /// with the causes of its satisfiers until the result pins a decision,
    /// then backjump to just before that decision.
    fn resolve_conflict(&mut self, mut id: IncompatId) -> Result<IncompatId> {
        debug!("conflict: {}", self.incompatibilities[id]);
        let mut derived = false;
        while !self.incompatibilities[id].is_failure() {
            let incompatibility = self.incompatibilities[id].clone();

            let mut most_recent_term: Option<Term> = None;
            let mut most_recent_satisfier: Option<partial_solution::Assignment> = None;
            let mut difference: Option<Term> = None;
            // Level 1 keeps the root decision out of reach of backjumps.
            let mut previous_level = 1usize;

            for term in &incompatibility.terms {
                let satisfier = self.solution.satisfier(term);
                match &most_recent_satisfier {
                    None => {
                        most_recent_term = Some(term.clone());
                        most_recent_satisfier = Some(satisfier);
                    }
                    Some(current) if current.index < satisfier.index => {
                        previous_level = previous_level.max(current.decision_level);
                        most_recent_term = Some(term.clone());
                        most_recent_satisfier = Some(satisfier);
                        difference = None;
                    }
                    Some(_) => {
                        previous_level = previous_level.max(satisfier.decision_level);
                    }
                }
                if most_recent_term.as_ref() == Some(term) {
                    // The satisfier may only partially satisfy the term; the
                    // leftover slice behaves like an extra term.
                    let satisfier = most_recent_satisfier
                        .as_ref()
                        .expect("assigned in this iteration");
                    difference = satisfier.term.difference(term);
                    if let Some(diff) = &difference {
                        previous_level = previous_level
                            .max(self.solution.satisfier(&diff.inverse()).decision_level);
                    }
                }
            }

            let satisfier = most_recent_satisfier.expect("a conflict always has terms");
            if satisfier.is_decision() || previous_level < satisfier.decision_level {
                debug!("backjumping to level {previous_level}");
                self.solution.backtrack(previous_level);
                if derived {
                    // Index the learned incompatibility so propagation
                    // sees it from now on.
                    let learned = self.incompatibilities[id].clone();
                    for term in &learned.terms {
                        self.by_package
                            .entry(term.package.name.clone())
                            .or_default()
                            .push(id);
                    }
                }
                return Ok(id);
            }

            let cause = satisfier
                .cause
                .expect("non-decisions always record their cause");
            let most_recent_term = most_recent_term.expect("assigned with the satisfier");
            let mut new_terms: Vec<Term> = incompatibility
                .terms
                .iter()
                .filter(|t| **t != most_recent_term)
                .cloned()
                .collect();
            new_terms.extend(
                self.incompatibilities[cause]
                    .terms
                    .iter()
                    .filter(|t| t.package != satisfier.term.package)
                    .cloned(),
            );
            if let Some(diff) = difference {
                new_terms.push(diff.inverse());
            }
            id = self.push_unindexed(Incompatibility::new(
                new_terms,
                Cause::Conflict { left: id, right: cause },
            ));
            derived = true;
        }

        Err(Error::Resolution(SolveFailure::new(
            self.incompatibilities.clone(),
            id,
        )))
    }

    /// Pick the next package to decide and decide it (or record why it
    /// cannot be decided). Returns the package touched, or `None` when the
    /// solution is complete.
    fn choose_package_version(&mut self) -> Result<Option<String>> {
        let unsatisfied = self.solution.unsatisfied();
        if unsatisfied.is_empty() {
            return Ok(None);
        }

        // Decide the tightest package first: fewest matching versions, ties
        // broken alphabetically (the list is name-sorted).
        let mut best: Option<(usize, PackageRange)> = None;
        for range in unsatisfied {
            let count = self.version_count(&range)?;
            if best.as_ref().map_or(true, |(c, _)| count < *c) {
                best = Some((count, range));
            }
        }
        let (_, package) = best.expect("unsatisfied was non-empty");
        let name = package.name.clone();

        match self.best_version(&package)? {
            BestVersion::NotFound(reason) => {
                debug!("{name} not found: {reason}");
                self.add_incompatibility(Incompatibility::new(
                    vec![Term::positive(package)],
                    Cause::NotFound { reason },
                ));
            }
            BestVersion::NoneAllowed => {
                debug!("no versions of {package} available");
                self.add_incompatibility(Incompatibility::new(
                    vec![Term::positive(package)],
                    Cause::NoVersions,
                ));
            }
            BestVersion::Chosen(id) => {
                let incompatibilities = self.incompatibilities_for(&id)?;
                let mut conflict = false;
                for incompatibility in incompatibilities {
                    // Deciding this version would immediately violate an
                    // already-satisfied incompatibility; register the facts
                    // but let propagation rule the version out instead.
                    let satisfied = incompatibility
                        .terms
                        .iter()
                        .all(|t| t.package.name == name || self.solution.satisfies(t));
                    self.add_incompatibility(incompatibility);
                    conflict = conflict || satisfied;
                }
                if !conflict {
                    debug!("selecting {id}");
                    self.solution.decide(id);
                }
            }
        }
        Ok(Some(name))
    }

    /// How many versions could satisfy `range`, for decision ordering.
    fn version_count(&mut self, range: &PackageRange) -> Result<usize> {
        if range.description == Description::Root {
            return Ok(1);
        }
        if let Some(locked) = self.locked_id(&range.name) {
            if range.allows(&locked) {
                return Ok(1);
            }
        }
        match self.versions_for(&range.to_ref())? {
            Listing::NotFound(_) => Ok(0),
            Listing::Found(versions) => Ok(versions
                .iter()
                .filter(|id| range.constraint.allows(&id.version))
                .count()),
        }
    }

    /// The version to decide for `range`: the locked version when usable,
    /// otherwise the newest (or oldest, for downgrades) allowed version.
    fn best_version(&mut self, range: &PackageRange) -> Result<BestVersion> {
        if range.description == Description::Root {
            return Ok(BestVersion::Chosen(self.root_id.clone()));
        }

        if let Some(locked) = self.locked_id(&range.name) {
            if range.allows(&locked) {
                debug!("using locked version {locked}");
                return Ok(BestVersion::Chosen(locked));
            }
        }

        match self.versions_for(&range.to_ref())? {
            Listing::NotFound(reason) => Ok(BestVersion::NotFound(reason)),
            Listing::Found(versions) => {
                let mut allowed = versions
                    .iter()
                    .filter(|id| range.constraint.allows(&id.version));
                let chosen = match self.solve_type {
                    SolveType::Downgrade => allowed.next(),
                    _ => allowed.last(),
                };
                Ok(match chosen {
                    Some(id) => BestVersion::Chosen(id.clone()),
                    None => BestVersion::NoneAllowed,
                })
            }
        }
    }

    /// The locked id for `name`, when the solve mode says the lock applies.
    fn locked_id(&self, name: &str) -> Option<PackageId> {
        let lock = self.lock?;
        let use_lock = if self.unlock.is_empty() {
            self.solve_type == SolveType::Get
        } else {
            !self.unlock.contains(name)
        };
        if use_lock {
            lock.package(name).cloned()
        } else {
            None
        }
    }

    /// List versions through the registry, once per reference, converting
    /// missing-package failures into data for the solver.
    fn versions_for(&mut self, package: &PackageRef) -> Result<Listing> {
        if let Some(listing) = self.listings.get(package) {
            return Ok(listing.clone());
        }
        let listing = match self.registry.list_versions(package) {
            Ok(ids) => Listing::Found(Arc::new(ids)),
            Err(Error::Fetch(FetchError::Response {
                status: 404,
                message,
                ..
            })) => Listing::NotFound(if message.is_empty() {
                "the registry has no package by that name".to_string()
            } else {
                message
            }),
            Err(Error::Data(message)) => Listing::NotFound(message),
            Err(other) => return Err(other),
        };
        self.listings.insert(package.clone(), listing.clone());
        Ok(listing)
    }

    /// The manifest of a concrete version, cached per id.
    fn manifest_for(&mut self, id: &PackageId) -> Result<Manifest> {
        if id.is_root() {
            return Ok(self.root.clone());
        }
        let key = (id.name.clone(), id.version.clone(), id.description.description());
        if let Some(manifest) = self.manifest_cache.get(&key) {
            return Ok(manifest.clone());
        }
        let manifest = self.registry.describe(id)?;
        self.manifest_cache.insert(key, manifest.clone());
        Ok(manifest)
    }

    /// The incompatibilities a selected version brings in: one per
    /// dependency, plus one per unsatisfiable SDK requirement.
    fn incompatibilities_for(&mut self, id: &PackageId) -> Result<Vec<Incompatibility>> {
        let manifest = self.manifest_for(id)?;
        let this_version = if id.is_root() {
            PackageRange::root(&self.root.name, &id.version)
        } else {
            id.as_range()
        };

        let mut out = Vec::new();
        for (sdk, constraint) in &manifest.environment {
            let satisfied = self
                .sdk_versions
                .get(sdk)
                .map_or(false, |installed| constraint.allows(installed));
            if !satisfied {
                out.push(Incompatibility::new(
                    vec![Term::positive(this_version.clone())],
                    Cause::Sdk {
                        sdk: sdk.clone(),
                        constraint: constraint.clone(),
                    },
                ));
            }
        }

        let dependencies = if id.is_root() {
            manifest.effective_dependencies(true)
        } else {
            manifest.dependencies.clone()
        };
        for (dep_name, dep_range) in dependencies {
            // Overrides in the root manifest replace whatever constraints
            // other packages place on the overridden name.
            if !id.is_root() && self.root.dependency_overrides.contains_key(&dep_name) {
                continue;
            }
            if dep_name == self.root.name {
                // A dependency back onto the containing package.
                if dep_range.constraint.allows(&self.root_id.version) {
                    continue;
                }
                out.push(Incompatibility::new(
                    vec![Term::positive(this_version.clone())],
                    Cause::Custom {
                        reason: format!(
                            "{} requires {} {} but this is version {}",
                            this_version, dep_name, dep_range.constraint, self.root_id.version
                        ),
                    },
                ));
                continue;
            }
            out.push(Incompatibility::new(
                vec![
                    Term::positive(this_version.clone()),
                    Term::negative(dep_range),
                ],
                Cause::Dependency,
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::ResolvedDescription;

    /// Quick constructor for the widening/lock plumbing below.
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
    fn test_lock_file_kinds_and_default_sdk() {
        let root = Manifest::parse(
            "name: app\ndependencies:\n  foo: ^1.0.0\ndev_dependencies:\n  lint: ^2.0.0\n",
            None,
            "https://packages.test",
        )
        .unwrap();
        let result = SolveResult {
            packages: vec![
                hosted_id("foo", "1.2.0"),
                hosted_id("lint", "2.1.0"),
                hosted_id("transitive_dep", "0.4.0"),
            ],
            manifests: BTreeMap::new(),
            available_versions: BTreeMap::new(),
            attempted_solutions: 1,
            duration: Duration::from_millis(1),
        };
        let lock = result.lock_file(&root);
        assert_eq!(lock.packages["foo"].kind, DependencyKind::DirectMain);
        assert_eq!(lock.packages["lint"].kind, DependencyKind::DirectDev);
        assert_eq!(
            lock.packages["transitive_dep"].kind,
            DependencyKind::Transitive
        );
        assert!(lock.sdks[DEFAULT_SDK].is_any());
    }

    #[test]
    fn test_lock_file_intersects_sdk_constraints() {
        let root = Manifest::parse(
            "name: app\nenvironment:\n  keel: \">=2.0.0 <4.0.0\"\n",
            None,
            "https://packages.test",
        )
        .unwrap();
        let dep_manifest = Manifest::parse(
            "name: foo\nenvironment:\n  keel: \">=2.5.0 <3.0.0\"\n",
            None,
            "https://packages.test",
        )
        .unwrap();
        let mut manifests = BTreeMap::new();
        manifests.insert("foo".to_string(), dep_manifest);
        let result = SolveResult {
            packages: vec![hosted_id("foo", "1.0.0")],
            manifests,
            available_versions: BTreeMap::new(),
            attempted_solutions: 1,
            duration: Duration::from_millis(1),
        };
        let lock = result.lock_file(&root);
        let sdk = &lock.sdks[DEFAULT_SDK];
        assert!(sdk.allows(&Version::new(2, 6, 0)));
        assert!(!sdk.allows(&Version::new(2, 1, 0)));
        assert!(!sdk.allows(&Version::new(3, 1, 0)));
    }
}
