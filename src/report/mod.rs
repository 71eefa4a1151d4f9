// src/report/mod.rs

//! Machine-driven upgrade planning.
//!
//! Given the current manifest and lock file, the reporter classifies what
//! an upgrade could look like by re-running the solver under perturbed
//! inputs:
//!
//! - [`DependencyReporter::compatible`]: newest versions the current
//!   constraints already allow.
//! - [`DependencyReporter::single_breaking`]: one dependency allowed to
//!   cross its upper bound, everything else held by the lock.
//! - [`DependencyReporter::multi_breaking`]: every direct dependency
//!   allowed to cross its upper bound.
//! - [`DependencyReporter::smallest_update`]: the smallest move that
//!   satisfies externally imposed constraints (e.g. a security floor),
//!   computed with a downgrade solve over `>= current` windows.
//!
//! Each plan is a list of [`PackageChange`] records, including entries for
//! packages the new resolution removed.

use serde::Serialize;

use crate::error::Result;
use crate::lockfile::{DependencyKind, LockFile};
use crate::manifest::Manifest;
use crate::package::{PackageId, PackageRange, SourceKind};
use crate::solver::{resolve_versions, ConstraintAndCause, SolveResult, SolveType};
use crate::source::SourceRegistry;
use crate::version::{Version, VersionConstraint, VersionExt};

/// One package's movement in a computed upgrade plan.
#[derive(Debug, Clone, Serialize)]
pub struct PackageChange {
    pub name: String,
    /// The version the plan selects; `None` when the plan removes the
    /// package.
    pub version: Option<Version>,
    pub kind: Option<DependencyKind>,
    pub source: Option<SourceKind>,
    /// The manifest constraint bumped to the new version's caret window.
    pub constraint_bumped: Option<VersionConstraint>,
    /// The manifest constraint widened just enough to admit the new
    /// version.
    pub constraint_widened: Option<VersionConstraint>,
    /// The original constraint when it already admits the new version,
    /// otherwise the bumped form.
    pub constraint_bumped_if_needed: Option<VersionConstraint>,
    pub previous_version: Option<Version>,
    pub previous_constraint: Option<VersionConstraint>,
    pub previous_source: Option<SourceKind>,
}

/// Computes upgrade plans against one manifest/lock pair.
pub struct DependencyReporter<'a> {
    registry: &'a SourceRegistry,
    root: &'a Manifest,
    lock: &'a LockFile,
}

impl<'a> DependencyReporter<'a> {
    pub fn new(registry: &'a SourceRegistry, root: &'a Manifest, lock: &'a LockFile) -> Self {
        Self {
            registry,
            root,
            lock,
        }
    }

    /// Upgrades the current constraints already allow.
    pub fn compatible(&self) -> Result<Vec<PackageChange>> {
        let result = resolve_versions(
            SolveType::Upgrade,
            self.registry,
            self.root,
            Some(self.lock),
            &[],
            Vec::new(),
        )?;
        Ok(self.changes_for(&result, UpgradeClass::Compatible))
    }

    /// The plan when `package` alone may cross its upper bound.
    pub fn single_breaking(&self, package: &str) -> Result<Vec<PackageChange>> {
        let relaxed = self.with_stripped_bounds(|name| name == package);
        let unlock = [package.to_string()];
        let result = resolve_versions(
            SolveType::Get,
            self.registry,
            &relaxed,
            Some(self.lock),
            &unlock,
            Vec::new(),
        )?;
        Ok(self.changes_for(&result, UpgradeClass::Breaking))
    }

    /// The plan when every direct dependency may cross its upper bound.
    pub fn multi_breaking(&self) -> Result<Vec<PackageChange>> {
        let relaxed = self.with_stripped_bounds(|_| true);
        let unlock: Vec<String> = self.direct_dependency_names();
        let result = resolve_versions(
            SolveType::Get,
            self.registry,
            &relaxed,
            Some(self.lock),
            &unlock,
            Vec::new(),
        )?;
        Ok(self.changes_for(&result, UpgradeClass::Breaking))
    }

    /// The smallest move that satisfies `constraints` (typically a floor
    /// that disallows a vulnerable pinned version): every direct dependency
    /// is opened to `>= current` and the solver runs in downgrade mode, so
    /// it settles on the lowest versions that satisfy the new facts.
    pub fn smallest_update(
        &self,
        constraints: Vec<ConstraintAndCause>,
    ) -> Result<Vec<PackageChange>> {
        let mut floored = self.root.clone();
        for deps in [&mut floored.dependencies, &mut floored.dev_dependencies] {
            for (name, range) in deps.iter_mut() {
                if let Some(current) = self.lock.package(name) {
                    *range = range.with_constraint(VersionConstraint::range(
                        Some(current.version.clone()),
                        None,
                        true,
                        false,
                    ));
                }
            }
        }
        let result = resolve_versions(
            SolveType::Downgrade,
            self.registry,
            &floored,
            Some(self.lock),
            &[],
            constraints,
        )?;
        Ok(self.changes_for(&result, UpgradeClass::Breaking))
    }

    /// Direct dependency names (regular and dev) of the root manifest.
    fn direct_dependency_names(&self) -> Vec<String> {
        self.root
            .dependencies
            .keys()
            .chain(self.root.dev_dependencies.keys())
            .cloned()
            .collect()
    }

    /// The root manifest with upper bounds stripped from the direct
    /// dependencies selected by `which`.
    fn with_stripped_bounds(&self, which: impl Fn(&str) -> bool) -> Manifest {
        let mut relaxed = self.root.clone();
        for deps in [&mut relaxed.dependencies, &mut relaxed.dev_dependencies] {
            for (name, range) in deps.iter_mut() {
                if which(name) {
                    *range = range.with_constraint(range.constraint.strip_upper());
                }
            }
        }
        relaxed
    }

    /// Records for every package the new resolution moved, added, or
    /// removed, compared to the lock file.
    fn changes_for(&self, result: &SolveResult, class: UpgradeClass) -> Vec<PackageChange> {
        let mut changes = Vec::new();

        for id in &result.packages {
            let previous = self.lock.package(&id.name);
            if previous.map_or(false, |prev| prev.same_resolution(id)) {
                continue;
            }
            changes.push(self.change_record(id, previous, class));
        }

        // Packages the resolution no longer needs at all.
        for (name, locked) in &self.lock.packages {
            if result.package(name).is_none() {
                changes.push(PackageChange {
                    name: name.clone(),
                    version: None,
                    kind: Some(locked.kind),
                    source: None,
                    constraint_bumped: None,
                    constraint_widened: None,
                    constraint_bumped_if_needed: None,
                    previous_version: Some(locked.id.version.clone()),
                    previous_constraint: self.declared_constraint(name),
                    previous_source: Some(locked.id.description.kind()),
                });
            }
        }

        changes.sort_by(|a, b| a.name.cmp(&b.name));
        changes
    }

    fn change_record(
        &self,
        id: &PackageId,
        previous: Option<&PackageId>,
        class: UpgradeClass,
    ) -> PackageChange {
        let declared = self.declared_constraint(&id.name);
        let (bumped, widened, bumped_if_needed) = match &declared {
            None => (None, None, None),
            Some(original) => {
                let bumped = match class {
                    UpgradeClass::Compatible => {
                        // A compatible plan should never move a package
                        // outside its declared constraint.
                        debug_assert!(original.allows(&id.version));
                        if original.allows(&id.version) {
                            original.clone()
                        } else {
                            VersionConstraint::compatible_with(&id.version)
                        }
                    }
                    UpgradeClass::Breaking => {
                        VersionConstraint::compatible_with(&id.version)
                    }
                };
                let bumped_if_needed = if original.allows(&id.version) {
                    original.clone()
                } else {
                    VersionConstraint::compatible_with(&id.version)
                };
                (
                    Some(bumped),
                    Some(widen_constraint(original, &id.version)),
                    Some(bumped_if_needed),
                )
            }
        };

        PackageChange {
            name: id.name.clone(),
            version: Some(id.version.clone()),
            kind: Some(self.dependency_kind(&id.name)),
            source: Some(id.description.kind()),
            constraint_bumped: bumped,
            constraint_widened: widened,
            constraint_bumped_if_needed: bumped_if_needed,
            previous_version: previous.map(|id| id.version.clone()),
            previous_constraint: declared,
            previous_source: previous.map(|id| id.description.kind()),
        }
    }

    /// The constraint the root manifest declares for `name`, if it is a
    /// direct dependency.
    fn declared_constraint(&self, name: &str) -> Option<VersionConstraint> {
        direct_range(self.root, name).map(|range| range.constraint.clone())
    }

    fn dependency_kind(&self, name: &str) -> DependencyKind {
        if self.root.dependency_overrides.contains_key(name) {
            DependencyKind::DirectOverridden
        } else if self.root.dependencies.contains_key(name) {
            DependencyKind::DirectMain
        } else if self.root.dev_dependencies.contains_key(name) {
            DependencyKind::DirectDev
        } else {
            DependencyKind::Transitive
        }
    }
}

/// The [`PackageRange`] the root manifest declares for `name` as a direct
/// (regular or dev) dependency, if any.
fn direct_range<'a>(root: &'a Manifest, name: &str) -> Option<&'a PackageRange> {
    root.dependencies
        .get(name)
        .or_else(|| root.dev_dependencies.get(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradeClass {
    Compatible,
    Breaking,
}

/// Widen `original` just enough to admit `version`.
///
/// A version above the current window extends the upper bound to the
/// version's next breaking boundary; one below extends the lower bound down
/// to the version itself. When the result collapses to a single caret
/// window it is exactly `compatible_with` of its own minimum.
pub fn widen_constraint(original: &VersionConstraint, version: &Version) -> VersionConstraint {
    if original.allows(version) {
        return original.clone();
    }
    let min = original.min().map(|(v, inclusive)| (v.clone(), inclusive));
    let max = original.max().map(|(v, inclusive)| (v.clone(), inclusive));

    if let Some((bound, _)) = &max {
        if version >= bound {
            let upper = version.next_breaking().first_pre_release();
            let (lower, inclusive) = match min {
                Some((v, inclusive)) => (Some(v), inclusive),
                None => (None, false),
            };
            return VersionConstraint::range(lower, Some(upper), inclusive, false);
        }
    }
    if let Some((bound, _)) = &min {
        if version <= bound {
            let (upper, inclusive) = match max {
                Some((v, inclusive)) => (Some(v), inclusive),
                None => (None, false),
            };
            return VersionConstraint::range(
                Some(version.clone()),
                upper,
                true,
                inclusive,
            );
        }
    }
    // Inside a gap of a union, or an unbounded original: fall back to
    // admitting the version's own window alongside the original.
    original.union(&VersionConstraint::compatible_with(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::LockedPackage;
    use crate::package::ResolvedDescription;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    fn hosted_id(name: &str, version: &str) -> PackageId {
        PackageId::new(
            name,
            v(version),
            ResolvedDescription::Hosted {
                name: name.to_string(),
                url: "https://packages.test".to_string(),
                sha256: None,
            },
        )
    }

    fn lock_with(ids: &[PackageId]) -> LockFile {
        let mut lock = LockFile::empty();
        for id in ids {
            lock.packages.insert(
                id.name.clone(),
                LockedPackage {
                    id: id.clone(),
                    kind: DependencyKind::DirectMain,
                },
            );
        }
        lock
    }

    fn result_with(ids: Vec<PackageId>) -> SolveResult {
        SolveResult {
            packages: ids,
            manifests: BTreeMap::new(),
            available_versions: BTreeMap::new(),
            attempted_solutions: 1,
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_widen_noop_when_allowed() {
        assert_eq!(widen_constraint(&c("^1.0.0"), &v("1.5.0")), c("^1.0.0"));
    }

    #[test]
    fn test_widen_upward() {
        let widened = widen_constraint(&c("^1.0.0"), &v("2.3.0"));
        assert!(widened.allows(&v("1.0.0")));
        assert!(widened.allows(&v("2.3.0")));
        assert!(widened.allows(&v("2.9.0")));
        assert!(!widened.allows(&v("3.0.0")));
    }

    #[test]
    fn test_widen_upward_one_tick_equals_caret() {
        // ^1.0.0 widened to admit 1.x stays ^1.0.0; widened to admit 2.0.0
        // becomes the [1.0.0, 3.0.0) window.
        let widened = widen_constraint(&c(">=1.0.0 <2.0.0"), &v("2.0.0"));
        assert_eq!(widened, c(">=1.0.0 <3.0.0-0"));
    }

    #[test]
    fn test_widen_downward() {
        let widened = widen_constraint(&c(">=2.0.0 <3.0.0"), &v("1.4.0"));
        assert!(widened.allows(&v("1.4.0")));
        assert!(widened.allows(&v("2.5.0")));
        assert!(!widened.allows(&v("1.3.0")));
        assert!(!widened.allows(&v("3.0.0")));
    }

    #[test]
    fn test_changes_skip_unchanged_and_report_removed() {
        let root = Manifest::parse(
            "name: app\ndependencies:\n  foo: ^1.0.0\n  gone: ^1.0.0\n",
            None,
            "https://packages.test",
        )
        .unwrap();
        let registry = SourceRegistry::offline(tempfile::tempdir().unwrap().into_path());
        let lock = lock_with(&[
            hosted_id("foo", "1.0.0"),
            hosted_id("same", "2.0.0"),
            hosted_id("gone", "1.0.0"),
        ]);
        let reporter = DependencyReporter::new(&registry, &root, &lock);

        let result = result_with(vec![hosted_id("foo", "1.2.0"), hosted_id("same", "2.0.0")]);
        let changes = reporter.changes_for(&result, UpgradeClass::Compatible);

        let names: Vec<&str> = changes.iter().map(|change| change.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "gone"]);

        let foo = &changes[0];
        assert_eq!(foo.version, Some(v("1.2.0")));
        assert_eq!(foo.previous_version, Some(v("1.0.0")));
        assert_eq!(foo.constraint_bumped_if_needed, Some(c("^1.0.0")));

        let gone = &changes[1];
        assert_eq!(gone.version, None);
        assert_eq!(gone.previous_version, Some(v("1.0.0")));
        assert_eq!(gone.previous_source, Some(SourceKind::Hosted));
    }

    #[test]
    fn test_breaking_change_bumps_constraint() {
        let root = Manifest::parse(
            "name: app\ndependencies:\n  foo: ^1.0.0\n",
            None,
            "https://packages.test",
        )
        .unwrap();
        let registry = SourceRegistry::offline(tempfile::tempdir().unwrap().into_path());
        let lock = lock_with(&[hosted_id("foo", "1.0.0")]);
        let reporter = DependencyReporter::new(&registry, &root, &lock);

        let result = result_with(vec![hosted_id("foo", "2.1.0")]);
        let changes = reporter.changes_for(&result, UpgradeClass::Breaking);
        let foo = &changes[0];
        assert_eq!(foo.constraint_bumped, Some(c("^2.1.0")));
        assert_eq!(foo.constraint_bumped_if_needed, Some(c("^2.1.0")));
        let widened = foo.constraint_widened.as_ref().unwrap();
        assert!(widened.allows(&v("1.0.0")));
        assert!(widened.allows(&v("2.1.0")));
        assert!(!widened.allows(&v("3.0.0")));
    }
}
