// src/version/mod.rs

//! Version and constraint algebra for package dependencies.
//!
//! Versions are semver 2.0 ([`semver::Version`]): a `major.minor.patch`
//! triple plus optional pre-release and build metadata, ordered by semver
//! precedence. Constraints are unions of disjoint [`VersionRange`]s closed
//! under intersection, union, and difference.
//!
//! Pre-release semantics follow the ecosystem convention: a version with a
//! pre-release tag is excluded from a range unless one of the range's bounds
//! is itself a pre-release of the same `(major, minor, patch)`, or the range
//! was built to include pre-releases.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use semver::Version;

/// Error produced when a version or constraint string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version \"{input}\": {reason}")]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

/// Parse a semver version string, mapping errors into [`VersionParseError`].
pub fn parse_version(s: &str) -> Result<Version, VersionParseError> {
    Version::parse(s.trim()).map_err(|e| VersionParseError {
        input: s.to_string(),
        reason: e.to_string(),
    })
}

/// Extension operations on [`Version`] used by the constraint algebra.
pub trait VersionExt {
    /// The next version that is considered a breaking change.
    ///
    /// `major > 0` bumps major; else `minor > 0` bumps minor; else bumps
    /// patch. `1.2.3 -> 2.0.0`, `0.2.3 -> 0.3.0`, `0.0.3 -> 0.0.4`.
    fn next_breaking(&self) -> Version;

    /// The smallest pre-release of this version: `1.2.3 -> 1.2.3-0`.
    fn first_pre_release(&self) -> Version;

    /// Whether this version carries a pre-release tag.
    fn is_pre_release(&self) -> bool;

    /// Whether `other` has the same `(major, minor, patch)` triple.
    fn same_core(&self, other: &Version) -> bool;
}

impl VersionExt for Version {
    fn next_breaking(&self) -> Version {
        if self.major > 0 {
            Version::new(self.major + 1, 0, 0)
        } else if self.minor > 0 {
            Version::new(0, self.minor + 1, 0)
        } else {
            Version::new(0, 0, self.patch + 1)
        }
    }

    fn first_pre_release(&self) -> Version {
        let mut v = Version::new(self.major, self.minor, self.patch);
        v.pre = semver::Prerelease::new("0").expect("\"0\" is a valid pre-release tag");
        v
    }

    fn is_pre_release(&self) -> bool {
        !self.pre.is_empty()
    }

    fn same_core(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor && self.patch == other.patch
    }
}

/// A contiguous range of versions with optional bounds.
///
/// `min`/`max` are `None` for unbounded ends. `include_min`/`include_max`
/// select inclusive vs. exclusive bounds. `include_pre_releases` disables
/// the pre-release exclusion rule for this range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Option<Version>,
    pub max: Option<Version>,
    pub include_min: bool,
    pub include_max: bool,
    include_pre_releases: bool,
}

impl VersionRange {
    /// A range with the given bounds, or `None` if the bounds describe an
    /// empty set.
    pub fn new(
        min: Option<Version>,
        max: Option<Version>,
        include_min: bool,
        include_max: bool,
    ) -> Option<Self> {
        if let (Some(lo), Some(hi)) = (&min, &max) {
            match lo.cmp(hi) {
                Ordering::Greater => return None,
                Ordering::Equal if !(include_min && include_max) => return None,
                _ => {}
            }
        }
        Some(Self {
            min,
            max,
            include_min,
            include_max,
            include_pre_releases: false,
        })
    }

    /// The unbounded range.
    pub fn any() -> Self {
        Self {
            min: None,
            max: None,
            include_min: false,
            include_max: false,
            include_pre_releases: false,
        }
    }

    /// The range containing exactly one version.
    pub fn exact(version: Version) -> Self {
        Self {
            min: Some(version.clone()),
            max: Some(version),
            include_min: true,
            include_max: true,
            include_pre_releases: false,
        }
    }

    /// Mark this range as including pre-release versions at its bounds.
    pub fn with_pre_releases(mut self) -> Self {
        self.include_pre_releases = true;
        self
    }

    /// Whether `version` lies inside this range.
    pub fn allows(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            match version.cmp(min) {
                Ordering::Less => return false,
                Ordering::Equal if !self.include_min => return false,
                _ => {}
            }
        }
        if let Some(max) = &self.max {
            match version.cmp(max) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.include_max => return false,
                _ => {}
            }
        }
        if version.is_pre_release() && !self.include_pre_releases {
            let adjacent_pre_release = |bound: &Option<Version>| {
                bound
                    .as_ref()
                    .map_or(false, |b| b.is_pre_release() && b.same_core(version))
            };
            if !adjacent_pre_release(&self.min) && !adjacent_pre_release(&self.max) {
                return false;
            }
        }
        true
    }

    /// The intersection of two ranges, or `None` when they do not overlap.
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        let (min, include_min) =
            if cmp_lower(&self.min, self.include_min, &other.min, other.include_min)
                == Ordering::Less
            {
                (other.min.clone(), other.include_min)
            } else {
                (self.min.clone(), self.include_min)
            };
        let (max, include_max) =
            if cmp_upper(&self.max, self.include_max, &other.max, other.include_max)
                == Ordering::Greater
            {
                (other.max.clone(), other.include_max)
            } else {
                (self.max.clone(), self.include_max)
            };
        let mut range = VersionRange::new(min, max, include_min, include_max)?;
        range.include_pre_releases = self.include_pre_releases && other.include_pre_releases;
        Some(range)
    }

    /// Remove `other` from this range, yielding zero, one, or two pieces.
    pub fn subtract(&self, other: &VersionRange) -> Vec<VersionRange> {
        if self.intersect(other).is_none() {
            return vec![self.clone()];
        }

        let mut pieces = Vec::new();
        // Piece below other's lower bound.
        if cmp_lower(&self.min, self.include_min, &other.min, other.include_min)
            == Ordering::Less
        {
            if let Some(lo) = &other.min {
                if let Some(mut piece) = VersionRange::new(
                    self.min.clone(),
                    Some(lo.clone()),
                    self.include_min,
                    !other.include_min,
                ) {
                    piece.include_pre_releases = self.include_pre_releases;
                    pieces.push(piece);
                }
            }
        }
        // Piece above other's upper bound.
        if cmp_upper(&self.max, self.include_max, &other.max, other.include_max)
            == Ordering::Greater
        {
            if let Some(hi) = &other.max {
                if let Some(mut piece) = VersionRange::new(
                    Some(hi.clone()),
                    self.max.clone(),
                    !other.include_max,
                    self.include_max,
                ) {
                    piece.include_pre_releases = self.include_pre_releases;
                    pieces.push(piece);
                }
            }
        }
        pieces
    }

    /// Whether this range ends strictly before `other` begins, with a gap or
    /// touching bounds that exclude the meeting point on both sides.
    fn strictly_before(&self, other: &VersionRange) -> bool {
        match (&self.max, &other.min) {
            (Some(hi), Some(lo)) => match hi.cmp(lo) {
                Ordering::Less => true,
                Ordering::Equal => !(self.include_max || other.include_min),
                Ordering::Greater => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.min, &self.max) {
            (None, None) => write!(f, "any"),
            (Some(min), Some(max)) if min == max => write!(f, "{min}"),
            _ => {
                let mut wrote = false;
                if let Some(min) = &self.min {
                    write!(f, "{}{}", if self.include_min { ">=" } else { ">" }, min)?;
                    wrote = true;
                }
                if let Some(max) = &self.max {
                    if wrote {
                        write!(f, " ")?;
                    }
                    write!(f, "{}{}", if self.include_max { "<=" } else { "<" }, max)?;
                }
                Ok(())
            }
        }
    }
}

/// Compare lower bounds; `None` is negative infinity, and an inclusive bound
/// starts earlier than an exclusive bound at the same version.
fn cmp_lower(a: &Option<Version>, a_incl: bool, b: &Option<Version>, b_incl: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y).then(match (a_incl, b_incl) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => Ordering::Equal,
        }),
    }
}

/// Compare upper bounds; `None` is positive infinity, and an inclusive bound
/// ends later than an exclusive bound at the same version.
fn cmp_upper(a: &Option<Version>, a_incl: bool, b: &Option<Version>, b_incl: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(y).then(match (a_incl, b_incl) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => Ordering::Equal,
        }),
    }
}

/// A union of disjoint, sorted version ranges.
///
/// The empty union allows nothing; a single unbounded range allows
/// everything. All set operations return normalized constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    ranges: Vec<VersionRange>,
}

impl VersionConstraint {
    /// The constraint allowing no versions.
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// The constraint allowing every version.
    pub fn any() -> Self {
        Self {
            ranges: vec![VersionRange::any()],
        }
    }

    /// The constraint allowing exactly `version`.
    pub fn exact(version: Version) -> Self {
        Self {
            ranges: vec![VersionRange::exact(version)],
        }
    }

    /// A single-range constraint. Returns the empty constraint when the
    /// bounds describe an empty set.
    pub fn range(
        min: Option<Version>,
        max: Option<Version>,
        include_min: bool,
        include_max: bool,
    ) -> Self {
        match VersionRange::new(min, max, include_min, include_max) {
            Some(range) => Self {
                ranges: vec![range],
            },
            None => Self::empty(),
        }
    }

    /// The caret window `[v, next_breaking(v).first_pre_release())`.
    pub fn compatible_with(version: &Version) -> Self {
        let max = version.next_breaking().first_pre_release();
        Self::range(Some(version.clone()), Some(max), true, false)
    }

    /// Build a constraint from arbitrary ranges, sorting and merging.
    fn from_ranges(mut ranges: Vec<VersionRange>) -> Self {
        ranges.sort_by(|a, b| cmp_lower(&a.min, a.include_min, &b.min, b.include_min));
        let mut merged: Vec<VersionRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if !last.strictly_before(&range) => {
                    // Overlapping or touching: extend the accumulated range.
                    if cmp_upper(&last.max, last.include_max, &range.max, range.include_max)
                        == Ordering::Less
                    {
                        last.max = range.max;
                        last.include_max = range.include_max;
                    }
                    last.include_pre_releases =
                        last.include_pre_releases || range.include_pre_releases;
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Whether no version satisfies this constraint.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether every version satisfies this constraint.
    pub fn is_any(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].min.is_none() && self.ranges[0].max.is_none()
    }

    /// Whether `version` satisfies this constraint.
    pub fn allows(&self, version: &Version) -> bool {
        self.ranges.iter().any(|r| r.allows(version))
    }

    /// Whether every version allowed by `other` is allowed by `self`.
    pub fn allows_all(&self, other: &VersionConstraint) -> bool {
        other.difference(self).is_empty()
    }

    /// Whether some version is allowed by both constraints.
    pub fn allows_any(&self, other: &VersionConstraint) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Set intersection.
    pub fn intersect(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(r) = a.intersect(b) {
                    out.push(r);
                }
            }
        }
        Self::from_ranges(out)
    }

    /// Set union.
    pub fn union(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut out = self.ranges.clone();
        out.extend(other.ranges.iter().cloned());
        Self::from_ranges(out)
    }

    /// Set difference: versions allowed by `self` but not by `other`.
    pub fn difference(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut current = self.ranges.clone();
        for b in &other.ranges {
            let mut next = Vec::new();
            for a in &current {
                next.extend(a.subtract(b));
            }
            current = next;
        }
        Self::from_ranges(current)
    }

    /// Lowest bound across all ranges, with its inclusiveness.
    pub fn min(&self) -> Option<(&Version, bool)> {
        self.ranges
            .first()
            .and_then(|r| r.min.as_ref().map(|v| (v, r.include_min)))
    }

    /// Highest bound across all ranges, with its inclusiveness.
    pub fn max(&self) -> Option<(&Version, bool)> {
        self.ranges
            .last()
            .and_then(|r| r.max.as_ref().map(|v| (v, r.include_max)))
    }

    /// This constraint with its upper bound removed: `[min, infinity)`.
    ///
    /// Used by the upgrade planner to let a dependency cross a breaking
    /// boundary. `any` and `empty` are returned unchanged.
    pub fn strip_upper(&self) -> VersionConstraint {
        match self.ranges.first() {
            None => Self::empty(),
            Some(first) => Self::range(first.min.clone(), None, first.include_min, false),
        }
    }

    /// Parse a constraint string.
    ///
    /// Accepted forms: `any`, `none`, caret (`^1.2.3`), and
    /// whitespace-separated comparisons (`>=1.0.0 <2.0.0`, `>1.0.0`,
    /// `<=2.0.0`, `=1.2.3`). A bare version is an exact match.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let input = input.trim();
        if input.is_empty() || input == "any" || input == "*" {
            return Ok(Self::any());
        }
        if input == "none" {
            return Ok(Self::empty());
        }

        let mut result = Self::any();
        for token in input.split_whitespace() {
            let constraint = if let Some(rest) = token.strip_prefix(">=") {
                Self::range(Some(parse_version(rest)?), None, true, false)
            } else if let Some(rest) = token.strip_prefix('>') {
                Self::range(Some(parse_version(rest)?), None, false, false)
            } else if let Some(rest) = token.strip_prefix("<=") {
                Self::range(None, Some(parse_version(rest)?), false, true)
            } else if let Some(rest) = token.strip_prefix('<') {
                Self::range(None, Some(parse_version(rest)?), false, false)
            } else if let Some(rest) = token.strip_prefix('=') {
                Self::exact(parse_version(rest)?)
            } else if let Some(rest) = token.strip_prefix('^') {
                let version = parse_version(rest)?;
                Self::compatible_with(&version)
            } else {
                Self::exact(parse_version(token)?)
            };
            result = result.intersect(&constraint);
        }
        Ok(result)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        if self.is_any() {
            return write!(f, "any");
        }
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " || ")?;
            }
            // Render caret windows back in caret form.
            if let Some(min) = &range.min {
                if self.ranges.len() == 1
                    && VersionConstraint::compatible_with(min).ranges[0] == *range
                {
                    return write!(f, "^{min}");
                }
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn test_next_breaking() {
        assert_eq!(v("1.2.3").next_breaking(), v("2.0.0"));
        assert_eq!(v("0.2.3").next_breaking(), v("0.3.0"));
        assert_eq!(v("0.0.3").next_breaking(), v("0.0.4"));
    }

    #[test]
    fn test_first_pre_release() {
        assert_eq!(v("2.0.0").first_pre_release(), v("2.0.0-0"));
        assert!(v("2.0.0-0") < v("2.0.0-alpha"));
        assert!(v("2.0.0-0") < v("2.0.0"));
    }

    #[test]
    fn test_compatible_with_allows_self_and_excludes_breaking() {
        for s in ["1.2.3", "0.2.3", "0.0.3"] {
            let version = v(s);
            let constraint = VersionConstraint::compatible_with(&version);
            assert!(constraint.allows(&version), "{s}");
            assert!(!constraint.allows(&version.next_breaking()), "{s}");
        }
    }

    #[test]
    fn test_compatible_with_excludes_next_breaking_pre_releases() {
        let constraint = VersionConstraint::compatible_with(&v("1.2.0"));
        assert!(constraint.allows(&v("1.9.9")));
        assert!(!constraint.allows(&v("2.0.0-alpha")));
        assert!(!constraint.allows(&v("2.0.0")));
    }

    #[test]
    fn test_pre_release_excluded_by_default() {
        let constraint = c(">=1.0.0 <2.0.0");
        assert!(constraint.allows(&v("1.5.0")));
        assert!(!constraint.allows(&v("1.5.0-beta")));
    }

    #[test]
    fn test_pre_release_allowed_next_to_pre_release_bound() {
        let constraint = c(">=1.5.0-alpha <2.0.0");
        assert!(constraint.allows(&v("1.5.0-beta")));
        assert!(constraint.allows(&v("1.5.0")));
        assert!(!constraint.allows(&v("1.6.0-beta")));
    }

    #[test]
    fn test_intersect() {
        let constraint = c(">=1.0.0").intersect(&c("<2.0.0"));
        assert!(constraint.allows(&v("1.5.0")));
        assert!(!constraint.allows(&v("0.9.0")));
        assert!(!constraint.allows(&v("2.0.0")));
    }

    #[test]
    fn test_intersect_disjoint_is_empty() {
        assert!(c("^1.0.0").intersect(&c("^2.0.0")).is_empty());
    }

    #[test]
    fn test_union_merges_touching_ranges() {
        let union = c(">=1.0.0 <2.0.0").union(&c(">=2.0.0 <3.0.0"));
        assert!(union.allows(&v("2.0.0")));
        assert!(union.allows(&v("1.0.0")));
        assert!(!union.allows(&v("3.0.0")));
        // Merged into a single contiguous range.
        assert_eq!(union, c(">=1.0.0 <3.0.0"));
    }

    #[test]
    fn test_union_keeps_disjoint_ranges() {
        let union = c("^1.0.0").union(&c("^3.0.0"));
        assert!(union.allows(&v("1.5.0")));
        assert!(union.allows(&v("3.5.0")));
        assert!(!union.allows(&v("2.0.0")));
    }

    #[test]
    fn test_difference() {
        let diff = c(">=1.0.0 <3.0.0").difference(&c(">=1.5.0 <2.0.0"));
        assert!(diff.allows(&v("1.0.0")));
        assert!(!diff.allows(&v("1.7.0")));
        assert!(diff.allows(&v("2.0.0")));
    }

    #[test]
    fn test_difference_of_exact_removes_exactly_one_version() {
        let constraint = c(">=1.0.0 <2.0.0");
        let without = constraint.difference(&VersionConstraint::exact(v("1.5.0")));
        assert!(!without.allows(&v("1.5.0")));
        assert!(without.allows(&v("1.4.9")));
        assert!(without.allows(&v("1.5.1")));
        // C ∩ (C − {v}) never allows v.
        assert!(!constraint.intersect(&without).allows(&v("1.5.0")));
    }

    #[test]
    fn test_allows_all() {
        assert!(c(">=1.0.0 <3.0.0").allows_all(&c("^1.0.0")));
        assert!(!c("^1.0.0").allows_all(&c(">=1.0.0 <3.0.0")));
        assert!(VersionConstraint::any().allows_all(&c("^2.5.0")));
    }

    #[test]
    fn test_strip_upper() {
        let stripped = c("^1.2.0").strip_upper();
        assert!(stripped.allows(&v("1.2.0")));
        assert!(stripped.allows(&v("4.0.0")));
        assert!(!stripped.allows(&v("1.1.0")));
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        for s in ["any", "none", "^1.2.3", ">=1.0.0 <2.0.0", "1.2.3", ">1.0.0"] {
            let constraint = c(s);
            assert_eq!(c(&constraint.to_string()), constraint, "{s}");
        }
    }

    #[test]
    fn test_display_caret_form() {
        assert_eq!(c("^1.2.3").to_string(), "^1.2.3");
        assert_eq!(VersionConstraint::any().to_string(), "any");
        assert_eq!(VersionConstraint::empty().to_string(), "none");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(VersionConstraint::parse(">=not.a.version").is_err());
        assert!(VersionConstraint::parse("^").is_err());
    }
}
