//! Hand-rolled semver constraint parsing and matching.
//!
//! Constraint strings are whitespace- or comma-separated conjunctions of
//! comparators: `^1.2.0`, `>=1.0.0 <2.0.0`, `>=1.0.0, <2.0.0`, `3.1.4`
//! (exact). All comparators in a constraint must match for the constraint
//! to match a version.

use crate::errors::FlyError;
use semver::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Caret,
    Ge,
    Le,
    Lt,
    Gt,
    Exact,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Op::Exact => candidate == &self.version,
            Op::Ge => candidate >= &self.version,
            Op::Le => candidate <= &self.version,
            Op::Lt => candidate < &self.version,
            Op::Gt => candidate > &self.version,
            Op::Caret => caret_matches(&self.version, candidate),
        }
    }
}

/// `^1.2.3` matches `>=1.2.3, <2.0.0`; `^0.2.3` matches `>=0.2.3, <0.3.0`;
/// `^0.0.3` matches `>=0.0.3, <0.0.4`. Standard caret semantics.
fn caret_matches(base: &Version, candidate: &Version) -> bool {
    if candidate < base {
        return false;
    }
    if base.major > 0 {
        candidate.major == base.major
    } else if base.minor > 0 {
        candidate.major == 0 && candidate.minor == base.minor
    } else {
        candidate.major == 0 && candidate.minor == 0 && candidate.patch == base.patch
    }
}

/// A parsed conjunction of comparators — all must match.
#[derive(Debug, Clone)]
pub struct Constraint {
    comparators: Vec<Comparator>,
}

impl Constraint {
    pub fn parse(input: &str) -> Result<Self, FlyError> {
        let tokens: Vec<&str> = input
            .split(',')
            .flat_map(|part| part.split_whitespace())
            .filter(|s| !s.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err(FlyError::invalid_params(format!(
                "empty semver constraint: '{input}'"
            )));
        }

        let comparators = tokens
            .into_iter()
            .map(parse_comparator)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { comparators })
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(candidate))
    }

    /// Pick the highest version in `candidates` that satisfies this
    /// constraint, per the "newest compatible version wins" resolution
    /// policy.
    pub fn resolve_best<'a>(&self, candidates: impl Iterator<Item = &'a Version>) -> Option<&'a Version> {
        candidates.filter(|v| self.matches(v)).max()
    }
}

fn parse_comparator(token: &str) -> Result<Comparator, FlyError> {
    let (op, rest) = if let Some(rest) = token.strip_prefix('^') {
        (Op::Caret, rest)
    } else if let Some(rest) = token.strip_prefix(">=") {
        (Op::Ge, rest)
    } else if let Some(rest) = token.strip_prefix("<=") {
        (Op::Le, rest)
    } else if let Some(rest) = token.strip_prefix('<') {
        (Op::Lt, rest)
    } else if let Some(rest) = token.strip_prefix('>') {
        (Op::Gt, rest)
    } else if let Some(rest) = token.strip_prefix('=') {
        (Op::Exact, rest)
    } else {
        (Op::Exact, token)
    };

    let version = Version::parse(rest)
        .map_err(|e| FlyError::invalid_params(format!("invalid semver in constraint '{token}': {e}")))?;

    Ok(Comparator { op, version })
}
