//! Dotted version parsing and comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// `major.minor.patch`, tolerant of a leading `v`, missing components and
/// pre-release/build suffixes (which are ignored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionTriple {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionDifference {
    Major,
    Minor,
    Patch,
    None,
}

/// How the second version relates to the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionVerdict {
    Newer,
    Older,
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionComparison {
    pub difference: VersionDifference,
    pub verdict: VersionVerdict,
}

impl VersionTriple {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse()
    }

    fn difference(&self, other: &Self) -> VersionDifference {
        if self.major != other.major {
            VersionDifference::Major
        } else if self.minor != other.minor {
            VersionDifference::Minor
        } else if self.patch != other.patch {
            VersionDifference::Patch
        } else {
            VersionDifference::None
        }
    }
}

impl FromStr for VersionTriple {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_start_matches(['v', 'V']);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(AppError::validation(format!("Invalid version: {:?}", raw)));
        }

        let mut parts = [0u64; 3];
        for (idx, part) in core.split('.').enumerate() {
            if idx >= parts.len() {
                return Err(AppError::validation(format!("Invalid version: {:?}", raw)));
            }
            parts[idx] = part
                .parse()
                .map_err(|_| AppError::validation(format!("Invalid version: {:?}", raw)))?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compare `current` against `candidate`: the verdict says whether the
/// candidate is newer, older or the same.
pub fn compare(current: &str, candidate: &str) -> Result<VersionComparison> {
    let current = VersionTriple::parse(current)?;
    let candidate = VersionTriple::parse(candidate)?;
    let verdict = match candidate.cmp(&current) {
        Ordering::Greater => VersionVerdict::Newer,
        Ordering::Less => VersionVerdict::Older,
        Ordering::Equal => VersionVerdict::Same,
    };
    Ok(VersionComparison {
        difference: current.difference(&candidate),
        verdict,
    })
}

/// Sort version strings newest first; unparseable ones sink to the end.
pub fn sort_versions_desc(versions: &mut [String]) {
    versions.sort_by(|a, b| {
        let av = semver::Version::parse(a.trim_start_matches('v')).ok();
        let bv = semver::Version::parse(b.trim_start_matches('v')).ok();
        let at = VersionTriple::parse(a).ok();
        let bt = VersionTriple::parse(b).ok();

        match (av, bv) {
            (Some(va), Some(vb)) => vb.cmp(&va),
            _ => match (at, bt) {
                (Some(ta), Some(tb)) => tb.cmp(&ta),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => b.cmp(a),
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_bump_is_newer() {
        let cmp = compare("1.2.3", "1.2.4").expect("compare");
        assert_eq!(cmp.difference, VersionDifference::Patch);
        assert_eq!(cmp.verdict, VersionVerdict::Newer);
    }

    #[test]
    fn major_downgrade_is_older() {
        let cmp = compare("2.0.0", "1.9.9").expect("compare");
        assert_eq!(cmp.difference, VersionDifference::Major);
        assert_eq!(cmp.verdict, VersionVerdict::Older);
    }

    #[test]
    fn identical_versions_are_same() {
        let cmp = compare("1.0.0", "1.0.0").expect("compare");
        assert_eq!(cmp.difference, VersionDifference::None);
        assert_eq!(cmp.verdict, VersionVerdict::Same);
    }

    #[test]
    fn parse_is_lenient_about_prefix_and_suffix() {
        assert_eq!(VersionTriple::parse("v1.4").expect("parse"), VersionTriple::new(1, 4, 0));
        assert_eq!(
            VersionTriple::parse("2.1.0-beta.1").expect("parse"),
            VersionTriple::new(2, 1, 0)
        );
        assert!(VersionTriple::parse("1.2.3.4").is_err());
        assert!(VersionTriple::parse("latest").is_err());
        assert!(VersionTriple::parse("").is_err());
    }

    #[test]
    fn sorts_newest_first() {
        let mut versions = vec![
            "1.2.0".to_string(),
            "v1.10.0".to_string(),
            "garbage".to_string(),
            "1.9.3".to_string(),
        ];
        sort_versions_desc(&mut versions);
        assert_eq!(versions, vec!["v1.10.0", "1.9.3", "1.2.0", "garbage"]);
    }
}
