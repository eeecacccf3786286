//! Determinism verification: run an action N times and compare outputs.
//!
//! Four comparison strategies, in increasing tolerance:
//!
//! - `Bitwise`: byte equality.
//! - `ContentHash`: digest equality (what the cache ultimately keys on).
//! - `Fuzzy`: strip embedded timestamps/UUIDs/build-ids first
//!   (see [`super::fuzzy`]), then compare.
//! - `Structural`: format-aware comparison for the supported binary
//!   formats; unsupported formats surface as an `Unsupported` outcome,
//!   never an error.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, instrument};

use crate::{
    error::Result,
    hash::hash_bytes,
};

use super::{
    detect::{self, Finding},
    fuzzy::{self, BinaryFormat},
};

/// Output comparison strategy.
#[derive(
    Copy, Clone, Eq, PartialEq, Debug, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    ContentHash,
    Bitwise,
    Fuzzy,
    Structural,
}

/// The verdict for one verification pass.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ComparisonOutcome {
    /// All runs produced equivalent outputs under the strategy.
    Identical,
    /// Some output differed; carries the first differing path and a short
    /// description of how.
    Differs { path: PathBuf, detail: String },
    /// The strategy cannot judge this output's format.
    Unsupported { format: String },
}

/// Report from a verification pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyReport {
    pub strategy: Strategy,
    pub runs: usize,
    pub outcome: ComparisonOutcome,
    /// Diagnoses for an observed difference: missing determinism flags and
    /// timestamp macros found in the inputs. Empty when outputs matched.
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn is_deterministic(&self) -> bool {
        matches!(self.outcome, ComparisonOutcome::Identical)
    }
}

/// One run's outputs: `(path -> bytes)`.
pub type RunOutputs = BTreeMap<PathBuf, Vec<u8>>;

/// Re-runs an action and compares the output sets.
#[derive(Clone, Debug)]
pub struct Verifier {
    runs: usize,
    strategy: Strategy,
}

impl Verifier {
    /// At least two runs are required to compare anything.
    pub fn new(runs: usize, strategy: Strategy) -> Self {
        Self {
            runs: runs.max(2),
            strategy,
        }
    }

    /// Execute `run` once per repetition and compare every run's outputs
    /// against the first. `argv` and `inputs` feed the detector when a
    /// difference needs explaining.
    #[instrument(skip_all, fields(strategy = %self.strategy, runs = self.runs))]
    pub fn verify(
        &self,
        argv: &[String],
        inputs: impl IntoIterator<Item = PathBuf>,
        mut run: impl FnMut(usize) -> Result<RunOutputs>,
    ) -> Result<VerifyReport> {
        let baseline = run(0)?;
        let mut outcome = ComparisonOutcome::Identical;

        'runs: for repetition in 1..self.runs {
            let outputs = run(repetition)?;
            match compare_sets(self.strategy, &baseline, &outputs) {
                ComparisonOutcome::Identical => {}
                other => {
                    outcome = other;
                    break 'runs;
                }
            }
        }

        let findings = match &outcome {
            ComparisonOutcome::Identical => Vec::new(),
            _ => {
                let mut findings = detect::detect(argv);
                let inputs: Vec<PathBuf> = inputs.into_iter().collect();
                findings.extend(detect::scan_inputs(inputs.iter().map(PathBuf::as_path))?);
                findings.sort_by(|a, b| b.priority.cmp(&a.priority));
                findings
            }
        };

        debug!(?outcome, findings = findings.len(), "verification finished");
        Ok(VerifyReport {
            strategy: self.strategy,
            runs: self.runs,
            outcome,
            findings,
        })
    }
}

fn compare_sets(
    strategy: Strategy,
    baseline: &RunOutputs,
    candidate: &RunOutputs,
) -> ComparisonOutcome {
    if baseline.len() != candidate.len()
        || baseline.keys().zip(candidate.keys()).any(|(a, b)| a != b)
    {
        return ComparisonOutcome::Differs {
            path: first_missing(baseline, candidate),
            detail: "output sets name different paths".into(),
        };
    }

    for (path, base) in baseline {
        let other = &candidate[path];
        match compare_one(strategy, path, base, other) {
            ComparisonOutcome::Identical => {}
            outcome => return outcome,
        }
    }
    ComparisonOutcome::Identical
}

fn first_missing(baseline: &RunOutputs, candidate: &RunOutputs) -> PathBuf {
    baseline
        .keys()
        .find(|path| !candidate.contains_key(*path))
        .or_else(|| candidate.keys().find(|path| !baseline.contains_key(*path)))
        .cloned()
        .unwrap_or_default()
}

fn compare_one(
    strategy: Strategy,
    path: &Path,
    base: &[u8],
    other: &[u8],
) -> ComparisonOutcome {
    let differs = |detail: &str| ComparisonOutcome::Differs {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    };

    match strategy {
        Strategy::Bitwise => {
            if base == other {
                ComparisonOutcome::Identical
            } else {
                differs("byte content differs")
            }
        }
        Strategy::ContentHash => {
            if hash_bytes(base) == hash_bytes(other) {
                ComparisonOutcome::Identical
            } else {
                differs("content digests differ")
            }
        }
        Strategy::Fuzzy => {
            if fuzzy::normalize(base) == fuzzy::normalize(other) {
                ComparisonOutcome::Identical
            } else {
                differs("content differs beyond embedded build metadata")
            }
        }
        Strategy::Structural => {
            let format = fuzzy::detect_format(base);
            if format == BinaryFormat::Unknown {
                return ComparisonOutcome::Unsupported {
                    format: format.to_string(),
                };
            }
            if fuzzy::detect_format(other) != format {
                return differs("binary formats differ between runs");
            }
            if fuzzy::normalize(base) == fuzzy::normalize(other) {
                ComparisonOutcome::Identical
            } else {
                differs("structural content differs")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn outputs(pairs: &[(&str, &[u8])]) -> RunOutputs {
        pairs
            .iter()
            .map(|(path, bytes)| (PathBuf::from(path), bytes.to_vec()))
            .collect()
    }

    #[test]
    fn identical_runs_verify_clean() {
        let verifier = Verifier::new(3, Strategy::ContentHash);
        let report = verifier
            .verify(&["true".to_string()], [], |_| {
                Ok(outputs(&[("a.o", b"stable bytes")]))
            })
            .unwrap();
        assert!(report.is_deterministic());
        assert_eq!(report.runs, 3);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn varying_output_is_reported_with_findings() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.c");
        std::fs::write(&src, "char* t = __TIME__;").unwrap();

        let verifier = Verifier::new(2, Strategy::ContentHash);
        let mut counter = 0u8;
        let report = verifier
            .verify(
                &["gcc".to_string(), "-c".to_string(), "main.c".to_string()],
                [src.clone()],
                |_| {
                    counter += 1;
                    Ok(outputs(&[("main.o", [counter].as_slice())]))
                },
            )
            .unwrap();

        assert!(!report.is_deterministic());
        // The timestamp macro in the input is diagnosed Critical, with the
        // prefix-map fix suggested.
        let timestamp = report
            .findings
            .iter()
            .find(|finding| finding.flag == "__TIME__")
            .expect("timestamp macro diagnosed");
        assert_eq!(timestamp.priority, super::super::detect::Priority::Critical);
        assert!(timestamp.fix.contains("-ffile-prefix-map"));
    }

    #[test]
    fn fuzzy_tolerates_embedded_metadata() {
        // Two ar archives differing only in member mtimes.
        let one = ar_with_mtime("1111111111");
        let two = ar_with_mtime("2222222222");

        let verifier = Verifier::new(2, Strategy::Fuzzy);
        let mut runs = vec![
            outputs(&[("lib.a", two.as_slice())]),
            outputs(&[("lib.a", one.as_slice())]),
        ];
        let report = verifier
            .verify(&[], [], |_| Ok(runs.pop().unwrap_or_default()))
            .unwrap();
        assert!(report.is_deterministic());
    }

    #[test]
    fn structural_reports_unsupported_formats() {
        let verifier = Verifier::new(2, Strategy::Structural);
        let mut counter = 0u8;
        let report = verifier
            .verify(&[], [], |_| {
                counter += 1;
                Ok(outputs(&[("data.json", [b'{', counter, b'}'].as_slice())]))
            })
            .unwrap();
        assert_eq!(
            report.outcome,
            ComparisonOutcome::Unsupported {
                format: "unknown".into()
            },
        );
    }

    #[test]
    fn differing_path_sets_are_differences() {
        let verifier = Verifier::new(2, Strategy::Bitwise);
        let mut runs = vec![
            outputs(&[("b.o", b"bytes".as_slice())]),
            outputs(&[("a.o", b"bytes".as_slice())]),
        ];
        let report = verifier
            .verify(&[], [], |_| Ok(runs.pop().unwrap_or_default()))
            .unwrap();
        assert!(matches!(report.outcome, ComparisonOutcome::Differs { .. }));
    }

    fn ar_with_mtime(mtime: &str) -> Vec<u8> {
        let mut ar = Vec::new();
        ar.extend_from_slice(b"!<arch>\n");
        ar.extend_from_slice(format!("{:<16}", "m.o/").as_bytes());
        ar.extend_from_slice(format!("{mtime:<12}").as_bytes());
        ar.extend_from_slice(format!("{:<6}", 0).as_bytes());
        ar.extend_from_slice(format!("{:<6}", 0).as_bytes());
        ar.extend_from_slice(format!("{:<8}", 100644).as_bytes());
        ar.extend_from_slice(format!("{:<10}", 2).as_bytes());
        ar.extend_from_slice(b"`\n");
        ar.extend_from_slice(b"hi");
        ar
    }
}
