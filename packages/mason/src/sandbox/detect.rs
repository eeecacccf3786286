//! Static detection of missing determinism flags.
//!
//! The detector inspects an action's argv against a table of known
//! compilers and reports determinism flags the invocation is missing, each
//! with a priority and a concrete fix. It also scans input sources for
//! embedded-timestamp macros, which is how the verifier explains a
//! timestamp-shaped difference between runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::instrument;

use crate::error::{BuildError, Result};

/// How urgently a missing flag undermines reproducibility.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// One detected determinism problem.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Finding {
    /// The tool the finding applies to (basename of argv[0], or `source`
    /// for input-scan findings).
    pub tool: String,
    /// The missing flag, or the offending construct for input scans.
    pub flag: String,
    pub priority: Priority,
    /// Human-readable fix.
    pub fix: String,
}

struct FlagRule {
    /// Flag prefix whose absence triggers the finding.
    flag: &'static str,
    priority: Priority,
    fix: &'static str,
}

struct CompilerRules {
    /// Tool basenames this rule set applies to.
    tools: &'static [&'static str],
    flags: &'static [FlagRule],
}

static RULES: &[CompilerRules] = &[
    CompilerRules {
        tools: &["cc", "c++", "gcc", "g++", "clang", "clang++"],
        flags: &[
            FlagRule {
                flag: "-ffile-prefix-map=",
                priority: Priority::Critical,
                fix: "add -ffile-prefix-map=$PWD=. so embedded paths and \
                      __FILE__ expansions do not leak the build directory",
            },
            FlagRule {
                flag: "-Wdate-time",
                priority: Priority::Critical,
                fix: "add -Wdate-time to surface __DATE__/__TIME__/__TIMESTAMP__ \
                      usage; pair with SOURCE_DATE_EPOCH",
            },
            FlagRule {
                flag: "-frandom-seed=",
                priority: Priority::High,
                fix: "add -frandom-seed=<per-file constant> so internal \
                      symbol mangling is stable",
            },
        ],
    },
    CompilerRules {
        tools: &["rustc"],
        flags: &[FlagRule {
            flag: "--remap-path-prefix",
            priority: Priority::High,
            fix: "add --remap-path-prefix=$PWD=. so debug info does not \
                  embed the build directory",
        }],
    },
    CompilerRules {
        tools: &["go"],
        flags: &[FlagRule {
            flag: "-trimpath",
            priority: Priority::High,
            fix: "add -trimpath so binaries do not embed GOPATH",
        }],
    },
    CompilerRules {
        tools: &["ld", "ld.lld", "ld.gold", "lld"],
        flags: &[FlagRule {
            flag: "--build-id=none",
            priority: Priority::Medium,
            fix: "pass --build-id=none (or a content-derived build id) to \
                  keep link output independent of link time",
        }],
    },
    CompilerRules {
        tools: &["ar"],
        flags: &[FlagRule {
            flag: "D",
            priority: Priority::Medium,
            fix: "use ar's D modifier for deterministic member headers",
        }],
    },
];

/// Timestamp macros whose presence in inputs explains timestamp-shaped
/// nondeterminism.
const TIMESTAMP_MACROS: &[&str] = &["__TIMESTAMP__", "__DATE__", "__TIME__"];

/// Inspect an argv for missing determinism flags.
#[instrument(skip(argv))]
pub fn detect(argv: &[String]) -> Vec<Finding> {
    let Some(program) = argv.first() else {
        return Vec::new();
    };
    let tool = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());

    let mut findings = Vec::new();
    for rules in RULES {
        if !rules.tools.contains(&tool.as_str()) {
            continue;
        }
        for rule in rules.flags {
            let present = argv[1..]
                .iter()
                .any(|arg| arg.starts_with(rule.flag) || arg.contains(rule.flag));
            if !present {
                findings.push(Finding {
                    tool: tool.clone(),
                    flag: rule.flag.to_string(),
                    priority: rule.priority,
                    fix: rule.fix.to_string(),
                });
            }
        }
    }
    findings.sort_by(|a, b| b.priority.cmp(&a.priority));
    findings
}

/// Scan declared input files for embedded timestamp macros. A hit is
/// Critical: the output will differ run-to-run unless the macro is
/// remapped away.
#[instrument(skip(inputs))]
pub fn scan_inputs<'a>(inputs: impl IntoIterator<Item = &'a Path>) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for path in inputs {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(BuildError::storage(format!("read {path:?}"), err)),
        };
        let text = String::from_utf8_lossy(&bytes);
        for macro_name in TIMESTAMP_MACROS {
            if text.contains(macro_name) {
                findings.push(Finding {
                    tool: "source".to_string(),
                    flag: (*macro_name).to_string(),
                    priority: Priority::Critical,
                    fix: format!(
                        "{} in {} embeds build time; honor SOURCE_DATE_EPOCH \
                         and add -ffile-prefix-map / -Wdate-time",
                        macro_name,
                        path.display()
                    ),
                });
            }
        }
    }
    Ok(findings)
}
