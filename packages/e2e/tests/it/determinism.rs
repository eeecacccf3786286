//! Deterministic-build verification scenarios.

use std::{collections::BTreeMap, path::PathBuf};

use color_eyre::Result;
use e2e::TestWorkspace;
use mason::sandbox::{
    ComparisonOutcome, Strategy, Verifier,
    detect::Priority,
};
use pretty_assertions::assert_eq;

/// Repeated hermetic executions of a well-behaved action hash
/// identically under the content-hash strategy.
#[test_log::test]
fn three_runs_hash_identically() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("src.txt", "stable input")?;
    let out = ws.root().join("artifact.bin");

    let executor = mason::HermeticExecutor::new(Default::default());
    let seed = mason::hash::hash_bytes(b"verify-seed");
    let spec = mason::HermeticSpec::default();
    let cancel = mason::CancelToken::new();

    let verifier = Verifier::new(3, Strategy::ContentHash);
    let report = verifier.verify(
        &["sh".to_string()],
        [ws.root().join("src.txt")],
        |_| {
            let result = executor
                .execute(
                    &[
                        "sh".to_string(),
                        "-c".to_string(),
                        "tr a-z A-Z < src.txt > artifact.bin".to_string(),
                    ],
                    ws.root(),
                    &spec,
                    &seed,
                    &cancel,
                )?;
            assert!(result.success());
            let mut outputs = BTreeMap::new();
            outputs.insert(
                PathBuf::from("artifact.bin"),
                std::fs::read(&out).unwrap_or_default(),
            );
            Ok(outputs)
        },
    )?;

    assert!(report.is_deterministic(), "outcome: {:?}", report.outcome);
    assert_eq!(report.runs, 3);
    Ok(())
}

/// An action that embeds the current time fails verification, and the
/// report diagnoses the `__TIME__` macro in the input as Critical with a
/// prefix-map fix.
#[test_log::test]
fn timestamp_nondeterminism_is_detected_and_diagnosed() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let src = ws.write("main.c", "const char* when = __TIME__;")?;

    let verifier = Verifier::new(3, Strategy::ContentHash);
    let mut run_index = 0u64;
    let report = verifier.verify(
        &["gcc".to_string(), "-c".to_string(), "main.c".to_string()],
        [src],
        |_| {
            // Stand-in for a compiler that embeds wall-clock time.
            run_index += 1;
            let mut outputs = BTreeMap::new();
            outputs.insert(
                PathBuf::from("main.o"),
                format!("code-{run_index}").into_bytes(),
            );
            Ok(outputs)
        },
    )?;

    assert!(!report.is_deterministic());
    assert!(matches!(report.outcome, ComparisonOutcome::Differs { .. }));

    let timestamp = report
        .findings
        .iter()
        .find(|finding| finding.flag == "__TIME__")
        .expect("timestamp macro diagnosed");
    assert_eq!(timestamp.priority, Priority::Critical);
    assert!(timestamp.fix.contains("-ffile-prefix-map"));

    // The bare gcc invocation is also missing its determinism flags.
    assert!(
        report
            .findings
            .iter()
            .any(|finding| finding.flag == "-ffile-prefix-map=")
    );
    Ok(())
}

/// Fuzzy comparison ignores embedded archive timestamps that the content
/// hash strategy would reject.
#[test_log::test]
fn fuzzy_comparison_ignores_archive_timestamps() -> Result<()> {
    fn archive(mtime: &str) -> Vec<u8> {
        let mut ar = Vec::new();
        ar.extend_from_slice(b"!<arch>\n");
        ar.extend_from_slice(format!("{:<16}", "member.o/").as_bytes());
        ar.extend_from_slice(format!("{mtime:<12}").as_bytes());
        ar.extend_from_slice(format!("{:<6}", 1000).as_bytes());
        ar.extend_from_slice(format!("{:<6}", 1000).as_bytes());
        ar.extend_from_slice(format!("{:<8}", 100644).as_bytes());
        ar.extend_from_slice(format!("{:<10}", 6).as_bytes());
        ar.extend_from_slice(b"`\n");
        ar.extend_from_slice(b"OBJECT");
        ar
    }

    let mut archives = vec![archive("1700000001"), archive("1700000002")];

    // Content hashes differ...
    let strict = Verifier::new(2, Strategy::ContentHash);
    let mut strict_runs = archives.clone();
    let report = strict.verify(&[], [], |_| {
        let mut outputs = BTreeMap::new();
        outputs.insert(PathBuf::from("lib.a"), strict_runs.pop().unwrap_or_default());
        Ok(outputs)
    })?;
    assert!(!report.is_deterministic());

    // ...but fuzzy comparison sees through the member timestamps.
    let fuzzy = Verifier::new(2, Strategy::Fuzzy);
    let report = fuzzy.verify(&[], [], |_| {
        let mut outputs = BTreeMap::new();
        outputs.insert(PathBuf::from("lib.a"), archives.pop().unwrap_or_default());
        Ok(outputs)
    })?;
    assert!(report.is_deterministic());
    Ok(())
}
