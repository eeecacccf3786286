//! Incremental-build scenarios: cold/warm caching, metadata-only touches,
//! and content invalidation.

use std::time::Instant;

use color_eyre::Result;
use e2e::TestWorkspace;
use filetime::FileTime;
use mason::NodeStatus;
use pretty_assertions::assert_eq;

/// Cold build executes exactly one action; the warm rebuild executes
/// nothing and replays from cache.
#[test_log::test]
fn cold_then_warm_cache() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("src/input.txt", &"x".repeat(100))?;
    let target = ws.target(
        "copy",
        "cp src/input.txt out.txt",
        &["src/input.txt"],
        &[],
        &["out.txt"],
    );

    // Cold: one action executed, artifacts land in the store.
    let (ctx, sink) = ws.context(2)?;
    let cold_started = Instant::now();
    let report = ctx.build(&TestWorkspace::roots(&["copy"]), [target.clone()])?;
    let cold = cold_started.elapsed();

    assert!(report.success(), "cold build failed: {:?}", report.failed);
    assert_eq!(report.built, vec![TestWorkspace::id("copy")]);
    assert_eq!(sink.executed(), 1);
    assert_eq!(sink.cached(), 0);
    assert_eq!(ws.read("out.txt")?, "x".repeat(100));

    // Warm: a fresh context (fresh process, same cache directory) executes
    // zero actions.
    std::fs::remove_file(ws.root().join("out.txt"))?;
    let (ctx, sink) = ws.context(2)?;
    let warm_started = Instant::now();
    let report = ctx.build(&TestWorkspace::roots(&["copy"]), [target])?;
    let warm = warm_started.elapsed();

    assert!(report.success());
    assert_eq!(report.cached, vec![TestWorkspace::id("copy")]);
    assert_eq!(sink.executed(), 0, "warm build must not execute");
    assert_eq!(sink.cached(), 1);
    assert_eq!(ws.read("out.txt")?, "x".repeat(100), "outputs restored");
    assert!(
        warm < cold || warm.as_millis() < 250,
        "warm ({warm:?}) should beat cold ({cold:?})"
    );
    Ok(())
}

/// Touching a source without changing content re-stamps the file but
/// still hits the action cache: the content digest (and therefore the
/// fingerprint) is unchanged.
#[test_log::test]
fn metadata_only_touch_still_hits() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let src = ws.write("main.c", "int main() { return 0; }")?;
    let target = ws.target(
        "cc",
        "cp main.c main.o",
        &["main.c"],
        &[],
        &["main.o"],
    );

    let (ctx, sink) = ws.context(2)?;
    ctx.build(&TestWorkspace::roots(&["cc"]), [target.clone()])?;
    assert_eq!(sink.executed(), 1);

    // Touch: bump mtime, keep bytes.
    filetime::set_file_mtime(&src, FileTime::now())?;

    let (ctx, sink) = ws.context(2)?;
    let report = ctx.build(&TestWorkspace::roots(&["cc"]), [target])?;

    assert!(report.success());
    assert_eq!(sink.executed(), 0, "metadata change alone must not rebuild");
    assert_eq!(sink.cached(), 1);
    Ok(())
}

/// Changing a single byte of a source changes the fingerprint and forces
/// re-execution with a fresh cache entry.
#[test_log::test]
fn content_change_invalidates() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("data.txt", "version one")?;
    let target = ws.target(
        "stamp",
        "cp data.txt stamped.txt",
        &["data.txt"],
        &[],
        &["stamped.txt"],
    );

    let (ctx, sink) = ws.context(2)?;
    ctx.build(&TestWorkspace::roots(&["stamp"]), [target.clone()])?;
    assert_eq!(sink.executed(), 1);

    // One byte differs.
    ws.write("data.txt", "version two")?;

    let (ctx, sink) = ws.context(2)?;
    let report = ctx.build(&TestWorkspace::roots(&["stamp"]), [target.clone()])?;

    assert!(report.success());
    assert_eq!(sink.executed(), 1, "changed content must re-execute");
    assert_eq!(ws.read("stamped.txt")?, "version two");

    // And the new entry is itself warm now.
    let (ctx, sink) = ws.context(2)?;
    ctx.build(&TestWorkspace::roots(&["stamp"]), [target])?;
    assert_eq!(sink.executed(), 0);
    assert_eq!(sink.cached(), 1);
    Ok(())
}

/// Failed actions propagate: dependents are skipped, the report carries
/// the stderr head, and the exit code is 1.
#[test_log::test]
fn failure_blocks_dependents_and_reports() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let bad = ws.target("bad", "echo boom >&2; exit 7", &[], &[], &[]);
    let top = ws.target("top", "true", &[], &["bad"], &[]);

    let (ctx, _sink) = ws.context(2)?;
    let report = ctx.build(&TestWorkspace::roots(&["top"]), [bad, top])?;

    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.target, TestWorkspace::id("bad"));
    assert!(failed.stderr_head.contains("boom"));
    assert!(failed.chain[0].contains("ActionFailed"));
    assert!(failed.command.as_deref().unwrap_or_default().contains("exit 7"));
    assert_eq!(report.skipped, vec![TestWorkspace::id("top")]);
    assert_eq!(report.exit_code(), 1);
    Ok(())
}

/// Node statuses follow the DFA: a warm node lands in `Cached`, a cold
/// one in `Success`.
#[test_log::test]
fn node_statuses_reflect_cache_state() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.write("in.txt", "bytes")?;
    let target = ws.target("t", "cp in.txt out.bin", &["in.txt"], &[], &["out.bin"]);

    let (ctx, _sink) = ws.context(1)?;
    let report = ctx.build(&TestWorkspace::roots(&["t"]), [target.clone()])?;
    assert_eq!(report.built.len(), 1);

    let (ctx, _sink) = ws.context(1)?;
    let report = ctx.build(&TestWorkspace::roots(&["t"]), [target])?;
    assert_eq!(report.cached.len(), 1);
    // The report's cached list is exactly the set of nodes that finished
    // in `Cached` status.
    assert_eq!(NodeStatus::Cached.is_terminal(), true);
    Ok(())
}
