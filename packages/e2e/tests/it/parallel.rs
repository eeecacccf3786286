//! Parallel wave scheduling with real processes.

use color_eyre::Result;
use e2e::TestWorkspace;
use pretty_assertions::assert_eq;

/// Eight independent leaves and a root over four workers: nine actions
/// total, at most four in flight, root strictly after the leaves, and a
/// real parallel speedup.
#[test_log::test]
fn parallel_wave_respects_admission_and_order() -> Result<()> {
    let ws = TestWorkspace::new()?;

    let mut targets = Vec::new();
    let mut leaf_names = Vec::new();
    for index in 1..=8 {
        let name = format!("l{index}");
        targets.push(ws.target(
            &name,
            &format!("sleep 0.2; echo {name} > {name}.out"),
            &[],
            &[],
            &[&format!("{name}.out")],
        ));
        leaf_names.push(name);
    }
    let leaf_refs: Vec<&str> = leaf_names.iter().map(String::as_str).collect();
    // The root reads every leaf output, so it can only run after all of
    // them exist.
    targets.push(ws.target(
        "root",
        "cat l1.out l2.out l3.out l4.out l5.out l6.out l7.out l8.out > root.out",
        &[],
        &leaf_refs,
        &["root.out"],
    ));

    let (ctx, sink) = ws.context(4)?;
    let report = ctx.build(&TestWorkspace::roots(&["root"]), targets)?;

    assert!(report.success(), "failed: {:?}", report.failed);
    assert_eq!(sink.executed(), 9, "all nine actions execute cold");
    assert!(
        report.peak_in_flight <= 4,
        "admission bound violated: {} in flight",
        report.peak_in_flight
    );

    // Root ran last and saw every leaf's bytes.
    let root = ws.read("root.out")?;
    for index in 1..=8 {
        assert!(root.contains(&format!("l{index}")));
    }

    // Speedup check: with eight 200ms leaves on four workers, summed work
    // must be at least twice the wall clock.
    assert!(
        report.total_work >= report.duration.mul_f64(2.0),
        "no parallel speedup: work {:?} vs wall {:?}",
        report.total_work,
        report.duration
    );
    Ok(())
}

/// Diamond dependencies execute each shared node exactly once.
#[test_log::test]
fn diamond_executes_each_node_once() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let targets = vec![
        ws.target("base", "echo base > base.out", &[], &[], &["base.out"]),
        ws.target("left", "cp base.out left.out", &[], &["base"], &["left.out"]),
        ws.target("right", "cp base.out right.out", &[], &["base"], &["right.out"]),
        ws.target(
            "join",
            "cat left.out right.out > join.out",
            &[],
            &["left", "right"],
            &["join.out"],
        ),
    ];

    let (ctx, sink) = ws.context(4)?;
    let report = ctx.build(&TestWorkspace::roots(&["join"]), targets)?;

    assert!(report.success(), "failed: {:?}", report.failed);
    assert_eq!(sink.executed(), 4);
    assert_eq!(ws.read("join.out")?.matches("base").count(), 2);
    Ok(())
}
