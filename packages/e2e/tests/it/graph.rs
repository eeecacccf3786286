//! Graph-level scenarios: cycle rejection and missing references through
//! the public entry point.

use color_eyre::Result;
use e2e::TestWorkspace;
use mason::{BuildErrorKind, DependencyGraph, Target, TargetId};
use pretty_assertions::assert_eq;

/// A -> B -> C is fine; adding C -> A must fail with the offending path
/// and leave the graph untouched.
#[test_log::test]
fn cycle_rejection_reports_path() -> Result<()> {
    let mut graph = DependencyGraph::new();
    for name in ["a", "b", "c"] {
        graph.add_node(Target::new(TargetId::new("demo", name), "shell"));
    }
    let id = |name: &str| TargetId::new("demo", name);
    graph.add_edge(&id("a"), &id("b")).unwrap();
    graph.add_edge(&id("b"), &id("c")).unwrap();

    let err = graph.add_edge(&id("c"), &id("a")).unwrap_err();
    let BuildErrorKind::GraphCyclic { path } = err.kind() else {
        panic!("expected GraphCyclic, got {err}");
    };
    assert_eq!(
        path.iter().map(ToString::to_string).collect::<Vec<_>>(),
        vec!["demo:c", "demo:a", "demo:b", "demo:c"],
    );

    // State unchanged: c still has no dependencies, and the graph still
    // validates as a DAG.
    assert_eq!(graph.deps_of(&id("c")).count(), 0);
    graph.validate()?;
    Ok(())
}

/// A declared dependency on an unknown target is a configuration error
/// surfaced from `build` itself, with exit code 2.
#[test_log::test]
fn missing_dependency_is_a_config_violation() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let (ctx, _sink) = ws.context(2)?;

    let target = ws.target("app", "true", &[], &["ghost"], &[]);
    let err = ctx
        .build(&TestWorkspace::roots(&["app"]), [target])
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    Ok(())
}

/// Cycles across target declarations surface from `build` with exit
/// code 2 as well.
#[test_log::test]
fn declared_cycle_is_rejected_at_build_time() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let (ctx, _sink) = ws.context(2)?;

    let a = ws.target("a", "true", &[], &["b"], &[]);
    let b = ws.target("b", "true", &[], &["a"], &[]);
    let err = ctx
        .build(&TestWorkspace::roots(&["a"]), [a, b])
        .unwrap_err();

    assert!(matches!(err.kind(), BuildErrorKind::GraphCyclic { .. }));
    assert_eq!(err.exit_code(), 2);
    Ok(())
}

/// Two targets claiming the same output path cannot be scheduled
/// concurrently, so planning rejects the build outright.
#[test_log::test]
fn conflicting_output_declarations_are_rejected() -> Result<()> {
    let ws = TestWorkspace::new()?;
    let (ctx, _sink) = ws.context(2)?;

    let one = ws.target("one", "echo 1 > shared.out", &[], &[], &["shared.out"]);
    let two = ws.target("two", "echo 2 > shared.out", &[], &[], &["shared.out"]);
    let err = ctx
        .build(&TestWorkspace::roots(&["one", "two"]), [one, two])
        .unwrap_err();

    assert!(matches!(err.kind(), BuildErrorKind::ConfigInvalid { .. }));
    assert_eq!(err.exit_code(), 2);
    Ok(())
}
