//! Build feedback: extraction from real-looking tool output, then comparison
//! of successive builds under each change policy.

use std::path::PathBuf;

use coordination::feedback::canonical_order;
use coordination::{
    BuildObservation, BuildToolRegistry, ChangeComparator, ChangePolicy, ExtractError,
    ProcessOutput, RejectReason,
};

const MAVEN_LOG: &str = "\
[INFO] Scanning for projects...
[INFO] --- maven-compiler-plugin:3.11.0:compile (default-compile) @ demo ---
[INFO] Compiling 3 source files to /work/demo/target/classes
[INFO] -------------------------------------------------------------
[ERROR] COMPILATION ERROR :
[INFO] -------------------------------------------------------------
[ERROR] /work/demo/src/main/java/demo/A.java:[12,9] cannot find symbol
  symbol:   variable count
  location: class demo.A
[ERROR] /work/demo/src/main/java/demo/A.java:[30,17] incompatible types: int cannot be converted to java.lang.String
[ERROR] /work/demo/src/main/java/demo/B.java:[5,1] class, interface, enum, or record expected
[INFO] 3 errors
[INFO] -------------------------------------------------------------
[INFO] ------------------------------------------------------------------------
[INFO] BUILD FAILURE
[INFO] ------------------------------------------------------------------------
";

fn maven_observations() -> Vec<BuildObservation> {
    let tool = BuildToolRegistry::new()
        .create("maven", &PathBuf::from("/work/demo"))
        .unwrap();
    tool.extract(&ProcessOutput::new(MAVEN_LOG, "", Some(1))).unwrap()
}

fn obs(file: &str, line: u32, message: &str) -> BuildObservation {
    BuildObservation::new(message).with_file(file).at(line, Some(1))
}

// ── Extraction ─────────────────────────────────────────────────────

#[test]
fn test_successful_build_has_no_observations() {
    for name in ["maven", "cargo"] {
        let tool = BuildToolRegistry::new().create(name, &PathBuf::from("/work")).unwrap();
        let output = ProcessOutput::new("anything at all", "warning: noise", Some(0));
        assert!(tool.extract(&output).unwrap().is_empty(), "{name}");
    }
}

#[test]
fn test_maven_log_in_canonical_order() {
    let observations = maven_observations();
    assert_eq!(observations.len(), 3);

    // Files ascending, lines descending within a file.
    assert_eq!(observations[0].line, Some(30));
    assert_eq!(observations[1].line, Some(12));
    assert!(observations[1].message.contains("symbol:   variable count"));
    assert_eq!(
        observations[2].file.as_deref(),
        Some(PathBuf::from("/work/demo/src/main/java/demo/B.java").as_path())
    );

    assert_eq!(canonical_order(&observations), observations);
}

#[test]
fn test_unrecognized_failure_is_an_error() {
    let tool = BuildToolRegistry::new().create("maven", &PathBuf::from("/work")).unwrap();
    let err = tool
        .extract(&ProcessOutput::new("[INFO] something odd happened", "", Some(2)))
        .unwrap_err();
    assert!(matches!(err, ExtractError::NoObservations { exit_code: 2, .. }));

    let err = tool.extract(&ProcessOutput::new("", "", None)).unwrap_err();
    assert!(matches!(err, ExtractError::Terminated { .. }));
}

#[test]
fn test_stderr_only_failure() {
    let tool = BuildToolRegistry::new().create("maven", &PathBuf::from("/work")).unwrap();
    let observations = tool
        .extract(&ProcessOutput::new("", "sh: mvn: command not found\n", Some(1)))
        .unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].message, "sh: mvn: command not found");
    assert_eq!(observations[0].file, None);
    assert_eq!(observations[0].line, None);
}

#[test]
fn test_cargo_json_errors() {
    let stdout = r#"{"reason":"compiler-artifact","package_id":"x","target":{"name":"x"}}
{"reason":"compiler-message","package_id":"demo","target":{"name":"demo","src_path":"/w/src/lib.rs"},"message":{"message":"mismatched types","code":{"code":"E0308","explanation":null},"level":"error","spans":[{"file_name":"src/lib.rs","line_start":7,"column_start":13,"is_primary":true,"label":"expected `u32`, found `&str`"}],"children":[]}}
{"reason":"compiler-message","package_id":"demo","target":{"name":"demo","src_path":"/w/src/lib.rs"},"message":{"message":"unused variable: `x`","code":null,"level":"warning","spans":[],"children":[]}}
{"reason":"build-finished","success":false}
"#;
    let tool = BuildToolRegistry::new().create("cargo", &PathBuf::from("/w")).unwrap();
    let observations = tool.extract(&ProcessOutput::new(stdout, "", Some(101))).unwrap();

    assert_eq!(observations.len(), 1);
    let first = &observations[0];
    assert_eq!(first.code.as_deref(), Some("E0308"));
    assert_eq!(first.file, Some(PathBuf::from("/w/src/lib.rs")));
    assert_eq!((first.line, first.column), (Some(7), Some(13)));
    assert!(first.message.contains("expected `u32`, found `&str`"));
}

// ── Comparison ─────────────────────────────────────────────────────

#[test]
fn test_duplicate_observations_are_unchanged() {
    let a = obs("Foo.java", 10, "cannot find symbol").at(10, Some(5));
    let b = obs("Foo.java", 10, "cannot find symbol").at(10, Some(5));
    assert_eq!(a, b);

    let set = vec![a, b];
    let verdict = ChangeComparator::new(ChangePolicy::NoMaterialChange, "pom.xml").compare(&set, &set);
    assert_eq!(verdict.rejected, Some(RejectReason::Unchanged));
    assert!(verdict.feedback.unwrap().contains("all the same as before"));
}

#[test]
fn test_shrinking_subset_accepted_by_both_counting_policies() {
    let previous = vec![
        obs("A.java", 3, "cannot find symbol"),
        obs("A.java", 9, "incompatible types"),
        obs("B.java", 1, "missing return"),
    ];
    // Same diagnostic, shifted by an edit above it.
    let latest = vec![obs("A.java", 5, "cannot find symbol")];

    for policy in [ChangePolicy::Decreasing, ChangePolicy::NonIncreasing] {
        let verdict = ChangeComparator::new(policy, "pom.xml").compare(&previous, &latest);
        assert!(verdict.is_accepted(), "{policy}");
    }
}

#[test]
fn test_growth_rejected_by_both_counting_policies() {
    let previous = vec![obs("A.java", 3, "cannot find symbol")];
    let latest = vec![
        obs("A.java", 3, "cannot find symbol"),
        obs("A.java", 4, "not a statement"),
    ];

    let verdict = ChangeComparator::new(ChangePolicy::NonIncreasing, "pom.xml").compare(&previous, &latest);
    assert_eq!(verdict.rejected, Some(RejectReason::MoreErrors));
    let verdict = ChangeComparator::new(ChangePolicy::Decreasing, "pom.xml").compare(&previous, &latest);
    assert_eq!(verdict.rejected, Some(RejectReason::NotDecreased));
}

#[test]
fn test_new_descriptor_error_rejected_under_every_policy() {
    let previous = vec![obs("A.java", 3, "cannot find symbol")];
    let latest = vec![BuildObservation::new("Non-parseable POM").with_file("/work/pom.xml")];

    for policy in [
        ChangePolicy::NoMaterialChange,
        ChangePolicy::NonIncreasing,
        ChangePolicy::Decreasing,
    ] {
        let verdict = ChangeComparator::new(policy, "pom.xml").compare(&previous, &latest);
        assert_eq!(verdict.rejected, Some(RejectReason::DescriptorRegression), "{policy}");
        assert!(verdict.feedback.unwrap().contains("Non-parseable POM"));
    }
}

#[test]
fn test_disabled_comparison_and_empty_sets() {
    let previous = vec![obs("A.java", 3, "cannot find symbol")];
    let worse = vec![
        obs("A.java", 3, "cannot find symbol"),
        obs("C.java", 1, "unexpected token"),
    ];

    let comparator = ChangeComparator::new(ChangePolicy::Decreasing, "pom.xml");
    assert!(comparator.compare(&previous, &[]).is_accepted());
    assert!(comparator.compare(&[], &worse).is_accepted());
    assert!(comparator.clone().enabled(false).compare(&previous, &worse).is_accepted());
}
