//! Resolution of raw configuration into a validated RunConfig.

use std::fs;
use std::path::{Path, PathBuf};

use eptm_core::config::{resolve, CaptureMode, ConcurrencyPolicy, EngineSpec, RawConfig, StdioMode};
use eptm_core::{AuxiliaryFiles, AuxiliaryOverrides, ConfigError, StudyDefinition};
use tempfile::TempDir;

/// Lay out config/calib/output directories the way a study expects them.
fn fixture() -> (TempDir, RawConfig) {
    let root = tempfile::tempdir().expect("tempdir");
    let raw = layout(root.path());
    (root, raw)
}

fn layout(root: &Path) -> RawConfig {
    let config_dir = root.join("config");
    let calib_dir = root.join("calib");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(&calib_dir).unwrap();
    for name in AuxiliaryFiles::default().ordered() {
        fs::write(config_dir.join(name), "x").unwrap();
    }
    fs::write(calib_dir.join("behavior_parameters.h5"), "h5").unwrap();
    let engine = root.join("eptm-engine");
    fs::write(&engine, "#!/bin/sh\n").unwrap();

    let mut raw = RawConfig::default();
    raw.engine.executable = Some(engine);
    raw.paths.config_dir = Some(config_dir);
    raw.paths.calibration_dir = Some(calib_dir);
    raw.paths.output_dir = Some(root.join("out"));
    raw
}

fn expect_missing(err: ConfigError, needle: &str) {
    match &err {
        ConfigError::Missing { resource, path } => {
            assert!(
                resource.contains(needle) || path.to_string_lossy().contains(needle),
                "unexpected missing resource: {err}"
            );
        }
        other => panic!("expected Missing, got {other:?}"),
    }
}

#[test]
fn test_resolves_valid_layout() {
    let (root, raw) = fixture();
    let config = resolve(&raw, "RUN_1").expect("resolve");

    assert!(matches!(config.engine, EngineSpec::Native { .. }));
    assert_eq!(config.junctions_dir, config.config_dir);
    assert_eq!(config.input_dir, config.config_dir);
    assert_eq!(config.output_dir, root.path().join("out"));
    assert_eq!(config.execution.policy, ConcurrencyPolicy::Serial);
    assert!(config.execution.timeout.is_none());
    assert!(matches!(config.execution.stdio, StdioMode::Capture { .. }));
    assert!(!config.output_dir.exists(), "resolution must not create directories");
}

#[test]
fn test_missing_engine_is_named() {
    let (root, mut raw) = fixture();
    raw.engine.executable = Some(root.path().join("no-such-engine"));
    expect_missing(resolve(&raw, "1").unwrap_err(), "engine executable");
}

#[test]
fn test_missing_behavior_file_is_named() {
    let (_root, mut raw) = fixture();
    raw.files.behavior_base = "other_behavior".to_string();
    expect_missing(resolve(&raw, "1").unwrap_err(), "other_behavior.h5");
}

#[test]
fn test_per_release_behavior_skips_shared_file_check() {
    let (_root, mut raw) = fixture();
    raw.files.behavior_base = "per_release".to_string();
    raw.files.per_release_behavior = true;
    assert!(resolve(&raw, "1").is_ok());
}

#[test]
fn test_missing_auxiliary_file_is_named() {
    let (_root, mut raw) = fixture();
    let config_dir = raw.paths.config_dir.clone().unwrap();
    fs::remove_file(config_dir.join("latd2Ep.csv")).unwrap();
    expect_missing(resolve(&raw, "1").unwrap_err(), "latd2Ep.csv");
}

#[test]
fn test_junctions_read_from_junctions_dir() {
    let (root, mut raw) = fixture();
    let junctions_dir = root.path().join("junctions");
    fs::create_dir_all(&junctions_dir).unwrap();
    raw.paths.junctions_dir = Some(junctions_dir.clone());
    expect_missing(resolve(&raw, "1").unwrap_err(), "Junctions812.csv");

    fs::write(junctions_dir.join("Junctions812.csv"), "j").unwrap();
    let config = resolve(&raw, "1").expect("resolve");
    assert_eq!(config.junctions_dir, junctions_dir);
}

#[test]
fn test_missing_config_dir_fails_fast() {
    let (root, mut raw) = fixture();
    raw.paths.config_dir = Some(root.path().join("nowhere"));
    expect_missing(resolve(&raw, "1").unwrap_err(), "configuration directory");
}

#[test]
fn test_empty_fields_rejected() {
    let (_root, mut raw) = fixture();
    raw.paths.output_dir = Some(PathBuf::new());
    assert!(matches!(
        resolve(&raw, "1").unwrap_err(),
        ConfigError::EmptyField { field: "paths.output_dir" }
    ));

    let (_root, mut raw) = fixture();
    raw.paths.calibration_dir = None;
    assert!(matches!(
        resolve(&raw, "1").unwrap_err(),
        ConfigError::EmptyField { field: "paths.calibration_dir" }
    ));
}

#[test]
fn test_output_dir_needs_existing_parent() {
    let (root, mut raw) = fixture();
    raw.paths.output_dir = Some(root.path().join("a").join("b"));
    expect_missing(resolve(&raw, "1").unwrap_err(), "output directory");
}

#[test]
fn test_jar_engine_with_explicit_runtime() {
    let (root, mut raw) = fixture();
    let jar = root.path().join("ePTM.jar");
    let java = root.path().join("java");
    fs::write(&jar, "jar").unwrap();
    fs::write(&java, "java").unwrap();
    raw.engine.executable = None;
    raw.engine.jar = Some(jar.clone());
    raw.engine.runtime = Some(java.to_string_lossy().into_owned());

    let config = resolve(&raw, "1").expect("resolve");
    match config.engine {
        EngineSpec::Jar { runtime, jar: j, jvm } => {
            assert_eq!(runtime, java);
            assert_eq!(j, jar);
            assert_eq!(jvm.max_heap, "1024M");
        }
        other => panic!("expected jar engine, got {other:?}"),
    }
}

#[test]
fn test_unknown_runtime_rejected() {
    let (root, mut raw) = fixture();
    let jar = root.path().join("ePTM.jar");
    fs::write(&jar, "jar").unwrap();
    raw.engine.executable = None;
    raw.engine.jar = Some(jar);
    raw.engine.runtime = Some("definitely-not-a-java-runtime-9f2c".to_string());
    assert!(matches!(
        resolve(&raw, "1").unwrap_err(),
        ConfigError::RuntimeNotFound { .. }
    ));
}

#[test]
fn test_bad_jvm_size_rejected() {
    let (root, mut raw) = fixture();
    let jar = root.path().join("ePTM.jar");
    fs::write(&jar, "jar").unwrap();
    raw.engine.executable = None;
    raw.engine.jar = Some(jar);
    raw.engine.jvm.max_heap = "lots".to_string();
    assert!(matches!(resolve(&raw, "1").unwrap_err(), ConfigError::Invalid(_)));
}

#[test]
fn test_execution_settings_validated() {
    let (_root, mut raw) = fixture();
    raw.execution.max_parallel = Some(0);
    assert!(matches!(resolve(&raw, "1").unwrap_err(), ConfigError::Invalid(_)));

    let (_root, mut raw) = fixture();
    raw.execution.timeout_secs = Some(0);
    assert!(matches!(resolve(&raw, "1").unwrap_err(), ConfigError::Invalid(_)));

    let (_root, mut raw) = fixture();
    raw.execution.max_parallel = Some(4);
    raw.execution.timeout_secs = Some(5);
    raw.execution.capture = CaptureMode::LogFiles;
    let config = resolve(&raw, "1").expect("resolve");
    assert_eq!(
        config.execution.policy,
        ConcurrencyPolicy::BoundedParallel { max_in_flight: 4 }
    );
    assert_eq!(config.execution.timeout.map(|t| t.as_secs()), Some(5));
    assert_eq!(
        config.execution.stdio,
        StdioMode::LogFiles {
            dir: config.output_dir.join("logs")
        }
    );
}

#[test]
fn test_study_auxiliary_override_applies_to_that_study_only() {
    let (_root, mut raw) = fixture();
    let config_dir = raw.paths.config_dir.clone().unwrap();
    fs::write(config_dir.join("latVel_wet.csv"), "v").unwrap();
    raw.studies.insert(
        "WET".to_string(),
        StudyDefinition {
            points: vec!["1".to_string()],
            auxiliary: Some(AuxiliaryOverrides {
                lateral_velocity: Some("latVel_wet.csv".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let wet = resolve(&raw, "WET").expect("resolve WET");
    assert_eq!(wet.auxiliary.lateral_velocity, "latVel_wet.csv");

    let dry = resolve(&raw, "DRY").expect("resolve DRY");
    assert_eq!(dry.auxiliary.lateral_velocity, "latVel.csv");
}

#[test]
fn test_auxiliary_names_must_be_bare() {
    let (_root, mut raw) = fixture();
    raw.auxiliary.junctions = Some("../Junctions812.csv".to_string());
    assert!(matches!(resolve(&raw, "1").unwrap_err(), ConfigError::Invalid(_)));
}

#[test]
fn test_invalid_study_definition_rejected() {
    let (_root, mut raw) = fixture();
    raw.studies.insert(
        "BAD".to_string(),
        StudyDefinition {
            points: vec!["1".to_string(), "../2".to_string()],
            ..Default::default()
        },
    );
    assert!(matches!(resolve(&raw, "BAD").unwrap_err(), ConfigError::Invalid(_)));
}

#[test]
fn test_undeclared_study_id_must_be_a_design_point() {
    let (_root, raw) = fixture();
    assert!(matches!(
        resolve(&raw, "bad id").unwrap_err(),
        ConfigError::DesignPoint { .. }
    ));
}

#[test]
fn test_relative_paths_become_absolute() {
    let root = tempfile::Builder::new()
        .prefix("eptm-relative")
        .tempdir_in(".")
        .expect("tempdir");
    let relative = PathBuf::from(".").join(root.path().file_name().unwrap());
    assert!(relative.is_relative());

    let raw = layout(&relative);
    let config = resolve(&raw, "1").expect("resolve");
    assert!(config.config_dir.is_absolute());
    assert!(config.calibration_dir.is_absolute());
    assert!(config.output_dir.is_absolute());
    match &config.engine {
        EngineSpec::Native { executable } => assert!(executable.is_absolute()),
        other => panic!("expected native engine, got {other:?}"),
    }
}

#[test]
fn test_load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eptm.toml");
    fs::write(&path, "[execution]\nmax_parallel = 2\n").unwrap();
    let raw = RawConfig::load(&path).expect("load");
    assert_eq!(raw.execution.max_parallel, Some(2));

    let err = RawConfig::load(&dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
