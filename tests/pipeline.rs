//! End-to-end pipeline tests over the local backend.
//!
//! SLURM itself is not required here: a dry run prepares the complete
//! staging tree, and the generated entrypoint is then driven under plain
//! bash with `SLURM_ARRAY_TASK_ID` set, the way the array runner would
//! execute it.

use std::path::Path;
use std::process::Command;

use canine::backend::LocalBackend;
use canine::config::Config;
use canine::config::LocalizationOptions;
use canine::localization::Localizer;
use canine::orchestrator::Orchestrator;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;

/// Renders a single-task pipeline configuration staged under `staging`.
fn pipeline_yaml(staging: &Path, out: &Path) -> String {
    format!(
        "name: smoke\n\
         script:\n\
         \x20 - echo $FOO\n\
         inputs:\n\
         \x20 '0':\n\
         \x20   FOO: bar\n\
         outputs:\n\
         \x20 log: stdout\n\
         localization:\n\
         \x20 staging_dir: {staging}\n\
         \x20 output_dir: {out}\n",
        staging = staging.display(),
        out = out.display(),
    )
}

/// Runs a pipeline in dry run mode and returns its staging directory.
async fn prepare(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let staging = dir.path().join("staging");
    let out = dir.path().join("out");
    let config = Config::from_yaml_str(&pipeline_yaml(&staging, &out)).unwrap();
    let mut orchestrator = Orchestrator::new(config).unwrap();
    let outcome = orchestrator.run_pipeline(true).await.unwrap();
    assert!(outcome.batch_id.is_none());
    assert!(outcome.acct.is_none());
    assert_eq!(outcome.job_spec["0"]["FOO"], "bar");
    staging
}

#[tokio::test]
async fn dry_run_prepares_the_staging_tree() {
    let dir = tempfile::tempdir().unwrap();
    let staging = prepare(&dir).await;

    assert!(staging.join("common").is_dir());
    assert!(staging.join("outputs").is_dir());
    assert!(staging.join("jobs/0/workspace").is_dir());
    assert!(staging.join("jobs/0/teardown.sh").is_file());

    let entrypoint = std::fs::read_to_string(staging.join("entrypoint.sh")).unwrap();
    assert!(entrypoint.starts_with("#!/bin/bash\n"));
    assert!(entrypoint.contains("export CANINE_BACKEND=\"Local\""));
    assert!(entrypoint.contains("export CANINE_ADAPTER=\"Manual\""));
    assert!(entrypoint.contains(&format!(
        "export CANINE_ROOT=\"{}\"",
        staging.display()
    )));
    assert!(entrypoint.contains("source $CANINE_JOBS/$SLURM_ARRAY_TASK_ID/setup.sh"));
    assert!(entrypoint.ends_with(&format!("{}/script.sh\n", staging.display())));

    let script = std::fs::read_to_string(staging.join("script.sh")).unwrap();
    assert_eq!(script, "#!/bin/bash\necho $FOO\n");

    let setup = std::fs::read_to_string(staging.join("jobs/0/setup.sh")).unwrap();
    assert!(setup.contains("export CANINE_JOB_VARS=FOO"));
    assert!(setup.contains("export FOO=bar"));
}

#[tokio::test]
async fn two_task_pipelines_stage_every_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("staging");
    let yaml = format!(
        "script: ['echo $x']\n\
         inputs:\n\
         \x20 x: [a, b]\n\
         outputs:\n\
         \x20 log: stdout\n\
         localization:\n\
         \x20 staging_dir: {staging}\n",
        staging = staging.display(),
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    let mut orchestrator = Orchestrator::new(config).unwrap();
    let outcome = orchestrator.run_pipeline(true).await.unwrap();
    assert_eq!(outcome.job_spec.len(), 2);

    for (task, value) in [("0", "a"), ("1", "b")] {
        let setup = std::fs::read_to_string(
            staging.join("jobs").join(task).join("setup.sh"),
        )
        .unwrap();
        assert!(setup.contains(&format!("export x={value}")));
        assert!(staging.join("jobs").join(task).join("workspace").is_dir());
    }
}

#[tokio::test]
async fn outputs_round_trip_through_a_manual_array_run() {
    let dir = tempfile::tempdir().unwrap();
    let staging = prepare(&dir).await;

    // Execute array element 0 the way the scheduler would: bash runs the
    // entrypoint with the array index in the environment and stdio pointed
    // into the task workspace.
    let workspace = staging.join("jobs/0/workspace");
    let stdout = std::fs::File::create(workspace.join("stdout")).unwrap();
    let stderr = std::fs::File::create(workspace.join("stderr")).unwrap();
    let status = Command::new("/bin/bash")
        .arg(staging.join("entrypoint.sh"))
        .env("SLURM_ARRAY_TASK_ID", "0")
        .stdout(stdout)
        .stderr(stderr)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(
        std::fs::read_to_string(workspace.join("stdout")).unwrap(),
        "bar\n"
    );

    // Harvest the declared outputs back to the invoking host.
    let backend = LocalBackend::new();
    let options = LocalizationOptions {
        staging_dir: Some(staging.to_string_lossy().into_owned()),
        output_dir: dir.path().join("out").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let localizer = Localizer::new(&backend, &options).await.unwrap();
    let patterns = IndexMap::from_iter([("log".to_string(), "stdout".to_string())]);
    let outputs = localizer.delocalize(&patterns, Some("0"), true).await.unwrap();

    let log = Path::new(&outputs["0"]["log"]);
    assert!(log.starts_with(dir.path().join("out")));
    assert_eq!(std::fs::read_to_string(log).unwrap(), "bar\n");
    assert!(!workspace.join("stdout").exists());
}
