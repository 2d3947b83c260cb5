//! The end-to-end pipeline driver.
//!
//! The orchestrator consumes a parsed configuration, instantiates the adapter
//! and backend, stages the pipeline through a localizer, submits the SLURM
//! array, polls accounting until every array element reaches a terminal
//! state, and delocalizes each task's declared outputs as it finishes.

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use indexmap::IndexSet;
use tracing::info;
use tracing::warn;

use crate::VERSION;
use crate::adapter;
use crate::adapter::Adapter;
use crate::backend;
use crate::backend::AcctTable;
use crate::backend::Backend;
use crate::config::Config;
use crate::config::JobSpec;
use crate::config::LocalizationOptions;
use crate::config::Overrides;
use crate::config::RawInputs;
use crate::config::ScriptSource;
use crate::error::Error;
use crate::error::Result;
use crate::localization::Localizer;
use crate::localization::OutputMap;
use crate::utils::basename;
use crate::utils::join;

/// The interval between accounting polls while the array runs.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The result of a driven pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The submitted batch id; `None` under dry run.
    pub batch_id: Option<String>,
    /// The expanded job specification the array ran over.
    pub job_spec: JobSpec,
    /// The delocalized outputs per task.
    pub outputs: OutputMap,
    /// The final accounting table; `None` under dry run.
    pub acct: Option<AcctTable>,
}

/// Parses a configuration and runs a pipeline end to end.
pub struct Orchestrator {
    /// The pipeline name.
    name: String,
    /// The user script.
    script: ScriptSource,
    /// Raw inputs, prior to adapter expansion.
    raw_inputs: RawInputs,
    /// SLURM resource flags forwarded to `sbatch`.
    resources: IndexMap<String, String>,
    /// The instantiated adapter.
    adapter: Box<dyn Adapter>,
    /// The adapter's registry tag, exported into every task.
    adapter_type: &'static str,
    /// The instantiated backend.
    backend: Box<dyn Backend>,
    /// Localizer options.
    localization: LocalizationOptions,
    /// Per-input localization overrides.
    overrides: Overrides,
    /// Output name to glob pattern mapping.
    outputs: IndexMap<String, String>,
}

impl Orchestrator {
    /// Builds an orchestrator from a parsed configuration.
    ///
    /// Fails when the script path does not exist; unknown adapter and
    /// backend tags were already rejected during configuration parsing.
    pub fn new(config: Config) -> Result<Self> {
        if let ScriptSource::Path(path) = &config.script {
            if !Path::new(path).is_file() {
                return Err(Error::config(format!("script file `{path}` does not exist")));
            }
        }
        Ok(Self {
            name: config.name,
            script: config.script,
            raw_inputs: config.inputs,
            resources: config.resources,
            adapter: adapter::create(&config.adapter),
            adapter_type: config.adapter.type_name(),
            backend: backend::create(&config.backend),
            localization: config.localization,
            overrides: config.overrides,
            outputs: config.outputs,
        })
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the configured pipeline.
    ///
    /// Under `dry_run`, everything is prepared and localized in the staging
    /// directory (which is preserved) but nothing is ever submitted.
    pub async fn run_pipeline(&mut self, dry_run: bool) -> Result<PipelineOutcome> {
        let job_spec = self.adapter.parse_inputs(&self.raw_inputs)?;
        if job_spec.is_empty() {
            return Err(Error::config("the pipeline expanded to no tasks"));
        }
        info!(
            "preparing pipeline `{name}` with {count} task(s)",
            name = self.name,
            count = job_spec.len(),
        );

        info!("connecting to the {kind} backend", kind = self.backend.type_name());
        self.backend.enter().await?;
        let result = self.drive(&job_spec, dry_run).await;
        let shutdown = self.backend.exit().await;
        match result {
            Err(e) => {
                if let Err(shutdown) = shutdown {
                    warn!("backend shutdown also failed: {shutdown}");
                }
                Err(e)
            }
            Ok(outcome) => {
                shutdown?;
                Ok(outcome)
            }
        }
    }

    /// Runs the pipeline inside the backend scope.
    async fn drive(&self, job_spec: &JobSpec, dry_run: bool) -> Result<PipelineOutcome> {
        info!("initializing the pipeline workspace");
        let mut localizer = Localizer::new(&*self.backend, &self.localization).await?;
        localizer.enter().await?;
        let result = self.drive_staged(&mut localizer, job_spec, dry_run).await;
        // The staging tree survives a faulted exit for inspection, and a dry
        // run by design.
        let keep_staging = dry_run || result.is_err();
        let cleanup = localizer.exit(keep_staging).await;
        match result {
            Err(e) => {
                if let Err(cleanup) = cleanup {
                    warn!("staging cleanup also failed: {cleanup}");
                }
                Err(e)
            }
            Ok(outcome) => {
                cleanup?;
                Ok(outcome)
            }
        }
    }

    /// Runs the pipeline inside the localizer scope.
    async fn drive_staged(
        &self,
        localizer: &mut Localizer<'_>,
        job_spec: &JobSpec,
        dry_run: bool,
    ) -> Result<PipelineOutcome> {
        info!("localizing inputs");
        localizer.localize(job_spec, &self.overrides).await?;

        info!("preparing the pipeline script");
        let controller_root = localizer.staging_dir().to_string();
        let compute_root = localizer.mount_path().to_string();
        let entrypoint_path = join(&controller_root, "entrypoint.sh");
        let pipeline_script = match &self.script {
            ScriptSource::Path(path) => {
                let dest = join(&controller_root, basename(path));
                let transport = self.backend.transport().await?;
                transport.send(Path::new(path), &dest)?;
                transport.chmod(&dest, 0o775)?;
                join(&compute_root, basename(path))
            }
            ScriptSource::Lines(lines) => {
                self.backend
                    .pack_batch_script(lines, &join(&controller_root, "script.sh"))
                    .await?;
                join(&compute_root, "script.sh")
            }
        };

        let compute = localizer.compute_layout();
        let entrypoint = format!(
            "#!/bin/bash\n\
             export CANINE=\"{version}\"\n\
             export CANINE_BACKEND=\"{backend}\"\n\
             export CANINE_ADAPTER=\"{adapter}\"\n\
             export CANINE_ROOT=\"{root}\"\n\
             export CANINE_COMMON=\"{common}\"\n\
             export CANINE_OUTPUT=\"{output}\"\n\
             export CANINE_JOBS=\"{jobs}\"\n\
             source $CANINE_JOBS/$SLURM_ARRAY_TASK_ID/setup.sh\n\
             {pipeline_script}\n",
            version = VERSION,
            backend = self.backend.type_name(),
            adapter = self.adapter_type,
            root = compute.root(),
            common = compute.common(),
            output = compute.outputs(),
            jobs = compute.jobs(),
        );
        let compute_jobs = compute.jobs();
        {
            let transport = self.backend.transport().await?;
            transport.write_file(&entrypoint_path, entrypoint.as_bytes())?;
            transport.chmod(&entrypoint_path, 0o775)?;
        }

        info!("preparing task environments");
        for job_id in job_spec.keys() {
            localizer.localize_job(job_id, None, &self.outputs).await?;
        }

        if dry_run {
            info!("dry run requested; stopping before submission");
            return Ok(PipelineOutcome {
                batch_id: None,
                job_spec: job_spec.clone(),
                outputs: OutputMap::new(),
                acct: None,
            });
        }

        info!("waiting for the cluster to finish startup");
        self.backend.wait_for_cluster_ready(false).await?;

        info!("submitting the batch job");
        let mut flags = IndexMap::new();
        flags.insert("array".to_string(), format!("0-{}", job_spec.len() - 1));
        flags.insert(
            "output".to_string(),
            format!("{compute_jobs}/%a/workspace/stdout"),
        );
        flags.insert(
            "error".to_string(),
            format!("{compute_jobs}/%a/workspace/stderr"),
        );
        for (name, value) in &self.resources {
            flags.insert(name.clone(), value.clone());
        }
        let batch_id = self.backend.sbatch(&entrypoint_path, &flags).await?;
        info!("batch id: {batch_id}");

        let mut waiting: IndexSet<String> = (0..job_spec.len())
            .map(|index| format!("{batch_id}_{index}"))
            .collect();
        let mut outputs = OutputMap::new();
        while !waiting.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
            let acct = self.backend.sacct().await?;
            for job_id in waiting.clone() {
                let Some(row) = acct.get(&job_id) else {
                    continue;
                };
                if row.state.waiting() {
                    continue;
                }
                let Some((_, task)) = job_id.rsplit_once('_') else {
                    waiting.shift_remove(&job_id);
                    continue;
                };
                info!(
                    "delocalizing task {task} with status {state}",
                    state = row.state
                );
                outputs.extend(localizer.delocalize(&self.outputs, Some(task), true).await?);
                waiting.shift_remove(&job_id);
            }
        }

        info!("parsing output data");
        self.adapter.parse_outputs(&outputs);

        Ok(PipelineOutcome {
            batch_id: Some(batch_id),
            job_spec: job_spec.clone(),
            outputs,
            acct: Some(self.backend.sacct().await?),
        })
    }
}
