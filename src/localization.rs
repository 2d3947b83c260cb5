//! Input localization and output delocalization.
//!
//! The localizer owns every filesystem side effect on the shared staging
//! area: it plans how each input is materialized, stages common and per-task
//! files, writes the per-task setup and teardown scripts, and harvests
//! declared outputs back to the invoking host after tasks finish.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use globset::Glob;
use globset::GlobMatcher;
use indexmap::IndexMap;
use indexmap::IndexSet;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::backend::Backend;
use crate::backend::Transport;
use crate::config::JobSpec;
use crate::config::LocalizationOptions;
use crate::config::Overrides;
use crate::error::Error;
use crate::error::Result;
use crate::utils::basename;
use crate::utils::is_gs_uri;
use crate::utils::join;
use crate::utils::quote;
use crate::utils::splitext;

/// The stderr marker `gsutil` prints for unbilled requester pays access.
const REQUESTER_PAYS_MARKER: &str = "requester pays bucket but no user project provided";

/// Delocalized outputs: task id to output name to local path.
pub type OutputMap = IndexMap<String, IndexMap<String, String>>;

/// How an input value is realized for a task at job start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Localization {
    /// The carried value (a staged path or a literal) is exported as-is.
    Passthrough(String),
    /// A FIFO is created at task start and the cloud object streams into it.
    Stream(String),
    /// The cloud object is downloaded at task start before the script runs.
    Download(String),
}

/// The staging directory layout rooted at one view of the shared area.
#[derive(Debug, Clone)]
pub(crate) struct StagingLayout {
    /// The root of the staging area in this view.
    root: String,
}

impl StagingLayout {
    /// Creates a layout rooted at the given path.
    fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// The staging root.
    pub(crate) fn root(&self) -> &str {
        &self.root
    }

    /// The directory holding deduplicated common inputs.
    pub(crate) fn common(&self) -> String {
        join(&self.root, "common")
    }

    /// The delocalization staging directory.
    pub(crate) fn outputs(&self) -> String {
        join(&self.root, "outputs")
    }

    /// The directory holding the per-task subtrees.
    pub(crate) fn jobs(&self) -> String {
        join(&self.root, "jobs")
    }

    /// One task's subtree.
    fn job(&self, job_id: &str) -> String {
        join(&self.jobs(), job_id)
    }

    /// One task's working directory.
    fn workspace(&self, job_id: &str) -> String {
        join(&self.job(job_id), "workspace")
    }

    /// One task's localized input directory.
    fn inputs(&self, job_id: &str) -> String {
        join(&self.job(job_id), "inputs")
    }

    /// One task's setup script.
    fn setup(&self, job_id: &str) -> String {
        join(&self.job(job_id), "setup.sh")
    }

    /// One task's teardown script.
    fn teardown(&self, job_id: &str) -> String {
        join(&self.job(job_id), "teardown.sh")
    }
}

/// Reserves a destination under `dir` for `name`, renaming with `._alt`
/// until the path does not exist. Returns the path and the final name.
fn reserve_path(transport: &dyn Transport, dir: &str, name: &str) -> (String, String) {
    let mut final_name = name.to_string();
    let mut path = join(dir, &final_name);
    while transport.exists(&path) {
        let (stem, ext) = splitext(&final_name);
        final_name = format!("{stem}._alt{ext}");
        path = join(dir, &final_name);
    }
    (path, final_name)
}

/// Handles file localization and delocalization over one staging area.
///
/// The localizer assumes its backend is entered and functional for the whole
/// of its life cycle. On clean exit the staging area is removed; a faulted
/// exit (or a dry run) leaves the tree behind for inspection.
pub struct Localizer<'a> {
    /// The backend whose filesystem is staged into.
    backend: &'a dyn Backend,
    /// Whether `gs://` inputs are copied by the controller.
    localize_gs: bool,
    /// Whether shared inputs are deduplicated into the common directory.
    common: bool,
    /// The directory on the invoking host that outputs land in.
    output_dir: String,
    /// The staging layout as the controller sees it.
    controller: StagingLayout,
    /// The staging layout as workers see it.
    compute: StagingLayout,
    /// Planned localization records: task id to input name to record.
    inputs: IndexMap<String, IndexMap<String, Localization>>,
    /// Values shared by enough tasks to be staged once.
    common_inputs: IndexSet<String>,
    /// Per-bucket requester pays probe results.
    requester_pays: HashMap<String, bool>,
    /// The memoized default billing project, probed at most once.
    billing_project: Option<Option<String>>,
    /// Whether planning has already run.
    localized: bool,
}

impl<'a> Localizer<'a> {
    /// Creates a localizer over the given backend.
    ///
    /// A random staging directory name is chosen when the options supply
    /// none; the worker view defaults to the controller view, normalized.
    pub async fn new(backend: &'a dyn Backend, options: &LocalizationOptions) -> Result<Self> {
        let staging_dir = options
            .staging_dir
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let transport = backend.transport().await?;
        let mount_path =
            transport.normpath(options.mount_path.as_deref().unwrap_or(&staging_dir));
        Ok(Self {
            backend,
            localize_gs: options.localize_gs,
            common: options.common,
            output_dir: options.output_dir.clone(),
            controller: StagingLayout::new(staging_dir),
            compute: StagingLayout::new(mount_path),
            inputs: IndexMap::new(),
            common_inputs: IndexSet::new(),
            requester_pays: HashMap::new(),
            billing_project: None,
            localized: false,
        })
    }

    /// The staging root as the controller sees it.
    pub fn staging_dir(&self) -> &str {
        self.controller.root()
    }

    /// The staging root as workers see it.
    pub fn mount_path(&self) -> &str {
        self.compute.root()
    }

    /// The worker-view staging layout.
    pub(crate) fn compute_layout(&self) -> &StagingLayout {
        &self.compute
    }

    /// The planned localization record for one input, once planning ran.
    pub fn record(&self, job_id: &str, name: &str) -> Option<&Localization> {
        self.inputs.get(job_id)?.get(name)
    }

    /// Builds the staging directory tree.
    pub async fn enter(&self) -> Result<()> {
        let transport = self.backend.transport().await?;
        for dir in [
            self.controller.root().to_string(),
            self.controller.common(),
            self.controller.outputs(),
            self.controller.jobs(),
        ] {
            if !transport.isdir(&dir) {
                transport.makedirs(&dir)?;
            }
        }
        Ok(())
    }

    /// Releases the staging area.
    ///
    /// Outputs are assumed to have been delocalized already. When
    /// `keep_staging` is set (faulted exit, dry run) the tree is preserved
    /// for inspection.
    pub async fn exit(&self, keep_staging: bool) -> Result<()> {
        if keep_staging {
            info!(
                "preserving staging directory {root}",
                root = self.controller.root()
            );
            return Ok(());
        }
        let command = format!("rm -rf {}", quote(self.controller.root())?);
        self.backend.invoke(&command).await?.check(&command)?;
        Ok(())
    }

    /// Whether the object's bucket is requester pays, probed at most once
    /// per bucket.
    async fn is_requester_pays(&mut self, uri: &str) -> bool {
        let bucket = uri
            .strip_prefix("gs://")
            .unwrap_or(uri)
            .split('/')
            .next()
            .unwrap_or("")
            .to_string();
        if let Some(flag) = self.requester_pays.get(&bucket) {
            return *flag;
        }
        let command = format!("gsutil ls gs://{bucket}");
        match self.backend.invoke(&command).await {
            Ok(invocation) => {
                let flag = invocation.stderr_lossy().contains(REQUESTER_PAYS_MARKER);
                self.requester_pays.insert(bucket, flag);
                flag
            }
            Err(e) => {
                debug!("requester pays probe failed: {e}");
                false
            }
        }
    }

    /// The default billing project, probed from the cloud CLI at most once.
    async fn billing_project(&mut self) -> Option<String> {
        if let Some(memo) = &self.billing_project {
            return memo.clone();
        }
        let project = match self.backend.invoke("gcloud config get-value project").await {
            Ok(invocation) if invocation.ok() => {
                let project = invocation.stdout_lossy().trim().to_string();
                (!project.is_empty() && project != "(unset)").then_some(project)
            }
            _ => None,
        };
        if project.is_none() {
            warn!("no default billing project is configured; requester pays buckets will fail");
        }
        self.billing_project = Some(project.clone());
        project
    }

    /// The `gsutil` billing flag (with a trailing space) for an object, or
    /// an empty string when none is needed.
    async fn gsutil_billing_flag(&mut self, uri: &str) -> Result<String> {
        if self.is_requester_pays(uri).await {
            if let Some(project) = self.billing_project().await {
                return Ok(format!("-u {} ", quote(&project)?));
            }
        }
        Ok(String::new())
    }

    /// Stages one file under a task's input directory and returns the
    /// compute-visible path.
    ///
    /// Common and stream handling are decided by the caller; this only
    /// handles per-task destinations. With `delayed` set, a destination is
    /// reserved but nothing is copied.
    async fn stage_file(
        &mut self,
        transport: &dyn Transport,
        job_id: &str,
        value: &str,
        delayed: bool,
    ) -> Result<String> {
        let dir = self.controller.inputs(job_id);
        transport.makedirs(&dir)?;
        let (controller_path, final_name) = reserve_path(transport, &dir, basename(value));
        if !delayed {
            if is_gs_uri(value) && self.localize_gs {
                let flag = self.gsutil_billing_flag(value).await?;
                let command = format!(
                    "gsutil {flag}cp {src} {dst}",
                    src = quote(value)?,
                    dst = quote(&controller_path)?,
                );
                self.backend
                    .invoke(&command)
                    .await?
                    .check(&command)
                    .map_err(|e| {
                        Error::localization(format!("failed to localize `{value}`: {e}"))
                    })?;
            } else if Path::new(value).is_file() {
                transport.send(Path::new(value), &controller_path)?;
            }
        }
        Ok(join(&self.compute.inputs(job_id), &final_name))
    }

    /// Applies the no-override handling rules to one input value.
    async fn default_record(
        &mut self,
        transport: &dyn Transport,
        job_id: &str,
        value: &str,
        common_dests: &IndexMap<String, String>,
    ) -> Result<Localization> {
        if let Some(dest) = common_dests.get(value) {
            return Ok(Localization::Passthrough(dest.clone()));
        }
        if Path::new(value).is_file() || (is_gs_uri(value) && self.localize_gs) {
            let staged = self.stage_file(transport, job_id, value, false).await?;
            return Ok(Localization::Passthrough(staged));
        }
        Ok(Localization::Passthrough(value.to_string()))
    }

    /// Plans and eagerly materializes all inputs.
    ///
    /// May be called at most once per localizer. Overrides are per input
    /// name: `common`, `localize`, `stream`, `delayed`, or `null`.
    pub async fn localize(&mut self, inputs: &JobSpec, overrides: &Overrides) -> Result<()> {
        if self.localized {
            return Err(Error::localization(
                "localize may only be called once per localizer",
            ));
        }
        self.localized = true;

        // Normalize: modes are case-insensitive, and non-string override
        // values (plus the spelled-out null) all mean pass through verbatim.
        let overrides: IndexMap<&str, Option<String>> = overrides
            .iter()
            .map(|(name, mode)| {
                let mode = mode
                    .as_ref()
                    .map(|m| m.to_ascii_lowercase())
                    .filter(|m| m != "null" && m != "none");
                (name.as_str(), mode)
            })
            .collect();

        let transport = self.backend.transport().await?;

        if self.common {
            let mut seen = IndexSet::new();
            for values in inputs.values() {
                for (name, value) in values {
                    let mode = overrides.get(name.as_str());
                    let is_common_override =
                        matches!(mode, Some(Some(m)) if m == "common");
                    if seen.contains(value.as_str()) && (mode.is_none() || is_common_override) {
                        self.common_inputs.insert(value.clone());
                    }
                    if is_common_override {
                        self.common_inputs.insert(value.clone());
                    }
                    seen.insert(value.as_str());
                }
            }
        }

        // Materialize the common set once, remembering value -> staged path.
        let mut common_dests: IndexMap<String, String> = IndexMap::new();
        let common_values: Vec<String> = self.common_inputs.iter().cloned().collect();
        for value in common_values {
            if is_gs_uri(&value) && self.localize_gs {
                let dir = self.controller.common();
                let (controller_path, final_name) =
                    reserve_path(&*transport, &dir, basename(&value));
                let flag = self.gsutil_billing_flag(&value).await?;
                let command = format!(
                    "gsutil {flag}cp {src} {dst}",
                    src = quote(&value)?,
                    dst = quote(&controller_path)?,
                );
                self.backend
                    .invoke(&command)
                    .await?
                    .check(&command)
                    .map_err(|e| {
                        Error::localization(format!("failed to localize `{value}`: {e}"))
                    })?;
                common_dests.insert(value, join(&self.compute.common(), &final_name));
            } else if Path::new(&value).is_file() {
                let dir = self.controller.common();
                let (controller_path, final_name) =
                    reserve_path(&*transport, &dir, basename(&value));
                transport.send(Path::new(&value), &controller_path)?;
                common_dests.insert(value, join(&self.compute.common(), &final_name));
            } else {
                warn!("could not handle common input `{value}`");
            }
        }

        for (job_id, values) in inputs {
            let workspace = self.controller.workspace(job_id);
            if !transport.isdir(&workspace) {
                transport.makedirs(&workspace)?;
            }
            let mut records = IndexMap::new();
            for (name, value) in values {
                let record = match overrides.get(name.as_str()) {
                    Some(Some(mode)) => match mode.as_str() {
                        "stream" => Localization::Stream(value.clone()),
                        "localize" => Localization::Passthrough(
                            self.stage_file(&*transport, job_id, value, false).await?,
                        ),
                        "delayed" => {
                            if is_gs_uri(value) {
                                Localization::Download(value.clone())
                            } else {
                                warn!(
                                    "ignoring `delayed` override for {name} with value \
                                     {value}; localizing now"
                                );
                                Localization::Passthrough(
                                    self.stage_file(&*transport, job_id, value, false).await?,
                                )
                            }
                        }
                        "common" => match common_dests.get(value) {
                            Some(dest) => Localization::Passthrough(dest.clone()),
                            None => {
                                warn!(
                                    "input {name} is overridden to `common` but its value \
                                     could not be staged; passing it through"
                                );
                                Localization::Passthrough(value.clone())
                            }
                        },
                        other => {
                            warn!(
                                "unknown localization override `{other}` for input {name}; \
                                 using default handling"
                            );
                            self.default_record(&*transport, job_id, value, &common_dests)
                                .await?
                        }
                    },
                    Some(None) => Localization::Passthrough(value.clone()),
                    None => {
                        self.default_record(&*transport, job_id, value, &common_dests)
                            .await?
                    }
                };
                records.insert(name.clone(), record);
            }
            self.inputs.insert(job_id.clone(), records);
        }
        Ok(())
    }

    /// Writes one task's setup and teardown scripts, completing its
    /// localization. Returns the compute-visible setup script path.
    pub async fn localize_job(
        &mut self,
        job_id: &str,
        setup_text: Option<&str>,
        patterns: &IndexMap<String, String>,
    ) -> Result<String> {
        let transport = self.backend.transport().await?;
        let records = self
            .inputs
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::localization(format!("no localized inputs for task `{job_id}`")))?;

        let job_vars = records
            .keys()
            .map(|name| quote(name))
            .collect::<Result<Vec<_>>>()?;
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("export CANINE_JOB_VARS={}", job_vars.join(":")),
            format!("export CANINE_JOB_INPUTS={}", quote(&self.compute.inputs(job_id))?),
            format!("export CANINE_JOB_ROOT={}", quote(&self.compute.workspace(job_id))?),
            format!("export CANINE_JOB_SETUP={}", quote(&self.compute.setup(job_id))?),
            format!(
                "export CANINE_JOB_TEARDOWN={}",
                quote(&self.compute.teardown(job_id))?
            ),
            "if [[ -d $CANINE_JOB_INPUTS ]]; then cd $CANINE_JOB_INPUTS; fi".to_string(),
        ];
        for (name, record) in &records {
            match record {
                Localization::Stream(uri) => {
                    let dest = self.stage_file(&*transport, job_id, uri, true).await?;
                    let flag = self.gsutil_billing_flag(uri).await?;
                    lines.push(format!("mkfifo {}", quote(&dest)?));
                    lines.push(format!(
                        "gsutil {flag}cat {src} > {dst} &",
                        src = quote(uri)?,
                        dst = quote(&dest)?,
                    ));
                    lines.push(format!("export {name}={}", quote(&dest)?));
                }
                Localization::Download(uri) => {
                    let dest = self.stage_file(&*transport, job_id, uri, true).await?;
                    let flag = self.gsutil_billing_flag(uri).await?;
                    lines.push(format!(
                        "gsutil {flag}cp {src} {dst}",
                        src = quote(uri)?,
                        dst = quote(&dest)?,
                    ));
                    lines.push(format!("export {name}={}", quote(&dest)?));
                }
                Localization::Passthrough(value) => {
                    lines.push(format!("export {name}={}", quote(value)?));
                }
            }
        }
        if let Some(text) = setup_text {
            lines.push(text.to_string());
        }
        lines.push("cd $CANINE_JOB_ROOT".to_string());
        let script = lines.join("\n") + "\n";

        let setup_path = self.controller.setup(job_id);
        transport.write_file(&setup_path, script.as_bytes())?;
        transport.chmod(&setup_path, 0o775)?;

        let teardown_path = self.controller.teardown(job_id);
        let teardown = self.render_teardown(job_id, patterns)?;
        transport.write_file(&teardown_path, teardown.as_bytes())?;
        transport.chmod(&teardown_path, 0o775)?;

        Ok(self.compute.setup(job_id))
    }

    /// Renders the teardown script that collects declared outputs into the
    /// delocalization staging area on the share.
    fn render_teardown(&self, job_id: &str, patterns: &IndexMap<String, String>) -> Result<String> {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "cd $CANINE_JOB_ROOT".to_string(),
            "shopt -s nullglob".to_string(),
        ];
        let staging = join(&self.compute.outputs(), job_id);
        for (name, pattern) in patterns {
            let dest = quote(&join(&staging, name))?;
            lines.push(format!("mkdir -p {dest}"));
            lines.push(format!(
                "for output_file in {pattern}; do cp -r \"$output_file\" {dest}/; done"
            ));
        }
        Ok(lines.join("\n") + "\n")
    }

    /// Harvests declared outputs for one task (or all tasks) back to the
    /// invoking host.
    ///
    /// Each pattern is matched against the file's absolute path and its path
    /// relative to the task workspace. Matches land in
    /// `<output_dir>/<task>/<name>/<basename>`; with `delete` set they are
    /// removed from the worker tree afterwards.
    pub async fn delocalize(
        &self,
        patterns: &IndexMap<String, String>,
        job_id: Option<&str>,
        delete: bool,
    ) -> Result<OutputMap> {
        let transport = self.backend.transport().await?;
        match job_id {
            Some(job_id) => self.delocalize_task(&*transport, patterns, job_id, delete),
            None => {
                let mut outputs = OutputMap::new();
                for job_id in transport.listdir(&self.controller.jobs())? {
                    outputs.extend(self.delocalize_task(
                        &*transport,
                        patterns,
                        &job_id,
                        delete,
                    )?);
                }
                Ok(outputs)
            }
        }
    }

    /// Walks one task's workspace and harvests every pattern match.
    fn delocalize_task(
        &self,
        transport: &dyn Transport,
        patterns: &IndexMap<String, String>,
        job_id: &str,
        delete: bool,
    ) -> Result<OutputMap> {
        let matchers = patterns
            .iter()
            .map(|(name, pattern)| {
                Glob::new(pattern)
                    .map(|glob| (name.clone(), glob.compile_matcher()))
                    .map_err(|e| {
                        Error::localization(format!("invalid output pattern `{pattern}`: {e}"))
                    })
            })
            .collect::<Result<Vec<(String, GlobMatcher)>>>()?;

        let workspace = self.controller.workspace(job_id);
        let prefix = format!("{workspace}/");
        let mut outputs = IndexMap::new();
        for entry in transport.walk(&workspace)? {
            for file in &entry.files {
                let full = join(&entry.dir, file);
                let relative = full.strip_prefix(&prefix).unwrap_or(&full);
                let mut matched = false;
                for (name, matcher) in &matchers {
                    if matcher.is_match(&full) || matcher.is_match(relative) {
                        let local = self.delocalize_file(transport, job_id, name, &full)?;
                        outputs.insert(name.clone(), local);
                        matched = true;
                    }
                }
                if matched && delete && transport.isfile(&full) {
                    transport.remove(&full)?;
                }
            }
        }
        Ok(OutputMap::from_iter([(job_id.to_string(), outputs)]))
    }

    /// Copies one matched output file back to the invoking host.
    fn delocalize_file(
        &self,
        transport: &dyn Transport,
        job_id: &str,
        name: &str,
        full: &str,
    ) -> Result<String> {
        let dest_dir: PathBuf = [self.output_dir.as_str(), job_id, name].iter().collect();
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(basename(full));
        transport.receive(full, &dest)?;
        Ok(dest.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::LocalBackend;
    use crate::backend::LocalTransport;

    /// Builds a job spec from task/name/value triples.
    fn spec(entries: &[(&str, &[(&str, &str)])]) -> JobSpec {
        entries
            .iter()
            .map(|(job, inputs)| {
                (
                    job.to_string(),
                    inputs
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect(),
                )
            })
            .collect()
    }

    /// Creates a localizer staged under a fresh temporary directory.
    async fn localizer<'a>(
        backend: &'a LocalBackend,
        dir: &tempfile::TempDir,
        common: bool,
    ) -> Localizer<'a> {
        let options = LocalizationOptions {
            common,
            staging_dir: Some(dir.path().join("staging").to_string_lossy().into_owned()),
            output_dir: dir.path().join("out").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let localizer = Localizer::new(backend, &options).await.unwrap();
        localizer.enter().await.unwrap();
        localizer
    }

    /// Writes a throwaway file whose content is its own path.
    fn makefile(path: &Path) -> String {
        let text = path.to_string_lossy().into_owned();
        std::fs::write(path, &text).unwrap();
        text
    }

    #[tokio::test]
    async fn literals_pass_through_verbatim() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        localizer
            .localize(&spec(&[("0", &[("FOO", "bar baz")])]), &Overrides::new())
            .await
            .unwrap();
        assert_eq!(
            localizer.record("0", "FOO"),
            Some(&Localization::Passthrough("bar baz".to_string()))
        );

        let setup = localizer
            .localize_job("0", None, &IndexMap::new())
            .await
            .unwrap();
        let text = String::from_utf8(LocalTransport.read_file(&setup).unwrap()).unwrap();
        assert!(text.contains("export CANINE_JOB_VARS=FOO"));
        assert!(text.contains("export FOO='bar baz'"));
        assert!(text.ends_with("cd $CANINE_JOB_ROOT\n"));
    }

    #[tokio::test]
    async fn workspaces_exist_after_planning() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        localizer
            .localize(
                &spec(&[("0", &[("A", "x")]), ("1", &[("A", "y")])]),
                &Overrides::new(),
            )
            .await
            .unwrap();
        for job in ["0", "1"] {
            assert!(
                dir.path()
                    .join("staging")
                    .join("jobs")
                    .join(job)
                    .join("workspace")
                    .is_dir()
            );
        }
    }

    #[tokio::test]
    async fn shared_files_deduplicate_into_common() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let shared = makefile(&dir.path().join("t.txt"));
        let mut localizer = localizer(&backend, &dir, true).await;
        localizer
            .localize(
                &spec(&[
                    ("0", &[("data", shared.as_str())]),
                    ("1", &[("data", shared.as_str())]),
                ]),
                &Overrides::new(),
            )
            .await
            .unwrap();

        let staged = dir.path().join("staging").join("common").join("t.txt");
        assert!(staged.is_file());
        let expected = Localization::Passthrough(staged.to_string_lossy().into_owned());
        assert_eq!(localizer.record("0", "data"), Some(&expected));
        assert_eq!(localizer.record("1", "data"), Some(&expected));
    }

    #[tokio::test]
    async fn colliding_basenames_rename_with_alt() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        let first = makefile(&dir.path().join("a").join("x.txt"));
        let second = makefile(&dir.path().join("b").join("x.txt"));
        let mut localizer = localizer(&backend, &dir, true).await;
        localizer
            .localize(
                &spec(&[(
                    "0",
                    &[("first", first.as_str()), ("second", second.as_str())],
                )]),
                &Overrides::new(),
            )
            .await
            .unwrap();

        assert!(!dir.path().join("staging").join("common").join("x.txt").exists());
        let Some(Localization::Passthrough(path)) = localizer.record("0", "first") else {
            panic!("expected a passthrough record");
        };
        assert!(path.ends_with("inputs/x.txt"));
        let Some(Localization::Passthrough(path)) = localizer.record("0", "second") else {
            panic!("expected a passthrough record");
        };
        assert!(path.ends_with("inputs/x._alt.txt"));
        assert!(Path::new(path).is_file());
    }

    #[tokio::test]
    async fn stream_overrides_emit_fifos_without_copying() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        let overrides =
            Overrides::from_iter([("src".to_string(), Some("stream".to_string()))]);
        localizer
            .localize(&spec(&[("0", &[("src", "gs://b/o")])]), &overrides)
            .await
            .unwrap();
        assert_eq!(
            localizer.record("0", "src"),
            Some(&Localization::Stream("gs://b/o".to_string()))
        );

        let setup = localizer
            .localize_job("0", None, &IndexMap::new())
            .await
            .unwrap();
        let text = String::from_utf8(LocalTransport.read_file(&setup).unwrap()).unwrap();
        assert!(text.contains("mkfifo "));
        assert!(text.contains("gsutil cat gs://b/o > "));
        assert!(text.contains(" &\n"));
        // Reserved, never copied.
        assert!(!dir.path().join("staging/jobs/0/inputs/o").exists());
    }

    #[tokio::test]
    async fn delayed_downloads_fetch_at_task_start() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        let overrides =
            Overrides::from_iter([("src".to_string(), Some("delayed".to_string()))]);
        localizer
            .localize(&spec(&[("0", &[("src", "gs://b/o")])]), &overrides)
            .await
            .unwrap();
        assert_eq!(
            localizer.record("0", "src"),
            Some(&Localization::Download("gs://b/o".to_string()))
        );

        let setup = localizer
            .localize_job("0", None, &IndexMap::new())
            .await
            .unwrap();
        let text = String::from_utf8(LocalTransport.read_file(&setup).unwrap()).unwrap();
        assert!(text.contains("gsutil cp gs://b/o "));
    }

    #[tokio::test]
    async fn delayed_falls_back_to_eager_for_local_files() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let file = makefile(&dir.path().join("f.txt"));
        let mut localizer = localizer(&backend, &dir, true).await;
        let overrides =
            Overrides::from_iter([("src".to_string(), Some("delayed".to_string()))]);
        localizer
            .localize(&spec(&[("0", &[("src", file.as_str())])]), &overrides)
            .await
            .unwrap();

        let Some(Localization::Passthrough(path)) = localizer.record("0", "src") else {
            panic!("expected delayed to fall back to an eager copy");
        };
        assert!(Path::new(path).is_file());
    }

    #[tokio::test]
    async fn null_overrides_disable_localization() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let file = makefile(&dir.path().join("f.txt"));
        let mut localizer = localizer(&backend, &dir, true).await;
        let overrides = Overrides::from_iter([("src".to_string(), None)]);
        localizer
            .localize(&spec(&[("0", &[("src", file.as_str())])]), &overrides)
            .await
            .unwrap();
        assert_eq!(
            localizer.record("0", "src"),
            Some(&Localization::Passthrough(file.clone()))
        );
        assert!(!dir.path().join("staging/jobs/0/inputs/f.txt").exists());
    }

    #[tokio::test]
    async fn localize_runs_at_most_once() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        let inputs = spec(&[("0", &[("A", "x")])]);
        localizer.localize(&inputs, &Overrides::new()).await.unwrap();
        let err = localizer
            .localize(&inputs, &Overrides::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("once"));
    }

    #[tokio::test]
    async fn delocalize_matches_relative_and_absolute_patterns() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let mut localizer = localizer(&backend, &dir, true).await;
        localizer
            .localize(&spec(&[("0", &[("A", "x")])]), &Overrides::new())
            .await
            .unwrap();

        let workspace = dir.path().join("staging/jobs/0/workspace");
        std::fs::create_dir_all(workspace.join("nested")).unwrap();
        std::fs::write(workspace.join("stdout"), "hello\n").unwrap();
        std::fs::write(workspace.join("nested/result.txt"), "data").unwrap();

        let patterns = IndexMap::from_iter([
            ("log".to_string(), "stdout".to_string()),
            ("result".to_string(), "*.txt".to_string()),
        ]);
        let outputs = localizer.delocalize(&patterns, Some("0"), true).await.unwrap();

        let log = Path::new(&outputs["0"]["log"]);
        assert_eq!(std::fs::read_to_string(log).unwrap(), "hello\n");
        assert!(log.ends_with(Path::new("0/log/stdout")));
        let result = Path::new(&outputs["0"]["result"]);
        assert_eq!(std::fs::read_to_string(result).unwrap(), "data");
        // Harvested files are removed from the worker tree.
        assert!(!workspace.join("stdout").exists());
        assert!(!workspace.join("nested/result.txt").exists());
    }

    #[tokio::test]
    async fn clean_exit_removes_staging_and_faulted_exit_keeps_it() {
        let backend = LocalBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let localizer = localizer(&backend, &dir, true).await;
        assert!(staging.is_dir());
        localizer.exit(true).await.unwrap();
        assert!(staging.is_dir());
        localizer.exit(false).await.unwrap();
        assert!(!staging.exists());
    }
}
