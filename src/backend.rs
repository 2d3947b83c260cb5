//! Execution backends and their filesystem transports.
//!
//! A backend owns an execution substrate (the host, an SSH-reachable SLURM
//! controller, or an ephemeral container cluster) and presents one uniform
//! contract over it: invoke a shell command, and open a scoped filesystem
//! transport. SLURM operations (`sbatch`, `sacct`, `scancel`) are provided on
//! the trait itself, built on `invoke`, so every substrate gets them for free.

use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use crate::config::BackendOptions;
use crate::error::Error;
use crate::error::Result;
use crate::utils::join;
use crate::utils::quote;

mod container;
mod local;
mod remote;

pub use container::TransientBackend;
pub use local::LocalBackend;
pub use local::LocalTransport;
pub use remote::RemoteBackend;
pub use remote::SftpTransport;

/// The interval between `sinfo` probes while waiting for the cluster.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The `sinfo` invocation used to probe partition readiness.
const SINFO_COMMAND: &str = "sinfo --noheader -o '%P|%a|%D'";

/// Metadata for a single path on a transport.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// The size of the file in bytes.
    pub size: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Whether the path is a regular file.
    pub is_file: bool,
    /// The permission bits, when the transport reports them.
    pub mode: Option<u32>,
}

/// One directory visited by a recursive [`Transport::walk`].
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// The directory path.
    pub dir: String,
    /// Names of subdirectories directly under [`dir`](Self::dir).
    pub dirs: Vec<String>,
    /// Names of files directly under [`dir`](Self::dir).
    pub files: Vec<String>,
}

/// A scoped filesystem handle over a backend's view.
///
/// Paths are POSIX strings native to the transport. Dropping a transport
/// releases whatever channel backs it.
pub trait Transport {
    /// Opens a path for reading, returning a byte stream.
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>>;

    /// Opens (creating or truncating) a path for writing.
    fn open_write(&self, path: &str) -> Result<Box<dyn Write>>;

    /// Lists the entry names of a directory.
    fn listdir(&self, path: &str) -> Result<Vec<String>>;

    /// Creates a single directory.
    fn mkdir(&self, path: &str) -> Result<()>;

    /// Creates a directory and any missing parents.
    fn makedirs(&self, path: &str) -> Result<()>;

    /// Returns metadata for a path.
    fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Sets the permission bits of a path.
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Removes a file.
    fn remove(&self, path: &str) -> Result<()>;

    /// Removes an empty directory.
    fn rmdir(&self, path: &str) -> Result<()>;

    /// Whether a path exists.
    fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// Whether a path is a regular file.
    fn isfile(&self, path: &str) -> bool {
        self.stat(path).map(|info| info.is_file).unwrap_or(false)
    }

    /// Whether a path is a directory.
    fn isdir(&self, path: &str) -> bool {
        self.stat(path).map(|info| info.is_dir).unwrap_or(false)
    }

    /// Recursively walks a directory, returning one entry per directory
    /// visited (the root first).
    fn walk(&self, path: &str) -> Result<Vec<WalkEntry>> {
        let mut out = Vec::new();
        let mut pending = VecDeque::new();
        pending.push_back(path.to_string());
        while let Some(dir) = pending.pop_front() {
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            for name in self.listdir(&dir)? {
                if self.isdir(&join(&dir, &name)) {
                    dirs.push(name);
                } else {
                    files.push(name);
                }
            }
            for sub in &dirs {
                pending.push_back(join(&dir, sub));
            }
            out.push(WalkEntry { dir, dirs, files });
        }
        Ok(out)
    }

    /// Copies a file from the invoking host onto the transport.
    ///
    /// Fails fast when the local source does not exist.
    fn send(&self, local: &Path, remote: &str) -> Result<()> {
        let mut src = std::fs::File::open(local)
            .map_err(|e| Error::transport("send", local.display().to_string(), e))?;
        let mut dst = self.open_write(remote)?;
        std::io::copy(&mut src, &mut dst)
            .map_err(|e| Error::transport("send", remote, e))?;
        Ok(())
    }

    /// Copies a file from the transport back to the invoking host.
    fn receive(&self, remote: &str, local: &Path) -> Result<()> {
        let mut src = self.open_read(remote)?;
        let mut dst = std::fs::File::create(local)
            .map_err(|e| Error::transport("receive", local.display().to_string(), e))?;
        std::io::copy(&mut src, &mut dst)
            .map_err(|e| Error::transport("receive", remote, e))?;
        Ok(())
    }

    /// Normalizes a path, collapsing `.` and `..` components.
    fn normpath(&self, path: &str) -> String {
        path_clean::clean(path).to_string_lossy().into_owned()
    }

    /// Writes a whole file in one call.
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut file = self.open_write(path)?;
        file.write_all(contents)
            .map_err(|e| Error::transport("write", path, e))?;
        Ok(())
    }

    /// Reads a whole file in one call.
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open_read(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| Error::transport("read", path, e))?;
        Ok(contents)
    }
}

/// The result of invoking a shell command on a backend.
///
/// A non-zero exit status is not an error; callers escalate with
/// [`Invocation::check`] when they require success.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The exit status of the command.
    pub status: i32,
    /// The captured standard output bytes.
    pub stdout: Vec<u8>,
    /// The captured standard error bytes.
    pub stderr: Vec<u8>,
}

impl Invocation {
    /// Whether the command exited with status zero.
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    /// The captured standard output, lossily decoded.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// The captured standard error, lossily decoded.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Escalates a non-zero exit status into a command failure carrying the
    /// captured streams.
    pub fn check(self, command: &str) -> Result<Self> {
        if self.ok() {
            Ok(self)
        } else {
            Err(Error::Command {
                command: command.to_string(),
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// A SLURM job state as reported by `sacct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// The job was terminated due to node boot failure.
    BootFail,
    /// The job was cancelled by the user or an administrator.
    Cancelled,
    /// The job completed with an exit code of 0.
    Completed,
    /// The job was terminated after exceeding a deadline.
    Deadline,
    /// The job finished with a non-zero exit code.
    Failed,
    /// The job was terminated due to node failure.
    NodeFail,
    /// The job was terminated by the OOM killer.
    OutOfMemory,
    /// The job is queued and waiting for initiation.
    Pending,
    /// The job was preempted.
    Preempted,
    /// The job was requeued.
    Requeued,
    /// The job is currently running.
    Running,
    /// The job is suspended.
    Suspended,
    /// The job was terminated after reaching its time limit.
    Timeout,
    /// A state this crate does not model.
    Other(String),
}

impl JobState {
    /// Whether the orchestrator should keep waiting on this state.
    pub fn waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Parses a state from `sacct` output.
    ///
    /// `sacct` may suffix states (e.g. `CANCELLED by 0`); only the first
    /// token is considered. Unmodeled states are preserved verbatim.
    pub fn from_text(s: &str) -> Self {
        let token = s.split_whitespace().next().unwrap_or("");
        match token {
            "BOOT_FAIL" => Self::BootFail,
            "CANCELLED" => Self::Cancelled,
            "COMPLETED" => Self::Completed,
            "DEADLINE" => Self::Deadline,
            "FAILED" => Self::Failed,
            "NODE_FAIL" => Self::NodeFail,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "PENDING" => Self::Pending,
            "PREEMPTED" => Self::Preempted,
            "REQUEUED" => Self::Requeued,
            "RUNNING" => Self::Running,
            "SUSPENDED" => Self::Suspended,
            "TIMEOUT" => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_text(s))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BootFail => write!(f, "BOOT_FAIL"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Deadline => write!(f, "DEADLINE"),
            Self::Failed => write!(f, "FAILED"),
            Self::NodeFail => write!(f, "NODE_FAIL"),
            Self::OutOfMemory => write!(f, "OUT_OF_MEMORY"),
            Self::Pending => write!(f, "PENDING"),
            Self::Preempted => write!(f, "PREEMPTED"),
            Self::Requeued => write!(f, "REQUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One row of job accounting output.
#[derive(Debug, Clone)]
pub struct AcctRow {
    /// The reported job state.
    pub state: JobState,
    /// The reported exit code field, when the job has one.
    pub exit_code: Option<String>,
}

/// A job accounting table keyed by composite job id (`<batch>_<index>`).
#[derive(Debug, Clone, Default)]
pub struct AcctTable {
    /// The rows of the table, in `sacct` output order.
    rows: IndexMap<String, AcctRow>,
}

impl AcctTable {
    /// Parses parseable, headerless `sacct` output
    /// (`JobID|State|ExitCode` per line).
    pub fn parse(output: &[u8]) -> Result<Self> {
        let output = String::from_utf8_lossy(output);
        let mut rows = IndexMap::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split('|');
            let job_id = parts
                .next()
                .ok_or_else(|| Error::Backend("`sacct` output is missing a job id".into()))?;
            // Job steps (`<id>.batch`, `<id>.0`, ...) are not tracked.
            if job_id.contains('.') {
                continue;
            }
            let state = JobState::from_text(
                parts
                    .next()
                    .ok_or_else(|| Error::Backend("`sacct` output is missing a job state".into()))?,
            );
            let exit_code = parts.next().map(str::to_string).filter(|s| !s.is_empty());
            rows.insert(
                job_id.to_string(),
                AcctRow { state, exit_code },
            );
        }
        Ok(Self { rows })
    }

    /// Looks up a row by composite job id.
    pub fn get(&self, job_id: &str) -> Option<&AcctRow> {
        self.rows.get(job_id)
    }

    /// The number of rows in the table.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over `(job id, row)` pairs in output order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AcctRow)> {
        self.rows.iter()
    }
}

impl std::fmt::Display for AcctTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self
            .rows
            .keys()
            .map(String::len)
            .chain([5])
            .max()
            .unwrap_or(5);
        writeln!(f, "{:width$}  {:12}  {}", "JobID", "State", "ExitCode")?;
        for (job_id, row) in &self.rows {
            writeln!(
                f,
                "{job_id:width$}  {:12}  {}",
                row.state.to_string(),
                row.exit_code.as_deref().unwrap_or("-"),
            )?;
        }
        Ok(())
    }
}

/// An execution substrate presenting the uniform backend contract.
#[async_trait(?Send)]
pub trait Backend {
    /// The registry tag of this backend.
    fn type_name(&self) -> &'static str;

    /// Brings the substrate up. Must be called before any other operation.
    async fn enter(&mut self) -> Result<()>;

    /// Tears the substrate down. Idempotent.
    async fn exit(&mut self) -> Result<()>;

    /// Yields a fresh transport scope over the backend's filesystem.
    async fn transport(&self) -> Result<Box<dyn Transport>>;

    /// Invokes a shell command, capturing its output.
    ///
    /// A non-zero exit status is reported in the returned [`Invocation`], not
    /// as an error.
    async fn invoke(&self, command: &str) -> Result<Invocation>;

    /// Invokes a shell command with the user's terminal attached, returning
    /// its exit status.
    async fn invoke_tty(&self, command: &str) -> Result<i32>;

    /// Submits a batch script as an array job, returning the batch id.
    async fn sbatch(
        &self,
        script_path: &str,
        flags: &IndexMap<String, String>,
    ) -> Result<String> {
        let command = render_sbatch(script_path, flags)?;
        debug!("submitting: {command}");
        let invocation = self.invoke(&command).await?.check(&command)?;
        parse_batch_id(&invocation.stdout_lossy())
            .ok_or_else(|| Error::Backend("`sbatch` did not output a job identifier".into()))
    }

    /// Queries job accounting, returning a table keyed by composite job id.
    async fn sacct(&self) -> Result<AcctTable> {
        const COMMAND: &str = "sacct -P -n --format JobID,State,ExitCode";
        let invocation = self.invoke(COMMAND).await?.check(COMMAND)?;
        AcctTable::parse(&invocation.stdout)
    }

    /// Cancels a submitted batch job. Best effort; never called automatically.
    async fn scancel(&self, batch_id: &str) -> Result<()> {
        let command = format!("scancel {}", quote(batch_id)?);
        self.invoke(&command).await?.check(&command)?;
        Ok(())
    }

    /// Persists shell lines as an executable batch script, returning its
    /// path. A `#!/bin/bash` shebang is prepended unless one is present.
    async fn pack_batch_script(&self, lines: &[String], script_path: &str) -> Result<String> {
        let mut content = String::new();
        if lines.first().map(|line| !line.starts_with("#!")).unwrap_or(true) {
            content.push_str("#!/bin/bash\n");
        }
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        let transport = self.transport().await?;
        transport.write_file(script_path, content.as_bytes())?;
        transport.chmod(script_path, 0o775)?;
        Ok(script_path.to_string())
    }

    /// Blocks until the cluster partition is usable.
    async fn wait_for_cluster_ready(&self, elastic: bool) -> Result<()> {
        self.wait_for_partition(elastic).await
    }

    /// Polls `sinfo` until a partition reports available. When `elastic` is
    /// set, a partition with zero powered nodes still counts as ready.
    async fn wait_for_partition(&self, elastic: bool) -> Result<()> {
        loop {
            let invocation = self.invoke(SINFO_COMMAND).await?;
            if invocation.ok() && partition_ready(&invocation.stdout_lossy(), elastic) {
                return Ok(());
            }
            debug!("cluster partition is not ready yet");
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// Instantiates the backend selected by the configuration.
pub fn create(options: &BackendOptions) -> Box<dyn Backend> {
    match options {
        BackendOptions::Local => Box::new(LocalBackend::new()),
        BackendOptions::Remote(options) => Box::new(RemoteBackend::new(options.clone())),
        BackendOptions::Transient(options) => Box::new(TransientBackend::new(options.clone())),
    }
}

/// Renders the `sbatch` command line for a script and flag map.
///
/// A value of `true` renders as a bare boolean flag; single-character names
/// render with one dash.
fn render_sbatch(script_path: &str, flags: &IndexMap<String, String>) -> Result<String> {
    let mut command = String::from("sbatch");
    for (name, value) in flags {
        let dashes = if name.len() == 1 { "-" } else { "--" };
        command.push(' ');
        command.push_str(dashes);
        command.push_str(name);
        if !value.eq_ignore_ascii_case("true") {
            command.push(' ');
            command.push_str(&quote(value)?);
        }
    }
    command.push(' ');
    command.push_str(&quote(script_path)?);
    Ok(command)
}

/// Extracts the job identifier from `sbatch` stdout.
fn parse_batch_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if let Some(id) = line.trim().strip_prefix("Submitted batch job ") {
            let id = id.trim();
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Decides partition readiness from `sinfo --noheader -o '%P|%a|%D'` output.
fn partition_ready(output: &str, elastic: bool) -> bool {
    for line in output.lines() {
        let mut parts = line.trim().split('|');
        let (Some(_partition), Some(avail)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !avail.contains("up") {
            continue;
        }
        let nodes: usize = parts
            .next()
            .and_then(|count| count.trim().parse().ok())
            .unwrap_or(0);
        if elastic || nodes > 0 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sacct_output_parses_and_skips_steps() {
        let output = b"24_0|COMPLETED|0:0\n24_0.batch|COMPLETED|0:0\n24_1|RUNNING|\n";
        let table = AcctTable::parse(output).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("24_0").unwrap().state, JobState::Completed);
        assert_eq!(
            table.get("24_0").unwrap().exit_code.as_deref(),
            Some("0:0")
        );
        assert_eq!(table.get("24_1").unwrap().state, JobState::Running);
        assert!(table.get("24_1").unwrap().exit_code.is_none());
        assert!(table.get("24_0.batch").is_none());
    }

    #[test]
    fn job_states_round_trip() {
        for (text, state) in [
            ("COMPLETED", JobState::Completed),
            ("FAILED", JobState::Failed),
            ("CANCELLED by 0", JobState::Cancelled),
            ("TIMEOUT", JobState::Timeout),
        ] {
            assert_eq!(text.parse::<JobState>().unwrap(), state);
        }
        assert!(JobState::Pending.waiting());
        assert!(JobState::Running.waiting());
        assert!(!JobState::Failed.waiting());
        assert!(!"REVOKED".parse::<JobState>().unwrap().waiting());
    }

    #[test]
    fn sbatch_command_renders_flags() {
        let mut flags = IndexMap::new();
        flags.insert("array".to_string(), "0-3".to_string());
        flags.insert("requeue".to_string(), "true".to_string());
        flags.insert("J".to_string(), "my job".to_string());
        let command = render_sbatch("/tmp/entry.sh", &flags).unwrap();
        assert_eq!(
            command,
            "sbatch --array 0-3 --requeue -J 'my job' /tmp/entry.sh"
        );
    }

    #[test]
    fn batch_id_parses_from_sbatch_output() {
        assert_eq!(
            parse_batch_id("Submitted batch job 1234\n").as_deref(),
            Some("1234")
        );
        assert_eq!(parse_batch_id("sbatch: error\n"), None);
    }

    #[test]
    fn partition_readiness() {
        assert!(partition_ready("debug*|up|2\n", false));
        assert!(!partition_ready("debug*|up|0\n", false));
        assert!(partition_ready("debug*|up|0\n", true));
        assert!(!partition_ready("debug*|down|4\n", false));
        assert!(!partition_ready("", false));
    }
}
