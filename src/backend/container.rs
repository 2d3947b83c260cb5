//! Backend for an ephemeral, container-hosted SLURM cluster.
//!
//! On entry, a controller container is launched on a bridge network with a
//! shared bind directory standing in for NFS; the controller boots the
//! requested number of worker containers and signals readiness through a
//! sentinel file on the share. File transport happens over SFTP to the
//! controller's forwarded SSH port.

use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::Invocation;
use crate::backend::LocalBackend;
use crate::backend::SftpTransport;
use crate::backend::Transport;
use crate::config::TransientOptions;
use crate::error::Error;
use crate::error::Result;

/// The sentinel file the controller creates on the share once SLURM is up.
const READY_SENTINEL: &str = "controller.ready";

/// The interval between readiness probes during startup.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs a `docker` subcommand, capturing its output.
async fn docker(args: &[&str]) -> Result<Invocation> {
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    Ok(Invocation {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Runs a `docker` subcommand, escalating failure to a command error.
async fn docker_ok(args: &[&str]) -> Result<Invocation> {
    let command = format!("docker {}", args.join(" "));
    docker(args).await?.check(&command)
}

/// Backend operating a SLURM cluster out of containers on the local host.
///
/// Only a container runtime is required; the cluster consumes local compute
/// resources. Useful for testing pipelines and for single powerful hosts.
pub struct TransientBackend {
    /// The configured cluster shape.
    options: TransientOptions,
    /// The host port forwarded to the controller's SSH port.
    port: Option<u16>,
    /// The bind directory mounted into every container at `/mnt/nfs`.
    bind_dir: Option<TempDir>,
    /// The controller container id.
    controller: Option<String>,
    /// The worker container ids.
    workers: Vec<String>,
    /// Startup scripts dispatched on the cluster, drained by
    /// [`Backend::wait_for_cluster_ready`].
    startup_tasks: Mutex<JoinSet<()>>,
}

impl TransientBackend {
    /// Creates a new transient backend. No containers are started until
    /// entry.
    pub fn new(options: TransientOptions) -> Self {
        Self {
            options,
            port: None,
            bind_dir: None,
            controller: None,
            workers: Vec::new(),
            startup_tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The controller container id, or an error if the backend was not
    /// entered.
    fn controller(&self) -> Result<&str> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Backend("transient backend has not been entered".into()))
    }

    /// The bind directory path on the host.
    fn bind_path(&self) -> Result<&Path> {
        self.bind_dir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| Error::Backend("transient backend has not been entered".into()))
    }

    /// Ensures the bridge network exists, creating it if absent.
    async fn ensure_network(&self) -> Result<()> {
        let network = self.options.network.as_str();
        if !docker(&["network", "inspect", network]).await?.ok() {
            info!("creating bridge network {network}");
            docker_ok(&["network", "create", "--driver", "bridge", network]).await?;
        }
        Ok(())
    }

    /// Ensures the cluster image is present, pulling it if absent.
    async fn ensure_image(&self) -> Result<()> {
        let image = self.options.image.as_str();
        if !docker(&["image", "inspect", image]).await?.ok() {
            info!("pulling image {image}");
            docker_ok(&["pull", image]).await?;
        }
        Ok(())
    }

    /// Launches the controller container and returns its id.
    async fn launch_controller(&self, bind: &str, port: u16) -> Result<String> {
        let gcloud = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".config")
            .join("gcloud");
        let nfs_mount = format!("{bind}:/mnt/nfs");
        let gcloud_mount = format!("{}:/root/.config/gcloud", gcloud.display());
        let port_forward = format!("{port}:22");
        let n_workers = self.options.n_workers.to_string();

        let mut args = vec![
            "run",
            "-d",
            "-t",
            "--network",
            self.options.network.as_str(),
            "-v",
            nfs_mount.as_str(),
            "-v",
            "/var/run/docker.sock:/var/run/docker.sock",
            "-v",
            gcloud_mount.as_str(),
            "-p",
            port_forward.as_str(),
            self.options.image.as_str(),
            "/controller.py",
            self.options.network.as_str(),
            n_workers.as_str(),
        ];
        let cpus = self.options.cpus.map(|c| c.to_string());
        if let Some(cpus) = &cpus {
            args.extend(["--cpus", cpus.as_str()]);
        }
        if let Some(memory) = &self.options.memory {
            args.extend(["--memory", memory.as_str()]);
        }

        let invocation = docker_ok(&args).await.map_err(|e| {
            Error::ClusterStartup(format!("failed to start the controller container: {e}"))
        })?;
        Ok(invocation.stdout_lossy().trim().to_string())
    }

    /// Streams controller logs to the user until the ready sentinel appears
    /// on the share or the controller exits.
    async fn await_controller_ready(&self, controller: &str) -> Result<()> {
        info!("SLURM controller started in {controller}");
        info!("waiting for containers to start...");
        let mut logs = Command::new("docker")
            .args(["logs", "-f", controller])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let sentinel = self.bind_path()?.join(READY_SENTINEL);
        let result = loop {
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
            if sentinel.exists() {
                break Ok(());
            }
            let state = docker(&["inspect", "-f", "{{.State.Running}}", controller]).await?;
            if !state.ok() || state.stdout_lossy().trim() != "true" {
                break Err(Error::ClusterStartup(
                    "the controller exited before signalling ready".into(),
                ));
            }
        };
        let _ = logs.kill().await;
        result
    }

    /// Enumerates worker containers on the bridge network started since the
    /// controller.
    async fn enumerate_workers(&self, controller: &str) -> Result<Vec<String>> {
        let network_filter = format!("network={}", self.options.network);
        let since_filter = format!("since={controller}");
        let invocation = docker_ok(&[
            "ps",
            "--filter",
            network_filter.as_str(),
            "--filter",
            since_filter.as_str(),
            "--format",
            "{{.ID}}",
        ])
        .await?;
        // The `since` filter is inclusive, so the controller shows up here.
        Ok(invocation
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty() && !controller.starts_with(id))
            .map(str::to_string)
            .collect())
    }

    /// Dispatches the configured startup scripts on the controller and
    /// workers as independent background tasks.
    async fn dispatch_startup_scripts(&self) -> Result<()> {
        let mut tasks = self.startup_tasks.lock().await;
        let controller_script = self.options.controller_script.trim();
        if !controller_script.is_empty() {
            let container = self.controller()?.to_string();
            let script = controller_script.to_string();
            tasks.spawn(run_startup_script(container, script));
        }
        let compute_script = self.options.compute_script.trim();
        if !compute_script.is_empty() {
            for worker in &self.workers {
                tasks.spawn(run_startup_script(worker.clone(), compute_script.to_string()));
            }
        }
        Ok(())
    }

    /// Generates the SFTP keypair under the share and installs the public
    /// key into the controller, once.
    async fn ensure_keys(&self) -> Result<PathBuf> {
        let key_path = self.bind_path()?.join(".ssh").join("id_rsa");
        if key_path.exists() {
            return Ok(key_path);
        }
        let controller = self.controller()?.to_string();
        std::fs::create_dir_all(key_path.parent().expect("key path has a parent"))?;
        let key = key_path.display().to_string();
        let pubkey = format!("{key}.pub");
        let authorized = format!("{controller}:/root/.ssh/authorized_keys");
        let keygen = Command::new("ssh-keygen")
            .args(["-q", "-b", "2048", "-t", "rsa", "-N", "", "-f", key.as_str()])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !keygen.status.success() {
            return Err(Error::Backend(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&keygen.stderr).trim()
            )));
        }
        docker_ok(&[
            "exec",
            controller.as_str(),
            "mkdir",
            "-p",
            "-m",
            "700",
            "/root/.ssh",
        ])
        .await?;
        docker_ok(&["cp", pubkey.as_str(), authorized.as_str()]).await?;
        docker_ok(&[
            "exec",
            controller.as_str(),
            "chown",
            "root:root",
            "/root/.ssh/authorized_keys",
        ])
        .await?;
        Ok(key_path)
    }

    /// Opens an authenticated SSH session to the controller's forwarded
    /// port.
    async fn connect(&self) -> Result<Session> {
        let port = self
            .port
            .ok_or_else(|| Error::Backend("transient backend has not been entered".into()))?;
        let key_path = self.ensure_keys().await?;
        let stream = TcpStream::connect(("127.0.0.1", port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.handshake()?;
        session.userauth_pubkey_file("root", None, &key_path, None)?;
        Ok(session)
    }
}

/// Runs a startup script in a container, logging a warning on failure.
async fn run_startup_script(container: String, script: String) {
    match docker(&["exec", container.as_str(), "/bin/bash", "-c", script.as_str()]).await {
        Ok(invocation) if invocation.ok() => {
            debug!("startup script finished in {container}");
        }
        Ok(invocation) => {
            warn!(
                "startup script in {container} exited with status {status}: {stderr}",
                status = invocation.status,
                stderr = invocation.stderr_lossy().trim(),
            );
        }
        Err(e) => warn!("startup script in {container} could not be dispatched: {e}"),
    }
}

/// Picks a free TCP port on the loopback interface.
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[async_trait(?Send)]
impl Backend for TransientBackend {
    fn type_name(&self) -> &'static str {
        "TransientGCP"
    }

    async fn enter(&mut self) -> Result<()> {
        let port = free_port()?;
        let home = dirs::home_dir()
            .ok_or_else(|| Error::ClusterStartup("cannot determine the home directory".into()))?;
        let bind_dir = tempfile::tempdir_in(home)?;
        self.port = Some(port);
        let bind = bind_dir.path().display().to_string();
        self.bind_dir = Some(bind_dir);

        self.ensure_network().await?;
        self.ensure_image().await?;

        let controller = self.launch_controller(&bind, port).await?;
        self.controller = Some(controller.clone());
        self.await_controller_ready(&controller).await?;

        let workers = self.enumerate_workers(&controller).await?;
        if workers.len() != self.options.n_workers {
            return Err(Error::ClusterStartup(format!(
                "number of worker containers ({found}) does not match the expected count \
                 ({expected})",
                found = workers.len(),
                expected = self.options.n_workers,
            )));
        }
        self.workers = workers;

        self.dispatch_startup_scripts().await
    }

    async fn exit(&mut self) -> Result<()> {
        self.startup_tasks.lock().await.abort_all();
        for worker in std::mem::take(&mut self.workers) {
            if !docker(&["stop", worker.as_str()]).await?.ok() {
                warn!("failed to stop worker container {worker}");
            }
        }
        if let Some(controller) = self.controller.take() {
            if !docker(&["stop", controller.as_str()]).await?.ok() {
                warn!("failed to stop controller container {controller}");
            }
        }
        // Dropping the bind directory removes the share.
        self.bind_dir = None;
        self.port = None;
        Ok(())
    }

    async fn transport(&self) -> Result<Box<dyn Transport>> {
        let session = self.connect().await?;
        Ok(Box::new(SftpTransport::new(&session)?))
    }

    async fn invoke(&self, command: &str) -> Result<Invocation> {
        docker(&["exec", self.controller()?, "/bin/bash", "-c", command]).await
    }

    async fn invoke_tty(&self, command: &str) -> Result<i32> {
        // The container runtime's own terminal handling is what the user
        // wants here, so the interactive path shells out directly.
        let command = format!("docker exec -it {} {}", self.controller()?, command);
        LocalBackend::new().invoke_tty(&command).await
    }

    async fn wait_for_cluster_ready(&self, elastic: bool) -> Result<()> {
        let mut tasks = self.startup_tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("a startup script task failed: {e}");
            }
        }
        drop(tasks);
        self.wait_for_partition(elastic).await
    }
}
