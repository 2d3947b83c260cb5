//! Backend for a SLURM controller on the invoking host.

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::backend::Backend;
use crate::backend::FileInfo;
use crate::backend::Invocation;
use crate::backend::Transport;
use crate::backend::WalkEntry;
use crate::error::Error;
use crate::error::Result;

/// A transport over the host filesystem.
#[derive(Debug, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>> {
        let file =
            std::fs::File::open(path).map_err(|e| Error::transport("open", path, e))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write>> {
        let file =
            std::fs::File::create(path).map_err(|e| Error::transport("open", path, e))?;
        Ok(Box::new(file))
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let entries =
            std::fs::read_dir(path).map_err(|e| Error::transport("listdir", path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::transport("listdir", path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        std::fs::create_dir(path).map_err(|e| Error::transport("mkdir", path, e))
    }

    fn makedirs(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| Error::transport("makedirs", path, e))
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let meta = std::fs::metadata(path).map_err(|e| Error::transport("stat", path, e))?;
        Ok(FileInfo {
            size: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            mode: Some(meta.permissions().mode()),
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::transport("chmod", path, e))
    }

    fn remove(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| Error::transport("remove", path, e))
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        std::fs::remove_dir(path).map_err(|e| Error::transport("rmdir", path, e))
    }

    fn walk(&self, path: &str) -> Result<Vec<WalkEntry>> {
        let mut entries: Vec<WalkEntry> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(|e| Error::transport("walk", path, e))?;
            let entry_path = entry.path().to_string_lossy().into_owned();
            let name = entry.file_name().to_string_lossy().into_owned();
            let parent = entry
                .path()
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .and_then(|p| index.get(&p).copied());
            if entry.file_type().is_dir() {
                if let Some(parent) = parent {
                    entries[parent].dirs.push(name);
                }
                index.insert(entry_path.clone(), entries.len());
                entries.push(WalkEntry {
                    dir: entry_path,
                    dirs: Vec::new(),
                    files: Vec::new(),
                });
            } else if let Some(parent) = parent {
                entries[parent].files.push(name);
            }
        }
        Ok(entries)
    }

    fn send(&self, local: &Path, remote: &str) -> Result<()> {
        std::fs::copy(local, remote)
            .map_err(|e| Error::transport("send", local.display().to_string(), e))?;
        Ok(())
    }

    fn receive(&self, remote: &str, local: &Path) -> Result<()> {
        std::fs::copy(remote, local).map_err(|e| Error::transport("receive", remote, e))?;
        Ok(())
    }
}

/// Backend for interacting with a SLURM install on the host itself.
///
/// Entry and exit are no-ops: the substrate is the host process.
#[derive(Debug, Clone, Copy)]
pub struct LocalBackend;

impl LocalBackend {
    /// Creates a new local backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl Backend for LocalBackend {
    fn type_name(&self) -> &'static str {
        "Local"
    }

    async fn enter(&mut self) -> Result<()> {
        Ok(())
    }

    async fn exit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn transport(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LocalTransport))
    }

    async fn invoke(&self, command: &str) -> Result<Invocation> {
        let output = Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::inherit())
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

    async fn invoke_tty(&self, command: &str) -> Result<i32> {
        let status = Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn transport_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport;
        let root = dir.path().to_string_lossy().into_owned();
        let nested = format!("{root}/a/b");
        transport.makedirs(&nested).unwrap();
        let path = format!("{nested}/hello.txt");
        transport.write_file(&path, b"hello").unwrap();
        assert_eq!(transport.read_file(&path).unwrap(), b"hello");
        assert!(transport.isfile(&path));
        assert!(transport.isdir(&nested));
        assert!(!transport.exists(&format!("{root}/missing")));

        transport.chmod(&path, 0o775).unwrap();
        let info = transport.stat(&path).unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.mode.unwrap() & 0o777, 0o775);
    }

    #[test]
    fn walk_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport;
        let root = dir.path().to_string_lossy().into_owned();
        transport.makedirs(&format!("{root}/sub")).unwrap();
        transport.write_file(&format!("{root}/top.txt"), b"1").unwrap();
        transport.write_file(&format!("{root}/sub/leaf.txt"), b"2").unwrap();

        let entries = transport.walk(&root).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dir, root);
        assert_eq!(entries[0].dirs, vec!["sub".to_string()]);
        assert_eq!(entries[0].files, vec!["top.txt".to_string()]);
        assert_eq!(entries[1].files, vec!["leaf.txt".to_string()]);
    }

    #[tokio::test]
    async fn invoke_captures_streams_and_status() {
        let backend = LocalBackend::new();
        let invocation = backend.invoke("echo out; echo err >&2").await.unwrap();
        assert!(invocation.ok());
        assert_eq!(invocation.stdout_lossy(), "out\n");
        assert_eq!(invocation.stderr_lossy(), "err\n");

        let invocation = backend.invoke("exit 3").await.unwrap();
        assert_eq!(invocation.status, 3);
        assert!(invocation.check("exit 3").is_err());
    }
}
