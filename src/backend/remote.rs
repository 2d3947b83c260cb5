//! Backend for a SLURM controller reached over SSH.

use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use ssh2::FileStat;
use ssh2::Session;
use ssh2::Sftp;
use tracing::debug;

use crate::backend::Backend;
use crate::backend::FileInfo;
use crate::backend::Invocation;
use crate::backend::LocalBackend;
use crate::backend::Transport;
use crate::config::RemoteOptions;
use crate::error::Error;
use crate::error::Result;
use crate::utils::quote;

/// A transport speaking SFTP over an established SSH session.
///
/// Dropping the transport closes the SFTP channel; the SSH session itself
/// stays open for the backend.
pub struct SftpTransport {
    /// The SFTP channel.
    sftp: Sftp,
}

impl SftpTransport {
    /// Opens an SFTP channel on the given session.
    pub(crate) fn new(session: &Session) -> Result<Self> {
        Ok(Self {
            sftp: session.sftp()?,
        })
    }
}

impl Transport for SftpTransport {
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>> {
        let file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| Error::transport("open", path, e))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write>> {
        let file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| Error::transport("open", path, e))?;
        Ok(Box::new(file))
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let entries = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| Error::transport("listdir", path, e))?;
        Ok(entries
            .into_iter()
            .filter_map(|(entry, _)| {
                entry
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        self.sftp
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| Error::transport("mkdir", path, e))
    }

    fn makedirs(&self, path: &str) -> Result<()> {
        let mut prefix = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix.push_str(component);
            if !self.isdir(&prefix) {
                self.mkdir(&prefix)?;
            }
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| Error::transport("stat", path, e))?;
        Ok(FileInfo {
            size: stat.size.unwrap_or(0),
            is_dir: stat.is_dir(),
            is_file: stat.is_file(),
            mode: stat.perm,
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| Error::transport("chmod", path, e))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| Error::transport("remove", path, e))
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| Error::transport("rmdir", path, e))
    }
}

/// Values read from a `Host` block of `~/.ssh/config`.
#[derive(Debug, Clone, Default)]
struct SshConfigEntry {
    /// The real hostname behind the alias.
    hostname: Option<String>,
    /// The user to authenticate as.
    user: Option<String>,
    /// The port to connect to.
    port: Option<u16>,
    /// The identity file to authenticate with.
    identity_file: Option<String>,
}

/// Parses the subset of `ssh_config` this backend honors.
///
/// Earlier matching blocks win, matching OpenSSH's first-obtained-value rule.
/// Only exact host tokens and the `*` wildcard are recognized.
fn parse_ssh_config(text: &str, host: &str) -> SshConfigEntry {
    let mut entry = SshConfigEntry::default();
    let mut in_matching_block = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        if key.eq_ignore_ascii_case("host") {
            in_matching_block = value
                .split_whitespace()
                .any(|pattern| pattern == host || pattern == "*");
            continue;
        }
        if !in_matching_block {
            continue;
        }
        match key.to_ascii_lowercase().as_str() {
            "hostname" => entry.hostname.get_or_insert_with(|| value.to_string()),
            "user" => entry.user.get_or_insert_with(|| value.to_string()),
            "identityfile" => entry.identity_file.get_or_insert_with(|| value.to_string()),
            "port" => {
                if let Ok(port) = value.parse() {
                    entry.port.get_or_insert(port);
                }
                continue;
            }
            _ => continue,
        };
    }
    entry
}

/// Connection parameters after merging explicit options, `~/.ssh/config`,
/// and defaults.
#[derive(Debug, Clone)]
struct ResolvedRemote {
    /// The hostname to connect to.
    hostname: String,
    /// The port to connect to.
    port: u16,
    /// The user to authenticate as.
    user: String,
    /// The private key to authenticate with, tilde-expanded.
    key_file: PathBuf,
    /// A password to authenticate with instead of the key.
    password: Option<String>,
}

/// Backend for a SLURM controller host reached via SSH, with SFTP transports
/// over the same connection.
///
/// Host keys are not verified: the connection trusts whatever host it
/// reaches, matching an ignore-everything known-hosts policy.
pub struct RemoteBackend {
    /// The configured connection options.
    options: RemoteOptions,
    /// The live session, once entered.
    session: Option<Session>,
}

impl RemoteBackend {
    /// Creates a new remote backend. No connection is made until entry.
    pub fn new(options: RemoteOptions) -> Self {
        Self {
            options,
            session: None,
        }
    }

    /// Merges explicit options with `~/.ssh/config` and defaults.
    fn resolve(&self) -> ResolvedRemote {
        let config = dirs::home_dir()
            .map(|home| home.join(".ssh").join("config"))
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|text| parse_ssh_config(&text, &self.options.host))
            .unwrap_or_default();
        let key_file = self
            .options
            .key_file
            .clone()
            .or(config.identity_file)
            .unwrap_or_else(|| "~/.ssh/id_rsa".to_string());
        ResolvedRemote {
            hostname: config.hostname.unwrap_or_else(|| self.options.host.clone()),
            port: self.options.port.or(config.port).unwrap_or(22),
            user: self
                .options
                .user
                .clone()
                .or(config.user)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string()),
            key_file: PathBuf::from(shellexpand::tilde(&key_file).into_owned()),
            password: self.options.password.clone(),
        }
    }

    /// The live session, or an error if the backend was not entered.
    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::Backend("remote backend has not been entered".into()))
    }
}

#[async_trait(?Send)]
impl Backend for RemoteBackend {
    fn type_name(&self) -> &'static str {
        "Remote"
    }

    async fn enter(&mut self) -> Result<()> {
        let resolved = self.resolve();
        debug!(
            "connecting to {user}@{hostname}:{port}",
            user = resolved.user,
            hostname = resolved.hostname,
            port = resolved.port,
        );
        let stream = TcpStream::connect((resolved.hostname.as_str(), resolved.port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.handshake()?;
        if let Some(password) = &resolved.password {
            session.userauth_password(&resolved.user, password)?;
        } else if resolved.key_file.is_file() {
            session.userauth_pubkey_file(&resolved.user, None, &resolved.key_file, None)?;
        } else {
            session.userauth_agent(&resolved.user)?;
        }
        if !session.authenticated() {
            return Err(Error::Backend(format!(
                "authentication to {hostname} failed",
                hostname = resolved.hostname
            )));
        }
        self.session = Some(session);
        Ok(())
    }

    async fn exit(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            // Best effort: the server may already have dropped the link.
            let _ = session.disconnect(None, "closing", None);
        }
        Ok(())
    }

    async fn transport(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SftpTransport::new(self.session()?)?))
    }

    async fn invoke(&self, command: &str) -> Result<Invocation> {
        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.exec(command)?;
        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;
        channel.wait_close()?;
        Ok(Invocation {
            status: channel.exit_status()?,
            stdout,
            stderr,
        })
    }

    async fn invoke_tty(&self, command: &str) -> Result<i32> {
        // Interactive sessions go through the ssh binary so the user's
        // terminal drives the remote pty directly.
        let resolved = self.resolve();
        let ssh = format!(
            "ssh -tt -p {port} {user}@{hostname} {command}",
            port = resolved.port,
            user = resolved.user,
            hostname = resolved.hostname,
            command = quote(command)?,
        );
        LocalBackend::new().invoke_tty(&ssh).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const CONFIG: &str = "
# cluster access
Host login login.example.org
    HostName login.internal.example.org
    User worker
    IdentityFile ~/.ssh/cluster_rsa
    Port 2222

Host *
    User fallback
";

    #[test]
    fn matching_block_is_read() {
        let entry = parse_ssh_config(CONFIG, "login");
        assert_eq!(entry.hostname.as_deref(), Some("login.internal.example.org"));
        assert_eq!(entry.user.as_deref(), Some("worker"));
        assert_eq!(entry.identity_file.as_deref(), Some("~/.ssh/cluster_rsa"));
        assert_eq!(entry.port, Some(2222));
    }

    #[test]
    fn earlier_blocks_win_over_wildcard() {
        let entry = parse_ssh_config(CONFIG, "login");
        assert_eq!(entry.user.as_deref(), Some("worker"));
        let entry = parse_ssh_config(CONFIG, "elsewhere");
        assert_eq!(entry.user.as_deref(), Some("fallback"));
        assert_eq!(entry.hostname, None);
    }
}
