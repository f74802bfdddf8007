//! Stateless file operations over SFTP.
//!
//! Every public function opens its own SSH connection and SFTP session,
//! performs one logical operation and closes both. Nothing is pooled and
//! nothing is retried; a failed call is reported with the operation and path
//! so the caller can decide whether to re-issue it.
//!
//! ## Path validation
//!
//! All paths must be absolute and must not contain `..` components or null
//! bytes.
//!
//! ## Read cap
//!
//! [`read`] checks the remote size first and then reads at most `cap + 1`
//! bytes, so a file that grows between the two steps is still rejected
//! instead of buffered.

use std::path::{Component, Path};
use std::time::Duration;

use russh::Disconnect;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::connector::ssh::{connect_client, ClientHandle};
use crate::connector::{ConnectError, ConnectorConfig};

#[cfg(test)]
mod memfs;

const COPY_BUFFER: usize = 32 * 1024;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;

#[derive(Debug, Error)]
pub enum SftpError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{op} {path}: {source}")]
    Remote {
        op: &'static str,
        path: String,
        #[source]
        source: SftpClientError,
    },
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is a directory")]
    IsDirectory { path: String },
    #[error("{path} is {size} bytes, over the {cap} byte limit")]
    TooLarge { path: String, size: u64, cap: u64 },
    #[error("copy interrupted after {copied} of {total} bytes: {reason}")]
    CopyInterrupted { copied: u64, total: u64, reason: String },
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("{op} timed out")]
    Timeout { op: &'static str },
}

impl SftpError {
    pub fn code(&self) -> &'static str {
        match self {
            SftpError::Connect(e) => e.code(),
            SftpError::InvalidPath { .. } => "INVALID_PATH",
            SftpError::Remote { source, .. } => match source {
                SftpClientError::Status(status) => match status.status_code {
                    StatusCode::NoSuchFile => "NOT_FOUND",
                    StatusCode::PermissionDenied => "PERMISSION_DENIED",
                    _ => "SFTP_ERROR",
                },
                _ => "SFTP_ERROR",
            },
            SftpError::Io { .. } => "IO_ERROR",
            SftpError::IsDirectory { .. } => "IS_DIRECTORY",
            SftpError::TooLarge { .. } => "FILE_TOO_LARGE",
            SftpError::CopyInterrupted { .. } => "COPY_INTERRUPTED",
            SftpError::UnknownUser(_) => "UNKNOWN_USER",
            SftpError::UnknownGroup(_) => "UNKNOWN_GROUP",
            SftpError::Timeout { .. } => "TIMEOUT",
        }
    }
}

fn remote<'a>(op: &'static str, path: &'a str) -> impl FnOnce(SftpClientError) -> SftpError + 'a {
    move |source| SftpError::Remote {
        op,
        path: path.to_string(),
        source,
    }
}

fn io<'a>(op: &'static str, path: &'a str) -> impl FnOnce(std::io::Error) -> SftpError + 'a {
    move |source| SftpError::Io {
        op,
        path: path.to_string(),
        source,
    }
}

/// Deadlines and limits shared by every operation.
#[derive(Debug, Clone, Copy)]
pub struct SftpOptions {
    pub connect_timeout: Duration,
    /// Deadline for the operation itself, after the connection is up.
    pub op_timeout: Duration,
    pub read_cap: u64,
}

/// Reject relative paths, `..` components and null bytes.
pub fn validate_path(path: &str) -> Result<&str, SftpError> {
    let invalid = |reason| SftpError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if path.contains('\0') {
        return Err(invalid("contains null bytes"));
    }
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(invalid("must be absolute"));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("path traversal (..) not allowed"));
    }
    Ok(path)
}

/// True for `/` and every spelling of it (`//`, `/.`, `/./`).
fn is_root(path: &str) -> bool {
    Path::new(path).components().eq([Component::RootDir])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileKind {
    fn from_mode(mode: Option<u32>) -> Self {
        match mode.map(|m| m & S_IFMT) {
            Some(S_IFDIR) => FileKind::Dir,
            Some(S_IFLNK) => FileKind::Symlink,
            Some(S_IFREG) => FileKind::File,
            _ => FileKind::Other,
        }
    }
}

/// One directory entry or `stat` result.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits only (`0o7777` mask).
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Unix seconds.
    pub mtime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl FileEntry {
    fn from_attrs(name: String, path: String, attrs: &FileAttributes) -> Self {
        Self {
            name,
            path,
            kind: FileKind::from_mode(attrs.permissions),
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.unwrap_or(0) & 0o7777,
            uid: attrs.uid,
            gid: attrs.gid,
            mtime: attrs.mtime,
            link_target: None,
        }
    }
}

/// File bytes returned by [`read`].
#[derive(Debug, Clone)]
pub struct FileContent {
    pub path: String,
    pub data: Vec<u8>,
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

/// One SSH connection carrying one SFTP session.
struct SftpClient {
    ssh: ClientHandle,
    sftp: SftpSession,
}

impl SftpClient {
    async fn open(config: &ConnectorConfig, timeout: Duration) -> Result<Self, SftpError> {
        let ssh = connect_client(config, timeout).await?;
        let channel = ssh.channel_open_session().await.map_err(ConnectError::from)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(ConnectError::from)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(remote("open sftp", ""))?;
        Ok(Self { ssh, sftp })
    }

    async fn close(self) {
        if let Err(e) = self.sftp.close().await {
            debug!(error = %e, "SFTP close failed");
        }
        let _ = self.ssh.disconnect(Disconnect::ByApplication, "", "en").await;
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let dir = self.sftp.read_dir(path).await.map_err(remote("list", path))?;
        let mut entries: Vec<FileEntry> = dir
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| {
                let name = e.file_name();
                let full = join(path, &name);
                FileEntry::from_attrs(name, full, &e.metadata())
            })
            .collect();
        entries.sort_by(|a, b| {
            (b.kind == FileKind::Dir)
                .cmp(&(a.kind == FileKind::Dir))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, SftpError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(remote("stat", path))?;
        let mut entry = FileEntry::from_attrs(base_name(path), path.to_string(), &attrs);
        if entry.kind == FileKind::Symlink {
            entry.link_target = self.sftp.read_link(path).await.ok();
        }
        Ok(entry)
    }

    async fn read(&self, path: &str, cap: u64) -> Result<FileContent, SftpError> {
        let attrs = self.sftp.metadata(path).await.map_err(remote("read", path))?;
        if FileKind::from_mode(attrs.permissions) == FileKind::Dir {
            return Err(SftpError::IsDirectory {
                path: path.to_string(),
            });
        }
        let size = attrs.size.unwrap_or(0);
        if size > cap {
            return Err(SftpError::TooLarge {
                path: path.to_string(),
                size,
                cap,
            });
        }
        let file = self.sftp.open(path).await.map_err(remote("read", path))?;
        let mut data = Vec::new();
        file.take(cap + 1)
            .read_to_end(&mut data)
            .await
            .map_err(io("read", path))?;
        if data.len() as u64 > cap {
            return Err(SftpError::TooLarge {
                path: path.to_string(),
                size: data.len() as u64,
                cap,
            });
        }
        Ok(FileContent {
            path: path.to_string(),
            data,
        })
    }

    async fn write(&self, path: &str, data: &[u8], mode: Option<u32>) -> Result<u64, SftpError> {
        let mut file = self.sftp.create(path).await.map_err(remote("write", path))?;
        file.write_all(data).await.map_err(io("write", path))?;
        file.shutdown().await.map_err(io("write", path))?;
        if let Some(mode) = mode {
            self.chmod(path, mode).await?;
        }
        Ok(data.len() as u64)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            permissions: Some(mode & 0o7777),
            ..FileAttributes::empty()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(remote("chmod", path))
    }

    /// Depth-first walk without following symlinks. Returns entries changed.
    async fn chmod_recursive(&self, root: &str, mode: u32) -> Result<u64, SftpError> {
        let mut changed = 0;
        let mut pending = vec![root.to_string()];
        while let Some(path) = pending.pop() {
            let attrs = self
                .sftp
                .symlink_metadata(&path)
                .await
                .map_err(remote("chmod", &path))?;
            match FileKind::from_mode(attrs.permissions) {
                FileKind::Symlink => continue,
                FileKind::Dir => {
                    let dir = self.sftp.read_dir(&path).await.map_err(remote("chmod", &path))?;
                    pending.extend(
                        dir.map(|e| e.file_name())
                            .filter(|n| n != "." && n != "..")
                            .map(|n| join(&path, &n)),
                    );
                }
                _ => {}
            }
            self.chmod(&path, mode).await?;
            changed += 1;
        }
        Ok(changed)
    }

    async fn read_small(&self, path: &str) -> Result<String, SftpError> {
        let content = self.read(path, 1024 * 1024).await?;
        Ok(String::from_utf8_lossy(&content.data).into_owned())
    }

    async fn chown(&self, path: &str, user: Option<&str>, group: Option<&str>) -> Result<(u32, u32), SftpError> {
        let current = self.sftp.metadata(path).await.map_err(remote("chown", path))?;

        let uid = match user {
            Some(name) => match name.parse::<u32>() {
                Ok(id) => id,
                Err(_) => lookup_id(&self.read_small("/etc/passwd").await?, name)
                    .ok_or_else(|| SftpError::UnknownUser(name.to_string()))?,
            },
            None => current.uid.unwrap_or(0),
        };
        let gid = match group {
            Some(name) => match name.parse::<u32>() {
                Ok(id) => id,
                Err(_) => lookup_id(&self.read_small("/etc/group").await?, name)
                    .ok_or_else(|| SftpError::UnknownGroup(name.to_string()))?,
            },
            None => current.gid.unwrap_or(0),
        };

        let attrs = FileAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..FileAttributes::empty()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(remote("chown", path))?;
        Ok((uid, gid))
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<u64, SftpError> {
        let attrs = self.sftp.metadata(from).await.map_err(remote("copy", from))?;
        if FileKind::from_mode(attrs.permissions) == FileKind::Dir {
            return Err(SftpError::IsDirectory {
                path: from.to_string(),
            });
        }
        let total = attrs.size.unwrap_or(0);
        let mut source = self.sftp.open(from).await.map_err(remote("copy", from))?;
        let mut dest = self.sftp.create(to).await.map_err(remote("copy", to))?;

        let mut copied = 0u64;
        let interrupted = |copied, reason: String| SftpError::CopyInterrupted {
            copied,
            total,
            reason,
        };
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| interrupted(copied, format!("read {from}: {e}")))?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])
                .await
                .map_err(|e| interrupted(copied, format!("write {to}: {e}")))?;
            copied += n as u64;
            progress(copied, total);
        }
        dest.shutdown()
            .await
            .map_err(|e| interrupted(copied, format!("close {to}: {e}")))?;
        if let Some(mode) = attrs.permissions {
            if let Err(e) = self.chmod(to, mode).await {
                debug!(error = %e, "Could not copy permissions");
            }
        }
        Ok(copied)
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<(), SftpError> {
        // OpenSSH's sftp-server reads SSH_FXP_SYMLINK as (target, link).
        self.sftp
            .symlink(target, link)
            .await
            .map_err(remote("symlink", link))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp.rename(from, to).await.map_err(remote("rename", from))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<u64, SftpError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(remote("delete", path))?;
        if FileKind::from_mode(attrs.permissions) != FileKind::Dir {
            self.sftp.remove_file(path).await.map_err(remote("delete", path))?;
            return Ok(1);
        }
        if !recursive {
            self.sftp.remove_dir(path).await.map_err(remote("delete", path))?;
            return Ok(1);
        }

        // Collect in pre-order, then remove in reverse so children go first.
        let mut order = Vec::new();
        let mut pending = vec![(path.to_string(), true)];
        while let Some((current, is_dir)) = pending.pop() {
            if is_dir {
                let dir = self
                    .sftp
                    .read_dir(&current)
                    .await
                    .map_err(remote("delete", &current))?;
                for entry in dir {
                    let name = entry.file_name();
                    if name == "." || name == ".." {
                        continue;
                    }
                    let child_dir = FileKind::from_mode(entry.metadata().permissions) == FileKind::Dir;
                    pending.push((join(&current, &name), child_dir));
                }
            }
            order.push((current, is_dir));
        }
        let mut removed = 0;
        for (target, is_dir) in order.into_iter().rev() {
            if is_dir {
                self.sftp.remove_dir(&target).await.map_err(remote("delete", &target))?;
            } else {
                self.sftp.remove_file(&target).await.map_err(remote("delete", &target))?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

/// Numeric id of `name` in a passwd or group file (`name:x:id:...`).
pub fn lookup_id(content: &str, name: &str) -> Option<u32> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 3 && fields[0] == name)
        .and_then(|fields| fields[2].parse().ok())
}

async fn timed<T>(
    opts: SftpOptions,
    op: &'static str,
    fut: impl std::future::Future<Output = Result<T, SftpError>>,
) -> Result<T, SftpError> {
    tokio::time::timeout(opts.op_timeout, fut)
        .await
        .unwrap_or(Err(SftpError::Timeout { op }))
}

pub async fn list(config: &ConnectorConfig, opts: SftpOptions, path: &str) -> Result<Vec<FileEntry>, SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "list", client.list(path)).await;
    client.close().await;
    result
}

pub async fn stat(config: &ConnectorConfig, opts: SftpOptions, path: &str) -> Result<FileEntry, SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "stat", client.stat(path)).await;
    client.close().await;
    result
}

/// Read a whole file, refusing anything over `opts.read_cap` bytes.
pub async fn read(config: &ConnectorConfig, opts: SftpOptions, path: &str) -> Result<FileContent, SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "read", client.read(path, opts.read_cap)).await;
    client.close().await;
    result
}

/// Create or truncate `path` with `data`, then apply `mode` if given.
pub async fn write(
    config: &ConnectorConfig,
    opts: SftpOptions,
    path: &str,
    data: &[u8],
    mode: Option<u32>,
) -> Result<u64, SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "write", client.write(path, data, mode)).await;
    client.close().await;
    result
}

pub async fn chmod(config: &ConnectorConfig, opts: SftpOptions, path: &str, mode: u32) -> Result<(), SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "chmod", client.chmod(path, mode)).await;
    client.close().await;
    result
}

/// Apply `mode` to `path` and everything below it. Symlinks are skipped.
pub async fn chmod_recursive(
    config: &ConnectorConfig,
    opts: SftpOptions,
    path: &str,
    mode: u32,
) -> Result<u64, SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "chmod", client.chmod_recursive(path, mode)).await;
    client.close().await;
    result
}

/// Change owner by user and group name (or numeric id) as the remote host
/// resolves them. Returns the applied `(uid, gid)`.
pub async fn chown(
    config: &ConnectorConfig,
    opts: SftpOptions,
    path: &str,
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(u32, u32), SftpError> {
    let path = validate_path(path)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "chown", client.chown(path, user, group)).await;
    client.close().await;
    result
}

/// Create `link` pointing at `target`. The target may be relative.
pub async fn symlink(config: &ConnectorConfig, opts: SftpOptions, target: &str, link: &str) -> Result<(), SftpError> {
    let link = validate_path(link)?;
    if target.is_empty() || target.contains('\0') {
        return Err(SftpError::InvalidPath {
            path: target.to_string(),
            reason: "invalid symlink target",
        });
    }
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "symlink", client.symlink(target, link)).await;
    client.close().await;
    result
}

/// Copy one file, reporting `(copied, total)` after every chunk. A failure
/// part way through reports how far it got.
pub async fn copy(
    config: &ConnectorConfig,
    opts: SftpOptions,
    from: &str,
    to: &str,
    progress: &mut (dyn FnMut(u64, u64) + Send),
) -> Result<u64, SftpError> {
    let from = validate_path(from)?;
    let to = validate_path(to)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "copy", client.copy(from, to, progress)).await;
    client.close().await;
    result
}

pub async fn rename(config: &ConnectorConfig, opts: SftpOptions, from: &str, to: &str) -> Result<(), SftpError> {
    let from = validate_path(from)?;
    let to = validate_path(to)?;
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "rename", client.rename(from, to)).await;
    client.close().await;
    result
}

/// Remove a file, an empty directory, or (with `recursive`) a tree.
/// Returns the number of entries removed.
pub async fn delete(config: &ConnectorConfig, opts: SftpOptions, path: &str, recursive: bool) -> Result<u64, SftpError> {
    let path = validate_path(path)?;
    if is_root(path) {
        return Err(SftpError::InvalidPath {
            path: path.to_string(),
            reason: "refusing to delete the root directory",
        });
    }
    let client = SftpClient::open(config, opts.connect_timeout).await?;
    let result = timed(opts, "delete", client.delete(path, recursive)).await;
    client.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/etc/hosts").is_ok());
        assert!(matches!(validate_path("etc/hosts"), Err(SftpError::InvalidPath { .. })));
        assert!(validate_path("/etc/../root").is_err());
        assert!(validate_path("/tmp/a\0b").is_err());
        assert_eq!(validate_path("relative").unwrap_err().code(), "INVALID_PATH");
    }

    #[test]
    fn test_is_root() {
        for root in ["/", "//", "/.", "/./", "///", "/./."] {
            assert!(is_root(root), "{root:?}");
        }
        assert!(!is_root("/tmp"));
        assert!(!is_root("//tmp/."));
    }

    #[test]
    fn test_lookup_id_in_passwd_and_group() {
        let passwd = "# comment\nroot:x:0:0:root:/root:/bin/bash\nwww-data:x:33:33::/var/www:/usr/sbin/nologin\n";
        assert_eq!(lookup_id(passwd, "root"), Some(0));
        assert_eq!(lookup_id(passwd, "www-data"), Some(33));
        assert_eq!(lookup_id(passwd, "www"), None);
        let group = "adm:x:4:syslog\ndocker:x:999:\n";
        assert_eq!(lookup_id(group, "docker"), Some(999));
        assert_eq!(lookup_id("broken:line\n", "broken"), None);
    }

    #[test]
    fn test_file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(Some(0o040_755)), FileKind::Dir);
        assert_eq!(FileKind::from_mode(Some(0o100_644)), FileKind::File);
        assert_eq!(FileKind::from_mode(Some(0o120_777)), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(Some(0o020_666)), FileKind::Other);
        assert_eq!(FileKind::from_mode(None), FileKind::Other);
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/etc", "hosts"), "/etc/hosts");
        assert_eq!(base_name("/etc/hosts"), "hosts");
        assert_eq!(base_name("/"), "/");
    }

    #[test]
    fn test_too_large_message_and_code() {
        let err = SftpError::TooLarge {
            path: "/big".into(),
            size: 3 * 1024 * 1024,
            cap: 2 * 1024 * 1024,
        };
        assert_eq!(err.code(), "FILE_TOO_LARGE");
        assert!(err.to_string().contains("/big"));
    }

    #[tokio::test]
    async fn test_invalid_path_fails_before_connecting() {
        let config = ConnectorConfig {
            host: "203.0.113.1".into(),
            port: 22,
            auth_type: "password".into(),
            ..ConnectorConfig::default()
        };
        let opts = SftpOptions {
            connect_timeout: Duration::from_millis(10),
            op_timeout: Duration::from_millis(10),
            read_cap: 1,
        };
        let err = read(&config, opts, "../etc/passwd").await.unwrap_err();
        assert!(matches!(err, SftpError::InvalidPath { .. }));
        for root in ["/", "//", "/.", "/./", "///"] {
            let err = delete(&config, opts, root, true).await.unwrap_err();
            assert!(matches!(err, SftpError::InvalidPath { .. }), "{root:?} was not refused");
        }
    }

    use super::memfs::{serve, Kind, MemFs};

    fn remote_opts() -> SftpOptions {
        SftpOptions {
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(5),
            read_cap: 1024,
        }
    }

    #[tokio::test]
    async fn test_list_stat_and_write_against_server() {
        let served = serve(
            MemFs::new()
                .dir("/srv")
                .file("/srv/b.txt", b"bee")
                .file("/srv/a.txt", b"a")
                .dir("/srv/zdir")
                .dir("/srv/adir")
                .link("/srv/current", "/srv/adir"),
        )
        .await;
        let config = &served.config;
        let opts = remote_opts();

        let entries = list(config, opts, "/srv").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["adir", "zdir", "a.txt", "b.txt", "current"]);
        assert_eq!(entries[0].path, "/srv/adir");
        assert_eq!(entries[3].size, 3);
        assert_eq!(entries[4].kind, FileKind::Symlink);

        let link = stat(config, opts, "/srv/current").await.unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("/srv/adir"));

        assert_eq!(write(config, opts, "/srv/new.conf", b"port=8080\n", Some(0o600)).await.unwrap(), 10);
        let written = stat(config, opts, "/srv/new.conf").await.unwrap();
        assert_eq!((written.kind, written.size, written.mode), (FileKind::File, 10, 0o600));

        rename(config, opts, "/srv/new.conf", "/srv/app.conf").await.unwrap();
        symlink(config, opts, "/srv/adir", "/srv/latest").await.unwrap();

        let err = stat(config, opts, "/srv/missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        {
            let fs = served.fs();
            assert!(fs.node("/srv/new.conf").is_none());
            assert_eq!(fs.node("/srv/app.conf").unwrap().data(), b"port=8080\n");
            assert_eq!(fs.node("/srv/latest").unwrap().kind, Kind::Link("/srv/adir".into()));
        }
        // One connection per call, nothing pooled.
        assert_eq!(served.connections(), 7);
    }

    #[tokio::test]
    async fn test_read_enforces_cap_even_when_size_is_stale() {
        let mut fs = MemFs::new()
            .file("/small", b"hello")
            .file("/big", &[7u8; 2000])
            .file("/growing", &[1u8; 2000])
            .dir("/dir");
        fs.stale_size.insert("/growing".into(), 10);
        let served = serve(fs).await;
        let opts = remote_opts();

        let content = read(&served.config, opts, "/small").await.unwrap();
        assert_eq!(content.data, b"hello");

        match read(&served.config, opts, "/big").await.unwrap_err() {
            SftpError::TooLarge { size, cap, .. } => assert_eq!((size, cap), (2000, 1024)),
            other => panic!("unexpected error: {other}"),
        }

        // The size check passes, the bounded read catches it at cap + 1.
        match read(&served.config, opts, "/growing").await.unwrap_err() {
            SftpError::TooLarge { size, cap, .. } => assert_eq!((size, cap), (1025, 1024)),
            other => panic!("unexpected error: {other}"),
        }

        let err = read(&served.config, opts, "/dir").await.unwrap_err();
        assert_eq!(err.code(), "IS_DIRECTORY");
    }

    #[tokio::test]
    async fn test_copy_reports_progress_and_keeps_mode() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let served = serve(MemFs::new().file_with_mode("/src.bin", &payload, 0o640)).await;

        let mut seen = Vec::new();
        let copied = copy(&served.config, remote_opts(), "/src.bin", "/dst.bin", &mut |done, total| {
            seen.push((done, total))
        })
        .await
        .unwrap();

        assert_eq!(copied, 100_000);
        assert!(seen.len() > 1);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(seen.iter().all(|(_, total)| *total == 100_000));
        assert_eq!(seen.last(), Some(&(100_000, 100_000)));

        let fs = served.fs();
        let dst = fs.node("/dst.bin").unwrap();
        assert_eq!(dst.data(), payload.as_slice());
        assert_eq!(dst.mode, 0o640);
    }

    #[tokio::test]
    async fn test_copy_failure_reports_bytes_copied() {
        let mut fs = MemFs::new().file("/src.bin", &[3u8; 100_000]);
        fs.fail_reads_from.insert("/src.bin".into(), 65_536);
        let served = serve(fs).await;

        let mut last = None;
        let err = copy(&served.config, remote_opts(), "/src.bin", "/dst.bin", &mut |done, total| {
            last = Some((done, total))
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), "COPY_INTERRUPTED");
        let SftpError::CopyInterrupted { copied, total, reason } = err else {
            unreachable!();
        };
        assert_eq!(total, 100_000);
        assert!(copied > 0 && copied <= 65_536, "copied {copied}");
        assert_eq!(last, Some((copied, 100_000)));
        assert!(reason.contains("/src.bin"), "{reason}");
    }

    #[tokio::test]
    async fn test_recursive_delete_removes_children_first() {
        let served = serve(
            MemFs::new()
                .dir("/data")
                .file("/data/a.txt", b"a")
                .dir("/data/sub")
                .file("/data/sub/b.txt", b"b")
                .dir("/data/sub/deep")
                .file("/data/sub/deep/c.txt", b"c")
                .link("/data/keep-link", "/keep")
                .dir("/keep")
                .file("/keep/x", b"x"),
        )
        .await;
        let opts = remote_opts();

        let err = delete(&served.config, opts, "/data", false).await.unwrap_err();
        assert_eq!(err.code(), "SFTP_ERROR");
        assert!(served.fs().node("/data/a.txt").is_some());

        assert_eq!(delete(&served.config, opts, "/data", true).await.unwrap(), 7);

        let fs = served.fs();
        assert_eq!(fs.paths(), ["/", "/keep", "/keep/x"]);
        for (i, op) in fs.ops.iter().enumerate() {
            let Some(dir) = op.strip_prefix("rmdir ") else {
                continue;
            };
            let prefix = format!("{dir}/");
            assert!(
                fs.ops[i..].iter().all(|later| !later.contains(&prefix)),
                "{op} ran before its children: {:?}",
                fs.ops
            );
        }
        assert!(fs.ops.contains(&"remove /data/keep-link".to_string()));
    }

    #[tokio::test]
    async fn test_chmod_recursive_does_not_follow_symlinks() {
        let served = serve(
            MemFs::new()
                .dir("/site")
                .file("/site/index.html", b"<html>")
                .dir("/site/assets")
                .file("/site/assets/app.js", b"0")
                .link("/site/escape", "/outside/secret")
                .dir("/outside")
                .file_with_mode("/outside/secret", b"key", 0o600),
        )
        .await;

        let changed = chmod_recursive(&served.config, remote_opts(), "/site", 0o750).await.unwrap();
        assert_eq!(changed, 4);

        let fs = served.fs();
        for path in ["/site", "/site/index.html", "/site/assets", "/site/assets/app.js"] {
            assert_eq!(fs.node(path).unwrap().mode, 0o750, "{path}");
        }
        assert_eq!(fs.node("/outside/secret").unwrap().mode, 0o600);
        assert!(!fs.ops.iter().any(|op| op == "setstat /site/escape"));
    }

    #[tokio::test]
    async fn test_chown_resolves_names_on_remote_host() {
        let served = serve(
            MemFs::new()
                .dir("/etc")
                .file(
                    "/etc/passwd",
                    b"root:x:0:0:root:/root:/bin/bash\nwww-data:x:33:33::/var/www:/usr/sbin/nologin\n",
                )
                .file("/etc/group", b"root:x:0:\ndeploy:x:1001:\n")
                .dir("/srv")
                .file("/srv/app", b"bin"),
        )
        .await;
        let opts = remote_opts();

        let applied = chown(&served.config, opts, "/srv/app", Some("www-data"), Some("deploy"))
            .await
            .unwrap();
        assert_eq!(applied, (33, 1001));
        {
            let fs = served.fs();
            let node = fs.node("/srv/app").unwrap();
            assert_eq!((node.uid, node.gid), (33, 1001));
        }

        // Numeric ids skip the lookup; a missing user keeps the current uid.
        let applied = chown(&served.config, opts, "/srv/app", None, Some("0")).await.unwrap();
        assert_eq!(applied, (33, 0));

        let err = chown(&served.config, opts, "/srv/app", Some("nobody-here"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_USER");
    }
}
