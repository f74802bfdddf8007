//! In-process SSH server with an in-memory SFTP subsystem, for tests.
//!
//! The tree lives in a [`MemFs`] shared with the test, so a test can seed
//! files, break reads on purpose, and inspect the result and the order of
//! mutating requests afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::net::TcpListener;

use crate::connector::ConnectorConfig;

const USER: &str = "tester";
const PASSWORD: &str = "secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    File(Vec<u8>),
    Dir,
    Link(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: Kind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Node {
    pub fn data(&self) -> &[u8] {
        match &self.kind {
            Kind::File(data) => data,
            _ => &[],
        }
    }
}

#[derive(Debug, Default)]
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
    /// Mutating requests in arrival order, e.g. `rmdir /data/a`.
    pub ops: Vec<String>,
    /// Size `stat` reports for a path, whatever its content.
    pub stale_size: HashMap<String, u64>,
    /// Reads at or past this offset fail.
    pub fail_reads_from: HashMap<String, u64>,
}

fn parent_of(path: &str) -> Option<String> {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
}

fn name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

impl MemFs {
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.insert("/", Kind::Dir, 0o755);
        fs
    }

    fn insert(&mut self, path: &str, kind: Kind, mode: u32) {
        self.nodes.insert(
            path.to_string(),
            Node {
                kind,
                mode,
                uid: 0,
                gid: 0,
            },
        );
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.insert(path, Kind::Dir, 0o755);
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.insert(path, Kind::File(data.to_vec()), 0o644);
        self
    }

    pub fn file_with_mode(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        self.insert(path, Kind::File(data.to_vec()), mode);
        self
    }

    pub fn link(mut self, path: &str, target: &str) -> Self {
        self.insert(path, Kind::Link(target.to_string()), 0o777);
        self
    }

    pub fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Path after following at most one symlink.
    fn resolve(&self, path: &str) -> Option<String> {
        match &self.nodes.get(path)?.kind {
            Kind::Link(target) => self.nodes.contains_key(target).then(|| target.clone()),
            _ => Some(path.to_string()),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        self.nodes.get(path).is_some_and(|n| n.kind == Kind::Dir)
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| p.as_str() != dir && parent_of(p).as_deref() == Some(dir))
            .cloned()
            .collect()
    }

    fn attrs(&self, path: &str) -> Option<FileAttributes> {
        let node = self.nodes.get(path)?;
        let (type_bits, size) = match &node.kind {
            Kind::File(data) => (0o100_000, data.len() as u64),
            Kind::Dir => (0o040_000, 0),
            Kind::Link(target) => (0o120_000, target.len() as u64),
        };
        Some(FileAttributes {
            size: Some(self.stale_size.get(path).copied().unwrap_or(size)),
            uid: Some(node.uid),
            gid: Some(node.gid),
            permissions: Some(type_bits | node.mode),
            atime: Some(0),
            mtime: Some(0),
            ..FileAttributes::empty()
        })
    }
}

enum Open {
    File(String),
    Dir { path: String, listed: bool },
}

/// SFTP request handler over a shared [`MemFs`].
struct MemSftp {
    fs: Arc<Mutex<MemFs>>,
    handles: HashMap<String, Open>,
    next_handle: u64,
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

impl MemSftp {
    fn fs(&self) -> MutexGuard<'_, MemFs> {
        self.fs.lock().unwrap()
    }

    fn open_handle(&mut self, open: Open) -> String {
        self.next_handle += 1;
        let handle = self.next_handle.to_string();
        self.handles.insert(handle.clone(), open);
        handle
    }

    fn file_path(&self, handle: &str) -> Result<String, StatusCode> {
        match self.handles.get(handle) {
            Some(Open::File(path)) => Ok(path.clone()),
            _ => Err(StatusCode::Failure),
        }
    }
}

impl russh_sftp::server::Handler for MemSftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, _version: u32, _extensions: HashMap<String, String>) -> Result<Version, Self::Error> {
        Ok(Version {
            version: 3,
            extensions: HashMap::new(),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = {
            let mut fs = self.fs();
            match fs.resolve(&filename) {
                Some(path) if fs.is_dir(&path) => return Err(StatusCode::Failure),
                Some(path) => {
                    if pflags.contains(OpenFlags::TRUNCATE) {
                        if let Some(node) = fs.nodes.get_mut(&path) {
                            node.kind = Kind::File(Vec::new());
                        }
                    }
                    path
                }
                None if pflags.contains(OpenFlags::CREATE) => {
                    let parent_ok = parent_of(&filename).is_some_and(|p| fs.is_dir(&p));
                    if !parent_ok {
                        return Err(StatusCode::NoSuchFile);
                    }
                    fs.insert(&filename, Kind::File(Vec::new()), 0o644);
                    fs.ops.push(format!("create {filename}"));
                    filename
                }
                None => return Err(StatusCode::NoSuchFile),
            }
        };
        let handle = self.open_handle(Open::File(path));
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(ok(id))
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        let path = self.file_path(&handle)?;
        let fs = self.fs();
        let fail_from = fs.fail_reads_from.get(&path).copied().unwrap_or(u64::MAX);
        if offset >= fail_from {
            return Err(StatusCode::Failure);
        }
        let data = fs.nodes.get(&path).ok_or(StatusCode::NoSuchFile)?.data();
        let start = usize::try_from(offset).map_err(|_| StatusCode::Failure)?;
        if start >= data.len() {
            return Err(StatusCode::Eof);
        }
        let mut end = data.len().min(start + len as usize);
        if let Ok(fail_from) = usize::try_from(fail_from) {
            end = end.min(fail_from);
        }
        Ok(Data {
            id,
            data: data[start..end].to_vec(),
        })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status, Self::Error> {
        let path = self.file_path(&handle)?;
        let mut fs = self.fs();
        let node = fs.nodes.get_mut(&path).ok_or(StatusCode::NoSuchFile)?;
        let Kind::File(content) = &mut node.kind else {
            return Err(StatusCode::Failure);
        };
        let start = usize::try_from(offset).map_err(|_| StatusCode::Failure)?;
        if content.len() < start + data.len() {
            content.resize(start + data.len(), 0);
        }
        content[start..start + data.len()].copy_from_slice(&data);
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.fs().attrs(&path).ok_or(StatusCode::NoSuchFile)?;
        Ok(Attrs { id, attrs })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let fs = self.fs();
        let resolved = fs.resolve(&path).ok_or(StatusCode::NoSuchFile)?;
        let attrs = fs.attrs(&resolved).ok_or(StatusCode::NoSuchFile)?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let path = self.file_path(&handle)?;
        let attrs = self.fs().attrs(&path).ok_or(StatusCode::NoSuchFile)?;
        Ok(Attrs { id, attrs })
    }

    async fn setstat(&mut self, id: u32, path: String, attrs: FileAttributes) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        let resolved = fs.resolve(&path).ok_or(StatusCode::NoSuchFile)?;
        fs.ops.push(format!("setstat {path}"));
        let node = fs.nodes.get_mut(&resolved).ok_or(StatusCode::NoSuchFile)?;
        if let Some(permissions) = attrs.permissions {
            node.mode = permissions & 0o7777;
        }
        if let Some(uid) = attrs.uid {
            node.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.gid = gid;
        }
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        if !self.fs().is_dir(&path) {
            return Err(StatusCode::NoSuchFile);
        }
        let handle = self.open_handle(Open::Dir { path, listed: false });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = match self.handles.get_mut(&handle) {
            Some(Open::Dir { listed: true, .. }) => return Err(StatusCode::Eof),
            Some(Open::Dir { path, listed }) => {
                *listed = true;
                path.clone()
            }
            _ => return Err(StatusCode::Failure),
        };
        let fs = self.fs();
        let dir_attrs = fs.attrs(&path).unwrap_or_else(FileAttributes::empty);
        let mut files = vec![
            File::new(".", dir_attrs.clone()),
            File::new("..", dir_attrs),
        ];
        for child in fs.children(&path) {
            let attrs = fs.attrs(&child).unwrap_or_else(FileAttributes::empty);
            files.push(File::new(name_of(&child), attrs));
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        match fs.nodes.get(&filename) {
            None => return Err(StatusCode::NoSuchFile),
            Some(node) if node.kind == Kind::Dir => return Err(StatusCode::Failure),
            Some(_) => {}
        }
        fs.nodes.remove(&filename);
        fs.ops.push(format!("remove {filename}"));
        Ok(ok(id))
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        if fs.nodes.contains_key(&path) {
            return Err(StatusCode::Failure);
        }
        fs.insert(&path, Kind::Dir, 0o755);
        fs.ops.push(format!("mkdir {path}"));
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        if !fs.is_dir(&path) {
            return Err(StatusCode::NoSuchFile);
        }
        if !fs.children(&path).is_empty() {
            return Err(StatusCode::Failure);
        }
        fs.nodes.remove(&path);
        fs.ops.push(format!("rmdir {path}"));
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::new(path, FileAttributes::empty())],
        })
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        if !fs.nodes.contains_key(&oldpath) {
            return Err(StatusCode::NoSuchFile);
        }
        if fs.nodes.contains_key(&newpath) {
            return Err(StatusCode::Failure);
        }
        let prefix = format!("{oldpath}/");
        let moving: Vec<String> = fs
            .nodes
            .keys()
            .filter(|p| **p == oldpath || p.starts_with(&prefix))
            .cloned()
            .collect();
        for path in moving {
            if let Some(node) = fs.nodes.remove(&path) {
                let moved = format!("{newpath}{}", &path[oldpath.len()..]);
                fs.nodes.insert(moved, node);
            }
        }
        fs.ops.push(format!("rename {oldpath} {newpath}"));
        Ok(ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        match self.fs().nodes.get(&path).map(|n| &n.kind) {
            Some(Kind::Link(target)) => Ok(Name {
                id,
                files: vec![File::new(target.clone(), FileAttributes::empty())],
            }),
            Some(_) => Err(StatusCode::Failure),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    /// Arguments arrive as (target, link), the order OpenSSH servers use.
    async fn symlink(&mut self, id: u32, target: String, link: String) -> Result<Status, Self::Error> {
        let mut fs = self.fs();
        if fs.nodes.contains_key(&link) {
            return Err(StatusCode::Failure);
        }
        fs.insert(&link, Kind::Link(target.clone()), 0o777);
        fs.ops.push(format!("symlink {link} -> {target}"));
        Ok(ok(id))
    }
}

/// SSH side: password auth and an `sftp` subsystem on session channels.
struct SshSide {
    fs: Arc<Mutex<MemFs>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl russh::server::Handler for SshSide {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.remove(&channel_id) {
            Some(channel) if name == "sftp" => {
                let _ = session.channel_success(channel_id);
                let handler = MemSftp {
                    fs: self.fs.clone(),
                    handles: HashMap::new(),
                    next_handle: 0,
                };
                tokio::spawn(russh_sftp::server::run(channel.into_stream(), handler));
            }
            _ => {
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }
}

/// A running server and what a test needs to reach and inspect it.
pub struct Served {
    pub config: ConnectorConfig,
    pub fs: Arc<Mutex<MemFs>>,
    connections: Arc<AtomicUsize>,
}

impl Served {
    pub fn fs(&self) -> MutexGuard<'_, MemFs> {
        self.fs.lock().unwrap()
    }

    /// SSH connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Serve `fs` on an ephemeral loopback port.
pub async fn serve(fs: MemFs) -> Served {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    let config = Arc::new(russh::server::Config {
        methods,
        keys: vec![key],
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fs = Arc::new(Mutex::new(fs));
    let connections = Arc::new(AtomicUsize::new(0));

    let shared = fs.clone();
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = SshSide {
                fs: shared.clone(),
                channels: HashMap::new(),
            };
            let config = config.clone();
            tokio::spawn(async move {
                if let Ok(running) = russh::server::run_stream(config, stream, handler).await {
                    let _ = running.await;
                }
            });
        }
    });

    Served {
        config: ConnectorConfig {
            host: "127.0.0.1".into(),
            port,
            user: USER.into(),
            auth_type: "password".into(),
            secret: PASSWORD.into(),
            ..ConnectorConfig::default()
        },
        fs,
        connections,
    }
}
