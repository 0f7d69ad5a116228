//! Test harness: a master on loopback and scripted storage nodes that speak
//! the real wire protocol.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetfs_master::{MasterConfig, MasterDaemon, NodeBootstrap, NodeEvent};
use fleetfs_meta::{KvStore, MemoryKvStore};
use fleetfs_transport::message::{
    Command, DiskStatus, HandshakeReply, Inbound, ListingEntry, RemergeEntry, RemoteError,
    RemoteErrorKind, Reply, Response, response_frame,
};
use fleetfs_transport::tcp::{FrameReader, FrameWriter, TcpTransport, TcpTransportConfig};
use fleetfs_transport::Frame;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);
pub const LAST_MODIFIED: u64 = 1_700_000_000_000;

/// Config for a loopback master with the given nodes, all admitted from 127.0.0.1.
pub fn test_config(nodes: &[&str]) -> MasterConfig {
    MasterConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        commit_delay_ms: 50,
        liveness_check_interval_ms: 20,
        handshake_timeout_ms: 1_000,
        ticket_reserve_timeout_ms: 1_000,
        nodes: nodes
            .iter()
            .map(|name| NodeBootstrap {
                name: name.to_string(),
                masks: vec!["127.0.0.1".to_string()],
                properties: BTreeMap::from([("timeout".to_string(), "2000".to_string())]),
            })
            .collect(),
        ..MasterConfig::default()
    }
}

pub struct TestMaster {
    pub daemon: MasterDaemon,
    pub addr: SocketAddr,
}

pub async fn start_master(nodes: &[&str]) -> TestMaster {
    start_with(test_config(nodes), Arc::new(MemoryKvStore::new())).await
}

pub async fn start_with(config: MasterConfig, kv: Arc<dyn KvStore>) -> TestMaster {
    let mut daemon = MasterDaemon::with_store(config, kv).unwrap();
    let addr = daemon.start().await.unwrap();
    TestMaster { daemon, addr }
}

/// Polls `condition` until it holds or the wait budget runs out.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits for the next event matching `wanted`, skipping others.
pub async fn expect_event(events: &mut broadcast::Receiver<NodeEvent>, wanted: NodeEvent) {
    let result = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {wanted:?}");
}

/// The files and directories one fake node holds.
#[derive(Debug, Clone, Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, u64>,
    pub dirs: BTreeSet<String>,
}

impl FakeFs {
    pub fn with_files(files: &[(&str, u64)]) -> Self {
        Self {
            files: files.iter().map(|(p, s)| (p.to_string(), *s)).collect(),
            dirs: BTreeSet::new(),
        }
    }

    fn all_dirs(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::from(["/".to_string()]);
        for path in self.files.keys().chain(self.dirs.iter()) {
            let mut current = parent_of(path);
            while let Some(dir) = current {
                current = parent_of(&dir);
                dirs.insert(dir);
            }
        }
        dirs.extend(self.dirs.iter().cloned());
        dirs
    }

    /// One listing per directory, parents first, followed by the end marker.
    pub fn remerge_stream(&self) -> Vec<RemergeEntry> {
        let dirs = self.all_dirs();
        let mut entries = Vec::new();
        for dir in &dirs {
            let mut listing = Vec::new();
            for (path, size) in &self.files {
                if parent_of(path).as_deref() == Some(dir.as_str()) {
                    listing.push(ListingEntry::file(name_of(path), *size, LAST_MODIFIED));
                }
            }
            for sub in &dirs {
                if sub != dir && parent_of(sub).as_deref() == Some(dir.as_str()) {
                    listing.push(ListingEntry::directory(name_of(sub), LAST_MODIFIED));
                }
            }
            entries.push(RemergeEntry {
                directory: dir.clone(),
                listing,
                is_final: false,
            });
        }
        entries.push(RemergeEntry {
            directory: String::new(),
            listing: Vec::new(),
            is_final: true,
        });
        entries
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.all_dirs().contains(path)
    }

    fn delete(&mut self, path: &str) -> Response {
        if self.files.remove(path).is_some() {
            return Ok(Reply::Ack);
        }
        if !self.exists(path) {
            return Err(RemoteError::new(RemoteErrorKind::NotFound, path));
        }
        let prefix = format!("{path}/");
        self.files.retain(|p, _| !p.starts_with(&prefix));
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        Ok(Reply::Ack)
    }

    fn rename(&mut self, from: &str, to_dir: &str, to_name: &str) -> Response {
        let to = if to_dir == "/" {
            format!("/{to_name}")
        } else {
            format!("{to_dir}/{to_name}")
        };
        if self.exists(&to) {
            return Err(RemoteError::new(RemoteErrorKind::AlreadyExists, to));
        }
        match self.files.remove(from) {
            Some(size) => {
                self.files.insert(to, size);
                Ok(Reply::Ack)
            }
            None => Err(RemoteError::new(RemoteErrorKind::NotFound, from)),
        }
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Default)]
struct FakeState {
    fs: FakeFs,
    commands: Vec<Command>,
    silent: bool,
    hold_listing: bool,
    held: Vec<RemergeEntry>,
}

/// A storage node driven by the test.
pub struct FakeNode {
    pub name: String,
    state: Arc<Mutex<FakeState>>,
    writer: Arc<FrameWriter>,
    task: JoinHandle<()>,
}

impl FakeNode {
    /// Connects, introduces itself as `name` and starts answering commands.
    /// Returns the rejection reason if the master turns it away.
    pub async fn connect(addr: SocketAddr, name: &str, fs: FakeFs) -> Result<FakeNode, String> {
        Self::open(addr, name, fs, false).await
    }

    /// Like [`connect`](Self::connect), but acknowledges the remerge request
    /// without streaming the listing until [`release_listing`](Self::release_listing).
    pub async fn connect_holding_listing(
        addr: SocketAddr,
        name: &str,
        fs: FakeFs,
    ) -> Result<FakeNode, String> {
        Self::open(addr, name, fs, true).await
    }

    async fn open(
        addr: SocketAddr,
        name: &str,
        fs: FakeFs,
        hold_listing: bool,
    ) -> Result<FakeNode, String> {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let mut conn = transport
            .connect(&addr.to_string())
            .await
            .map_err(|e| e.to_string())?;
        conn.writer()
            .write_identity(name)
            .await
            .map_err(|e| e.to_string())?;
        let frame = conn.reader().read_frame().await.map_err(|e| e.to_string())?;
        match HandshakeReply::from_frame(&frame).map_err(|e| e.to_string())? {
            HandshakeReply::Accepted => {}
            HandshakeReply::Rejected { reason } => return Err(reason),
        }
        let (reader, writer) = conn.into_split();
        let writer = Arc::new(writer);
        let state = Arc::new(Mutex::new(FakeState {
            fs,
            hold_listing,
            ..FakeState::default()
        }));
        let task = tokio::spawn(serve(reader, writer.clone(), state.clone()));
        Ok(FakeNode {
            name: name.to_string(),
            state,
            writer,
            task,
        })
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Files the node holds now.
    pub fn files(&self) -> BTreeMap<String, u64> {
        self.state.lock().fs.files.clone()
    }

    /// Stops answering commands (they are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Sends an unsolicited message.
    pub async fn send(&self, message: Inbound) {
        self.send_frame(message.to_frame().unwrap()).await;
    }

    /// Sends a raw frame.
    pub async fn send_frame(&self, frame: Frame) {
        self.writer.write_frame(&frame).await.unwrap();
    }

    /// Streams a listing held back by [`connect_holding_listing`](Self::connect_holding_listing).
    pub async fn release_listing(&self) {
        let held = {
            let mut state = self.state.lock();
            state.hold_listing = false;
            std::mem::take(&mut state.held)
        };
        for entry in held {
            self.send(Inbound::RemergeEntry(entry)).await;
        }
    }

    /// Drops the connection.
    pub async fn disconnect(self) {
        self.task.abort();
        let _ = self.task.await;
        let _ = self.writer.shutdown().await;
    }
}

async fn serve(mut reader: FrameReader, writer: Arc<FrameWriter>, state: Arc<Mutex<FakeState>>) {
    while let Ok(frame) = reader.read_frame().await {
        let Ok(command) = Command::from_frame(&frame) else {
            continue;
        };
        let (response, stream) = {
            let mut state = state.lock();
            state.commands.push(command.clone());
            if state.silent {
                continue;
            }
            let mut stream = match &command {
                Command::Remerge(_) => state.fs.remerge_stream(),
                _ => Vec::new(),
            };
            if state.hold_listing && !stream.is_empty() {
                state.held = std::mem::take(&mut stream);
            }
            (answer(&mut state.fs, &command), stream)
        };
        if writer
            .write_frame(&response_frame(frame.ticket(), &response).unwrap())
            .await
            .is_err()
        {
            return;
        }
        for entry in stream {
            if writer
                .write_frame(&Inbound::RemergeEntry(entry).to_frame().unwrap())
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

fn answer(fs: &mut FakeFs, command: &Command) -> Response {
    match command {
        Command::MaxPathLength => Ok(Reply::MaxPathLength(4096)),
        Command::TlsCapability => Ok(Reply::TlsCapability(false)),
        Command::Delete { path } => fs.delete(path),
        Command::Rename(req) => fs.rename(&req.from, &req.to_dir, &req.to_name),
        Command::Checksum { path } => match fs.files.get(path) {
            Some(size) => Ok(Reply::Checksum(*size as u32)),
            None => Err(RemoteError::new(RemoteErrorKind::NotFound, path.clone())),
        },
        Command::CheckDiskStatus => Ok(Reply::DiskStatus(DiskStatus {
            free_bytes: 1_000,
            total_bytes: 4_000,
            ..DiskStatus::default()
        })),
        Command::Remerge(_)
        | Command::RemergePause
        | Command::RemergeResume
        | Command::Ping
        | Command::AbortTransfer(_)
        | Command::Shutdown => Ok(Reply::Ack),
    }
}
