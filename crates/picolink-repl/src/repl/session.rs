//! Driver session.
//!
//! One [`ReplSession`] drives one board. It owns the connection (transport,
//! reader task, synchronizer), the session guard and the latest filesystem
//! snapshot. Every high-level operation goes through the guard and returns
//! [`Outcome::Skipped`] when the `ignore` policy drops it.

use crate::repl::error::{ReplError, ReplErrorKind, ReplResult};
use crate::repl::exec::Completion;
use crate::repl::fs_tree::{self, normalize_path, parent_dir};
use crate::repl::guard::SessionGuard;
use crate::repl::mode::ReplLink;
use crate::repl::observer::SessionObserver;
use crate::repl::port_scanner;
use crate::repl::scripts::{self, RENAME_FAILED, RENAME_OK, RM_FAILED, RM_OK};
use crate::repl::sync::StreamSync;
use crate::repl::transport::{ReaderLease, ReplTransport, SerialPortTransport, TransportHandle};
use crate::repl::types::*;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Connection {
    link: Arc<ReplLink>,
    reader_task: JoinHandle<()>,
    /// Set once `on_disconnect` has fired for this connection.
    reported: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
}

pub struct ReplSession {
    id: String,
    config: ReplConfig,
    observer: Arc<dyn SessionObserver>,
    guard: Arc<SessionGuard>,
    conn: Mutex<Option<Connection>>,
    tree: RwLock<Option<FsNode>>,
}

impl ReplSession {
    pub fn new(config: ReplConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            guard: Arc::new(SessionGuard::new(config.busy_policy)),
            config,
            observer,
            conn: Mutex::new(None),
            tree: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.guard.is_busy()
    }

    pub async fn is_connected(&self) -> bool {
        self.live_link().await.is_ok()
    }

    /// Latest filesystem snapshot.
    pub async fn tree(&self) -> Option<FsNode> {
        self.tree.read().await.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let conn = self.conn.lock().await;
        let live = conn.as_ref().filter(|c| !c.link.sync().is_cancelled());
        let (port_name, mode, connected_at, rx, tx) = match live {
            Some(c) => (
                c.link.port_name().to_string(),
                c.link.mode().await,
                Some(c.connected_at),
                c.link.sync().bytes_rx(),
                c.link.sync().bytes_tx(),
            ),
            None => (String::new(), ReplMode::Unknown, None, 0, 0),
        };
        SessionInfo {
            id: self.id.clone(),
            port_name,
            mode,
            connected: live.is_some(),
            busy: self.guard.is_busy(),
            connected_at,
            bytes_rx: rx,
            bytes_tx: tx,
        }
    }

    // ── Plumbing ─────────────────────────────────────────────────────

    async fn live_link(&self) -> ReplResult<Arc<ReplLink>> {
        match self.conn.lock().await.as_ref() {
            Some(c) if !c.link.sync().is_cancelled() => Ok(c.link.clone()),
            _ => Err(ReplError::not_connected()),
        }
    }

    async fn guarded<T, F, Fut>(&self, op: &str, f: F) -> ReplResult<Outcome<T>>
    where
        F: FnOnce(Arc<ReplLink>) -> Fut,
        Fut: Future<Output = ReplResult<T>>,
    {
        let Some(_permit) = self.guard.admit().await? else {
            log::info!("[repl] {} skipped, session busy", op);
            return Ok(Outcome::Skipped);
        };
        let link = self.live_link().await?;
        log::debug!("[repl:{}] {} started", link.port_name(), op);
        let res = f(link.clone()).await;
        if let Err(e) = &res {
            log::warn!("[repl:{}] {} failed: {}", link.port_name(), op, e);
        }
        res.map(Outcome::Done)
    }

    fn spawn_reader(
        &self,
        reader: ReaderLease,
        sync: Arc<StreamSync>,
        reported: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let observer = self.observer.clone();
        let guard = self.guard.clone();
        let chunk_size = self.config.read_chunk_size;
        tokio::spawn(async move {
            let cancel = sync.cancel_token().clone();
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = reader.read(chunk_size) => match res {
                        Ok(Some(chunk)) => sync.ingest(&chunk).await,
                        Ok(None) => break "port closed".to_string(),
                        Err(e) => break e.to_string(),
                    }
                }
            };
            log::warn!("read loop ended: {}", reason);
            cancel.cancel();
            guard.reset();
            if !reported.swap(true, Ordering::SeqCst) {
                observer.on_disconnect(&reason);
            }
        })
    }

    async fn teardown(&self, reason: &str) -> ReplResult<()> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        let port = conn.link.port_name().to_string();
        conn.link.sync().cancel_token().cancel();
        self.guard.reset();
        let closed = conn.link.handle.transport().close().await;
        // The reader task ends on cancellation; wait for it to drop its lease.
        let _ = conn.reader_task.await;
        if !conn.reported.swap(true, Ordering::SeqCst) {
            self.observer.on_disconnect(reason);
        }
        log::info!("[repl:{}] disconnected: {}", port, reason);
        closed
    }

    async fn open_connection(&self, transport: Arc<dyn ReplTransport>) -> ReplResult<Arc<ReplLink>> {
        let mut slot = self.conn.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.link.sync().is_cancelled() {
                return Err(ReplError::transport(format!(
                    "already connected to {}",
                    existing.link.port_name()
                )));
            }
        }
        if let Some(stale) = slot.take() {
            stale.reader_task.abort();
            let _ = stale.link.handle.transport().close().await;
        }

        if !transport.is_open() {
            transport.open(self.config.baud_rate).await?;
        }
        let port = transport.port_name().to_string();
        let handle = TransportHandle::new(transport);
        let reader = handle.acquire_reader()?;
        let sync = Arc::new(StreamSync::new(
            port.clone(),
            &self.config,
            self.observer.clone(),
            CancellationToken::new(),
        ));
        let reported = Arc::new(AtomicBool::new(false));
        let reader_task = self.spawn_reader(reader, sync.clone(), reported.clone());
        let link = Arc::new(ReplLink::new(
            handle,
            sync,
            self.config.clone(),
            self.observer.clone(),
        ));
        *slot = Some(Connection {
            link: link.clone(),
            reader_task,
            reported,
            connected_at: Utc::now(),
        });
        log::info!("[repl:{}] connected at {} baud", port, self.config.baud_rate);
        Ok(link)
    }

    // ── Filesystem snapshot ──────────────────────────────────────────

    async fn walk(&self, link: &ReplLink) -> ReplResult<FsNode> {
        let lines = link
            .run_raw(&scripts::listing_script(), Completion::prompt(1))
            .await?;
        let output = scripts::clean_output(&lines);
        let parsed = fs_tree::parse_listing(output.first().map(String::as_str).unwrap_or(""));
        link.enter_normal(3).await?;
        let tree = parsed?;
        log::debug!(
            "[repl:{}] filesystem has {} file(s)",
            link.port_name(),
            tree.file_count()
        );
        *self.tree.write().await = Some(tree.clone());
        self.observer.on_fs_snapshot(&tree);
        Ok(tree)
    }

    /// Walk after a mutation. A listing that does not parse keeps the
    /// previous snapshot; connection loss still fails the operation.
    async fn refresh_after_mutation(&self, link: &ReplLink) -> ReplResult<()> {
        match self.walk(link).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind == ReplErrorKind::ParseError => {
                log::warn!("[repl:{}] keeping previous tree: {}", link.port_name(), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect over `transport`, bring the board to the friendly prompt and
    /// take the first filesystem snapshot.
    pub async fn connect(&self, transport: Arc<dyn ReplTransport>) -> ReplResult<Outcome<()>> {
        let Some(_permit) = self.guard.admit().await? else {
            return Ok(Outcome::Skipped);
        };
        let link = self.open_connection(transport).await?;
        self.observer.on_connect(link.port_name());

        let res = async {
            link.enter_normal(0).await?;
            self.refresh_after_mutation(&link).await
        }
        .await;
        match res {
            Ok(()) => Ok(Outcome::Done(())),
            Err(e) => {
                log::warn!("[repl:{}] board did not respond: {}", link.port_name(), e);
                let _ = self.teardown(&e.message).await;
                Err(e)
            }
        }
    }

    /// Connect to the configured port, or the first board matching the
    /// configured USB id.
    pub async fn connect_serial(&self) -> ReplResult<Outcome<()>> {
        let config = self.config.clone();
        let port = tokio::task::spawn_blocking(move || port_scanner::resolve_port(&config))
            .await
            .map_err(|e| ReplError::transport(format!("port scan failed: {}", e)))??;
        self.connect(SerialPortTransport::new(port)).await
    }

    /// Close the connection. Never waits for the guard: any wait in flight
    /// ends with `Cancelled` and the session is free again afterwards.
    pub async fn disconnect(&self) -> ReplResult<()> {
        self.teardown("disconnected by host").await
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Re-walk the board's filesystem.
    pub async fn refresh_tree(&self) -> ReplResult<Outcome<FsNode>> {
        self.guarded("refresh", |link| async move {
            match self.walk(&link).await {
                Err(e) if e.kind == ReplErrorKind::ParseError => {
                    log::warn!("[repl:{}] unreadable listing: {}", link.port_name(), e);
                    Err(e)
                }
                other => other,
            }
        })
        .await
    }

    pub async fn read_file(&self, path: &str, mode: DownloadMode) -> ReplResult<Outcome<FileContent>> {
        let path = path.to_string();
        self.guarded("read", |link| async move { link.download(&path, mode).await })
            .await
    }

    pub async fn upload(&self, path: &str, content: FileContent) -> ReplResult<Outcome<ScriptOutcome>> {
        check_size(&content, self.config.upload_limit_bytes)?;
        let path = path.to_string();
        self.guarded("upload", |link| async move {
            let outcome = link.upload(&path, &content).await?;
            self.refresh_after_mutation(&link).await?;
            link.observer.on_progress(100, "Uploading file...");
            Ok(outcome)
        })
        .await
    }

    /// Upload several files into `dir`. Names ending in `.py`, `.txt`,
    /// `.text` or `.cfg` go up as text, everything else as binary. Files
    /// over the size limit are reported as failures without stopping the
    /// batch.
    pub async fn upload_many(
        &self,
        dir: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> ReplResult<Outcome<Vec<(String, ScriptOutcome)>>> {
        let dir = dir.to_string();
        self.guarded("upload batch", |link| async move {
            let mut results = Vec::with_capacity(files.len());
            for (name, bytes) in files {
                let path = fs_tree::join_path(&dir, &name)?;
                let content = FileContent::from_file_bytes(&name, bytes);
                let outcome = match link.upload(&path, &content).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.kind == ReplErrorKind::SizeLimitExceeded => {
                        ScriptOutcome::Failure(e.message)
                    }
                    Err(e) => return Err(e),
                };
                results.push((path, outcome));
            }
            self.refresh_after_mutation(&link).await?;
            Ok(results)
        })
        .await
    }

    /// Create `dir` and any missing parents.
    pub async fn build_path(&self, dir: &str) -> ReplResult<Outcome<ScriptOutcome>> {
        let dir = dir.to_string();
        self.guarded("mkdir", |link| async move {
            let outcome = link.make_dirs(&dir).await?;
            link.enter_normal(3).await?;
            self.refresh_after_mutation(&link).await?;
            Ok(outcome)
        })
        .await
    }

    /// Remove a file or a directory tree.
    pub async fn delete(&self, path: &str) -> ReplResult<Outcome<ScriptOutcome>> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(ReplError::invalid_path("refusing to delete '/'; use delete_all"));
        }
        self.guarded("delete", |link| async move {
            let lines = link
                .run_raw(&scripts::remove_script(&path), Completion::prompt(1))
                .await?;
            let outcome = scripts::parse_outcome(&lines, RM_OK, RM_FAILED);
            link.enter_normal(3).await?;
            link.observer.on_progress(55, "Deleting...");
            self.refresh_after_mutation(&link).await?;
            link.observer.on_progress(100, "Deleting...");
            Ok(outcome)
        })
        .await
    }

    /// Remove everything in the root directory.
    pub async fn delete_all(&self) -> ReplResult<Outcome<ScriptOutcome>> {
        self.guarded("delete all", |link| async move {
            let lines = link
                .run_raw(&scripts::remove_all_script(), Completion::prompt(1))
                .await?;
            let outcome = scripts::parse_outcome(&lines, RM_OK, RM_FAILED);
            link.enter_normal(3).await?;
            self.refresh_after_mutation(&link).await?;
            Ok(outcome)
        })
        .await
    }

    /// Give the entry at `old_path` the name `new_name` in the same
    /// directory. An existing target is never overwritten.
    pub async fn rename(&self, old_path: &str, new_name: &str) -> ReplResult<Outcome<ScriptOutcome>> {
        let old = normalize_path(old_path)?;
        let new_name = new_name.trim();
        if new_name.is_empty() || new_name.contains('/') {
            return Err(ReplError::invalid_path(format!(
                "'{}' is not a valid file name",
                new_name
            )));
        }
        if old == "/" {
            return Err(ReplError::invalid_path("cannot rename '/'"));
        }
        let new = fs_tree::join_path(parent_dir(&old), new_name)?;
        self.guarded("rename", |link| async move {
            link.observer.on_progress(1, "Renaming file...");
            let lines = link
                .run_raw(&scripts::rename_script(&old, &new), Completion::prompt(1))
                .await?;
            link.observer.on_progress(2, "Renaming file...");
            let outcome = scripts::parse_outcome(&lines, RENAME_OK, RENAME_FAILED);
            link.enter_normal(3).await?;
            link.observer.on_progress(55, "Renaming file...");
            self.refresh_after_mutation(&link).await?;
            link.observer.on_progress(100, "Renaming file...");
            Ok(outcome)
        })
        .await
    }

    /// Run user code in raw mode. Output is echoed to the observer while
    /// it runs and returned once the program ends.
    pub async fn execute_lines(&self, code: &str) -> ReplResult<Outcome<String>> {
        let code = code.to_string();
        self.guarded("exec", |link| async move {
            let lines = link.run_raw_echoed(&code, 1).await?;
            link.enter_normal(3).await?;
            self.refresh_after_mutation(&link).await?;
            Ok(scripts::clean_output(&lines).join(LINE_BREAK))
        })
        .await
    }
}

fn check_size(content: &FileContent, limit: usize) -> ReplResult<()> {
    crate::repl::transfer::check_upload_size(content.to_wire_bytes().len(), limit)
}
