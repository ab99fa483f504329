//! In-memory MicroPython board speaking the friendly and raw REPL.
//!
//! Recognises the driver's generated scripts by their content and runs
//! them against a small in-memory filesystem. Anything else is treated as
//! user code made of `print('...')` lines.

#![allow(dead_code)]

use picolink_repl::repl::{
    ReplConfig, ReplError, ReplResult, ReplSession, ReplTransport, SessionEvent,
};
use picolink_repl::repl::{BusyPolicy, EventObserver};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

pub const RAW_BANNER: &str = "\r\nraw REPL; CTRL-B to exit\r\n>";
pub const SOFT_REBOOT: &str = "OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>";
pub const NORMAL_BANNER: &str = "\r\nMicroPython v1.19.1 on 2022-06-18; Raspberry Pi Pico with RP2040\r\nType \"help()\" for more information.\r\n>>> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardMode {
    Normal,
    Raw,
    Receiving,
}

/// One upload frame as the receiver saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub path: String,
    pub header: String,
    pub blocks: usize,
}

struct Receiver {
    path: String,
    buf: Vec<u8>,
    declared: Option<usize>,
}

struct BoardState {
    mode: BoardMode,
    line: Vec<u8>,
    receiver: Option<Receiver>,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    frames: Vec<RecordedFrame>,
    stalled: bool,
    scripts_run: usize,
}

pub struct EmulatedBoard {
    name: String,
    open: AtomicBool,
    /// Reply chunk size; 0 sends each reply whole.
    chunk_size: AtomicUsize,
    rx: Mutex<VecDeque<Vec<u8>>>,
    rx_notify: Notify,
    state: Mutex<BoardState>,
}

impl EmulatedBoard {
    pub fn new() -> Arc<Self> {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Arc::new(Self {
            name: "EMU0".to_string(),
            open: AtomicBool::new(false),
            chunk_size: AtomicUsize::new(0),
            rx: Mutex::new(VecDeque::new()),
            rx_notify: Notify::new(),
            state: Mutex::new(BoardState {
                mode: BoardMode::Normal,
                line: Vec::new(),
                receiver: None,
                files: BTreeMap::new(),
                dirs,
                frames: Vec::new(),
                stalled: false,
                scripts_run: 0,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap()
    }

    pub fn with_file(self: Arc<Self>, path: &str, data: &[u8]) -> Arc<Self> {
        {
            let mut st = self.state();
            let mut built = String::new();
            for part in parent_of(path).split('/').filter(|p| !p.is_empty()) {
                built = format!("{}/{}", built, part);
                st.dirs.insert(built.clone());
            }
            st.files.insert(path.to_string(), data.to_vec());
        }
        self
    }

    /// Deliver every reply in pieces of at most `size` bytes.
    pub fn with_chunk_size(self: Arc<Self>, size: usize) -> Arc<Self> {
        self.chunk_size.store(size, Ordering::SeqCst);
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn mode(&self) -> BoardMode {
        self.state().mode
    }

    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.state().frames.clone()
    }

    pub fn scripts_run(&self) -> usize {
        self.state().scripts_run
    }

    /// Swallow every write without answering.
    pub fn stall(&self) {
        self.state().stalled = true;
    }

    /// Simulate the cable being pulled.
    pub fn hang_up(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
    }

    fn emit(&self, out: Vec<u8>) {
        if out.is_empty() {
            return;
        }
        let size = self.chunk_size.load(Ordering::SeqCst);
        {
            let mut rx = self.rx.lock().unwrap();
            if size == 0 {
                rx.push_back(out);
            } else {
                rx.extend(out.chunks(size).map(<[u8]>::to_vec));
            }
        }
        self.rx_notify.notify_waiters();
    }

    fn feed(&self, data: &[u8]) -> Vec<u8> {
        let mut st = self.state();
        let mut out = Vec::new();
        if st.stalled {
            return out;
        }
        for &b in data {
            match st.mode {
                BoardMode::Receiving => st.receive(b, &mut out),
                BoardMode::Normal => match b {
                    0x01 => {
                        st.mode = BoardMode::Raw;
                        st.line.clear();
                        out.extend_from_slice(RAW_BANNER.as_bytes());
                    }
                    b'\r' | 0x03 => out.extend_from_slice(b"\r\n>>> "),
                    0x02 | 0x04 => {}
                    b => out.push(b),
                },
                BoardMode::Raw => match b {
                    0x01 => {
                        st.line.clear();
                        out.extend_from_slice(RAW_BANNER.as_bytes());
                    }
                    0x02 => {
                        st.mode = BoardMode::Normal;
                        st.line.clear();
                        out.extend_from_slice(NORMAL_BANNER.as_bytes());
                    }
                    0x03 => st.line.clear(),
                    0x04 if st.line.is_empty() => out.extend_from_slice(SOFT_REBOOT.as_bytes()),
                    0x04 => {
                        let script = String::from_utf8_lossy(&std::mem::take(&mut st.line)).into_owned();
                        st.scripts_run += 1;
                        st.execute(&script, &mut out);
                    }
                    b => st.line.push(b),
                },
            }
        }
        out
    }
}

impl BoardState {
    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    fn receive(&mut self, b: u8, out: &mut Vec<u8>) {
        let Some(rcv) = self.receiver.as_mut() else {
            return;
        };
        rcv.buf.push(b);
        if rcv.buf.len() == 7 {
            let header = String::from_utf8_lossy(&rcv.buf).into_owned();
            rcv.declared = Some(header.parse().unwrap());
        }
        let Some(len) = rcv.declared else {
            return;
        };
        let blocks = len.div_ceil(255);
        if rcv.buf.len() < 7 + blocks * 255 {
            return;
        }
        let Some(rcv) = self.receiver.take() else {
            return;
        };
        self.mode = BoardMode::Raw;
        self.frames.push(RecordedFrame {
            path: rcv.path.clone(),
            header: String::from_utf8_lossy(&rcv.buf[..7]).into_owned(),
            blocks,
        });
        if self.dirs.contains(parent_of(&rcv.path)) && !self.dirs.contains(&rcv.path) {
            self.files.insert(rcv.path, rcv.buf[7..7 + len].to_vec());
            out.extend_from_slice(b"upload_done\r\n\x04\x04>");
        } else {
            out.extend_from_slice(b"upload_failed OSError(2,)\r\n\x04\x04>");
        }
    }

    fn execute(&mut self, script: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(b"OK");
        if script.contains("micropython.kbd_intr(-1)") {
            let (path, _) = literal_after(script, "open(").unwrap();
            self.mode = BoardMode::Receiving;
            self.receiver = Some(Receiver {
                path,
                buf: Vec::new(),
                declared: None,
            });
            return;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if script.contains("ujson.dumps(walk(") {
            let listing = json!({ "": self.listing("/") });
            stdout.extend_from_slice(listing.to_string().as_bytes());
            stdout.extend_from_slice(b"\r\n");
        } else if script.contains("###DONE READING FILE###") {
            let (path, _) = literal_after(script, "open(").unwrap();
            match self.files.get(&path) {
                Some(data) => {
                    stdout.extend_from_slice(data);
                    stdout.extend_from_slice(b"###DONE READING FILE###");
                }
                None => stdout.extend_from_slice(
                    b"\r\n[Errno 2] ENOENT###READ FAILED######DONE READING FILE###",
                ),
            }
        } else if script.contains("os.rename(") {
            let (old, rest) = literal_after(script, "os.rename(").unwrap();
            let (new, _) = py_literal(rest.trim_start_matches(", ")).unwrap();
            if self.exists(&new) {
                stdout.extend_from_slice(b"rename_error\r\n");
            } else if !self.exists(&old) {
                stdout.extend_from_slice(b"rename_error [Errno 2] ENOENT\r\n");
            } else {
                self.rename(&old, &new);
                stdout.extend_from_slice(b"no_rename_error\r\n");
            }
        } else if script.contains("for f in os.listdir('/'):") {
            let top: Vec<String> = self.children("/").into_iter().map(|(p, _)| p).collect();
            for path in top {
                self.remove(&path);
                stdout.extend_from_slice(b"rm_worked\r\n");
            }
            stdout.extend_from_slice(b"rm_worked\r\n");
        } else if script.contains("\nrm(") {
            let (path, _) = literal_after(script, "\nrm(").unwrap();
            if self.exists(&path) && path != "/" {
                self.remove(&path);
                stdout.extend_from_slice(b"rm_worked\r\n");
            } else {
                stdout.extend_from_slice(b"rm_failed\r\n");
            }
        } else if script.contains("for part in ") {
            let (path, _) = literal_after(script, "for part in ").unwrap();
            let mut built = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                built = format!("{}/{}", built, part);
                if !self.files.contains_key(&built) {
                    self.dirs.insert(built.clone());
                }
            }
            stdout.extend_from_slice(b"mkdir_done\r\n");
        } else {
            run_user_code(script, &mut stdout, &mut stderr);
        }
        out.extend_from_slice(&stdout);
        out.push(0x04);
        out.extend_from_slice(&stderr);
        out.extend_from_slice(b"\x04>");
    }

    /// Direct children of `dir` as (path, is_dir), sorted by path.
    fn children(&self, dir: &str) -> Vec<(String, bool)> {
        let mut out: Vec<(String, bool)> = self
            .dirs
            .iter()
            .filter(|d| d.as_str() != "/" && parent_of(d) == dir)
            .map(|d| (d.clone(), true))
            .chain(
                self.files
                    .keys()
                    .filter(|f| parent_of(f) == dir)
                    .map(|f| (f.clone(), false)),
            )
            .collect();
        out.sort();
        out
    }

    fn listing(&self, dir: &str) -> Value {
        let mut obj = Map::new();
        for (index, (path, is_dir)) in self.children(dir).into_iter().enumerate() {
            let name = name_of(&path).to_string();
            if is_dir {
                obj.insert(index.to_string(), json!({ "D": name }));
                obj.insert(name, self.listing(&path));
            } else {
                obj.insert(index.to_string(), json!({ "F": name }));
            }
        }
        Value::Object(obj)
    }

    fn remove(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        self.files.retain(|f, _| f != path && !f.starts_with(&prefix));
        self.dirs.retain(|d| d != path && !d.starts_with(&prefix));
    }

    fn rename(&mut self, old: &str, new: &str) {
        let prefix = format!("{}/", old);
        let moved = |p: &String| -> Option<String> {
            if p == old {
                Some(new.to_string())
            } else {
                p.strip_prefix(&prefix).map(|rest| format!("{}/{}", new, rest))
            }
        };
        self.files = std::mem::take(&mut self.files)
            .into_iter()
            .map(|(p, data)| (moved(&p).unwrap_or(p), data))
            .collect();
        self.dirs = std::mem::take(&mut self.dirs)
            .into_iter()
            .map(|p| moved(&p).unwrap_or(p))
            .collect();
    }
}

fn run_user_code(script: &str, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
    for (n, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let printed = line
            .strip_prefix("print(")
            .and_then(py_literal)
            .filter(|(_, rest)| *rest == ")");
        match printed {
            Some((text, _)) => {
                stdout.extend_from_slice(text.as_bytes());
                stdout.extend_from_slice(b"\r\n");
            }
            None => {
                stderr.extend_from_slice(
                    format!(
                        "Traceback (most recent call last):\r\n  File \"<stdin>\", line {}\r\nSyntaxError: invalid syntax\r\n",
                        n + 1
                    )
                    .as_bytes(),
                );
                return;
            }
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parse a single-quoted Python literal at the start of `src`.
fn py_literal(src: &str) -> Option<(String, &str)> {
    let body = src.strip_prefix('\'')?;
    let mut out = String::new();
    let mut it = body.char_indices();
    while let Some((i, c)) = it.next() {
        match c {
            '\'' => return Some((out, &body[i + 1..])),
            '\\' => match it.next()?.1 {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                'x' => {
                    let hex: String = [it.next()?.1, it.next()?.1].iter().collect();
                    out.push(u8::from_str_radix(&hex, 16).ok()? as char);
                }
                c => out.push(c),
            },
            c => out.push(c),
        }
    }
    None
}

fn literal_after<'a>(script: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let start = script.find(prefix)? + prefix.len();
    py_literal(&script[start..])
}

#[async_trait::async_trait]
impl ReplTransport for EmulatedBoard {
    async fn open(&self, _baud_rate: u32) -> ReplResult<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(ReplError::transport("already open"));
        }
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.hang_up();
        Ok(())
    }

    async fn read(&self, max_len: usize) -> ReplResult<Option<Vec<u8>>> {
        loop {
            let notified = self.rx_notify.notified();
            if !self.open.load(Ordering::SeqCst) {
                return Ok(None);
            }
            {
                let mut rx = self.rx.lock().unwrap();
                if let Some(mut chunk) = rx.pop_front() {
                    if chunk.len() > max_len {
                        let rest = chunk.split_off(max_len);
                        rx.push_front(rest);
                    }
                    return Ok(Some(chunk));
                }
            }
            notified.await;
        }
    }

    async fn write(&self, data: &[u8]) -> ReplResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::not_connected());
        }
        let out = self.feed(data);
        self.emit(out);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Rig {
    pub session: Arc<ReplSession>,
    pub board: Arc<EmulatedBoard>,
    pub events: UnboundedReceiver<SessionEvent>,
}

pub fn config(policy: BusyPolicy) -> ReplConfig {
    ReplConfig {
        busy_policy: policy,
        ..ReplConfig::default()
    }
}

/// Connect a fresh session to `board`.
pub async fn connect(board: Arc<EmulatedBoard>, policy: BusyPolicy) -> Rig {
    let (observer, events) = EventObserver::channel();
    let session = Arc::new(ReplSession::new(config(policy), Arc::new(observer)));
    let outcome = session.connect(board.clone()).await.unwrap();
    assert!(!outcome.is_skipped());
    Rig {
        session,
        board,
        events,
    }
}

/// Drain queued events.
pub fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

pub fn progress(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

/// Wait until `session` reports an operation in flight.
pub async fn wait_busy(session: &ReplSession) {
    for _ in 0..500 {
        if session.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("session never became busy");
}
