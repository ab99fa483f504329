//! Stream synchronizer.
//!
//! Turns the arbitrarily chunked inbound byte stream into protocol events.
//! The reader task feeds every chunk to [`StreamSync::ingest`]; an
//! operation arms a marker with [`StreamSync::arm`], writes to the device
//! and then awaits [`StreamSync::wait_for_marker`].
//!
//! Matching works line by line on the text received since the marker was
//! armed. A line matches when it equals or contains the marker, when the
//! marker is empty, or when the line is exactly the raw prompt `>`. An
//! unterminated trailing `>` only counts once the stream has been quiet
//! for the prompt-settle time, so a normal `>>> ` prompt arriving in
//! pieces never trips it.

use crate::repl::error::{ReplError, ReplResult};
use crate::repl::observer::SessionObserver;
use crate::repl::types::{ReplConfig, COMPLETION_TOKEN, LINE_BREAK, RAW_PROMPT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct SyncState {
    pending_marker: Option<String>,
    accumulated: String,
    raw_capture: Option<Vec<u8>>,
    force_echo: bool,
    /// Bytes of a UTF-8 sequence split across chunks.
    utf8_tail: Vec<u8>,
    /// Last inbound chunk.
    last_rx: Instant,
    /// Last inbound chunk, arm or write; drives the idle timeout.
    last_activity: Instant,
}

/// Per-connection synchronizer shared by the reader task and the running
/// operation.
pub struct StreamSync {
    port: String,
    state: Mutex<SyncState>,
    notify: Notify,
    cancel: CancellationToken,
    observer: Arc<dyn SessionObserver>,
    idle_timeout: Duration,
    prompt_settle: Duration,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    Matched(usize),
    /// Only a trailing `>` that has not settled yet.
    PendingPrompt,
    NoMatch,
}

impl StreamSync {
    pub fn new(
        port: impl Into<String>,
        config: &ReplConfig,
        observer: Arc<dyn SessionObserver>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            port: port.into(),
            state: Mutex::new(SyncState {
                pending_marker: None,
                accumulated: String::new(),
                raw_capture: None,
                force_echo: false,
                utf8_tail: Vec::new(),
                last_rx: now,
                last_activity: now,
            }),
            notify: Notify::new(),
            cancel,
            observer,
            idle_timeout: Duration::from_millis(config.marker_idle_timeout_ms),
            prompt_settle: Duration::from_millis(config.prompt_settle_ms),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Feed one inbound chunk.
    pub async fn ingest(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.bytes_rx.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        log::trace!("[repl:{}] rx {}", self.port, hex::encode(chunk));

        let mut st = self.state.lock().await;
        let now = Instant::now();
        st.last_rx = now;
        st.last_activity = now;

        let text = decode_utf8_incremental(&mut st.utf8_tail, chunk);
        if st.pending_marker.is_none() {
            drop(st);
            if !text.is_empty() {
                self.observer.on_data(&text);
            }
            return;
        }

        if let Some(raw) = st.raw_capture.as_mut() {
            raw.extend_from_slice(chunk);
        }
        if st.force_echo && !text.is_empty() {
            self.observer.on_data(&text);
        }
        st.accumulated.push_str(&text);
        drop(st);
        self.notify.notify_one();
    }

    // ── Arming ───────────────────────────────────────────────────────

    /// Arm `marker` and start collecting text from scratch.
    pub async fn arm(&self, marker: &str) {
        let mut st = self.state.lock().await;
        st.pending_marker = Some(marker.to_string());
        st.accumulated.clear();
        st.last_activity = Instant::now();
        log::debug!("[repl:{}] waiting for {:?}", self.port, marker);
    }

    pub async fn is_armed(&self) -> bool {
        self.state.lock().await.pending_marker.is_some()
    }

    /// Echo collected text to the observer while a marker is armed.
    pub async fn set_force_echo(&self, on: bool) {
        self.state.lock().await.force_echo = on;
    }

    /// Keep a byte-accurate copy of everything received while armed.
    pub async fn start_raw_capture(&self) {
        self.state.lock().await.raw_capture = Some(Vec::new());
    }

    /// Stop raw capture and hand back the captured bytes.
    pub async fn end_raw_capture(&self) -> Vec<u8> {
        self.state.lock().await.raw_capture.take().unwrap_or_default()
    }

    /// Record an outbound write; counts towards the idle timeout.
    pub async fn note_write(&self, len: usize) {
        self.bytes_tx.fetch_add(len as u64, Ordering::Relaxed);
        self.state.lock().await.last_activity = Instant::now();
    }

    // ── Waiting ──────────────────────────────────────────────────────

    /// Wait for the armed marker.
    ///
    /// Returns the collected lines before the matching line plus `omit`
    /// more. Lines past that are forwarded to the observer. Fails with
    /// `Cancelled` when the connection goes away and with
    /// `ProtocolTimeout` after the idle timeout passes with no inbound data.
    pub async fn wait_for_marker(&self, omit: usize) -> ReplResult<Vec<String>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReplError::cancelled());
            }
            let notified = self.notify.notified();
            let wake_at = {
                let mut st = self.state.lock().await;
                let Some(marker) = st.pending_marker.clone() else {
                    return Ok(Vec::new());
                };
                let now = Instant::now();
                let settled = now.duration_since(st.last_rx) >= self.prompt_settle;
                let settle_at = match scan_lines(&st.accumulated, &marker, settled) {
                    Scan::Matched(index) => {
                        log::debug!("[repl:{}] matched {:?} at line {}", self.port, marker, index);
                        return Ok(self.resolve(&mut st, index, omit));
                    }
                    Scan::PendingPrompt => Some(st.last_rx + self.prompt_settle),
                    Scan::NoMatch => None,
                };
                let idle_at = st.last_activity + self.idle_timeout;
                if now >= idle_at {
                    st.pending_marker = None;
                    return Err(ReplError::timeout(format!(
                        "no {:?} from device within {} ms",
                        marker,
                        self.idle_timeout.as_millis()
                    )));
                }
                settle_at.map_or(idle_at, |s| s.min(idle_at))
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ReplError::cancelled()),
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn resolve(&self, st: &mut SyncState, index: usize, omit: usize) -> Vec<String> {
        let lines = split_lines(&st.accumulated);
        let cut = (index + omit).min(lines.len());
        let result: Vec<String> = lines[..cut].iter().map(|l| l.to_string()).collect();
        let rest = lines[cut..].join(LINE_BREAK);
        let echoed = st.force_echo;
        st.pending_marker = None;
        st.accumulated.clear();
        if !rest.is_empty() && !echoed {
            self.observer.on_data(&rest);
        }
        result
    }

    /// Completion-prompt watchdog.
    ///
    /// Waits up to `retries * interval` for a line that is the raw prompt or
    /// starts with the completion token. Returns whether it showed up; does
    /// not consume the collected text.
    pub async fn wait_for_prompt(&self, retries: u32, interval: Duration) -> ReplResult<bool> {
        let deadline = Instant::now() + interval * retries;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReplError::cancelled());
            }
            let notified = self.notify.notified();
            {
                let st = self.state.lock().await;
                if split_lines(&st.accumulated)
                    .iter()
                    .any(|l| *l == RAW_PROMPT || l.starts_with(COMPLETION_TOKEN))
                {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ReplError::cancelled()),
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Pure helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split(LINE_BREAK).collect()
    }
}

fn scan_lines(text: &str, marker: &str, prompt_settled: bool) -> Scan {
    if marker.is_empty() {
        return Scan::Matched(0);
    }
    let lines = split_lines(text);
    let last = lines.len().saturating_sub(1);
    let mut pending = false;
    for (i, line) in lines.iter().enumerate() {
        if *line == marker || line.contains(marker) {
            return Scan::Matched(i);
        }
        if *line == RAW_PROMPT {
            if i < last || prompt_settled {
                return Scan::Matched(i);
            }
            pending = true;
        }
    }
    if pending {
        Scan::PendingPrompt
    } else {
        Scan::NoMatch
    }
}

/// Decode `chunk` after any bytes left over from the previous chunk.
/// An incomplete sequence at the end is kept in `tail`; invalid bytes
/// become U+FFFD exactly as a one-shot lossy decode would.
fn decode_utf8_incremental(tail: &mut Vec<u8>, chunk: &[u8]) -> String {
    let mut buf = std::mem::take(tail);
    buf.extend_from_slice(chunk);
    let mut out = String::with_capacity(buf.len());
    let mut input = &buf[..];
    loop {
        match std::str::from_utf8(input) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if let Ok(s) = std::str::from_utf8(&input[..valid]) {
                    out.push_str(s);
                }
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        input = &input[valid + len..];
                    }
                    None => {
                        *tail = input[valid..].to_vec();
                        break;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::error::ReplErrorKind;
    use crate::repl::observer::{EventObserver, NullObserver, SessionEvent};

    fn make_sync(observer: Arc<dyn SessionObserver>) -> Arc<StreamSync> {
        Arc::new(StreamSync::new(
            "SIM0",
            &ReplConfig::default(),
            observer,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_scan_rules() {
        assert_eq!(scan_lines("a\r\nOK\r\nb", "OK", false), Scan::Matched(1));
        assert_eq!(scan_lines("xx MPY: soft reboot yy", "MPY: soft reboot", false), Scan::Matched(0));
        assert_eq!(scan_lines("", "", false), Scan::Matched(0));
        assert_eq!(scan_lines("foo\r\n>\r\nbar", "never", false), Scan::Matched(1));
        assert_eq!(scan_lines("foo\r\n>", "never", false), Scan::PendingPrompt);
        assert_eq!(scan_lines("foo\r\n>", "never", true), Scan::Matched(1));
        assert_eq!(scan_lines("foo\r\n>>> ", "never", true), Scan::NoMatch);
    }

    #[test]
    fn test_incremental_utf8_matches_one_shot() {
        let bytes = "héllo → wörld".as_bytes();
        for split in 0..=bytes.len() {
            let mut tail = Vec::new();
            let mut text = decode_utf8_incremental(&mut tail, &bytes[..split]);
            text.push_str(&decode_utf8_incremental(&mut tail, &bytes[split..]));
            assert_eq!(text, "héllo → wörld", "split at {}", split);
            assert!(tail.is_empty());
        }
    }

    #[test]
    fn test_incremental_utf8_replaces_invalid_bytes() {
        let mut tail = Vec::new();
        let text = decode_utf8_incremental(&mut tail, b"a\xFFb");
        assert_eq!(text, String::from_utf8_lossy(b"a\xFFb"));
    }

    #[tokio::test]
    async fn test_empty_marker_resolves_immediately() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("").await;
        let lines = sync.wait_for_marker(0).await.unwrap();
        assert!(lines.is_empty());
        assert!(!sync.is_armed().await);
    }

    #[tokio::test]
    async fn test_marker_returns_lines_and_forwards_rest() {
        let (obs, mut rx) = EventObserver::channel();
        let sync = make_sync(Arc::new(obs));
        sync.arm("MPY: soft reboot").await;
        sync.ingest(b"OK\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>extra")
            .await;
        let lines = sync.wait_for_marker(2).await.unwrap();
        assert_eq!(lines, vec!["OK", "MPY: soft reboot", "raw REPL; CTRL-B to exit"]);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Data(">extra".into()));
    }

    #[tokio::test]
    async fn test_unarmed_data_goes_to_observer() {
        let (obs, mut rx) = EventObserver::channel();
        let sync = make_sync(Arc::new(obs));
        sync.ingest(b">>> print(1)\r\n1\r\n").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Data(">>> print(1)\r\n1\r\n".into())
        );
        assert_eq!(sync.bytes_rx(), 17);
    }

    #[tokio::test]
    async fn test_force_echo_while_armed() {
        let (obs, mut rx) = EventObserver::channel();
        let sync = make_sync(Arc::new(obs));
        sync.set_force_echo(true).await;
        sync.arm(">").await;
        sync.ingest(b"OKhello\r\n\x04\x04>").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Data("OKhello\r\n\x04\x04>".into())
        );
        sync.wait_for_marker(0).await.unwrap();
        // Already echoed; the remainder is not forwarded twice.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_raw_capture_is_byte_accurate() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("###END###").await;
        sync.start_raw_capture().await;
        sync.ingest(b"OK\x00\xFF\xFE").await;
        sync.ingest(b"###END###").await;
        sync.wait_for_marker(1).await.unwrap();
        assert_eq!(sync.end_raw_capture().await, b"OK\x00\xFF\xFE###END###");
        assert!(sync.end_raw_capture().await.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_boundary_independence() {
        let stream = "jünk\r\nnoise\r\nMPY: soft reboot\r\nraw REPL; CTRL-B to exit\r\n>".as_bytes();
        let marker = "MPY: soft reboot";

        let whole = make_sync(Arc::new(NullObserver));
        whole.arm(marker).await;
        whole.ingest(stream).await;
        let expected = whole.wait_for_marker(0).await.unwrap();
        assert_eq!(expected, vec!["jünk", "noise"]);

        let mut splits: Vec<Vec<&[u8]>> = (1..stream.len())
            .map(|at| vec![&stream[..at], &stream[at..]])
            .collect();
        splits.push(stream.chunks(1).collect());
        splits.push(stream.chunks(7).collect());

        for chunks in splits {
            let sync = make_sync(Arc::new(NullObserver));
            sync.arm(marker).await;
            let waiter = {
                let sync = sync.clone();
                tokio::spawn(async move { sync.wait_for_marker(0).await })
            };
            for chunk in &chunks {
                sync.ingest(chunk).await;
                tokio::task::yield_now().await;
            }
            assert_eq!(waiter.await.unwrap().unwrap(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_prompt_matches_after_settle() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("never printed").await;
        sync.ingest(b"Traceback\r\n>").await;
        let started = Instant::now();
        let lines = sync.wait_for_marker(0).await.unwrap();
        assert_eq!(lines, vec!["Traceback"]);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_normal_prompt_does_not_match() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("never printed").await;
        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait_for_marker(0).await })
        };
        sync.ingest(b">").await;
        tokio::task::yield_now().await;
        sync.ingest(b">> ").await;
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::ProtocolTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reports_protocol_timeout() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("raw REPL; CTRL-B to exit").await;
        let started = Instant::now();
        let err = sync.wait_for_marker(2).await.unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::ProtocolTimeout);
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert!(!sync.is_armed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_wait() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm("###DONE READING FILE###").await;
        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait_for_marker(0).await })
        };
        tokio::task::yield_now().await;
        let started = Instant::now();
        sync.cancel_token().cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ReplErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_prompt_sees_completion_token() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm(">").await;
        sync.ingest(b"OKrm_worked\r\n").await;
        assert!(sync.wait_for_prompt(15, Duration::from_millis(5)).await.unwrap());
        // The watchdog leaves the text for the marker wait.
        sync.ingest(b"\x04\x04>").await;
        assert_eq!(sync.wait_for_marker(0).await.unwrap(), vec!["OKrm_worked"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_prompt_gives_up_after_retries() {
        let sync = make_sync(Arc::new(NullObserver));
        sync.arm(">").await;
        let started = Instant::now();
        assert!(!sync.wait_for_prompt(15, Duration::from_millis(5)).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(75));
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
