//! Shared types for the raw REPL crate.
//!
//! Covers device control characters, protocol constants, driver
//! configuration, session state snapshots, transfer payloads and the
//! on-board filesystem tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control characters & protocol constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ctrl-A: enter raw REPL.
pub const CTRL_RAW_MODE: u8 = 0x01;
/// Ctrl-B: leave raw REPL for the friendly prompt.
pub const CTRL_NORMAL_MODE: u8 = 0x02;
/// Ctrl-C: keyboard interrupt, aborts a running program.
pub const CTRL_INTERRUPT: u8 = 0x03;
/// Ctrl-D: soft reset when the raw line buffer is empty.
pub const CTRL_SOFT_RESET: u8 = 0x04;
/// Ctrl-D: end of transmission, executes the buffered raw script.
pub const CTRL_EOT: u8 = 0x04;

/// Largest write the device receive buffer accepts in one go.
pub const SEND_BLOCK_SIZE: usize = 255;
/// Width of the zero-padded decimal length header of an upload frame.
pub const HEADER_DIGITS: usize = 7;
/// Filler for the short final block of an upload frame.
pub const PAD_BYTE: u8 = 0xFF;
/// Chunk size the download script streams the file with.
pub const DOWNLOAD_CHUNK_SIZE: usize = 256;

/// Raw REPL prompt character.
pub const RAW_PROMPT: &str = ">";
/// Token the raw REPL prints once it accepted a script.
pub const COMPLETION_TOKEN: &str = "OK";
/// Literal the download script writes after the file body.
pub const DOWNLOAD_TERMINATOR: &str = "###DONE READING FILE###";

/// Line separator used by the device.
pub const LINE_BREAK: &str = "\r\n";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Interpreter mode as last confirmed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplMode {
    /// Nothing confirmed yet (fresh connection or after an aborted wait).
    Unknown,
    /// Raw mode requested, banner or soft reboot not yet confirmed.
    RawPending,
    /// Raw REPL confirmed.
    Raw,
    /// Friendly prompt confirmed.
    Normal,
}

impl Default for ReplMode {
    fn default() -> Self {
        Self::Unknown
    }
}

impl ReplMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::RawPending => "raw-pending",
            Self::Raw => "raw",
            Self::Normal => "normal",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Banner substrings the firmware prints on mode transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    /// Printed after Ctrl-A.
    #[serde(default = "default_raw_banner")]
    pub raw_banner: String,
    /// Printed after Ctrl-D on an empty raw line.
    #[serde(default = "default_soft_reboot_banner")]
    pub soft_reboot_banner: String,
    /// Board-specific part of the friendly-mode boot banner.
    #[serde(default = "default_normal_banner")]
    pub normal_banner: String,
}

fn default_raw_banner() -> String {
    "raw REPL; CTRL-B to exit".to_string()
}
fn default_soft_reboot_banner() -> String {
    "MPY: soft reboot".to_string()
}
fn default_normal_banner() -> String {
    "Raspberry Pi Pico with RP2040".to_string()
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            raw_banner: default_raw_banner(),
            soft_reboot_banner: default_soft_reboot_banner(),
            normal_banner: default_normal_banner(),
        }
    }
}

/// What the session guard does with a call that arrives while another
/// high-level operation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BusyPolicy {
    /// Drop the call and report [`Outcome::Skipped`].
    Ignore,
    /// Fail with a `SessionBusy` error.
    Reject,
    /// Wait until the running operation finishes.
    Queue,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

impl std::str::FromStr for BusyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown busy policy '{}'", other)),
        }
    }
}

/// Complete driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplConfig {
    /// Port name (e.g. `COM3`, `/dev/ttyACM0`). `None` = auto-detect by VID/PID.
    #[serde(default)]
    pub port_name: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// USB vendor id used for auto-detection.
    #[serde(default = "default_usb_vendor_id")]
    pub usb_vendor_id: u16,

    /// USB product id used for auto-detection.
    #[serde(default = "default_usb_product_id")]
    pub usb_product_id: u16,

    /// Size of the buffer handed to each transport read.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// A marker wait fails after this long without any inbound data.
    #[serde(default = "default_marker_idle_timeout")]
    pub marker_idle_timeout_ms: u64,

    /// Quiet time before a dangling `>` line counts as a raw prompt.
    #[serde(default = "default_prompt_settle")]
    pub prompt_settle_ms: u64,

    /// Retry ceiling of the completion-prompt watchdog.
    #[serde(default = "default_prompt_retries")]
    pub prompt_retries: u32,

    /// Cadence of the completion-prompt watchdog.
    #[serde(default = "default_prompt_interval")]
    pub prompt_interval_ms: u64,

    /// Uploads of this many bytes or more are refused.
    #[serde(default = "default_upload_limit")]
    pub upload_limit_bytes: usize,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default)]
    pub profile: DeviceProfile,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_usb_vendor_id() -> u16 {
    11914
}
fn default_usb_product_id() -> u16 {
    5
}
fn default_read_chunk_size() -> usize {
    1024
}
fn default_marker_idle_timeout() -> u64 {
    5000
}
fn default_prompt_settle() -> u64 {
    20
}
fn default_prompt_retries() -> u32 {
    15
}
fn default_prompt_interval() -> u64 {
    5
}
fn default_upload_limit() -> usize {
    2_000_000
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: default_baud_rate(),
            usb_vendor_id: default_usb_vendor_id(),
            usb_product_id: default_usb_product_id(),
            read_chunk_size: default_read_chunk_size(),
            marker_idle_timeout_ms: default_marker_idle_timeout(),
            prompt_settle_ms: default_prompt_settle(),
            prompt_retries: default_prompt_retries(),
            prompt_interval_ms: default_prompt_interval(),
            upload_limit_bytes: default_upload_limit(),
            busy_policy: BusyPolicy::default(),
            profile: DeviceProfile::default(),
        }
    }
}

impl ReplConfig {
    /// Check values the protocol cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baudRate must be positive".to_string());
        }
        if self.read_chunk_size == 0 {
            return Err("readChunkSize must be positive".to_string());
        }
        if self.upload_limit_bytes > 9_999_999 {
            return Err(format!(
                "uploadLimitBytes {} does not fit a {}-digit length header",
                self.upload_limit_bytes, HEADER_DIGITS
            ));
        }
        let p = &self.profile;
        if p.raw_banner.is_empty() || p.soft_reboot_banner.is_empty() || p.normal_banner.is_empty() {
            return Err("device profile banners must not be empty".to_string());
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Point-in-time view of a driver session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub port_name: String,
    pub mode: ReplMode,
    pub connected: bool,
    pub busy: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Operation results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a guarded high-level operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation ran.
    Done(T),
    /// The session was busy and the `ignore` policy dropped the call.
    Skipped,
}

impl<T> Outcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::Skipped => None,
        }
    }
}

/// Success or failure reported by a generated script through its own
/// printed tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptOutcome {
    Success,
    Failure(String),
}

impl ScriptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  File content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a download is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadMode {
    /// Decoded text lines; lossy for invalid UTF-8.
    Text,
    /// Byte-accurate raw capture.
    Binary,
}

/// File body going to or coming from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Bytes as they are written to the device. Text has its line endings
    /// normalised to `\n`.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => normalize_newlines(text).into_bytes(),
            Self::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text for well-known source/config extensions, binary otherwise.
    pub fn from_file_bytes(file_name: &str, bytes: Vec<u8>) -> Self {
        if is_text_file_name(file_name) {
            match String::from_utf8(bytes) {
                Ok(text) => Self::Text(text),
                Err(e) => Self::Binary(e.into_bytes()),
            }
        } else {
            Self::Binary(bytes)
        }
    }
}

/// Extensions uploaded as text.
pub const TEXT_EXTENSIONS: &[&str] = &[".py", ".txt", ".text", ".cfg"];

pub fn is_text_file_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    TEXT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Rewrite `\r\n` and lone `\r` to `\n`.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Filesystem tree
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry of the on-board filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FsNode {
    File { name: String },
    Directory { name: String, children: Vec<FsNode> },
}

impl FsNode {
    pub fn name(&self) -> &str {
        match self {
            Self::File { name } | Self::Directory { name, .. } => name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    pub fn children(&self) -> &[FsNode] {
        match self {
            Self::File { .. } => &[],
            Self::Directory { children, .. } => children,
        }
    }

    /// Resolve a `/`-separated path relative to this node.
    pub fn find(&self, path: &str) -> Option<&FsNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children().iter().find(|c| c.name() == segment)?;
        }
        Some(node)
    }

    /// Every file path below this node, depth first, in listing order.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(self, "", &mut out);
        out
    }

    /// Number of files (not directories) below this node.
    pub fn file_count(&self) -> usize {
        match self {
            Self::File { .. } => 1,
            Self::Directory { children, .. } => children.iter().map(FsNode::file_count).sum(),
        }
    }
}

fn collect_paths(node: &FsNode, prefix: &str, out: &mut Vec<String>) {
    for child in node.children() {
        let path = if prefix.is_empty() {
            child.name().to_string()
        } else {
            format!("{}/{}", prefix, child.name())
        };
        match child {
            FsNode::File { .. } => out.push(path),
            FsNode::Directory { .. } => collect_paths(child, &path, out),
        }
    }
}
