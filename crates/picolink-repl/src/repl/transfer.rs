//! File transfer engine.
//!
//! Upload frame: a zero-padded 7-digit decimal length, then the payload in
//! 255-byte blocks with the short last block padded with `0xFF`. The
//! device receiver keeps exactly the declared number of bytes.
//!
//! Download: the device streams the file in 256-byte chunks followed by a
//! literal terminator; the body sits between the raw REPL's `OK` and the
//! last occurrence of that terminator. A body ending in the read-failure
//! token carries the device's error on its last line instead.

use crate::repl::error::{ReplError, ReplResult};
use crate::repl::exec::Completion;
use crate::repl::fs_tree::{normalize_path, parent_dir};
use crate::repl::mode::ReplLink;
use crate::repl::scripts::{
    self, MKDIR_FAILED, MKDIR_OK, READ_FAILED, UPLOAD_FAILED, UPLOAD_OK,
};
use crate::repl::types::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Upload frame
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Length header plus fixed-size blocks for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFrame {
    pub header: String,
    pub blocks: Vec<Vec<u8>>,
}

impl UploadFrame {
    pub fn new(payload: &[u8]) -> ReplResult<Self> {
        let header = format!("{:0width$}", payload.len(), width = HEADER_DIGITS);
        if header.len() != HEADER_DIGITS {
            return Err(ReplError::size_limit(payload.len(), 10usize.pow(HEADER_DIGITS as u32)));
        }
        let blocks = payload
            .chunks(SEND_BLOCK_SIZE)
            .map(|chunk| {
                let mut block = chunk.to_vec();
                block.resize(SEND_BLOCK_SIZE, PAD_BYTE);
                block
            })
            .collect();
        Ok(Self { header, blocks })
    }

    /// Payload length the header declares.
    pub fn declared_len(&self) -> usize {
        self.header.parse().unwrap_or(0)
    }

    /// Padding bytes in the final block.
    pub fn padding(&self) -> usize {
        self.blocks.len() * SEND_BLOCK_SIZE - self.declared_len()
    }
}

/// Refuse payloads at or above `limit` bytes.
pub fn check_upload_size(len: usize, limit: usize) -> ReplResult<()> {
    if len >= limit {
        return Err(ReplError::size_limit(len, limit));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Download extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File body out of a raw capture.
pub fn extract_download(raw: &[u8]) -> ReplResult<Vec<u8>> {
    let body = raw.strip_prefix(COMPLETION_TOKEN.as_bytes()).unwrap_or(raw);
    let term = DOWNLOAD_TERMINATOR.as_bytes();
    let end = body
        .windows(term.len())
        .rposition(|w| w == term)
        .ok_or_else(|| ReplError::parse("download terminator missing from device output"))?;
    check_read_failure(&body[..end])?;
    Ok(body[..end].to_vec())
}

/// File text out of the collected lines.
pub fn extract_download_text(lines: &[String]) -> ReplResult<String> {
    let joined = lines.join(LINE_BREAK);
    let body = joined.strip_prefix(COMPLETION_TOKEN).unwrap_or(&joined);
    let end = body
        .rfind(DOWNLOAD_TERMINATOR)
        .ok_or_else(|| ReplError::parse("download terminator missing from device output"))?;
    check_read_failure(body[..end].as_bytes())?;
    Ok(body[..end].to_string())
}

fn check_read_failure(body: &[u8]) -> ReplResult<()> {
    let Some(head) = body.strip_suffix(READ_FAILED.as_bytes()) else {
        return Ok(());
    };
    let start = head.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    let reason = String::from_utf8_lossy(&head[start..]);
    Err(ReplError::script_failed(format!(
        "device could not read the file: {}",
        reason.trim()
    )))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl ReplLink {
    /// Create `dir` and all its parents. Stays in raw mode.
    pub async fn make_dirs(&self, dir: &str) -> ReplResult<ScriptOutcome> {
        let dir = normalize_path(dir)?;
        let lines = self
            .run_raw(&scripts::mkdir_script(&dir), Completion::prompt(1))
            .await?;
        Ok(scripts::parse_outcome(&lines, MKDIR_OK, MKDIR_FAILED))
    }

    /// Write `content` to `path`, creating parent directories first.
    /// Ends in normal mode.
    pub async fn upload(&self, path: &str, content: &FileContent) -> ReplResult<ScriptOutcome> {
        let payload = content.to_wire_bytes();
        check_upload_size(payload.len(), self.config.upload_limit_bytes)?;
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(ReplError::invalid_path("upload needs a file name"));
        }
        let frame = UploadFrame::new(&payload)?;
        log::info!(
            "[repl:{}] uploading {} ({} bytes, {} blocks)",
            self.port_name(),
            path,
            payload.len(),
            frame.blocks.len()
        );
        self.observer.on_progress(1, "Uploading file...");

        let parent = parent_dir(&path);
        if parent != "/" {
            if let ScriptOutcome::Failure(reason) = self.make_dirs(parent).await? {
                self.enter_normal(3).await?;
                return Ok(ScriptOutcome::Failure(reason));
            }
        }

        self.run_raw(
            &scripts::upload_receiver_script(&path),
            Completion::Until {
                terminator: COMPLETION_TOKEN,
                omit: 1,
            },
        )
        .await?;
        self.observer.on_progress(2, "Uploading file...");

        self.sync.arm(RAW_PROMPT).await;
        self.write(frame.header.as_bytes()).await?;
        self.observer.on_progress(3, "Uploading file...");

        let total = frame.blocks.len();
        for (i, block) in frame.blocks.iter().enumerate() {
            self.write(block).await?;
            let percent = 3 + (95 * (i + 1) / total) as u8;
            self.observer.on_progress(percent, "Uploading file...");
        }

        let lines = self.sync.wait_for_marker(1).await?;
        let outcome = scripts::parse_outcome(&lines, UPLOAD_OK, UPLOAD_FAILED);
        match &outcome {
            ScriptOutcome::Success => log::info!("[repl:{}] uploaded {}", self.port_name(), path),
            ScriptOutcome::Failure(reason) => {
                log::warn!("[repl:{}] upload of {} failed: {}", self.port_name(), path, reason)
            }
        }

        self.enter_normal(3).await?;
        Ok(outcome)
    }

    /// Read `path` from the board. Ends in normal mode.
    pub async fn download(&self, path: &str, mode: DownloadMode) -> ReplResult<FileContent> {
        let path = normalize_path(path)?;
        let script = scripts::download_script(&path);
        log::info!("[repl:{}] reading {} ({:?})", self.port_name(), path, mode);

        let content = match mode {
            DownloadMode::Text => {
                let lines = self
                    .run_raw(
                        &script,
                        Completion::Until {
                            terminator: DOWNLOAD_TERMINATOR,
                            omit: 1,
                        },
                    )
                    .await?;
                extract_download_text(&lines).map(FileContent::Text)
            }
            DownloadMode::Binary => {
                let (_, raw) = self
                    .run_raw_captured(&script, DOWNLOAD_TERMINATOR, 1)
                    .await?;
                extract_download(&raw).map(FileContent::Binary)
            }
        };

        self.enter_normal(3).await?;
        let content = content?;
        log::debug!("[repl:{}] read {} bytes from {}", self.port_name(), content.len(), path);
        Ok(content)
    }
}
