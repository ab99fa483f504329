//! Command executor: runs generated scripts in raw mode.

use crate::repl::error::ReplResult;
use crate::repl::mode::ReplLink;
use crate::repl::types::{CTRL_EOT, RAW_PROMPT, SEND_BLOCK_SIZE};
use std::time::Duration;

/// How long [`ReplLink::run_raw`] waits after sending the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion<'a> {
    /// Return right after the end-of-transmission byte.
    FireAndForget,
    /// Wait for `terminator`, keeping `omit` lines past the matching one.
    Until { terminator: &'a str, omit: usize },
}

impl Completion<'static> {
    /// Wait for the raw prompt that ends every execution.
    pub fn prompt(omit: usize) -> Self {
        Completion::Until {
            terminator: RAW_PROMPT,
            omit,
        }
    }
}

impl ReplLink {
    /// Enter raw mode, send `script` in device-sized blocks and execute it.
    ///
    /// Device-side exceptions are not errors here; they come back as text
    /// in the returned lines.
    pub async fn run_raw(&self, script: &str, completion: Completion<'_>) -> ReplResult<Vec<String>> {
        self.run_raw_inner(script, completion, false, false).await
    }

    /// Run `script` up to the raw prompt, echoing its output to the
    /// observer as it arrives.
    pub async fn run_raw_echoed(&self, script: &str, omit: usize) -> ReplResult<Vec<String>> {
        self.run_raw_inner(script, Completion::prompt(omit), false, true)
            .await
    }

    /// Like [`run_raw`](Self::run_raw) with a byte-accurate capture of the
    /// output up to the terminator.
    pub async fn run_raw_captured(
        &self,
        script: &str,
        terminator: &str,
        omit: usize,
    ) -> ReplResult<(Vec<String>, Vec<u8>)> {
        let res = self
            .run_raw_inner(script, Completion::Until { terminator, omit }, true, false)
            .await;
        let raw = self.sync.end_raw_capture().await;
        res.map(|lines| (lines, raw))
    }

    async fn run_raw_inner(
        &self,
        script: &str,
        completion: Completion<'_>,
        capture: bool,
        echo: bool,
    ) -> ReplResult<Vec<String>> {
        self.enter_raw().await?;
        log::debug!(
            "[repl:{}] sending {} byte script",
            self.port_name(),
            script.len()
        );
        for block in script.as_bytes().chunks(SEND_BLOCK_SIZE) {
            self.write(block).await?;
        }

        let Completion::Until { terminator, omit } = completion else {
            self.write(&[CTRL_EOT]).await?;
            return Ok(Vec::new());
        };

        self.sync.arm(terminator).await;
        if capture {
            self.sync.start_raw_capture().await;
        }
        if echo {
            self.sync.set_force_echo(true).await;
        }
        let res = async {
            self.write(&[CTRL_EOT]).await?;
            if terminator == RAW_PROMPT {
                self.prompt_watchdog().await?;
            }
            self.sync.wait_for_marker(omit).await
        }
        .await;
        if echo {
            self.sync.set_force_echo(false).await;
        }
        res
    }

    /// Give a raw prompt that stalls after EOT an empty-write nudge.
    pub(crate) async fn prompt_watchdog(&self) -> ReplResult<()> {
        let seen = self
            .sync
            .wait_for_prompt(
                self.config.prompt_retries,
                Duration::from_millis(self.config.prompt_interval_ms),
            )
            .await?;
        if !seen {
            log::warn!(
                "[repl:{}] no completion prompt after {} tries, nudging device",
                self.port_name(),
                self.config.prompt_retries
            );
            self.write(&[]).await?;
        }
        Ok(())
    }
}
