//! Mode controller.
//!
//! [`ReplLink`] is the per-connection protocol context. This module gives
//! it the interrupt / raw / normal transitions; `exec` and `transfer` add
//! script execution and file transfer on top.

use crate::repl::error::ReplResult;
use crate::repl::observer::SessionObserver;
use crate::repl::sync::StreamSync;
use crate::repl::transport::TransportHandle;
use crate::repl::types::*;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything one connected device needs: the transport, the
/// synchronizer fed by the reader task, the config and the confirmed mode.
pub struct ReplLink {
    pub(crate) handle: TransportHandle,
    pub(crate) sync: Arc<StreamSync>,
    pub(crate) config: ReplConfig,
    pub(crate) observer: Arc<dyn SessionObserver>,
    mode: RwLock<ReplMode>,
}

impl ReplLink {
    pub fn new(
        handle: TransportHandle,
        sync: Arc<StreamSync>,
        config: ReplConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            handle,
            sync,
            config,
            observer,
            mode: RwLock::new(ReplMode::Unknown),
        }
    }

    pub fn port_name(&self) -> &str {
        self.handle.port_name()
    }

    pub fn sync(&self) -> &Arc<StreamSync> {
        &self.sync
    }

    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    pub async fn mode(&self) -> ReplMode {
        *self.mode.read().await
    }

    pub(crate) async fn set_mode(&self, mode: ReplMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            log::debug!(
                "[repl:{}] mode {} -> {}",
                self.port_name(),
                current.label(),
                mode.label()
            );
            *current = mode;
        }
    }

    /// Write bytes through the single writer lease.
    pub async fn write(&self, data: &[u8]) -> ReplResult<()> {
        let writer = self.handle.acquire_writer()?;
        log::trace!("[repl:{}] tx {}", self.port_name(), hex::encode(data));
        writer.write(data).await?;
        self.sync.note_write(data.len()).await;
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Interrupt whatever runs, enter raw mode and soft-reset into a clean
    /// raw prompt.
    pub async fn enter_raw(&self) -> ReplResult<()> {
        self.set_mode(ReplMode::RawPending).await;
        let res = async {
            self.sync.arm(&self.config.profile.raw_banner).await;
            self.write(&[b'\r', CTRL_INTERRUPT, CTRL_INTERRUPT]).await?;
            self.write(&[b'\r', CTRL_RAW_MODE]).await?;
            self.sync.wait_for_marker(2).await?;
            self.soft_reset().await
        }
        .await;
        self.settle(res, ReplMode::Raw).await
    }

    /// Soft reset from the raw prompt.
    pub async fn soft_reset(&self) -> ReplResult<()> {
        self.sync.arm(&self.config.profile.soft_reboot_banner).await;
        self.write(&[CTRL_SOFT_RESET]).await?;
        self.sync.wait_for_marker(4).await?;
        Ok(())
    }

    /// Go through raw mode back to the friendly prompt, hiding `omit`
    /// banner lines.
    pub async fn enter_normal(&self, omit: usize) -> ReplResult<()> {
        self.enter_raw().await?;
        let res = async {
            self.sync.arm(&self.config.profile.normal_banner).await;
            self.write(&[b'\r', CTRL_NORMAL_MODE]).await?;
            self.sync.wait_for_marker(omit).await?;
            Ok(())
        }
        .await;
        self.settle(res, ReplMode::Normal).await
    }

    async fn settle(&self, res: ReplResult<()>, reached: ReplMode) -> ReplResult<()> {
        match res {
            Ok(()) => {
                self.set_mode(reached).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("[repl:{}] mode change failed: {}", self.port_name(), e);
                self.set_mode(ReplMode::Unknown).await;
                Err(e)
            }
        }
    }
}
