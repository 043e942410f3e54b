//! Administrative handoff around replay.
//!
//! A first replay pass runs speculatively; the producing peer pool is then
//! suspended and drained before a final pass, which closes the window
//! between "read the log" and "no more writers". Transport to a remote peer
//! is the embedder's concern — only the control contract lives here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::core::Result;
use crate::pool::TwinPool;
use crate::replay::player::Player;

/// Control surface of the peer pool holding the authoritative twin,
/// consumed during the replay handoff.
#[async_trait]
pub trait PeerControl: Send + Sync + std::fmt::Debug {
    async fn suspend(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn active_connections(&self) -> Result<usize>;
    async fn restore_direct(&self) -> Result<()>;
}

/// In-process peer, used by tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pool: Arc<TwinPool>,
}

impl LocalPeer {
    pub fn new(pool: Arc<TwinPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PeerControl for LocalPeer {
    async fn suspend(&self) -> Result<()> {
        self.pool.suspend();
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.pool.resume();
        Ok(())
    }

    async fn active_connections(&self) -> Result<usize> {
        Ok(self.pool.active_connections())
    }

    async fn restore_direct(&self) -> Result<()> {
        self.pool.restore_direct();
        Ok(())
    }
}

/// Suspend the peer, wait for its borrowers to drain, run the final replay
/// pass, then restore direct mirroring and resume it.
pub(crate) async fn run_takeover(player: &mut Player, peer: &dyn PeerControl) -> Result<()> {
    peer.suspend().await?;
    let result = drain_and_replay(player, peer).await;
    // The peer resumes even when the final pass failed; its state flag is
    // only cleared on success.
    let resume = peer.resume().await;
    result?;
    resume
}

async fn drain_and_replay(player: &mut Player, peer: &dyn PeerControl) -> Result<()> {
    while peer.active_connections().await? > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let applied = player.play().await?;
    info!(applied, "final replay pass complete");
    peer.restore_direct().await?;
    Ok(())
}
