use std::{sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    scheduler::{BackgroundTask, Context},
    tiered::TieredServer,
};

/// Drains ready tiered work on the blocking pool.
pub struct TieredWorkTask {
    server: Arc<TieredServer>,
    interval: Duration,
}

impl TieredWorkTask {
    pub fn new(server: Arc<TieredServer>, interval: Duration) -> Self {
        Self { server, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for TieredWorkTask {
    fn name(&self) -> &'static str {
        "tiered-work"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        let processed = tokio::task::spawn_blocking(move || server.drain())
            .await
            .map_err(|e| Error::InvalidState(format!("Tiered worker join error: {}", e)))??;

        if processed > 0 {
            tracing::debug!(processed, "Tiered work drained");
        }
        Ok(())
    }
}

/// Reclaims local copies whose remote copies are confirmed.
pub struct SweepTask {
    server: Arc<TieredServer>,
    interval: Duration,
}

impl SweepTask {
    pub fn new(server: Arc<TieredServer>, interval: Duration) -> Self {
        Self { server, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SweepTask {
    fn name(&self) -> &'static str {
        "handle-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || server.sweep())
            .await
            .map_err(|e| Error::InvalidState(format!("Sweep join error: {}", e)))??;
        Ok(())
    }
}
