use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};

use crate::services::{object_store::StoreResult, token_store::TokenStore};

/// Background worker that removes expired transfer tokens.
pub struct TokenReaper {
    tokens: Arc<dyn TokenStore>,
    every: Duration,
}

impl TokenReaper {
    pub fn new(tokens: Arc<dyn TokenStore>, every: Duration) -> Self {
        Self { tokens, every }
    }

    /// Run the reaper in a background loop
    pub async fn run(&self) {
        tracing::info!(interval_secs = self.every.as_secs(), "Starting token reaper");

        let mut ticker = interval(self.every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(e) = self.sweep_once(Utc::now()).await {
                tracing::error!("Error reaping expired tokens: {:?}", e);
            }
        }
    }

    /// Delete every token that expired before `now`; returns (uploads, downloads).
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> StoreResult<(u64, u64)> {
        let uploads = self.tokens.delete_expired_upload_tokens(now).await?;
        let downloads = self.tokens.delete_expired_download_tokens(now).await?;
        if uploads > 0 || downloads > 0 {
            tracing::info!(uploads, downloads, "Reaped expired transfer tokens");
        }
        Ok((uploads, downloads))
    }
}
