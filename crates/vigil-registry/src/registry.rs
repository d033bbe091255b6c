//! Registry facade
//!
//! `Registry` owns the handles every registry operation needs: the column
//! store, the distributed lock, the clock and the background queue. The
//! operations themselves live in the `account`, `activity`, `service`,
//! `event`, `configuration` and `rectifier` modules as further `impl` blocks.

use std::sync::Arc;

use vigil_common::{Clock, SystemClock, Token};
use vigil_consistency::{Coordinator, DistributedLock};
use vigil_persistence::{ColumnStore, Mutation, MutationGroup};

use crate::background::BackgroundQueue;
use crate::config::RegistryConfig;
use crate::context::AccountContext;
use crate::error::Result;
use crate::model::{AccountMetadata, schema};

pub struct Registry {
    pub(crate) store: Arc<dyn ColumnStore>,
    pub(crate) lock: DistributedLock,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: RegistryConfig,
    pub(crate) background: BackgroundQueue,
}

impl Registry {
    /// Must be called from within a tokio runtime; starts the background queue
    pub fn new(
        store: Arc<dyn ColumnStore>,
        coordinator: Arc<dyn Coordinator>,
        config: RegistryConfig,
    ) -> Self {
        let lock = DistributedLock::new(coordinator).with_timeout(config.lock_timeout());
        let background = BackgroundQueue::start(config.background_queue_capacity);
        Self {
            store,
            lock,
            clock: Arc::new(SystemClock),
            config,
            background,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn ColumnStore> {
        &self.store
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.background
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Load the account and build a request context for it
    pub async fn context(&self, account_id: &str) -> Result<AccountContext> {
        let account = self.get_account(account_id).await?;
        Ok(AccountContext::new(account))
    }

    /// Read the account's rectification state, creating it if it is missing
    pub async fn get_metadata(&self, ctx: &AccountContext) -> Result<AccountMetadata> {
        let account_id = ctx.account_id();
        if let Some(cell) = self
            .store
            .get(
                schema::METADATA,
                account_id,
                schema::LAST_RECTIFICATION_COLUMN,
            )
            .await?
        {
            return Ok(AccountMetadata {
                last_rectification: cell.decode()?,
            });
        }

        let watermark = Token::low(ctx.account.created_at);
        tracing::debug!(
            account_id,
            txn_id = %ctx.txn_id,
            "Creating missing account metadata"
        );
        self.store
            .apply(
                MutationGroup::optional()
                    .with(watermark_mutation(account_id, watermark)?)
                    .into(),
            )
            .await?;
        Ok(AccountMetadata {
            last_rectification: watermark,
        })
    }
}

/// Watermark write stamped with the watermark's own time, so a concurrent
/// writer holding an older watermark can never overwrite a newer one.
pub(crate) fn watermark_mutation(account_id: &str, watermark: Token) -> Result<Mutation> {
    Ok(Mutation::put_json(
        schema::METADATA,
        account_id,
        schema::LAST_RECTIFICATION_COLUMN,
        &watermark,
    )?
    .with_write_ts(watermark.timestamp_millis() * 1000))
}
