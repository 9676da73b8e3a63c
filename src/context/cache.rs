//! Configuration-keyed cache of shared contexts.
//!
//! Concurrent `acquire` calls for different configurations only contend on
//! their own map shard. Calls for the same configuration may each build a
//! candidate, but only one is inserted; the others are closed.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::Context;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::service::{BackendFactory, ServiceFactory};

/// Shares one [`Context`] between every handle opened with an equal config.
pub struct ContextCache {
    contexts: DashMap<ConnectionConfig, Arc<Context>>,
    factory: Arc<dyn ServiceFactory>,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(Arc::new(BackendFactory))
    }
}

impl ContextCache {
    /// Creates an empty cache that connects services through `factory`.
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            contexts: DashMap::new(),
            factory,
        }
    }

    /// Returns the context for `config`, creating it on first use.
    ///
    /// Every successful call must be paired with one [`release`](Self::release).
    pub async fn acquire(&self, config: &ConnectionConfig) -> Result<Arc<Context>> {
        // Retain while the shard guard is held so `release` cannot remove
        // the entry between lookup and increment.
        if let Some(existing) = self.contexts.get(config) {
            existing.retain();
            return Ok(Arc::clone(existing.value()));
        }

        let candidate = Arc::new(self.build(config).await?);

        let (winner, loser) = match self.contexts.entry(config.clone()) {
            Entry::Occupied(entry) => {
                let winner = Arc::clone(entry.get());
                winner.retain();
                (winner, Some(candidate))
            }
            Entry::Vacant(entry) => {
                candidate.retain();
                entry.insert(Arc::clone(&candidate));
                (candidate, None)
            }
        };

        if let Some(loser) = loser {
            debug!(
                "Discarding context for {} built by a losing acquire",
                config.display_string()
            );
            if let Err(e) = loser.close().await {
                warn!("Closing discarded context failed: {}", e);
            }
        } else {
            info!("Created context for {}", config.display_string());
        }

        Ok(winner)
    }

    async fn build(&self, config: &ConnectionConfig) -> Result<Context> {
        let service = self.factory.connect(config).await?;
        Context::open(config.clone(), service).await
    }

    /// Releases one reference to `context`.
    ///
    /// When the last reference goes, the entry is removed (only if it still
    /// maps to this exact context) and the context is closed.
    pub async fn release(&self, config: &ConnectionConfig, context: &Arc<Context>) -> Result<()> {
        if self.detach(config, context)? {
            context.close().await?;
        }
        Ok(())
    }

    /// Synchronous half of [`release`](Self::release).
    ///
    /// Drops one reference and unlinks the entry at zero. Returns true when
    /// the caller now owns closing `context`.
    pub(crate) fn detach(
        &self,
        config: &ConnectionConfig,
        context: &Arc<Context>,
    ) -> Result<bool> {
        if context.release_ref()? > 0 {
            return Ok(false);
        }

        let removed = self
            .contexts
            .remove_if(config, |_, cached| {
                Arc::ptr_eq(cached, context) && cached.ref_count() == 0
            })
            .is_some();

        // A context that is no longer in the map can never be re-acquired.
        let orphaned = !removed
            && !self
                .contexts
                .get(config)
                .is_some_and(|cached| Arc::ptr_eq(cached.value(), context));

        if removed || orphaned {
            debug!(
                "Last reference to context for {} released",
                config.display_string()
            );
        }
        Ok(removed || orphaned)
    }

    /// Closes and removes every cached context regardless of references.
    ///
    /// Returns the number of contexts closed.
    pub async fn close_all(&self) -> usize {
        let keys: Vec<ConnectionConfig> = self
            .contexts
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let drained: Vec<Arc<Context>> = keys
            .iter()
            .filter_map(|key| self.contexts.remove(key).map(|(_, ctx)| ctx))
            .collect();

        let results = join_all(drained.iter().map(|ctx| ctx.close())).await;
        for (ctx, result) in drained.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    "Closing context for {} failed: {}",
                    ctx.config().display_string(),
                    e
                );
            }
        }

        info!("Closed {} cached contexts", drained.len());
        drained.len()
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, config: &ConnectionConfig) -> bool {
        self.contexts.contains_key(config)
    }
}
