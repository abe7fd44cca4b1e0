//! Upstream source of fresh raw locators.

use std::collections::HashMap;

use async_trait::async_trait;

use super::ProviderError;
use crate::task::ItemKey;

/// Supplies one raw URL per encoded stream of an item.
///
/// Called at most once at a time per item, from a task spawned by the
/// scheduler.
#[async_trait]
pub trait LocatorProvider: Send + Sync {
    /// Fetches fresh locators for `item`.
    async fn fetch_locators(&self, item: &ItemKey) -> Result<Vec<String>, ProviderError>;
}

/// Provider answering from a fixed table. Renewals re-issue the same URLs.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    urls: HashMap<ItemKey, Vec<String>>,
}

impl StaticProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the URLs returned for `item`.
    #[must_use]
    pub fn with_item(mut self, item: impl Into<ItemKey>, urls: Vec<String>) -> Self {
        self.urls.insert(item.into(), urls);
        self
    }
}

#[async_trait]
impl LocatorProvider for StaticProvider {
    async fn fetch_locators(&self, item: &ItemKey) -> Result<Vec<String>, ProviderError> {
        self.urls
            .get(item)
            .cloned()
            .ok_or_else(|| ProviderError::Failed {
                item: item.to_string(),
                message: "unknown item".to_string(),
            })
    }
}
