use lru::LruCache;
use std::{num::NonZeroUsize, sync::Mutex};

use crate::{
    engine::distribution::Distribution,
    error::VeldResult,
    external::{DataRequest, ExternalLayer},
};

type CacheKey = (String, String, u64, String);

/// Memoizing decorator over an [`ExternalLayer`].
///
/// Results are keyed by (source, variable, timestep, priming geometry). The
/// cache is consulted only when the request carries an explicit priming
/// geometry; unprimed requests pass straight through. Capacity-bounded LRU.
pub struct CacheLayer<L> {
    inner: L,
    cache: Mutex<LruCache<CacheKey, Distribution>>,
}

impl<L: ExternalLayer> CacheLayer<L> {
    pub fn new(inner: L, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ExternalLayer> ExternalLayer for CacheLayer<L> {
    fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
        let Some(priming_key) = request.priming_key() else {
            return self.inner.fulfill(request);
        };
        let key = (
            request.source.clone(),
            request.variable.clone(),
            request.timestep,
            priming_key,
        );

        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let result = self.inner.fulfill(request)?;
        self.cache
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .put(key, result.clone());
        Ok(result)
    }
}
