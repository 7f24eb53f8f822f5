//! A synchronous driver over [`AsyncCacheProxy`] (S4.8.1).
//!
//! No decision logic is duplicated here, only the await points move onto a
//! dedicated current-thread Tokio runtime so callers without their own
//! async runtime can still drive the cache.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::error::Result;
use crate::model::Request;
use crate::policy::Policy;
use crate::storage_engine::StorageEngine;

use super::{AsyncCacheProxy, ProxiedResponse, RequestSender};

/// Wraps an [`AsyncCacheProxy`] with a dedicated current-thread runtime,
/// giving blocking callers a synchronous `handle_request`.
pub struct BlockingCacheProxy<S: StorageEngine, O: RequestSender> {
    inner: AsyncCacheProxy<S, O>,
    runtime: Runtime,
}

impl<S: StorageEngine, O: RequestSender> BlockingCacheProxy<S, O> {
    /// Builds a blocking proxy over `storage` and `origin`, applying `policy`.
    pub fn new(storage: Arc<S>, origin: Arc<O>, policy: Policy) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { inner: AsyncCacheProxy::new(storage, origin, policy), runtime })
    }

    /// Handles one request end to end, blocking the calling thread until the
    /// underlying [`AsyncCacheProxy::handle_request`] resolves.
    pub fn handle_request(&self, request: Request) -> Result<ProxiedResponse> {
        self.runtime.block_on(self.inner.handle_request(request))
    }
}
