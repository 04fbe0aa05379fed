//! Shared toolchain install cache.

use crate::runner::StepContext;
use dashmap::DashMap;
use kiln_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// This call performed the install.
    Installed,
    /// Another call already installed it.
    Cached,
}

/// Records which toolchains have been installed during this process.
///
/// Handles are cheap to clone and share one underlying map. Each key is
/// installed at most once: concurrent callers for the same key wait on the
/// first installer, and a failed install is not remembered so a later call
/// retries it.
#[derive(Debug, Clone, Default)]
pub struct ToolchainCache {
    installs: Arc<DashMap<String, Arc<OnceCell<()>>>>,
}

impl ToolchainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self, key: &str) -> bool {
        self.installs
            .get(key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.installs.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `install` unless `key` is already installed.
    ///
    /// A caller that ends up waiting on another caller's install stops
    /// waiting at its own step deadline or when `cancel` fires. The caller
    /// running the install is bounded by the install future itself.
    pub async fn get_or_install<F, Fut>(
        &self,
        key: &str,
        step: &StepContext,
        cancel: &CancellationToken,
        install: F,
    ) -> Result<CacheStatus>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = Arc::clone(self.installs.entry(key.to_string()).or_default().value());

        let installing = AtomicBool::new(false);
        let init = cell.get_or_try_init(|| {
            installing.store(true, Ordering::Relaxed);
            install()
        });
        tokio::pin!(init);

        let finished = tokio::select! {
            biased;
            result = &mut init => Some(result),
            _ = tokio::time::sleep_until(step.deadline) => None,
            _ = cancel.cancelled() => None,
        };
        match finished {
            Some(result) => {
                result?;
            }
            None if installing.load(Ordering::Relaxed) => {
                (&mut init).await?;
            }
            None if cancel.is_cancelled() => {
                return Err(Error::Cancelled {
                    reason: format!("waiting for toolchain install {}", key),
                });
            }
            None => {
                debug!(key, "Gave up waiting for toolchain install");
                return Err(Error::StepTimeout {
                    seconds: step.timeout.as_secs(),
                });
            }
        }

        let status = if installing.load(Ordering::Relaxed) {
            CacheStatus::Installed
        } else {
            CacheStatus::Cached
        };
        debug!(key, ?status, "Toolchain cache lookup");
        Ok(status)
    }
}
