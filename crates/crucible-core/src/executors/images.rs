//! Image availability with single-flight pulls.
//!
//! Concurrent first use of the same image shares one inspect/pull. A failed
//! pull leaves the entry uninitialised, so the next request tries again.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::runtime::ContainerRuntime;
use super::{ExecutionPhase, PhaseReporter};
use crate::errors::EngineError;

#[derive(Default)]
pub struct ImageCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &str,
        reporter: &PhaseReporter,
    ) -> Result<(), EngineError> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(image.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_try_init(|| async {
            if runtime.image_exists(image).await? {
                return Ok(());
            }

            reporter.emit(ExecutionPhase::Pulling);
            log::info!("Pulling Docker image: {}", image);
            runtime.pull_image(image).await?;
            log::info!("Pulled Docker image: {}", image);
            Ok::<(), EngineError>(())
        })
        .await
        .map(|_| ())
    }

    /// Drop what is known about `image`, e.g. after it vanished from the host
    pub async fn forget(&self, image: &str) {
        self.entries.lock().await.remove(image);
    }

    pub async fn is_known(&self, image: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(image)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }
}
