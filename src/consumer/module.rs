use super::Consumer;
use crate::harness::{HealthReporter, Heart, HeartStone, Module, ModuleTerminationReason};
use crate::library::scheduling::JobScheduler;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs a [`Consumer`] as a [`Module`] until the process is asked to terminate
pub struct ConsumerModule {
    consumer: Arc<Consumer>,
    stone: Option<HeartStone>,
}

impl ConsumerModule {
    /// Wraps a consumer which has not been started yet
    pub fn new(consumer: Consumer) -> Self {
        Self {
            consumer: Arc::new(consumer),
            stone: None,
        }
    }
}

#[async_trait]
impl Module for ConsumerModule {
    async fn pre_startup(&mut self) -> EmptyResult {
        self.consumer.start().await?;
        Ok(())
    }

    async fn run(&mut self, _scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
        let (heart, stone) = Heart::new();
        self.stone = Some(stone);
        Ok(Some(heart))
    }

    fn health_reporter(&self) -> Option<Arc<dyn HealthReporter>> {
        Some(self.consumer.clone())
    }

    async fn post_shutdown(&mut self, termination_reason: ModuleTerminationReason) {
        info!(reason = %termination_reason, "Leaving consumer group");
        let report = self.consumer.stop().await;

        if !report.is_clean() {
            warn!(undrained = ?report.undrained, "Consumer stopped without draining every partition");
        }
    }
}
