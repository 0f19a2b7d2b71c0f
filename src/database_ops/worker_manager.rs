use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::database_ops::loader::{LoadResult, Loader};
use crate::database_ops::warehouse::Warehouse;
use crate::error::PipelineError;
use crate::models::CanonicalRecord;

#[async_trait::async_trait]
pub trait GameWorker: Send + Sync {
    fn name(&self) -> String;
    async fn run(&self, warehouse: Arc<dyn Warehouse>) -> Result<LoadResult, PipelineError>;
}

pub struct WorkerManager {
    warehouse: Arc<dyn Warehouse>,
}

impl WorkerManager {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Run all workers concurrently, logging outcomes. Results come back in
    /// worker order; the first error (or panic) wins.
    pub async fn run_all(
        &self,
        workers: Vec<Box<dyn GameWorker>>,
    ) -> Result<Vec<(String, LoadResult)>, PipelineError> {
        let mut tasks = Vec::with_capacity(workers.len());
        for w in workers {
            let warehouse = self.warehouse.clone();
            tasks.push(tokio::spawn(async move {
                let name = w.name();
                info!(worker = %name, "starting worker");
                let res = w.run(warehouse).await;
                match &res {
                    Ok(_) => info!(worker = %name, "worker finished"),
                    Err(e) => error!(worker = %name, error = %e, "worker failed"),
                }
                res.map(|r| (name, r))
            }));
        }
        let results = join_all(tasks).await;
        let mut first_err: Option<PipelineError> = None;
        let mut done = Vec::with_capacity(results.len());
        for r in results {
            match r {
                Ok(Ok(pair)) => done.push(pair),
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(PipelineError::Worker(join_err.to_string()));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }
}

/// Loads one game's canonical batch.
pub struct LoadWorker {
    game_id: String,
    records: Vec<CanonicalRecord>,
}

impl LoadWorker {
    pub fn new(game_id: impl Into<String>, records: Vec<CanonicalRecord>) -> Self {
        Self {
            game_id: game_id.into(),
            records,
        }
    }
}

#[async_trait::async_trait]
impl GameWorker for LoadWorker {
    fn name(&self) -> String {
        format!("load:{}", self.game_id)
    }

    async fn run(&self, warehouse: Arc<dyn Warehouse>) -> Result<LoadResult, PipelineError> {
        Loader::new(warehouse).load(&self.records).await
    }
}
