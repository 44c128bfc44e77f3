use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::error::AppError;
use crate::pipeline::plugins::Processor;

/// An ordered stage of a pipeline, along with how its processors are shared across workers.
#[derive(Clone)]
pub enum StageGroup {
    /// One processor instance used by every worker.
    Shared(Arc<dyn Processor>),
    /// One processor instance per worker, never shared.
    PerWorker(Vec<Arc<dyn Processor>>),
}

impl StageGroup {
    /// Check that this group can serve the given number of workers.
    pub(crate) fn validate(&self, stage: usize, workers: usize) -> Result<()> {
        match self {
            Self::Shared(_) => Ok(()),
            Self::PerWorker(processors) if processors.len() == workers => Ok(()),
            Self::PerWorker(processors) => Err(AppError::InvalidConfig(format!(
                "stage {} has {} per-worker processors but the pipeline runs {} workers",
                stage,
                processors.len(),
                workers
            ))
            .into()),
        }
    }

    /// The processor the given worker uses for this stage.
    ///
    /// Only valid for worker indices the group has been validated against.
    pub(crate) fn processor_for(&self, worker: usize) -> Arc<dyn Processor> {
        match self {
            Self::Shared(processor) => processor.clone(),
            Self::PerWorker(processors) => processors[worker].clone(),
        }
    }

    /// All distinct processor instances of this group.
    pub fn processors(&self) -> &[Arc<dyn Processor>] {
        match self {
            Self::Shared(processor) => std::slice::from_ref(processor),
            Self::PerWorker(processors) => processors.as_slice(),
        }
    }
}

impl fmt::Debug for StageGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(_) => f.write_str("Shared"),
            Self::PerWorker(processors) => write!(f, "PerWorker({})", processors.len()),
        }
    }
}
