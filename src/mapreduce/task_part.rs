//! Dispatched units of work, one per target member and phase

use super::command::TaskResponse;
use super::TaskId;
use crate::cluster::Address;
use crate::error::{MapReduceError, MapReduceResult, Phase};
use tokio::task::JoinHandle;
use uuid::Uuid;

type PartResult<K, V> = MapReduceResult<TaskResponse<K, V>>;

/// Handle on the invocation backing one task part
pub(crate) struct PartHandle<K, V> {
    pub target: Address,
    pub part_id: Uuid,
    handle: JoinHandle<PartResult<K, V>>,
}

impl<K, V> PartHandle<K, V> {
    pub fn new(target: Address, part_id: Uuid, handle: JoinHandle<PartResult<K, V>>) -> Self {
        Self {
            target,
            part_id,
            handle,
        }
    }
}

/// One outstanding map/combine or reduce invocation
pub(crate) enum TaskPart<K, V> {
    MapCombine(PartHandle<K, V>),
    Reduce(PartHandle<K, V>),
}

impl<K, V> TaskPart<K, V> {
    pub fn phase(&self) -> Phase {
        match self {
            TaskPart::MapCombine(_) => Phase::Map,
            TaskPart::Reduce(_) => Phase::Reduce,
        }
    }

    fn handle(&self) -> &PartHandle<K, V> {
        match self {
            TaskPart::MapCombine(handle) | TaskPart::Reduce(handle) => handle,
        }
    }

    pub fn target(&self) -> &Address {
        &self.handle().target
    }

    pub fn part_id(&self) -> Uuid {
        self.handle().part_id
    }

    /// Wait for the part and surface its failure as a phase error
    pub async fn join(self, task_id: &TaskId) -> PartResult<K, V> {
        let phase = self.phase();
        let (TaskPart::MapCombine(part) | TaskPart::Reduce(part)) = self;
        let PartHandle { target, handle, .. } = part;
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(MapReduceError::PartFailed {
                task_id: task_id.to_string(),
                phase,
                member: target.clone(),
                reason: format!("task part panicked or was aborted: {}", join_err),
                source: None,
            }),
        };
        outcome.map_err(|cause| match cause {
            already @ MapReduceError::PartFailed { .. } => already,
            cause => MapReduceError::part_failed(task_id, phase, target, cause),
        })
    }
}
