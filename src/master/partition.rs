use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::catalog::ArcCatalog;
use crate::model::{Datagram, ProcessingTask};

/// Splits a historical batch into contiguous tasks.
///
/// Every partition holds `len / n` datagrams except the last, which also takes the remainder.
/// Partitions that would start past the end of the batch are not created.
#[derive(Debug, Default)]
pub struct TaskPartitioner {
    counter: AtomicU64,
}

impl TaskPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks created so far.
    pub fn tasks_created(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Task ids are `task-{n}-{index}`, where `n` increases with every task ever created.
    pub fn partition(
        &self,
        datagrams: Arc<[Datagram]>,
        catalog: Arc<ArcCatalog>,
        num_partitions: usize,
    ) -> Vec<ProcessingTask> {
        let n = num_partitions.max(1);
        let len = datagrams.len();
        let chunk = (len / n).max(1);

        let mut tasks = Vec::with_capacity(n);
        for i in 0..n {
            let start = i * chunk;
            if start >= len {
                break;
            }
            let end = if i == n - 1 { len } else { (start + chunk).min(len) };
            let token = self.counter.fetch_add(1, Ordering::Relaxed) + 1;

            tasks.push(ProcessingTask::new(
                format!("task-{}-{}", token, i),
                datagrams.clone(),
                start..end,
                catalog.clone(),
                i,
                n,
            ));
        }
        tasks
    }
}
