//! Soft memory limit for the work queues.
//!
//! Once a minute the monitor samples the process resident set; over the
//! limit it sheds half the backlog of every queue that still has one. Shed
//! work is not lost for good since the fetchers' `init` scans re-derive it
//! from the store. When every queue is already minimal there is nothing
//! left to shed and the situation is only logged.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::buffered_task::ShrinkableQueue;

pub const DEFAULT_MEMORY_LIMIT: u64 = 1 << 30;

pub struct MemoryMonitor {
    limit_bytes: u64,
    period: Duration,
    queues: Vec<Arc<dyn ShrinkableQueue>>,
}

impl MemoryMonitor {
    pub fn new(limit_bytes: u64, queues: Vec<Arc<dyn ShrinkableQueue>>) -> Self {
        Self { limit_bytes, period: Duration::from_secs(60), queues }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pid = Pid::from_u32(std::process::id());
            let mut system = System::new();
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    ProcessRefreshKind::new().with_memory(),
                );
                let Some(process) = system.process(pid) else { continue };
                let used = process.memory();
                debug!(used, limit = self.limit_bytes, "memory probe");
                if used > self.limit_bytes {
                    self.shed(used);
                }
            }
        })
    }

    fn shed(&self, used: u64) {
        let mut dropped_total = 0usize;
        for queue in &self.queues {
            if queue.backlog_bytes() == 0 {
                continue;
            }
            let dropped = queue.shed_half();
            dropped_total += dropped;
            warn!(queue = queue.name(), dropped, "over memory limit, backlog halved");
        }
        if dropped_total == 0 {
            error!(
                used,
                limit = self.limit_bytes,
                "memory limit exceeded but all queues are minimal; nothing to shed"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeQueue {
        backlog: AtomicUsize,
    }

    impl ShrinkableQueue for FakeQueue {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn backlog_bytes(&self) -> usize {
            self.backlog.load(Ordering::SeqCst)
        }

        fn shed_half(&self) -> usize {
            let before = self.backlog.load(Ordering::SeqCst);
            self.backlog.store(before / 2, Ordering::SeqCst);
            before - before / 2
        }
    }

    #[test]
    fn sheds_every_non_minimal_queue() {
        let queues: Vec<Arc<dyn ShrinkableQueue>> = (0..10)
            .map(|_| {
                Arc::new(FakeQueue { backlog: AtomicUsize::new(10 << 20) })
                    as Arc<dyn ShrinkableQueue>
            })
            .collect();
        let monitor = MemoryMonitor::new(64 << 20, queues.clone());

        monitor.shed(100 << 20);

        for queue in &queues {
            assert_eq!(queue.backlog_bytes(), 5 << 20);
        }
    }

    #[test]
    fn logs_instead_of_shedding_when_minimal() {
        let queue = Arc::new(FakeQueue { backlog: AtomicUsize::new(0) });
        let monitor = MemoryMonitor::new(64 << 20, vec![queue.clone()]);
        monitor.shed(100 << 20);
        assert_eq!(queue.backlog_bytes(), 0);
    }
}
