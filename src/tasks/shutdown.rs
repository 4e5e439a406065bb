//! Shutdown monitor.
//!
//! Sits at the tail of a stream whose reader announces end of file. When the
//! shutdown control message arrives it starts a periodic sweep of every task
//! queue in the stream; once all queues have been empty for two consecutive
//! sweeps, the runner's stop gate is tripped and the process winds down.

use crate::core::stream::{StopGate, StreamInner};
use crate::core::task::{TaskCore, TaskUnit};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const CLEAR_SWEEPS_REQUIRED: u32 = 2;

pub struct ShutdownMonitorTask {
    core: TaskCore,
    stream: Weak<StreamInner>,
    gate: StopGate,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl ShutdownMonitorTask {
    pub fn new(stream: Weak<StreamInner>, gate: StopGate) -> Self {
        Self {
            core: TaskCore::new("ShutdownMonitor", false),
            stream,
            gate,
            sweeper: None,
        }
    }
}

#[async_trait]
impl TaskUnit for ShutdownMonitorTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn handle_shutdown_request(&mut self) -> bool {
        if self.sweeper.is_some() {
            return true;
        }
        tracing::info!("shutdown requested, waiting for queues to drain");
        let stream = self.stream.clone();
        let gate = self.gate.clone();
        self.sweeper = Some(self.core.runtime.spawn(sweep_until_drained(stream, gate)));
        true
    }

    fn handle_close(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep_until_drained(stream: Weak<StreamInner>, gate: StopGate) {
    let mut clear_sweeps = 0u32;
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;

        let Some(stream) = stream.upgrade() else {
            gate.trigger();
            return;
        };
        let Some(depths) = stream.queue_depths() else {
            continue;
        };

        if let Some((index, depth)) = depths.iter().enumerate().find(|(_, d)| **d > 0) {
            tracing::warn!(task = index, depth = *depth, "task still has pending data");
            clear_sweeps = 0;
            continue;
        }

        clear_sweeps += 1;
        if clear_sweeps >= CLEAR_SWEEPS_REQUIRED {
            tracing::info!(stream = %stream.name(), "queues drained, stopping runner");
            gate.trigger();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::ControlMessage;
    use crate::core::envelope::Envelope;
    use crate::core::stream::{Stream, TaskDriver, TaskEntry};
    use crate::core::task::{self, TaskShared};

    fn idle_driver() -> TaskDriver {
        TaskDriver::Async(tokio::spawn(async {}))
    }

    #[tokio::test(start_paused = true)]
    async fn trips_the_gate_once_queues_drain() {
        let stream = Stream::new("test");
        let gate = StopGate::new();

        let mut unit = ShutdownMonitorTask::new(Arc::downgrade(stream.inner()), gate.clone());
        let monitor_shared = unit.core().shared.clone();

        // A second, idle task with an empty queue.
        let (idle, _idle_rx) = TaskShared::new("idle", false);
        stream.seal(vec![
            TaskEntry::new(idle, idle_driver()),
            TaskEntry::new(monitor_shared, idle_driver()),
        ]);

        task::dispatch(
            &mut unit,
            task::QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::Shutdown),
                slot: 0,
            },
        );
        assert!(!gate.is_triggered());

        // Two clear sweeps at two-second intervals.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(gate.is_triggered());
        unit.handle_close();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_data_defers_the_stop() {
        let stream = Stream::new("busy");
        let gate = StopGate::new();

        let mut unit = ShutdownMonitorTask::new(Arc::downgrade(stream.inner()), gate.clone());
        let monitor_shared = unit.core().shared.clone();

        let (busy, busy_rx) = TaskShared::new("busy", false);
        busy.put(Envelope::control(ControlMessage::ClearStats), 0);
        stream.seal(vec![
            TaskEntry::new(busy, idle_driver()),
            TaskEntry::new(monitor_shared, idle_driver()),
        ]);

        task::dispatch(
            &mut unit,
            task::QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::Shutdown),
                slot: 0,
            },
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!gate.is_triggered());

        // Drain the stuck queue; the next sweeps notice and stop the runner.
        let _ = busy_rx.try_recv();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(gate.is_triggered());
        unit.handle_close();
    }
}
