//! Algorithm host task.
//!
//! A controller wraps one algorithm instance looked up in the factory
//! registry. It feeds the algorithm data messages while the task is in an
//! active state, measures per-message processing time, manages the optional
//! recording of every output channel, and runs the algorithm's alarm timer.
//! An algorithm failure puts the controller into Failure but never tears the
//! stream down.

use crate::algorithms::{factory, Algorithm, AlgorithmContext, TimerRequest};
use crate::core::control::{ControlMessage, RecordingStateChange};
use crate::core::envelope::Envelope;
use crate::core::params::Parameter;
use crate::core::task::{TaskCore, TaskShared, TaskUnit};
use crate::tasks::recorder::Recorder;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Processing-time statistics across the controller's lifetime.
#[derive(Debug, Clone, Default)]
pub struct ProcessingStat {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl ProcessingStat {
    pub fn add_sample(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;
        self.max = self.max.max(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }

    pub fn minimum(&self) -> Duration {
        self.min.unwrap_or(Duration::ZERO)
    }

    pub fn maximum(&self) -> Duration {
        self.max
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Background alarm. A dedicated thread sleeps toward absolute wakeup times
/// and posts a timeout control message into the owning task's queue on each
/// expiry.
struct AlarmTimer {
    active: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AlarmTimer {
    fn start(shared: Arc<TaskShared>, secs: u32) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let running = active.clone();
        let name = format!("{}-alarm", shared.name());
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let period = Duration::from_secs(u64::from(secs));
                let mut wakeup = Instant::now() + period;
                while running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now < wakeup {
                        // Sleep in slices so a stop request is honoured
                        // promptly.
                        std::thread::sleep((wakeup - now).min(Duration::from_millis(250)));
                        continue;
                    }
                    // Anchor on the intended wakeup, not on now, so queue
                    // latency does not accumulate as drift.
                    wakeup += period;
                    if !shared.put(Envelope::control(ControlMessage::Timeout), 0) {
                        break;
                    }
                }
            })
            .expect("spawning alarm thread");
        Self {
            active,
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AlarmTimer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

pub struct ControllerTask {
    core: TaskCore,
    algorithm_name: String,
    algorithm: Option<Box<dyn Algorithm>>,
    threaded: bool,
    recorders: Vec<Recorder>,
    recording: bool,
    recording_enabled: Arc<AtomicBool>,
    stats: ProcessingStat,
    timer: Option<AlarmTimer>,
    timer_request: Option<TimerRequest>,
}

impl ControllerTask {
    /// Instantiate the named algorithm and run its startup hook. The service
    /// name, when given, becomes the task name.
    pub fn open_and_init(
        algorithm_name: &str,
        service_name: Option<&str>,
        threaded: bool,
    ) -> Result<Self> {
        let task_name = service_name.unwrap_or(algorithm_name);
        let mut core = TaskCore::new(task_name, false);

        let recording_enabled = Arc::new(AtomicBool::new(false));
        core.params.register(
            Parameter::bool_value("recordingEnabled", "Recording Enabled", false),
        );
        let probe = recording_enabled.clone();
        core.shared
            .set_extra_using_data(Box::new(move || probe.load(Ordering::Relaxed)));

        let mut algorithm = factory::create_algorithm(algorithm_name)
            .with_context(|| format!("loading algorithm '{algorithm_name}'"))?;
        algorithm
            .startup(&mut core.params)
            .with_context(|| format!("algorithm '{algorithm_name}' failed startup"))?;

        if !threaded {
            tracing::warn!(task = task_name, "algorithm running on the shared runtime");
        }

        Ok(Self {
            core,
            algorithm_name: algorithm_name.to_string(),
            algorithm: Some(algorithm),
            threaded,
            recorders: Vec::new(),
            recording: false,
            recording_enabled,
            stats: ProcessingStat::default(),
            timer: None,
            timer_request: None,
        })
    }

    pub fn algorithm_name(&self) -> &str {
        &self.algorithm_name
    }

    pub fn processing_stats(&self) -> &ProcessingStat {
        &self.stats
    }

    fn apply_timer_request(&mut self) {
        match self.timer_request.take() {
            Some(TimerRequest::Start(secs)) => {
                if let Some(timer) = self.timer.as_mut() {
                    timer.stop();
                }
                tracing::info!(task = %self.core.name(), secs, "starting alarm timer");
                self.timer = Some(AlarmTimer::start(self.core.shared.clone(), secs));
            }
            Some(TimerRequest::Cancel) => {
                if let Some(mut timer) = self.timer.take() {
                    timer.stop();
                }
            }
            None => {}
        }
    }

    fn start_recordings(&mut self, directory: &std::path::Path) -> Result<()> {
        let channels = self.core.shared.output_count().max(1);
        let name = self.core.name();
        for index in 0..channels {
            let path = if channels > 1 {
                directory.join(format!("{}-{}.pri", name, index + 1))
            } else {
                directory.join(format!("{name}.pri"))
            };
            match Recorder::start(&name, path) {
                Ok(recorder) => self.recorders.push(recorder),
                Err(err) => {
                    for recorder in self.recorders.iter_mut() {
                        recorder.stop();
                    }
                    self.recorders.clear();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn stop_recordings(&mut self) {
        for recorder in self.recorders.iter_mut() {
            recorder.stop();
        }
        self.recorders.clear();
    }
}

#[async_trait]
impl TaskUnit for ControllerTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn dedicated_thread(&self) -> bool {
        self.threaded
    }

    fn enter_initialize(&mut self) -> bool {
        self.core.shared.reset_stats();
        self.core.shared.clear_error();
        self.stats.reset();
        self.algorithm.as_mut().map_or(false, |a| a.reset())
    }

    fn enter_auto_diagnostic(&mut self) -> bool {
        self.algorithm.as_mut().map_or(false, |a| a.begin_auto_diag())
    }

    fn enter_calibrate(&mut self) -> bool {
        self.algorithm
            .as_mut()
            .map_or(false, |a| a.begin_calibration())
    }

    fn enter_run(&mut self) -> bool {
        self.algorithm.as_mut().map_or(false, |a| a.begin_run())
    }

    fn enter_stop(&mut self) -> bool {
        self.algorithm.as_mut().map_or(false, |a| a.stop())
    }

    fn deliver_data(&mut self, envelope: Envelope, slot: usize) -> Result<()> {
        let Some(algorithm) = self.algorithm.as_mut() else {
            bail!("algorithm is not loaded");
        };

        // Out of Run/Calibrate/AutoDiagnostic the message is released
        // without processing.
        if !self.core.shared.state().is_active() {
            return Ok(());
        }

        let native = envelope.native()?;
        let started = Instant::now();
        let ok = {
            let mut ctx = AlgorithmContext::new(
                &self.core.params,
                &self.core.shared,
                &self.recorders,
                self.recording,
                &mut self.timer_request,
            );
            algorithm.process(&native, slot, &mut ctx)
        };
        self.stats.add_sample(started.elapsed());
        self.apply_timer_request();

        if !ok {
            bail!("failed to process message");
        }
        Ok(())
    }

    fn begin_parameters_change(&mut self) {
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.begin_parameter_changes();
        }
    }

    fn end_parameters_change(&mut self) {
        self.recording_enabled.store(
            self.core.params.get_bool("recordingEnabled").unwrap_or(false),
            Ordering::Relaxed,
        );
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.end_parameter_changes(&self.core.params);
        }
    }

    fn handle_recording_state_change(&mut self, request: &RecordingStateChange) -> bool {
        if !self.core.params.get_bool("recordingEnabled").unwrap_or(false) {
            return true;
        }

        match &request.path {
            Some(directory) => {
                if self.recording {
                    return true;
                }
                match self.start_recordings(directory) {
                    Ok(()) => {
                        self.recording = true;
                        if let Some(algorithm) = self.algorithm.as_mut() {
                            algorithm.recording_started();
                        }
                        true
                    }
                    Err(err) => {
                        self.core
                            .shared
                            .set_error_text(&format!("Failed to start recorder(s): {err}"), false);
                        false
                    }
                }
            }
            None => {
                self.recording = false;
                self.stop_recordings();
                if let Some(algorithm) = self.algorithm.as_mut() {
                    algorithm.recording_stopped();
                }
                tracing::info!(task = %self.core.name(), "recording stopped");
                true
            }
        }
    }

    fn handle_timeout(&mut self) -> bool {
        let Some(algorithm) = self.algorithm.as_mut() else {
            return false;
        };
        if self.core.shared.state().is_active() {
            let mut ctx = AlgorithmContext::new(
                &self.core.params,
                &self.core.shared,
                &self.recorders,
                self.recording,
                &mut self.timer_request,
            );
            algorithm.process_alarm(&mut ctx);
        }
        self.apply_timer_request();
        true
    }

    fn handle_close(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        self.stop_recordings();
        if let Some(mut algorithm) = self.algorithm.take() {
            algorithm.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::ParametersChange;
    use crate::core::params::ParameterRegistry;
    use crate::core::state::ProcessingState;
    use crate::core::task::{self, QueueItem};
    use crate::messages::header::NativeMessage;
    use crate::messages::video::Video;
    use serde_json::json;

    fn video(seq: u32, samples: Vec<i16>) -> Envelope {
        Envelope::wrap_native(Arc::new(Video::with_samples("t", seq, 0.0, samples)))
    }

    fn data(unit: &mut ControllerTask, envelope: Envelope) {
        task::dispatch(unit, QueueItem::Envelope { envelope, slot: 0 });
    }

    #[tokio::test]
    async fn processes_only_while_active() {
        let mut unit = ControllerTask::open_and_init("Passthrough", None, true).unwrap();

        // Not yet in an active state: silent drop.
        data(&mut unit, video(1, vec![1]));
        assert_eq!(unit.processing_stats().count(), 0);

        task::enter_processing_state(&mut unit, ProcessingState::AutoDiagnostic);
        for seq in 1..=10u32 {
            data(&mut unit, video(seq, vec![1, 2, 3]));
        }
        assert_eq!(unit.processing_stats().count(), 10);
        unit.handle_close();
    }

    #[tokio::test]
    async fn algorithm_outputs_flow_to_the_output_channel() {
        use crate::core::channel::{OutputChannel, Recipient};
        use crate::core::task::TaskShared;

        let mut unit = ControllerTask::open_and_init("Offset", Some("offset"), false).unwrap();
        let (sink, sink_rx) = TaskShared::new("sink", true);
        let mut channel = OutputChannel::new("out", "Video");
        channel.add_recipient(Recipient {
            task: sink,
            slot: 0,
        });
        unit.core().shared.add_output_channel(channel);

        // Configure the offset, then run.
        let request = ParametersChange {
            originals: true,
            values: vec![("offset".to_string(), json!(10))],
        };
        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::ParametersChange(request)),
                slot: 0,
            },
        );
        task::enter_processing_state(&mut unit, ProcessingState::Run);
        data(&mut unit, video(1, vec![1, 2, 3]));

        let QueueItem::Envelope { envelope, .. } = sink_rx.try_recv().unwrap() else {
            panic!("expected an envelope");
        };
        let native = envelope.native().unwrap();
        let out = native.as_any().downcast_ref::<Video>().unwrap();
        assert_eq!(out.samples(), &[11, 12, 13]);
        // Derived output keeps the source in its basis chain.
        assert_eq!(
            native.header().root_basis().unwrap().header().producer(),
            "t"
        );
        unit.handle_close();
    }

    #[tokio::test]
    async fn parameters_observed_by_the_next_message() {
        let mut unit = ControllerTask::open_and_init("Offset", None, true).unwrap();
        task::enter_processing_state(&mut unit, ProcessingState::Run);

        let request = ParametersChange {
            originals: false,
            values: vec![("offset".to_string(), json!(5))],
        };
        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::ParametersChange(request)),
                slot: 0,
            },
        );
        assert!(unit.core().shared.has_changed_parameters());
        assert_eq!(unit.core().params.get_int("offset"), Some(5));
        unit.handle_close();
    }

    #[tokio::test]
    async fn algorithm_failure_enters_failure_without_teardown() {
        struct Failing;
        impl Algorithm for Failing {
            fn startup(&mut self, _params: &mut ParameterRegistry) -> anyhow::Result<()> {
                Ok(())
            }
            fn process(
                &mut self,
                _message: &Arc<dyn NativeMessage>,
                _slot: usize,
                _ctx: &mut AlgorithmContext,
            ) -> bool {
                false
            }
        }
        factory::register_algorithm("AlwaysFails", Box::new(|| Box::new(Failing)));

        let mut unit = ControllerTask::open_and_init("AlwaysFails", None, true).unwrap();
        task::enter_processing_state(&mut unit, ProcessingState::Run);
        data(&mut unit, video(1, vec![1]));

        assert_eq!(unit.core().shared.state(), ProcessingState::Failure);
        assert!(unit.core().shared.has_error());
        // The queue stays usable; the stream is not torn down.
        assert!(unit.core().shared.is_queue_active());
        unit.handle_close();
    }

    #[tokio::test]
    async fn recording_round_trip() {
        let mut unit = ControllerTask::open_and_init("Passthrough", Some("recorded"), true).unwrap();
        unit.core()
            .shared
            .add_output_channel(crate::core::channel::OutputChannel::new("out", "Video"));

        // Recording is gated on the recordingEnabled parameter.
        let enable = ParametersChange {
            originals: false,
            values: vec![("recordingEnabled".to_string(), json!(true))],
        };
        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::ParametersChange(enable)),
                slot: 0,
            },
        );

        let directory = std::env::temp_dir().join(format!("rec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&directory).unwrap();

        task::enter_processing_state(&mut unit, ProcessingState::Run);
        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::RecordingStateChange(
                    RecordingStateChange::start(&directory),
                )),
                slot: 0,
            },
        );
        assert!(unit.recording);

        for seq in 1..=3u32 {
            data(&mut unit, video(seq, vec![7]));
        }

        task::dispatch(
            &mut unit,
            QueueItem::Envelope {
                envelope: Envelope::control(ControlMessage::RecordingStateChange(
                    RecordingStateChange::stop(),
                )),
                slot: 0,
            },
        );
        assert!(!unit.recording);

        let recorded = std::fs::read(directory.join("recorded.pri")).unwrap();
        let mut framer = crate::codec::frame::StreamFramer::new();
        framer.extend(&recorded);
        let mut count = 0;
        while framer.next_frame().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);

        unit.handle_close();
        std::fs::remove_dir_all(&directory).ok();
    }

    #[tokio::test]
    async fn alarm_timer_posts_timeout_controls() {
        struct Alarmed {
            alarms: Arc<AtomicBool>,
        }
        impl Algorithm for Alarmed {
            fn startup(&mut self, _params: &mut ParameterRegistry) -> anyhow::Result<()> {
                Ok(())
            }
            fn begin_run(&mut self) -> bool {
                true
            }
            fn process(
                &mut self,
                _message: &Arc<dyn NativeMessage>,
                _slot: usize,
                ctx: &mut AlgorithmContext,
            ) -> bool {
                ctx.set_timer_secs(1);
                true
            }
            fn process_alarm(&mut self, _ctx: &mut AlgorithmContext) {
                self.alarms.store(true, Ordering::Relaxed);
            }
        }

        let fired = Arc::new(AtomicBool::new(false));
        let fired_in = fired.clone();
        factory::register_algorithm(
            "AlarmProbe",
            Box::new(move || {
                Box::new(Alarmed {
                    alarms: fired_in.clone(),
                })
            }),
        );

        let mut unit = ControllerTask::open_and_init("AlarmProbe", None, true).unwrap();
        let rx = unit.core().queue_rx.clone();
        task::enter_processing_state(&mut unit, ProcessingState::Run);
        data(&mut unit, video(1, vec![1]));
        assert!(unit.timer.is_some());

        // The timer thread posts a timeout control within a couple seconds.
        let item = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .expect("timeout control message");
        task::dispatch(&mut unit, item);
        assert!(fired.load(Ordering::Relaxed));
        unit.handle_close();
    }
}
