//! Stream construction.
//!
//! Walks a stream's XML description in document order, builds a task of the
//! matching kind for each element, and wires the channel graph: outputs are
//! registered under stream-unique names (defaulting to
//! `taskIndex-channelIndex`), inputs resolve against previously registered
//! outputs with name and type checks. Tasks are then started in reverse
//! declaration order so every consumer exists before its producer begins to
//! send.

use crate::config::params;
use crate::config::schema::{
    AlgorithmConfig, FileInConfig, FileOutConfig, PublisherConfig, StreamConfig, SubscriberConfig,
    TaskElement, TspiConfig, VmeConfig,
};
use crate::core::channel::{OutputChannel, Recipient};
use crate::core::control::{ControlMessage, ParametersChange};
use crate::core::envelope::Envelope;
use crate::core::stream::{StopGate, Stream, TaskDriver, TaskEntry};
use crate::core::task::{
    run_dispatch, run_dispatch_blocking, InputConnection, TaskShared, TaskUnit, ThreadPolicy,
};
use crate::tasks::controller::ControllerTask;
use crate::tasks::file_in::FileInTask;
use crate::tasks::file_out::FileOutTask;
use crate::tasks::mcast_pub::McastPubTask;
use crate::tasks::mcast_sub::McastSubTask;
use crate::tasks::shutdown::ShutdownMonitorTask;
use crate::tasks::tcp_pub::TcpPubTask;
use crate::tasks::tcp_sub::TcpSubTask;
use crate::tasks::tspi::TspiReaderTask;
use crate::tasks::udp_in::UdpInTask;
use crate::tasks::udp_out::UdpOutTask;
use crate::tasks::vme::VmeReaderTask;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_MULTICAST_GROUP: &str = "239.255.0.1";

struct ChannelSlot {
    task: Arc<TaskShared>,
    index: usize,
    type_name: String,
}

/// Build one stream from its configuration and start every task.
pub async fn build_stream(
    config: &StreamConfig,
    stream_index: usize,
    gate: StopGate,
) -> Result<Stream> {
    let name = config
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("Stream {}", stream_index + 1));
    let stream = Stream::new(&name);

    let mut assembler = Assembler::new();
    for element in &config.tasks {
        match element {
            TaskElement::Algorithm(cfg) => assembler.make_algorithm(cfg)?,
            TaskElement::FileIn(cfg) => assembler.make_file_in(cfg)?,
            TaskElement::FileOut(cfg) => assembler.make_file_out(cfg)?,
            TaskElement::Publisher(cfg) => assembler.make_publisher(cfg)?,
            TaskElement::Subscriber(cfg) => assembler.make_subscriber(cfg)?,
            TaskElement::Vme(cfg) => assembler.make_vme(cfg)?,
            TaskElement::Tspi(cfg) => assembler.make_tspi(cfg)?,
        }
    }

    if assembler.need_shutdown_monitor {
        let monitor = ShutdownMonitorTask::new(Arc::downgrade(stream.inner()), gate);
        assembler.push(Box::new(monitor));
    }

    assembler.link_control_chain();
    let entries = assembler.activate().await?;
    stream.seal(entries);

    tracing::info!(stream = %name, tasks = stream.task_count(), "stream built");
    Ok(stream)
}

struct Assembler {
    units: Vec<Box<dyn TaskUnit>>,
    channels: HashMap<String, ChannelSlot>,
    need_shutdown_monitor: bool,
}

impl Assembler {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            channels: HashMap::new(),
            need_shutdown_monitor: false,
        }
    }

    fn task_index(&self) -> usize {
        self.units.len()
    }

    fn push(&mut self, unit: Box<dyn TaskUnit>) {
        unit.core().shared.set_index(self.units.len());
        self.units.push(unit);
    }

    fn apply_thread_policy(
        &self,
        unit: &mut Box<dyn TaskUnit>,
        scheduler: Option<&str>,
        priority: Option<&str>,
    ) -> Result<()> {
        let scheduler = params::parse_scheduler(scheduler)?;
        let priority = params::parse_priority(priority)?;
        if scheduler.is_some() || priority.is_some() {
            tracing::warn!(
                task = %unit.core().name(),
                ?scheduler,
                ?priority,
                "thread scheduling attributes recorded, not applied on this host"
            );
        }
        unit.core_mut().thread_policy = ThreadPolicy {
            scheduler,
            priority,
        };
        Ok(())
    }

    fn register_output(
        &mut self,
        unit: &dyn TaskUnit,
        type_name: &str,
        name: Option<&str>,
        channel_attr: Option<&str>,
    ) -> Result<()> {
        let task = unit.core().shared.clone();
        let channel_name = match channel_attr.filter(|s| !s.is_empty()) {
            Some(given) => given.to_string(),
            None => format!("{}-{}", task.index(), task.output_count()),
        };
        let display_name = name
            .filter(|s| !s.is_empty())
            .unwrap_or(&channel_name)
            .to_string();

        if self.channels.contains_key(&channel_name) {
            bail!("channel '{}' already exists", channel_name);
        }

        let index = task.add_output_channel(OutputChannel::new(&display_name, type_name));
        tracing::debug!(channel = %channel_name, type_name, "registered output channel");
        self.channels.insert(
            channel_name,
            ChannelSlot {
                task,
                index,
                type_name: type_name.to_string(),
            },
        );
        Ok(())
    }

    /// Find the output channel an input should connect to: either by its
    /// explicit name, or by probing the default names of earlier tasks.
    fn resolve_channel(
        &self,
        input_count: usize,
        channel_attr: Option<&str>,
    ) -> Result<(String, &ChannelSlot)> {
        if let Some(given) = channel_attr.filter(|s| !s.is_empty()) {
            return self
                .channels
                .get(given)
                .map(|slot| (given.to_string(), slot))
                .ok_or_else(|| anyhow!("unknown channel '{}'", given));
        }
        for prev_index in (0..self.task_index()).rev() {
            let candidate = format!("{prev_index}-{input_count}");
            if let Some(slot) = self.channels.get(&candidate) {
                return Ok((candidate, slot));
            }
        }
        bail!("no channel found for input connection")
    }

    fn connect_input(
        &mut self,
        unit: &mut Box<dyn TaskUnit>,
        type_name: Option<&str>,
        name: Option<&str>,
        channel_attr: Option<&str>,
    ) -> Result<()> {
        if self.task_index() == 0 {
            bail!("the first task of a stream cannot have input definitions");
        }

        let input_slot = unit.core().inputs.len();
        let (channel_name, slot) = self.resolve_channel(input_slot, channel_attr)?;

        let resolved_type = match type_name.filter(|s| !s.is_empty()) {
            Some(declared) => {
                if declared != slot.type_name {
                    bail!(
                        "input channel type '{}' does not match output type '{}'",
                        declared,
                        slot.type_name
                    );
                }
                declared.to_string()
            }
            None => slot.type_name.clone(),
        };
        let display_name = name
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| channel_name.clone());

        slot.task.with_output_mut(slot.index, |channel| {
            channel.add_recipient(Recipient {
                task: unit.core().shared.clone(),
                slot: input_slot,
            })
        });
        unit.core().shared.add_upstream(&slot.task);
        unit.core_mut().add_input(InputConnection {
            name: display_name,
            type_name: resolved_type,
        });
        tracing::debug!(
            channel = %channel_name,
            task = %unit.core().name(),
            slot = input_slot,
            "connected input channel"
        );
        Ok(())
    }

    fn make_algorithm(&mut self, cfg: &AlgorithmConfig) -> Result<()> {
        let name = cfg
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| cfg.dll.clone());
        let threaded = params::parse_flag(cfg.threaded.as_deref(), true);

        let controller = ControllerTask::open_and_init(&cfg.dll, Some(&name), threaded)
            .with_context(|| format!("unable to open controller for {}", cfg.dll))?;
        let mut unit: Box<dyn TaskUnit> = Box::new(controller);
        unit.core().shared.set_index(self.task_index());
        self.apply_thread_policy(&mut unit, cfg.scheduler.as_deref(), cfg.priority.as_deref())?;

        for output in &cfg.outputs {
            let type_name = output
                .type_name
                .as_deref()
                .ok_or_else(|| anyhow!("no type for <output> element"))?;
            self.register_output(
                unit.as_ref(),
                type_name,
                output.name.as_deref(),
                output.channel.as_deref(),
            )?;
        }
        for input in &cfg.inputs {
            self.connect_input(
                &mut unit,
                input.type_name.as_deref(),
                input.name.as_deref(),
                input.channel.as_deref(),
            )?;
        }

        if unit.core().inputs.is_empty() {
            tracing::warn!(task = %name, "no input channels defined for the task");
        }
        if unit.core().shared.output_count() == 0 {
            tracing::warn!(task = %name, "no output channels defined for the task");
        }

        if !cfg.params.is_empty() {
            let values = cfg
                .params
                .iter()
                .map(|p| Ok((p.name.clone(), params::param_value(p)?)))
                .collect::<Result<Vec<_>>>()?;
            let request = ParametersChange {
                originals: true,
                values,
            };
            unit.core().shared.put(
                Envelope::control(ControlMessage::ParametersChange(request)),
                0,
            );
        }

        self.units.push(unit);
        Ok(())
    }

    fn make_file_in(&mut self, cfg: &FileInConfig) -> Result<()> {
        let signal = params::parse_flag(cfg.signal_end_of_file.as_deref(), true);
        let task_name = format!("FileIn({},{})", cfg.type_name, cfg.path);
        let mut unit: Box<dyn TaskUnit> = Box::new(FileInTask::new(
            &task_name,
            PathBuf::from(&cfg.path),
            signal,
        ));
        unit.core().shared.set_index(self.task_index());
        self.apply_thread_policy(&mut unit, cfg.scheduler.as_deref(), cfg.priority.as_deref())?;

        self.register_output(unit.as_ref(), &cfg.type_name, None, cfg.channel.as_deref())?;
        if signal {
            self.need_shutdown_monitor = true;
        }
        self.units.push(unit);
        Ok(())
    }

    fn make_file_out(&mut self, cfg: &FileOutConfig) -> Result<()> {
        // The writer checks the native type of everything it persists, so the
        // channel type must be known before the task is constructed.
        let resolved_type = {
            let (_, slot) = self.resolve_channel(0, cfg.channel.as_deref())?;
            slot.type_name.clone()
        };
        let type_name = cfg
            .type_name
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or(resolved_type);
        let acquire = params::parse_flag(cfg.acquire_basis_time_stamps.as_deref(), true);

        let task_name = format!("FileOut({},{})", type_name, cfg.path);
        let task = FileOutTask::new(&task_name, PathBuf::from(&cfg.path), &type_name, acquire)
            .with_context(|| format!("unable to open file writer with path {}", cfg.path))?;
        let mut unit: Box<dyn TaskUnit> = Box::new(task);
        unit.core().shared.set_index(self.task_index());
        self.apply_thread_policy(&mut unit, cfg.scheduler.as_deref(), cfg.priority.as_deref())?;

        self.connect_input(&mut unit, Some(&type_name), None, cfg.channel.as_deref())?;
        self.units.push(unit);
        Ok(())
    }

    fn make_publisher(&mut self, cfg: &PublisherConfig) -> Result<()> {
        let transport = cfg.transport.as_deref().unwrap_or("multicast");
        let port = params::parse_port(cfg.port.as_deref(), 0)?;

        let mut unit: Box<dyn TaskUnit> = match transport {
            "tcp" => Box::new(TcpPubTask::new(&cfg.name, &cfg.type_name, port)),
            "multicast" => {
                let group: Ipv4Addr = cfg
                    .interface
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_MULTICAST_GROUP)
                    .parse()
                    .map_err(|_| anyhow!("invalid multicast group for publisher '{}'", cfg.name))?;
                Box::new(McastPubTask::new(&cfg.name, &cfg.type_name, group, port))
            }
            "udp" => {
                let host = cfg
                    .host
                    .as_deref()
                    .ok_or_else(|| anyhow!("no host name for 'udp' transport"))?;
                let task_name = format!("{} UDPOut", cfg.name);
                Box::new(UdpOutTask::new(&task_name, host, port))
            }
            other => bail!("invalid transport attribute - {}", other),
        };

        unit.core().shared.set_index(self.task_index());
        self.apply_thread_policy(&mut unit, cfg.scheduler.as_deref(), cfg.priority.as_deref())?;
        self.connect_input(&mut unit, Some(&cfg.type_name), None, cfg.channel.as_deref())?;
        self.units.push(unit);
        Ok(())
    }

    fn make_subscriber(&mut self, cfg: &SubscriberConfig) -> Result<()> {
        let transport = cfg.transport.as_deref().unwrap_or("multicast");
        let buffer_size = params::parse_buffer_size(cfg.buffer_size.as_deref(), 0);

        let unit: Box<dyn TaskUnit> = match transport {
            "multicast" => Box::new(McastSubTask::new(&cfg.name, &cfg.type_name, buffer_size)),
            "tcp" => Box::new(TcpSubTask::new(&cfg.name, &cfg.type_name)),
            "udp" => {
                let port = params::parse_port(cfg.port.as_deref(), 0)?;
                let task_name = format!("{} UDPIn", cfg.name);
                Box::new(UdpInTask::new(&task_name, port))
            }
            other => bail!("invalid transport attribute - {}", other),
        };

        unit.core().shared.set_index(self.task_index());
        self.register_output(unit.as_ref(), &cfg.type_name, None, cfg.channel.as_deref())?;
        self.units.push(unit);
        Ok(())
    }

    fn make_vme(&mut self, cfg: &VmeConfig) -> Result<()> {
        let group: Ipv4Addr = cfg
            .host
            .parse()
            .map_err(|_| anyhow!("invalid host for 'vme' element"))?;
        let port = params::parse_port(Some(&cfg.port), 0)?;
        let buffer_size = params::parse_buffer_size(cfg.buffer_size.as_deref(), 256 * 1024);

        let unit: Box<dyn TaskUnit> = Box::new(VmeReaderTask::new(
            &format!("VME({}/{port})", cfg.host),
            group,
            port,
            buffer_size,
        ));
        unit.core().shared.set_index(self.task_index());
        self.register_output(unit.as_ref(), "RawVideo", None, cfg.channel.as_deref())?;
        self.units.push(unit);
        Ok(())
    }

    fn make_tspi(&mut self, cfg: &TspiConfig) -> Result<()> {
        let port = params::parse_port(Some(&cfg.port), 0)?;
        let unit: Box<dyn TaskUnit> =
            Box::new(TspiReaderTask::new(&format!("TSPI({port})"), port));
        unit.core().shared.set_index(self.task_index());
        self.register_output(unit.as_ref(), "TSPI", None, cfg.channel.as_deref())?;
        self.units.push(unit);
        Ok(())
    }

    /// Chain each task to its successor for control-message propagation.
    fn link_control_chain(&mut self) {
        for index in 0..self.units.len().saturating_sub(1) {
            let next = self.units[index + 1].core().shared.clone();
            self.units[index].core().shared.set_next(next);
        }
    }

    /// Start every task, last declared first, so downstream queues exist
    /// before upstream tasks begin sending.
    async fn activate(self) -> Result<Vec<TaskEntry>> {
        let count = self.units.len();
        let mut entries: Vec<Option<TaskEntry>> =
            std::iter::repeat_with(|| None).take(count).collect();

        for (offset, mut unit) in self.units.into_iter().rev().enumerate() {
            let index = count - 1 - offset;
            let task_name = unit.core().name();
            unit.start()
                .await
                .with_context(|| format!("starting task '{task_name}'"))?;

            let shared = unit.core().shared.clone();
            let driver = if unit.dedicated_thread() {
                let handle = std::thread::Builder::new()
                    .name(task_name.clone())
                    .spawn(move || run_dispatch_blocking(unit))
                    .context("spawning dispatch thread")?;
                TaskDriver::Thread(handle)
            } else {
                TaskDriver::Async(tokio::spawn(run_dispatch(unit)))
            };
            entries[index] = Some(TaskEntry::new(shared, driver));
        }

        Ok(entries
            .into_iter()
            .map(|entry| entry.expect("task entry placed"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame;
    use crate::config::load_config_from_str;
    use crate::core::state::ProcessingState;
    use crate::messages::catalog;
    use crate::messages::video::Video;
    use crate::messages::NativeMessage;
    use std::time::Duration;

    fn write_input(frames: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!("builder-in-{}.pri", uuid::Uuid::new_v4()));
        let mut contents = Vec::new();
        for seq in 1..=frames {
            let video = Video::with_samples(
                "gen",
                seq,
                0.0,
                vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            );
            contents.extend_from_slice(&frame::encode_message(&video, None).unwrap());
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn read_output(path: &PathBuf) -> Vec<std::sync::Arc<dyn crate::messages::NativeMessage>> {
        let raw = std::fs::read(path).unwrap();
        let mut framer = frame::StreamFramer::new();
        framer.extend(&raw);
        let mut out = Vec::new();
        while let Some(frame) = framer.next_frame() {
            out.push(catalog::decode_message(&frame).unwrap());
        }
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_to_file_passthrough_preserves_messages() {
        let input = write_input(1);
        let output = std::env::temp_dir().join(format!("builder-out-{}.pri", uuid::Uuid::new_v4()));

        let xml = format!(
            r#"
            <runner>
              <stream name="copy">
                <filein type="Video" path="{}" signalEndOfFile="1"/>
                <fileout type="Video" path="{}" acquireBasisTimeStamps="0"/>
              </stream>
            </runner>
        "#,
            input.display(),
            output.display()
        );
        let config = load_config_from_str(&xml).unwrap();

        let gate = StopGate::new();
        let stream = build_stream(&config.streams[0], 0, gate.clone())
            .await
            .unwrap();
        // filein + fileout + shutdown monitor
        assert_eq!(stream.task_count(), 3);

        assert!(stream.command_state(ProcessingState::Run));
        tokio::time::timeout(Duration::from_secs(20), gate.wait())
            .await
            .expect("stream should drain and stop");
        stream.close().await;

        let messages = read_output(&output);
        assert_eq!(messages.len(), 1);
        let video = messages[0].as_any().downcast_ref::<Video>().unwrap();
        assert_eq!(video.samples(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(video.header().sequence(), 1);
        assert_eq!(video.azimuth(), 0.0);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn algorithm_stream_applies_configured_parameters() {
        let input = write_input(10);
        let output = std::env::temp_dir().join(format!("builder-alg-{}.pri", uuid::Uuid::new_v4()));

        let xml = format!(
            r#"
            <runner>
              <stream name="offset">
                <filein type="Video" path="{}" signalEndOfFile="1"/>
                <algorithm dll="Offset" name="offset" threaded="true">
                  <input type="Video"/>
                  <output type="Video"/>
                  <param name="offset" type="int" value="100"/>
                </algorithm>
                <fileout type="Video" path="{}" acquireBasisTimeStamps="1"/>
              </stream>
            </runner>
        "#,
            input.display(),
            output.display()
        );
        let config = load_config_from_str(&xml).unwrap();

        let gate = StopGate::new();
        let stream = build_stream(&config.streams[0], 0, gate.clone())
            .await
            .unwrap();
        assert!(stream.command_state(ProcessingState::Run));
        tokio::time::timeout(Duration::from_secs(20), gate.wait())
            .await
            .expect("stream should drain and stop");

        // Controller statistics are visible in the status snapshot.
        let status = stream.status();
        let controller = status.tasks.iter().find(|t| t.name == "offset").unwrap();
        assert_eq!(controller.message_count, 10);
        assert_eq!(controller.drop_count, 0);

        stream.close().await;

        let messages = read_output(&output);
        assert_eq!(messages.len(), 10);
        for message in &messages {
            let video = message.as_any().downcast_ref::<Video>().unwrap();
            assert_eq!(
                video.samples(),
                &[101, 102, 103, 104, 105, 106, 107, 108, 109, 110]
            );
        }

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&output).ok();
    }

    #[tokio::test]
    async fn wiring_errors_are_reported() {
        // Mismatched channel types.
        let mismatch = load_config_from_str(
            r#"
            <runner><stream>
              <filein type="Video" path="/dev/null" signalEndOfFile="0"/>
              <algorithm dll="Passthrough">
                <input type="Extractions"/>
                <output type="Video"/>
              </algorithm>
            </stream></runner>
        "#,
        )
        .unwrap();
        let err = build_stream(&mismatch.streams[0], 0, StopGate::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));

        // Unknown channel names.
        let unknown = load_config_from_str(
            r#"
            <runner><stream>
              <filein type="Video" path="/dev/null" signalEndOfFile="0"/>
              <algorithm dll="Passthrough">
                <input type="Video" channel="nowhere"/>
                <output type="Video"/>
              </algorithm>
            </stream></runner>
        "#,
        )
        .unwrap();
        let err = build_stream(&unknown.streams[0], 0, StopGate::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown channel"));
    }

    #[tokio::test]
    async fn duplicate_channel_names_are_rejected() {
        let config = load_config_from_str(
            r#"
            <runner><stream>
              <filein type="Video" path="/dev/null" signalEndOfFile="0" channel="shared"/>
              <subscriber name="s" type="Video" transport="tcp" channel="shared"/>
            </stream></runner>
        "#,
        )
        .unwrap();
        let err = build_stream(&config.streams[0], 0, StopGate::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
