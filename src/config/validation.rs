//! Structural validation of a loaded configuration.
//!
//! Catches the problems that are cheap to find before any sockets are bound
//! or files opened: unknown algorithms and message types, bad transports,
//! malformed numeric attributes. Channel wiring is validated during stream
//! construction, where the declaration order matters.

use crate::algorithms::factory;
use crate::config::params;
use crate::config::schema::{RunnerConfig, StreamConfig, TaskElement};
use crate::messages::catalog;
use anyhow::{bail, Result};

pub fn validate_config(config: &RunnerConfig) -> Result<()> {
    if config.streams.is_empty() {
        bail!("configuration defines no streams");
    }
    for (index, stream) in config.streams.iter().enumerate() {
        validate_stream(stream, index)?;
    }
    Ok(())
}

fn validate_stream(stream: &StreamConfig, index: usize) -> Result<()> {
    let label = stream
        .name
        .clone()
        .unwrap_or_else(|| format!("stream {}", index + 1));
    if stream.tasks.is_empty() {
        bail!("{label}: defines no tasks");
    }

    for task in &stream.tasks {
        match task {
            TaskElement::Algorithm(algorithm) => {
                if algorithm.dll.is_empty() {
                    bail!("{label}: algorithm element without a dll name");
                }
                if !factory::algorithm_exists(&algorithm.dll) {
                    bail!("{label}: unknown algorithm '{}'", algorithm.dll);
                }
                params::parse_scheduler(algorithm.scheduler.as_deref())?;
                params::parse_priority(algorithm.priority.as_deref())?;
                for output in &algorithm.outputs {
                    let Some(type_name) = output.type_name.as_deref() else {
                        bail!("{label}: algorithm '{}' output without a type", algorithm.dll);
                    };
                    if !catalog::type_exists(type_name) {
                        bail!("{label}: unknown message type '{}'", type_name);
                    }
                }
                for param in &algorithm.params {
                    params::param_value(param)?;
                }
            }
            TaskElement::FileIn(filein) => {
                if filein.path.is_empty() {
                    bail!("{label}: filein element without a path");
                }
                if !catalog::type_exists(&filein.type_name) {
                    bail!("{label}: unknown message type '{}'", filein.type_name);
                }
                params::parse_scheduler(filein.scheduler.as_deref())?;
            }
            TaskElement::FileOut(fileout) => {
                if fileout.path.is_empty() {
                    bail!("{label}: fileout element without a path");
                }
                if let Some(type_name) = fileout.type_name.as_deref() {
                    if !catalog::type_exists(type_name) {
                        bail!("{label}: unknown message type '{}'", type_name);
                    }
                }
            }
            TaskElement::Publisher(publisher) => {
                validate_transport(&label, publisher.transport.as_deref())?;
                params::parse_port(publisher.port.as_deref(), 0)?;
            }
            TaskElement::Subscriber(subscriber) => {
                validate_transport(&label, subscriber.transport.as_deref())?;
                params::parse_port(subscriber.port.as_deref(), 0)?;
            }
            TaskElement::Vme(vme) => {
                params::parse_port(Some(&vme.port), 0)?;
            }
            TaskElement::Tspi(tspi) => {
                params::parse_port(Some(&tspi.port), 0)?;
            }
        }
    }
    Ok(())
}

fn validate_transport(label: &str, transport: Option<&str>) -> Result<()> {
    match transport {
        None | Some("multicast") | Some("tcp") | Some("udp") => Ok(()),
        Some(other) => bail!("{label}: invalid transport attribute '{other}'"),
    }
}
