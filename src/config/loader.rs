//! Configuration loading.

use crate::config::schema::RunnerConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Load a runner configuration from an XML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RunnerConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    load_config_from_str(&content)
        .with_context(|| format!("parsing configuration file {}", path.display()))
}

/// Load a runner configuration from XML content in memory. Useful in tests
/// and anywhere configuration comes from a non-file source.
pub fn load_config_from_str(content: &str) -> Result<RunnerConfig> {
    let config: RunnerConfig =
        quick_xml::de::from_str(content).context("malformed runner XML")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TaskElement;

    #[test]
    fn parses_a_full_stream_definition() {
        let xml = r#"
            <runner name="playback">
              <stream name="main">
                <filein type="Video" path="capture.pri" signalEndOfFile="1"/>
                <algorithm dll="Offset" name="offset" threaded="true" scheduler="SCHED_FIFO" priority="10">
                  <input type="Video"/>
                  <output type="Video" channel="offset-out"/>
                  <param name="offset" type="int" value="100"/>
                </algorithm>
                <fileout type="Video" path="shifted.pri" acquireBasisTimeStamps="1"/>
              </stream>
            </runner>
        "#;

        let config = load_config_from_str(xml).unwrap();
        assert_eq!(config.name.as_deref(), Some("playback"));
        assert_eq!(config.streams.len(), 1);

        let stream = &config.streams[0];
        assert_eq!(stream.name.as_deref(), Some("main"));
        assert_eq!(stream.tasks.len(), 3);

        // Document order is preserved.
        assert!(matches!(stream.tasks[0], TaskElement::FileIn(_)));
        assert!(matches!(stream.tasks[1], TaskElement::Algorithm(_)));
        assert!(matches!(stream.tasks[2], TaskElement::FileOut(_)));

        let TaskElement::Algorithm(algorithm) = &stream.tasks[1] else {
            unreachable!();
        };
        assert_eq!(algorithm.dll, "Offset");
        assert_eq!(algorithm.inputs.len(), 1);
        assert_eq!(algorithm.outputs[0].channel.as_deref(), Some("offset-out"));
        assert_eq!(algorithm.params[0].name, "offset");
        assert_eq!(algorithm.params[0].value, "100");
    }

    #[test]
    fn parses_pubsub_elements() {
        let xml = r#"
            <runner>
              <stream>
                <subscriber name="radar" type="Video" transport="multicast" bufferSize="65536"/>
                <publisher name="plots" type="Extractions" transport="tcp" port="5500"/>
              </stream>
            </runner>
        "#;

        let config = load_config_from_str(xml).unwrap();
        let stream = &config.streams[0];
        let TaskElement::Subscriber(subscriber) = &stream.tasks[0] else {
            panic!("expected subscriber");
        };
        assert_eq!(subscriber.transport.as_deref(), Some("multicast"));
        let TaskElement::Publisher(publisher) = &stream.tasks[1] else {
            panic!("expected publisher");
        };
        assert_eq!(publisher.port.as_deref(), Some("5500"));
    }

    #[test]
    fn rejects_unknown_elements() {
        let xml = r#"
            <runner>
              <stream>
                <teleporter target="elsewhere"/>
              </stream>
            </runner>
        "#;
        assert!(load_config_from_str(xml).is_err());
    }
}
