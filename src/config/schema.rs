//! Stream configuration structures.
//!
//! A runner is configured by an XML document: a `<runner>` element holding
//! one `<stream>` per pipeline, whose children describe tasks in the order
//! data flows through them. Attributes arrive as strings and are interpreted
//! by the helpers in [`crate::config::params`]; keeping the schema loose here
//! gives better error messages at validation time than serde type failures
//! would.
//!
//! # Example
//!
//! ```xml
//! <runner name="playback">
//!   <stream name="main">
//!     <filein type="Video" path="capture.pri" signalEndOfFile="1"/>
//!     <algorithm dll="Offset" name="offset" threaded="true">
//!       <input type="Video"/>
//!       <output type="Video" channel="offset-out"/>
//!       <param name="offset" type="int" value="100"/>
//!     </algorithm>
//!     <fileout type="Video" path="shifted.pri" acquireBasisTimeStamps="1"/>
//!   </stream>
//! </runner>
//! ```

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "stream", default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(rename = "@name")]
    pub name: Option<String>,
    /// Task elements in document order.
    #[serde(rename = "$value", default)]
    pub tasks: Vec<TaskElement>,
}

#[derive(Debug, Clone, Deserialize)]
pub enum TaskElement {
    #[serde(rename = "algorithm")]
    Algorithm(AlgorithmConfig),
    #[serde(rename = "filein")]
    FileIn(FileInConfig),
    #[serde(rename = "fileout")]
    FileOut(FileOutConfig),
    #[serde(rename = "publisher")]
    Publisher(PublisherConfig),
    #[serde(rename = "subscriber")]
    Subscriber(SubscriberConfig),
    #[serde(rename = "vme")]
    Vme(VmeConfig),
    #[serde(rename = "tspi")]
    Tspi(TspiConfig),
}

/// An `<input>` or `<output>` declaration inside an `<algorithm>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDecl {
    #[serde(rename = "@type")]
    pub type_name: Option<String>,
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
}

/// A `<param>` child of an `<algorithm>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamDecl {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub type_name: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "@dll")]
    pub dll: String,
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "@scheduler")]
    pub scheduler: Option<String>,
    #[serde(rename = "@priority")]
    pub priority: Option<String>,
    #[serde(rename = "@threaded")]
    pub threaded: Option<String>,
    #[serde(rename = "input", default)]
    pub inputs: Vec<ChannelDecl>,
    #[serde(rename = "output", default)]
    pub outputs: Vec<ChannelDecl>,
    #[serde(rename = "param", default)]
    pub params: Vec<ParamDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInConfig {
    #[serde(rename = "@type")]
    pub type_name: String,
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "@signalEndOfFile")]
    pub signal_end_of_file: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
    #[serde(rename = "@scheduler")]
    pub scheduler: Option<String>,
    #[serde(rename = "@priority")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileOutConfig {
    #[serde(rename = "@type")]
    pub type_name: Option<String>,
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "@acquireBasisTimeStamps")]
    pub acquire_basis_time_stamps: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
    #[serde(rename = "@scheduler")]
    pub scheduler: Option<String>,
    #[serde(rename = "@priority")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub type_name: String,
    #[serde(rename = "@transport")]
    pub transport: Option<String>,
    #[serde(rename = "@interface")]
    pub interface: Option<String>,
    #[serde(rename = "@host")]
    pub host: Option<String>,
    #[serde(rename = "@port")]
    pub port: Option<String>,
    #[serde(rename = "@bufferSize")]
    pub buffer_size: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
    #[serde(rename = "@scheduler")]
    pub scheduler: Option<String>,
    #[serde(rename = "@priority")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub type_name: String,
    #[serde(rename = "@transport")]
    pub transport: Option<String>,
    #[serde(rename = "@interface")]
    pub interface: Option<String>,
    #[serde(rename = "@port")]
    pub port: Option<String>,
    #[serde(rename = "@bufferSize")]
    pub buffer_size: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmeConfig {
    #[serde(rename = "@host")]
    pub host: String,
    #[serde(rename = "@port")]
    pub port: String,
    #[serde(rename = "@bufferSize")]
    pub buffer_size: Option<String>,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TspiConfig {
    #[serde(rename = "@host")]
    pub host: Option<String>,
    #[serde(rename = "@port")]
    pub port: String,
    #[serde(rename = "@channel")]
    pub channel: Option<String>,
}
