//! Schema definitions for Procyon
//!
//! This crate contains the shared data structures used across the Procyon
//! process subsystem. All types here implement JSON Schema generation for
//! external consumption.

use schemars::JsonSchema;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Default chunk size for streaming reads, in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

bitflags::bitflags! {
    /// Option bit-set controlling how a child process is spawned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpawnOptions: u32 {
        /// Child inherits the parent environment when no explicit
        /// environment is supplied
        const INHERIT_ENVIRONMENT = 1 << 0;
        /// Merge the child's stderr into the stdout pipe; the handle then
        /// carries no separate stderr stream
        const COMBINED_STDOUT_STDERR = 1 << 1;
        /// Suppress console window creation on Windows; no-op elsewhere
        const NO_WINDOW = 1 << 2;
        /// Place the child in its own session and process group via
        /// `setsid()`, so signals can target the whole process tree
        const NEW_PROCESS_GROUP = 1 << 3;
    }
}

/// Flag names used for the serde representation of [`SpawnOptions`]
const SPAWN_OPTION_NAMES: &[(&str, SpawnOptions)] = &[
    ("inheritEnvironment", SpawnOptions::INHERIT_ENVIRONMENT),
    ("combinedStdoutStderr", SpawnOptions::COMBINED_STDOUT_STDERR),
    ("noWindow", SpawnOptions::NO_WINDOW),
    ("newProcessGroup", SpawnOptions::NEW_PROCESS_GROUP),
];

impl SpawnOptions {
    /// Names of the flags currently set, in declaration order
    pub fn flag_names(&self) -> Vec<&'static str> {
        SPAWN_OPTION_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Parse a single camelCase flag name
    pub fn from_flag_name(name: &str) -> Option<Self> {
        SPAWN_OPTION_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }
}

// Options serialize as a list of camelCase flag names rather than raw bits,
// so configuration files stay readable and unknown names fail loudly.
impl Serialize for SpawnOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flag_names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SpawnOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut options = SpawnOptions::empty();
        for name in &names {
            let flag = SpawnOptions::from_flag_name(name)
                .ok_or_else(|| D::Error::custom(format!("unknown spawn option '{name}'")))?;
            options |= flag;
        }
        Ok(options)
    }
}

impl JsonSchema for SpawnOptions {
    fn schema_name() -> String {
        "SpawnOptions".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        <Vec<String>>::json_schema(gen)
    }
}

/// Complete specification for spawning a child process
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSpec {
    /// Full command line; tokenized at spawn time honoring double quotes
    pub command: String,

    /// Option flags controlling spawn behavior
    #[serde(default)]
    pub options: SpawnOptions,

    /// Environment variables for the child. When non-empty, these replace
    /// the inherited environment entirely.
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Working directory for the child process
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_directory: Option<String>,

    /// Chunk size for streaming reads
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl SpawnSpec {
    /// Create a spec for `command` with default options and buffer size
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            options: SpawnOptions::default(),
            environment: HashMap::new(),
            working_directory: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set the option flags
    pub fn options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }

    /// Add one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the streaming read chunk size
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Current lifecycle state of a spawned process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    /// No native handle exists yet
    Unstarted,
    /// The child has been spawned and its handle is live
    Running,
    /// Cooperative shutdown has been requested
    ShuttingDown,
    /// The native handle has been released
    Terminated,
}

impl ProcessState {
    /// Whether a native handle currently exists
    pub fn has_handle(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::ShuttingDown)
    }
}

/// State of the asynchronous output pump
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PumpState {
    /// No sinks registered
    Idle,
    /// Sinks registered, background contexts not yet running
    Armed,
    /// At least one background context is pumping
    Running,
    /// All background contexts have exited
    Stopped,
}

/// Output stream identifier, used to tag pump dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Exit record for a child process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExit {
    /// Process ID of the exited child
    pub pid: u32,
    /// Exit code, if the process exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed (Unix only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Whether the process exited normally with code zero
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
