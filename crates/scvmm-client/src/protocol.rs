//! Remote call convention
//!
//! Every call is one PowerShell command line, `Function -Param 'value' ...`,
//! answered by exactly one JSON document on stdout. String arguments are
//! quoted with single quotes and escaped by doubling embedded quotes; that is
//! the only escaping applied. Two answer shapes exist: [`VmResult`] for plain
//! calls and [`VmSpecResult`] for calls that echo the machine spec back.

use crate::error::ScvmmError;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Escape a string for use inside a single-quoted PowerShell literal
pub fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Builder for a single remote function call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    function: String,
    line: String,
}

impl CommandLine {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            line: function.to_string(),
        }
    }

    /// Name of the remote function being called
    pub fn function(&self) -> &str {
        &self.function
    }

    /// `-name 'value'`
    pub fn arg_str(mut self, name: &str, value: &str) -> Self {
        self.line.push_str(&format!(" -{name} '{}'", escape(value)));
        self
    }

    /// `-name 42`
    pub fn arg_int(mut self, name: &str, value: i64) -> Self {
        self.line.push_str(&format!(" -{name} {value}"));
        self
    }

    /// `-name @('a','b')`
    pub fn arg_array(mut self, name: &str, values: &[String]) -> Self {
        let items = values
            .iter()
            .map(|v| format!("'{}'", escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        self.line.push_str(&format!(" -{name} @({items})"));
        self
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Spec and metadata of a machine, serialised for a spec call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecPayload {
    pub spec: String,
    pub metadata: String,
}

impl SpecPayload {
    pub fn new<S: Serialize, M: Serialize>(spec: &S, metadata: &M) -> Result<Self, ScvmmError> {
        Ok(Self {
            spec: serde_json::to_string(spec)?,
            metadata: serde_json::to_string(metadata)?,
        })
    }

    /// `Function -spec '<json>' -metadata '<json>'`
    pub fn command(&self, function: &str) -> CommandLine {
        CommandLine::new(function)
            .arg_str("spec", &self.spec)
            .arg_str("metadata", &self.metadata)
    }
}

/// Raw text a call produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Size information of one virtual disk
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VirtualDiskInfo {
    #[serde(rename = "Size", deserialize_with = "null_as_default")]
    pub size: i64,
    #[serde(rename = "MaximumSize", deserialize_with = "null_as_default")]
    pub maximum_size: i64,
}

/// Answer of a plain remote call
///
/// An empty `name` from a lookup means the VM does not exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VmResult {
    #[serde(rename = "Cloud", deserialize_with = "null_as_default")]
    pub cloud: String,
    #[serde(rename = "Name", deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "Hostname", deserialize_with = "null_as_default")]
    pub hostname: String,
    #[serde(rename = "Status", deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(rename = "Memory", deserialize_with = "null_as_default")]
    pub memory: i64,
    #[serde(rename = "CpuCount", deserialize_with = "null_as_default")]
    pub cpu_count: i64,
    #[serde(rename = "VirtualNetwork", deserialize_with = "null_as_default")]
    pub virtual_network: String,
    #[serde(rename = "IPv4Addresses", deserialize_with = "one_or_many")]
    pub ipv4_addresses: Vec<String>,
    #[serde(rename = "VirtualDisks", deserialize_with = "one_or_many")]
    pub virtual_disks: Vec<VirtualDiskInfo>,
    #[serde(rename = "BiosGuid", deserialize_with = "null_as_default")]
    pub bios_guid: String,
    #[serde(rename = "Id", deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(rename = "VMId", deserialize_with = "null_as_default")]
    pub vm_id: String,
    #[serde(rename = "Error", deserialize_with = "null_as_default")]
    pub error: String,
    #[serde(rename = "ScriptErrors", deserialize_with = "null_as_default")]
    pub script_errors: String,
    #[serde(rename = "Message", deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(rename = "CreationTime", deserialize_with = "remote_time")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(rename = "ModifiedTime", deserialize_with = "remote_time")]
    pub modified_time: Option<DateTime<Utc>>,
}

impl VmResult {
    /// The VM exists on the remote side
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }

    /// Failure reported by the remote function or its wrapper
    pub fn failure(&self) -> Option<&str> {
        failure(&self.error, &self.script_errors)
    }
}

/// Answer of a spec call: failure channels plus the echoed spec fields
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmSpecResult {
    #[serde(rename = "Error", deserialize_with = "null_as_default")]
    pub error: String,
    #[serde(rename = "ScriptErrors", deserialize_with = "null_as_default")]
    pub script_errors: String,
    #[serde(rename = "Message", deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(flatten)]
    pub spec: serde_json::Map<String, serde_json::Value>,
}

impl VmSpecResult {
    pub fn failure(&self) -> Option<&str> {
        failure(&self.error, &self.script_errors)
    }

    /// Decode the echoed spec fields into a spec type
    pub fn decode_spec<S: DeserializeOwned>(&self) -> Result<S, ScvmmError> {
        Ok(serde_json::from_value(serde_json::Value::Object(self.spec.clone()))?)
    }
}

fn failure<'a>(error: &'a str, script_errors: &'a str) -> Option<&'a str> {
    [error, script_errors].into_iter().find(|s| !s.is_empty())
}

/// Decode the stdout of a plain call
pub fn decode_result(output: &CommandOutput) -> Result<VmResult, ScvmmError> {
    decode(output)
}

/// Decode the stdout of a spec call
pub fn decode_spec_result(output: &CommandOutput) -> Result<VmSpecResult, ScvmmError> {
    decode(output)
}

fn decode<T: DeserializeOwned>(output: &CommandOutput) -> Result<T, ScvmmError> {
    serde_json::from_str(output.stdout.trim()).map_err(|source| ScvmmError::Decode {
        source,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// PowerShell serialises one-element collections as the bare element
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
        None => Vec::new(),
    })
}

/// Accepts RFC 3339 strings and the `/Date(ms)/` form of ConvertTo-Json;
/// anything unparsable is treated as absent
fn remote_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => parse_remote_time(&s),
        Some(serde_json::Value::Object(map)) => map
            .get("value")
            .or_else(|| map.get("DateTime"))
            .and_then(serde_json::Value::as_str)
            .and_then(parse_remote_time),
        _ => None,
    })
}

fn parse_remote_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix("/Date(").and_then(|t| t.strip_suffix(")/")) {
        let end = inner
            .char_indices()
            .skip(1)
            .find(|(_, c)| !c.is_ascii_digit())
            .map_or(inner.len(), |(i, _)| i);
        let millis: i64 = inner[..end].parse().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
