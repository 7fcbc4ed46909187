//! Records that flow through the pipeline.
//!
//! A [`WorkItem`] is built by a reader from one raw dataset row and handed to
//! exactly one worker through the queue. The worker turns it into an
//! [`EncodedRecord`], which is what lands (one JSON object per line) in the
//! output shards.
//!
//! Output line layout:
//!
//! ```text
//! {"text": "...", "snac_layer_1": [..], ..., "snac_layer_N": [..],
//!  "num_layers": N, "token_lengths": [..], "speaker": "...", <extra fields>}
//! ```
//!
//! `speaker` is omitted when the item had none. Extra fields are flattened
//! into the top-level object in key order.

use crate::codec::Encoded;
use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key prefix of the per-layer token arrays in output lines.
pub const LAYER_KEY_PREFIX: &str = "snac_layer_";

/// Keys a dataset's constant columns may not use.
pub const RESERVED_KEYS: &[&str] = &["text", "wave", "speaker", "num_layers", "token_lengths"];

/// Output key of the 1-based codec layer `index`.
#[must_use]
pub fn layer_key(index: usize) -> String {
    format!("{LAYER_KEY_PREFIX}{index}")
}

/// Returns true if `key` would collide with a field the worker writes itself.
#[must_use]
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key) || key.starts_with(LAYER_KEY_PREFIX)
}

/// A constant column value. Only scalars may be attached to records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Convert a JSON value, rejecting arrays, objects and null.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Fields carried through the pipeline untouched.
pub type ExtraFields = BTreeMap<String, Scalar>;

/// One unit of work: the raw inputs plus the dataset's constant metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub text: String,
    /// Mono samples at the run's sample rate.
    pub waveform: Vec<f32>,
    pub speaker: Option<String>,
    pub extra_fields: ExtraFields,
}

/// What travels through the work queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Work(WorkItem),
    /// End-of-stream marker; one per worker.
    Sentinel,
}

/// One encoded output line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct EncodedRecord {
    pub text: String,
    pub layers: Vec<Vec<i64>>,
    pub token_lengths: Vec<usize>,
    pub num_layers: usize,
    pub speaker: Option<String>,
    pub extra_fields: ExtraFields,
}

impl EncodedRecord {
    /// Merge a work item with its encoding.
    ///
    /// Text, speaker and every extra field are moved over from the item; the
    /// waveform is dropped.
    ///
    /// # Errors
    /// Fails if the encoding's layer count disagrees with its layers or lengths.
    pub fn assemble(item: WorkItem, encoded: Encoded) -> Result<Self> {
        let Encoded {
            layers,
            token_lengths,
            num_layers,
        } = encoded;
        ensure!(
            layers.len() == num_layers && token_lengths.len() == num_layers,
            "encoder returned {} layers and {} lengths for num_layers={}",
            layers.len(),
            token_lengths.len(),
            num_layers
        );
        Ok(Self {
            text: item.text,
            layers,
            token_lengths,
            num_layers,
            speaker: item.speaker,
            extra_fields: item.extra_fields,
        })
    }

    /// Serialize to a single JSON line, newline included.
    ///
    /// # Errors
    /// Fails only if serialization fails; nothing has been written yet in that case.
    pub fn to_json_line(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self).context("serialize encoded record")?;
        buf.push(b'\n');
        Ok(buf)
    }
}

impl Serialize for EncodedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 3
            + self.layers.len()
            + usize::from(self.speaker.is_some())
            + self.extra_fields.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("text", &self.text)?;
        for (i, layer) in self.layers.iter().enumerate() {
            map.serialize_entry(&layer_key(i + 1), layer)?;
        }
        map.serialize_entry("num_layers", &self.num_layers)?;
        map.serialize_entry("token_lengths", &self.token_lengths)?;
        if let Some(speaker) = &self.speaker {
            map.serialize_entry("speaker", speaker)?;
        }
        for (k, v) in &self.extra_fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl TryFrom<Map<String, Value>> for EncodedRecord {
    type Error = anyhow::Error;

    fn try_from(mut obj: Map<String, Value>) -> Result<Self> {
        let text = match obj.remove("text") {
            Some(Value::String(s)) => s,
            other => bail!("field `text` must be a string, got {other:?}"),
        };
        let num_layers = obj
            .remove("num_layers")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("field `num_layers` missing or not an integer"))?
            as usize;
        let token_lengths: Vec<usize> = serde_json::from_value(
            obj.remove("token_lengths")
                .ok_or_else(|| anyhow!("field `token_lengths` missing"))?,
        )
        .context("field `token_lengths`")?;

        let mut layers = Vec::with_capacity(num_layers);
        for i in 1..=num_layers {
            let key = layer_key(i);
            let layer: Vec<i64> = serde_json::from_value(
                obj.remove(&key).ok_or_else(|| anyhow!("field `{key}` missing"))?,
            )
            .with_context(|| format!("field `{key}`"))?;
            layers.push(layer);
        }
        ensure!(
            token_lengths.len() == num_layers,
            "{} token lengths for num_layers={num_layers}",
            token_lengths.len()
        );

        let speaker = match obj.remove("speaker") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => bail!("field `speaker` must be a string, got {other}"),
        };

        let mut extra_fields = ExtraFields::new();
        for (k, v) in obj {
            ensure!(!k.starts_with(LAYER_KEY_PREFIX), "unexpected layer field `{k}`");
            let scalar = Scalar::from_json(&v)
                .ok_or_else(|| anyhow!("extra field `{k}` is not a scalar: {v}"))?;
            extra_fields.insert(k, scalar);
        }

        Ok(Self {
            text,
            layers,
            token_lengths,
            num_layers,
            speaker,
            extra_fields,
        })
    }
}
