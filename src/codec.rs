//! The encoding capability seen from the pipeline.
//!
//! Workers never look inside an encoder. Each worker asks an
//! [`EncoderFactory`] for an [`Encoder`] bound to its accelerator unit once,
//! while loading, and then calls [`Encoder::encode`] once per work item.
//! Encoders are created on the worker's own thread and never cross threads,
//! so they need not be `Send`.
//!
//! [`MultiScaleQuantizer`] is a small deterministic CPU codec with the same
//! output shape as a hierarchical neural audio codec (coarse layer first,
//! each following layer at twice the temporal resolution). It lets the
//! binary and the tests run the full pipeline without accelerator hardware.

use anyhow::{bail, Result};

/// Encoder output for one waveform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// One token array per codec layer, coarsest first.
    pub layers: Vec<Vec<i64>>,
    /// `layers[i].len()` for each layer.
    pub token_lengths: Vec<usize>,
    pub num_layers: usize,
}

/// A loaded encoder bound to one accelerator unit.
pub trait Encoder {
    /// Encode a mono waveform.
    ///
    /// # Errors
    /// Malformed input is reported as an error; the caller drops that item.
    fn encode(&mut self, waveform: &[f32]) -> Result<Encoded>;
}

/// Loads encoders. Shared by all workers of a run.
pub trait EncoderFactory: Send + Sync {
    /// Bind a new encoder to accelerator unit `device`.
    ///
    /// # Errors
    /// A failure here is fatal for the calling worker.
    fn load(&self, device: usize) -> Result<Box<dyn Encoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn(usize) -> Result<Box<dyn Encoder>> + Send + Sync,
{
    fn load(&self, device: usize) -> Result<Box<dyn Encoder>> {
        self(device)
    }
}

/// Sample rate and layer count implied by a codec model id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpec {
    pub model_id: String,
    pub sample_rate: u32,
    pub num_layers: usize,
}

impl CodecSpec {
    /// Derive the spec from a model id such as `hubertsiuzdak/snac_24khz`.
    ///
    /// Unknown ids fall back to the 24 kHz, 3-layer configuration.
    #[must_use]
    pub fn from_model_id(model_id: &str) -> Self {
        let (sample_rate, num_layers) = if model_id.contains("24khz") {
            (24_000, 3)
        } else if model_id.contains("32khz") {
            (32_000, 4)
        } else if model_id.contains("44khz") {
            (44_000, 4)
        } else {
            (24_000, 3)
        };
        Self {
            model_id: model_id.to_string(),
            sample_rate,
            num_layers,
        }
    }
}

/// Samples per token on the finest layer.
pub const FINEST_HOP: usize = 512;
/// Number of distinct token values per layer.
pub const CODEBOOK_SIZE: i64 = 4096;

const FLOOR_DB: f32 = -100.0;

/// Deterministic multi-resolution RMS quantizer.
///
/// Layer `i` (0-based) uses a hop of `FINEST_HOP << (num_layers - 1 - i)`
/// samples. The waveform is zero-padded to a multiple of the coarsest hop so
/// every layer tiles it exactly, and each frame's RMS level is mapped on a
/// log scale from -100 dBFS..0 dBFS onto `0..CODEBOOK_SIZE`.
#[derive(Debug, Clone)]
pub struct MultiScaleQuantizer {
    num_layers: usize,
    finest_hop: usize,
}

impl MultiScaleQuantizer {
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self::with_hop(num_layers, FINEST_HOP)
    }

    #[must_use]
    pub fn with_hop(num_layers: usize, finest_hop: usize) -> Self {
        Self {
            num_layers: num_layers.max(1),
            finest_hop: finest_hop.max(1),
        }
    }

    fn hop(&self, layer: usize) -> usize {
        self.finest_hop << (self.num_layers - 1 - layer)
    }

    fn quantize(frame: &[f32]) -> i64 {
        let energy: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        let db = 20.0 * energy.sqrt().max(1e-5).log10();
        let unit = ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0);
        (unit * (CODEBOOK_SIZE - 1) as f32).round() as i64
    }
}

impl Encoder for MultiScaleQuantizer {
    fn encode(&mut self, waveform: &[f32]) -> Result<Encoded> {
        if waveform.is_empty() {
            bail!("empty waveform");
        }
        if let Some(pos) = waveform.iter().position(|s| !s.is_finite()) {
            bail!("non-finite sample at index {pos}");
        }

        let coarsest = self.hop(0);
        let padded_len = waveform.len().div_ceil(coarsest) * coarsest;
        let mut padded = waveform.to_vec();
        padded.resize(padded_len, 0.0);

        let layers: Vec<Vec<i64>> = (0..self.num_layers)
            .map(|layer| padded.chunks(self.hop(layer)).map(Self::quantize).collect())
            .collect();
        let token_lengths = layers.iter().map(Vec::len).collect();

        Ok(Encoded {
            layers,
            token_lengths,
            num_layers: self.num_layers,
        })
    }
}

/// Hands every worker its own [`MultiScaleQuantizer`].
#[derive(Debug, Clone)]
pub struct QuantizerFactory {
    spec: CodecSpec,
}

impl QuantizerFactory {
    #[must_use]
    pub fn new(spec: CodecSpec) -> Self {
        Self { spec }
    }
}

impl EncoderFactory for QuantizerFactory {
    fn load(&self, device: usize) -> Result<Box<dyn Encoder>> {
        tracing::debug!(device, model = %self.spec.model_id, "loading quantizer");
        Ok(Box::new(MultiScaleQuantizer::new(self.spec.num_layers)))
    }
}
