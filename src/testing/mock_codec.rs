//! Mock encoders.

use super::fixtures::{PANIC_SAMPLE, POISON_SAMPLE};
use crate::codec::{Encoded, Encoder, EncoderFactory};
use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic encoder: layer `i` holds `i + 1` copies of the waveform
/// length plus `i`.
///
/// Fails on any waveform containing [`POISON_SAMPLE`]. With `panics` set it
/// panics on waveforms containing [`PANIC_SAMPLE`].
#[derive(Debug, Clone)]
pub struct MockEncoder {
    pub num_layers: usize,
    pub delay: Duration,
    pub panics: bool,
}

impl Encoder for MockEncoder {
    fn encode(&mut self, waveform: &[f32]) -> Result<Encoded> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if waveform.contains(&POISON_SAMPLE) {
            bail!("poisoned waveform");
        }
        if self.panics && waveform.contains(&PANIC_SAMPLE) {
            panic!("mock encoder hit the panic marker");
        }
        let len = waveform.len() as i64;
        let layers: Vec<Vec<i64>> = (0..self.num_layers)
            .map(|i| vec![len + i as i64; i + 1])
            .collect();
        Ok(Encoded {
            token_lengths: layers.iter().map(Vec::len).collect(),
            layers,
            num_layers: self.num_layers,
        })
    }
}

/// Factory for [`MockEncoder`]s that counts loads and can refuse some ranks.
#[derive(Debug, Clone)]
pub struct MockFactory {
    template: MockEncoder,
    failing_devices: BTreeSet<usize>,
    loads: Arc<AtomicUsize>,
}

impl MockFactory {
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self {
            template: MockEncoder {
                num_layers,
                delay: Duration::ZERO,
                panics: false,
            },
            failing_devices: BTreeSet::new(),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long in every encode call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.template.delay = delay;
        self
    }

    /// Panic instead of failing on [`PANIC_SAMPLE`].
    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.template.panics = true;
        self
    }

    /// Make loading fail on these devices.
    #[must_use]
    pub fn failing_on(mut self, devices: impl IntoIterator<Item = usize>) -> Self {
        self.failing_devices.extend(devices);
        self
    }

    /// Successful and failed load attempts so far.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for MockFactory {
    fn load(&self, device: usize) -> Result<Box<dyn Encoder>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing_devices.contains(&device) {
            bail!("device {device} unavailable");
        }
        Ok(Box::new(self.template.clone()))
    }
}
