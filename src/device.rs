//! Accelerator discovery. One worker runs per accelerator unit.

/// Number of visible accelerator units.
///
/// With the `nvml` feature the NVIDIA management library is asked first.
/// Otherwise (or when NVML is unavailable) `CUDA_VISIBLE_DEVICES` is parsed.
#[must_use]
pub fn detect_accelerators() -> usize {
    #[cfg(feature = "nvml")]
    {
        match nvml_wrapper::Nvml::init().and_then(|nvml| nvml.device_count()) {
            Ok(n) => return n as usize,
            Err(e) => {
                tracing::debug!(error = %e, "NVML unavailable, falling back to CUDA_VISIBLE_DEVICES");
            }
        }
    }
    std::env::var("CUDA_VISIBLE_DEVICES")
        .map(|v| count_visible_devices(&v))
        .unwrap_or(0)
}

/// Count the entries of a `CUDA_VISIBLE_DEVICES` value.
///
/// The list ends at the first invalid entry (CUDA ignores everything after
/// it); `-1` or an empty value hides every device.
#[must_use]
pub fn count_visible_devices(value: &str) -> usize {
    value
        .split(',')
        .map(str::trim)
        .take_while(|entry| !entry.is_empty() && !entry.starts_with('-'))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_visible_device_lists() {
        assert_eq!(count_visible_devices("0,1,2"), 3);
        assert_eq!(count_visible_devices("GPU-8f2a, GPU-11bc"), 2);
        assert_eq!(count_visible_devices(""), 0);
        assert_eq!(count_visible_devices("-1"), 0);
        assert_eq!(count_visible_devices("0,-1,2"), 1);
    }
}
