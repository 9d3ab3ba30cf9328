//! System resource checks
//!
//! Free-memory guard applied before loading a model.

use crate::inference::backend::EngineError;

/// Memory the OS reports as available for new allocations, in MiB.
///
/// Linux only (`MemAvailable` in `/proc/meminfo`). Other platforms return
/// `None` and the load guard is skipped.
pub fn available_memory_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(text) => parse_meminfo_available(&text),
            Err(e) => {
                tracing::debug!("Cannot read /proc/meminfo: {}", e);
                None
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Extracts `MemAvailable` from meminfo text, converted from kB to MiB
fn parse_meminfo_available(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Refuses a load when less than `required_mb` is available.
///
/// A requirement of 0 disables the check, as does an unknown amount.
pub fn ensure_free_memory(required_mb: u64, available_mb: Option<u64>) -> Result<(), EngineError> {
    if required_mb == 0 {
        return Ok(());
    }
    match available_mb {
        Some(available) if available < required_mb => Err(EngineError::InsufficientMemory {
            available_mb: available,
            required_mb,
        }),
        Some(available) => {
            tracing::debug!("Available memory: {}MB", available);
            Ok(())
        }
        None => {
            tracing::debug!("Available memory unknown, skipping check");
            Ok(())
        }
    }
}
