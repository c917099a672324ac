//! Component H: hardware facts used to size worker pools.

use std::fs;

/// CPU/memory/GPU facts used to recommend per-stage worker counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareProfile {
    pub cores: usize,
    /// Total system memory in bytes; `0` when it could not be determined.
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub has_gpu: bool,
}

/// Recommended worker counts for the three pipeline stages, per §4.3's
/// policy: extraction scales with cores, classification is capped to
/// protect the external rate limit, indexing sits in between; each is
/// halved when available memory is under 8 GiB.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCounts {
    pub extraction: usize,
    pub classification: usize,
    pub indexing: usize,
}

const LOW_MEMORY_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024 * 1024;

impl HardwareProfile {
    /// Probe the host. Degrades gracefully on non-Linux hosts (or sandboxes
    /// without `/proc`): returns `cores` only, with memory left at zero.
    pub fn probe() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let (memory_total_bytes, memory_available_bytes) = read_proc_meminfo().unwrap_or((0, 0));
        let has_gpu = detect_gpu();

        Self {
            cores,
            memory_total_bytes,
            memory_available_bytes,
            has_gpu,
        }
    }

    pub fn recommended_worker_counts(&self) -> WorkerCounts {
        let extraction = (self.cores.saturating_sub(2)).max(1);
        let classification = (self.cores / 4).clamp(1, 5);
        let indexing = (self.cores / 3).clamp(1, 10);

        let low_memory = self.memory_total_bytes > 0 && self.memory_total_bytes < LOW_MEMORY_THRESHOLD_BYTES;
        if low_memory {
            WorkerCounts {
                extraction: (extraction / 2).max(1),
                classification: (classification / 2).max(1),
                indexing: (indexing / 2).max(1),
            }
        } else {
            WorkerCounts {
                extraction,
                classification,
                indexing,
            }
        }
    }
}

/// Parse `MemTotal`/`MemAvailable` out of `/proc/meminfo`. Returns `None`
/// when the file doesn't exist (e.g. non-Linux hosts).
fn read_proc_meminfo() -> Option<(u64, u64)> {
    let contents = fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;

    for line in contents.lines() {
        if let Some(kb) = parse_meminfo_line(line, "MemTotal:") {
            total = Some(kb * 1024);
        } else if let Some(kb) = parse_meminfo_line(line, "MemAvailable:") {
            available = Some(kb * 1024);
        }
    }

    Some((total?, available.unwrap_or(0)))
}

fn parse_meminfo_line(line: &str, prefix: &str) -> Option<u64> {
    let rest = line.strip_prefix(prefix)?;
    rest.trim().split_whitespace().next()?.parse().ok()
}

fn detect_gpu() -> bool {
    fs::metadata("/dev/nvidia0").is_ok() || fs::metadata("/dev/dri").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_memory_skips_low_memory_halving() {
        let profile = HardwareProfile {
            cores: 8,
            memory_total_bytes: 0,
            memory_available_bytes: 0,
            has_gpu: false,
        };
        let counts = profile.recommended_worker_counts();
        assert_eq!(counts.extraction, 6);
        assert_eq!(counts.classification, 2);
        assert_eq!(counts.indexing, 2);
    }

    #[test]
    fn low_memory_halves_counts() {
        let profile = HardwareProfile {
            cores: 8,
            memory_total_bytes: 4 * 1024 * 1024 * 1024,
            memory_available_bytes: 1 * 1024 * 1024 * 1024,
            has_gpu: false,
        };
        let counts = profile.recommended_worker_counts();
        assert_eq!(counts.extraction, 3);
        assert_eq!(counts.classification, 1);
        assert_eq!(counts.indexing, 1);
    }

    #[test]
    fn classification_worker_count_is_capped_at_five() {
        let profile = HardwareProfile {
            cores: 64,
            memory_total_bytes: 64 * 1024 * 1024 * 1024,
            memory_available_bytes: 32 * 1024 * 1024 * 1024,
            has_gpu: false,
        };
        let counts = profile.recommended_worker_counts();
        assert_eq!(counts.classification, 5);
        assert_eq!(counts.indexing, 10);
    }

    #[test]
    fn meminfo_parsing_handles_missing_available_field() {
        let sample = "MemTotal:       16384000 kB\nMemFree:        1000 kB\n";
        let total = parse_meminfo_line(sample.lines().next().unwrap(), "MemTotal:");
        assert_eq!(total, Some(16384000));
    }
}
