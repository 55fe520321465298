use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::format::ffmpeg::Ffmpeg;
use crate::format::FormatRegistry;
use crate::pipeline::EngineSettings;
use crate::probe::DEFAULT_PROBE_BYTES;

/// Used when the host reports no available memory
const FALLBACK_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// Configuration for the conversion engine and its scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Engines allowed to run at once
    pub max_parallel_jobs: usize,
    /// Upper bound on bytes buffered across all running jobs
    pub memory_budget_bytes: u64,
    /// Capacity of every inter-stage link
    pub buffer_packets: usize,
    /// Minimum spacing of fraction updates per job
    pub progress_interval_ms: u64,
    /// How much of each input is read for format detection
    pub probe_bytes: usize,
    /// Sample frames per packet when demuxing raw audio
    pub audio_packet_frames: u32,
    /// Keep `.part` files of failed or cancelled jobs
    pub keep_partial_output: bool,
    /// Directory where finished job records are stored
    pub job_state_dir: PathBuf,
    /// ffmpeg binary for containers the built-in families do not handle
    pub ffmpeg_bin: PathBuf,
    /// ffprobe binary used to probe those containers
    pub ffprobe_bin: PathBuf,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let engine = EngineSettings::default();
        Self {
            max_parallel_jobs: 2,
            memory_budget_bytes: default_memory_budget(),
            buffer_packets: engine.buffer_packets,
            progress_interval_ms: 250,
            probe_bytes: DEFAULT_PROBE_BYTES,
            audio_packet_frames: engine.audio_packet_frames,
            keep_partial_output: false,
            job_state_dir: PathBuf::from("/tmp/mconv-jobs"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        anyhow::ensure!(config.max_parallel_jobs > 0, "max_parallel_jobs must be at least 1");
        anyhow::ensure!(config.buffer_packets > 0, "buffer_packets must be at least 1");
        anyhow::ensure!(config.audio_packet_frames > 0, "audio_packet_frames must be at least 1");
        Ok(config)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            buffer_packets: self.buffer_packets,
            audio_packet_frames: self.audio_packet_frames,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn ffmpeg(&self) -> Ffmpeg {
        Ffmpeg::new(&self.ffmpeg_bin, &self.ffprobe_bin)
    }

    /// Every format family, with the configured ffmpeg binaries
    pub fn format_registry(&self) -> FormatRegistry {
        FormatRegistry::with_ffmpeg(self.ffmpeg())
    }
}

/// Half of what the host currently reports as available
fn default_memory_budget() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    match system.available_memory() / 2 {
        0 => FALLBACK_MEMORY_BUDGET,
        half => half,
    }
}
