//! Simulator settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `capture.toml` in the working directory, then `CAPTURE_*` environment
//! variables (`__` separates nested keys, e.g. `CAPTURE_ENGINE__RING_DEPTH`).

use config::{Config, Environment, File};
use dvp_capture::{EngineConfig, FrameRate};
use serde::{Deserialize, Serialize};

/// Named engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    LowLatency,
    Robust,
}

/// Simulated source behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Source clock error against the nominal rate (ppm)
    pub drift_ppm: i64,
    /// Drop one tick out of every this many; zero never drops
    pub skip_every: u64,
    /// Ticks to run before stopping
    pub ticks: u64,
    /// Real time between simulated ticks (us)
    pub pace_us: u64,
    /// Write one VBI packet per tick
    pub ancillary: bool,
    /// Switch to `switch_mode` after this many ticks
    pub switch_at: Option<u64>,
    pub switch_mode: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            drift_ppm: 40,
            skip_every: 0,
            ticks: 500,
            pace_us: 2000,
            ancillary: true,
            switch_at: None,
            switch_mode: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub log_level: String,
    /// Video mode selected at start
    pub mode: u32,
    /// Replaces `engine` when set
    pub preset: Option<Preset>,
    pub engine: EngineConfig,
    pub source: SourceSettings,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mode: 13,
            preset: None,
            engine: EngineConfig::default(),
            source: SourceSettings::default(),
        }
    }
}

impl SimSettings {
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings: SimSettings = Config::builder()
            .add_source(Config::try_from(&SimSettings::default())?)
            .add_source(File::with_name("capture").required(false))
            .add_source(
                Environment::with_prefix("CAPTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings.resolve())
    }

    fn resolve(mut self) -> Self {
        match self.preset {
            Some(Preset::LowLatency) => self.engine = EngineConfig::low_latency(),
            Some(Preset::Robust) => self.engine = EngineConfig::robust(),
            None => {}
        }
        self
    }

    /// Time of tick `ticks` after `start_us` at `rate` drifted by `drift_ppm`
    pub fn tick_time(&self, start_us: u64, rate: FrameRate, ticks: u64) -> u64 {
        let elapsed = rate.time_for_frames(ticks) as i128;
        let drift = elapsed * self.source.drift_ppm as i128 / 1_000_000;
        start_us + (elapsed + drift) as u64
    }
}
