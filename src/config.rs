use crate::error::{Result, TsError};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Thresholds consumed by [`crate::buffering::DefaultBufferingPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferingConfig {
    /// Buffered duration required to finish the initial (startup) buffering.
    pub duration_starting_done: Duration,
    /// Buffered duration required to finish a mid-stream rebuffer.
    pub duration_buffering_done: Duration,
    /// Buffering always completes once this much is buffered, whatever the byte count.
    pub duration_buffering_max: Duration,
    /// Bytes that must arrive after exhaustion before startup buffering completes.
    pub bytes_minimum_starting: usize,
    /// Bytes that must arrive after exhaustion before a rebuffer completes.
    pub bytes_minimum: usize,
    /// Hard ceiling: reads are blocked and buffering completes past this size.
    pub bytes_maximum: usize,
    /// High-water mark: reads are paused once the weakest stream holds this much.
    pub duration_read_disable: Duration,
    /// Low-water mark: paused reads resume once the weakest stream drops below this.
    pub duration_read_enable: Duration,
    /// Minimum interval between two buffering progress recomputations.
    pub progress_interval: Duration,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            duration_starting_done: Duration::from_millis(2500),
            duration_buffering_done: Duration::from_secs(6),
            duration_buffering_max: Duration::from_secs(12),
            bytes_minimum_starting: 96 * 1024,
            bytes_minimum: 256 * 1024,
            bytes_maximum: 8 * 1024 * 1024,
            duration_read_disable: Duration::from_secs(30),
            duration_read_enable: Duration::from_secs(20),
            progress_interval: Duration::from_millis(250),
        }
    }
}

impl BufferingConfig {
    /// Checks that the water marks and minimums are ordered sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.duration_read_enable > self.duration_read_disable {
            return Err(TsError::Config(
                "duration_read_enable must not exceed duration_read_disable".into(),
            ));
        }
        if self.bytes_minimum_starting > self.bytes_maximum || self.bytes_minimum > self.bytes_maximum {
            return Err(TsError::Config(
                "byte minimums must not exceed bytes_maximum".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemuxerConfig {
    /// Chunk size used by [`crate::format::ts::TsDemuxer::read_from`].
    pub read_chunk_size: usize,
    /// Upper bound on a pass-through PES unit that never signals its length.
    pub max_pes_length: usize,
    /// How many idle buffers each pool tier keeps around.
    pub pool_max_cached_per_tier: usize,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 64 * 1024,
            max_pes_length: 4 * 1024 * 1024,
            pool_max_cached_per_tier: 64,
        }
    }
}

/// Session configuration. Built once and handed to constructors; there is no
/// process-wide instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub buffering: BufferingConfig,
    pub demuxer: DemuxerConfig,
}

const ENV_PREFIX: &str = "TSDEMUX_";

impl Config {
    /// Defaults overridden by any `TSDEMUX_*` environment variable that is set.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        for key in KEYS {
            if let Ok(value) = env::var(format!("{}{}", ENV_PREFIX, key.to_uppercase())) {
                config.apply(key, &value)?;
            }
        }
        config.buffering.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_env`], then applies `key = value` lines from `path`
    /// when the file exists. Lines starting with `#` are comments.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Config::from_env()?;
        if let Ok(content) = fs::read_to_string(path.as_ref()) {
            config.apply_str(&content)?;
        }
        config.buffering.validate()?;
        Ok(config)
    }

    pub fn apply_str(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TsError::Config(format!("malformed line: {}", line)));
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            self.apply(key.trim(), value)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let b = &mut self.buffering;
        let d = &mut self.demuxer;
        match key {
            "duration_starting_done_ms" => b.duration_starting_done = millis(value)?,
            "duration_buffering_done_ms" => b.duration_buffering_done = millis(value)?,
            "duration_buffering_max_ms" => b.duration_buffering_max = millis(value)?,
            "bytes_minimum_starting" => b.bytes_minimum_starting = value.parse()?,
            "bytes_minimum" => b.bytes_minimum = value.parse()?,
            "bytes_maximum" => b.bytes_maximum = value.parse()?,
            "duration_read_disable_ms" => b.duration_read_disable = millis(value)?,
            "duration_read_enable_ms" => b.duration_read_enable = millis(value)?,
            "progress_interval_ms" => b.progress_interval = millis(value)?,
            "read_chunk_size" => d.read_chunk_size = nonzero(value)?,
            "max_pes_length" => d.max_pes_length = nonzero(value)?,
            "pool_max_cached_per_tier" => d.pool_max_cached_per_tier = nonzero(value)?,
            other => return Err(TsError::Config(format!("unknown key: {}", other))),
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "duration_starting_done_ms",
    "duration_buffering_done_ms",
    "duration_buffering_max_ms",
    "bytes_minimum_starting",
    "bytes_minimum",
    "bytes_maximum",
    "duration_read_disable_ms",
    "duration_read_enable_ms",
    "progress_interval_ms",
    "read_chunk_size",
    "max_pes_length",
    "pool_max_cached_per_tier",
];

fn millis(value: &str) -> Result<Duration> {
    Ok(Duration::from_millis(value.parse()?))
}

fn nonzero(value: &str) -> Result<usize> {
    let n: usize = value.parse()?;
    if n == 0 {
        return Err(TsError::Config("value must be non-zero".into()));
    }
    Ok(n)
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# tsdemux configuration
# Every key may also be set through a TSDEMUX_<KEY> environment variable.

duration_starting_done_ms = 2500
duration_buffering_done_ms = 6000
duration_buffering_max_ms = 12000
bytes_minimum_starting = 98304
bytes_minimum = 262144
bytes_maximum = 8388608
duration_read_disable_ms = 30000
duration_read_enable_ms = 20000
progress_interval_ms = 250

read_chunk_size = 65536
max_pes_length = 4194304
pool_max_cached_per_tier = 64
"#;
        fs::write(path, template)?;
    }
    Ok(())
}
