//! Scheduler configuration
//!
//! Values are layered in this order, later layers overriding earlier ones:
//! 1. Defaults
//! 2. `VOLTERRA_*` environment variables
//! 3. A `volterra-plugins.yaml` file
//!
//! The result is checked with [`SchedulerConfig::validate`] before a
//! scheduler accepts it.

use crate::common::env_loader::EnvLoader;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the YAML configuration file
pub const CONFIG_FILE_NAME: &str = "volterra-plugins.yaml";

/// Queue used when a job does not name one
pub const DEFAULT_QUEUE: &str = "analysis";

const DEFAULT_LOAD_THRESHOLD: f64 = 90.0;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file from disk
    #[error("Failed to read configuration file {path}: {source}")]
    FileRead {
        /// Path to the configuration file that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML content from a configuration file
    #[error("Invalid YAML syntax in {path}:\n{source}\n\nHint: Check for proper indentation and YAML formatting")]
    YamlParse {
        /// Path to the configuration file with invalid YAML content
        path: PathBuf,
        /// Underlying YAML parsing error
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value for a specific field
    #[error("Invalid configuration value for '{field}': {value}\n{hint}")]
    InvalidValue {
        /// Name of the field
        field: String,
        /// The rejected value
        value: String,
        /// How to fix it
        hint: String,
    },

    /// Configuration is inconsistent as a whole
    #[error("Configuration validation failed: {message}")]
    Validation {
        /// What is inconsistent
        message: String,
    },
}

/// Worker slots for a queue when none are configured: 75% of the CPUs, at least 2
pub fn default_max_concurrent_jobs() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cpus as f64 * 0.75).floor() as usize).max(2)
}

/// Settings for one named queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub queue_type: String,
    /// Worker slots; at most this many jobs of the queue run at once
    pub max_concurrent_jobs: usize,
    /// Jobs start only while system CPU load is below this percentage
    pub cpu_load_threshold: f64,
    /// Jobs start only while system RAM usage is below this percentage
    pub ram_load_threshold: f64,
    /// Per-job timeout; `None` runs jobs unbounded
    pub timeout: Option<Duration>,
}

impl QueueConfig {
    pub fn new(queue_type: impl Into<String>) -> Self {
        Self {
            queue_type: queue_type.into(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            cpu_load_threshold: DEFAULT_LOAD_THRESHOLD,
            ram_load_threshold: DEFAULT_LOAD_THRESHOLD,
            timeout: None,
        }
    }

    pub fn with_max_concurrent_jobs(mut self, slots: usize) -> Self {
        self.max_concurrent_jobs = slots;
        self
    }

    pub fn with_thresholds(mut self, cpu: f64, ram: f64) -> Self {
        self.cpu_load_threshold = cpu;
        self.ram_load_threshold = ram;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_type.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "queue_type".to_string(),
                value: self.queue_type.clone(),
                hint: "queue names cannot be empty".to_string(),
            });
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_concurrent_jobs", self.queue_type),
                value: "0".to_string(),
                hint: "a queue needs at least one worker slot".to_string(),
            });
        }
        for (field, value) in [
            ("cpu_load_threshold", self.cpu_load_threshold),
            ("ram_load_threshold", self.ram_load_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.{}", self.queue_type, field),
                    value: value.to_string(),
                    hint: "load thresholds are percentages in (0, 100]".to_string(),
                });
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.timeout", self.queue_type),
                value: "0".to_string(),
                hint: "omit the timeout to run jobs unbounded".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a job scheduler and the components it drives
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Root directory holding one sub-directory per plugin
    pub plugins_dir: PathBuf,
    /// Queue used by jobs that do not name one
    pub default_queue: String,
    pub queues: Vec<QueueConfig>,
    /// Idle sleep of a queue's dispatch loop between admission checks
    pub tick_interval: Duration,
    /// How often running jobs are compared against their timeout
    pub watchdog_interval: Duration,
    /// How often system load is sampled
    pub load_sample_interval: Duration,
    /// Time a terminated process gets before it is killed
    pub termination_grace: Duration,
    /// Delay before retrying a "text file busy" spawn
    pub spawn_retry_delay: Duration,
    pub health_check_interval: Duration,
    /// Fraction of the timeout after which a running job is reported as slow
    pub timeout_warning_ratio: f64,
    /// Largest single message accepted from a plugin's output stream
    pub max_frame_bytes: usize,
    /// Stderr lines kept for failure messages
    pub stderr_tail_lines: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            default_queue: DEFAULT_QUEUE.to_string(),
            queues: vec![QueueConfig::new(DEFAULT_QUEUE)],
            tick_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_secs(1),
            load_sample_interval: Duration::from_secs(1),
            termination_grace: crate::process::DEFAULT_TERMINATION_GRACE,
            spawn_retry_delay: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(30),
            timeout_warning_ratio: 0.9,
            max_frame_bytes: crate::stream::DEFAULT_MAX_FRAME_BYTES,
            stderr_tail_lines: crate::process::DEFAULT_STDERR_TAIL_LINES,
        }
    }
}

fn default_plugins_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("volterra-plugins").join("plugins"))
        .unwrap_or_else(|| PathBuf::from("plugins"))
}

impl SchedulerConfig {
    /// Defaults, then environment, then the first YAML file found
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_vars(&EnvLoader::default());

        if let Some(path) = Self::find_yaml_config_file() {
            YamlConfig::load_from_file(&path)?.apply_to_config(&mut config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults, then environment, then the given YAML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_vars(&EnvLoader::default());
        YamlConfig::load_from_file(path)?.apply_to_config(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn with_plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = dir.into();
        self
    }

    /// Add a queue, replacing any existing queue of the same type
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        match self
            .queues
            .iter_mut()
            .find(|q| q.queue_type == queue.queue_type)
        {
            Some(existing) => *existing = queue,
            None => self.queues.push(queue),
        }
        self
    }

    pub fn queue(&self, queue_type: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.queue_type == queue_type)
    }

    fn default_queue_mut(&mut self) -> Option<&mut QueueConfig> {
        let name = self.default_queue.clone();
        self.queues.iter_mut().find(|q| q.queue_type == name)
    }

    /// Apply environment overrides; queue settings target the default queue
    pub fn apply_env_vars(&mut self, loader: &EnvLoader) {
        if let Some(dir) = loader.load_path("PLUGINS_DIR") {
            self.plugins_dir = dir;
        }
        if let Some(interval) = loader.load_duration_secs("HEALTH_CHECK_INTERVAL_SECS") {
            self.health_check_interval = interval;
        }
        if let Some(interval) = loader.load_duration_millis("TICK_INTERVAL_MS") {
            self.tick_interval = interval;
        }

        let slots = loader.load_optional::<usize>("MAX_CONCURRENT_JOBS");
        let cpu = loader.load_optional::<f64>("CPU_LOAD_THRESHOLD");
        let ram = loader.load_optional::<f64>("RAM_LOAD_THRESHOLD");
        let timeout = loader.load_optional::<u64>("JOB_TIMEOUT_SECS");

        if let Some(queue) = self.default_queue_mut() {
            if let Some(slots) = slots {
                queue.max_concurrent_jobs = slots;
            }
            if let Some(cpu) = cpu {
                queue.cpu_load_threshold = cpu;
            }
            if let Some(ram) = ram {
                queue.ram_load_threshold = ram;
            }
            if let Some(secs) = timeout {
                // 0 clears the timeout
                queue.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }
    }

    /// Validate the current configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Validation {
                message: "at least one queue must be configured".to_string(),
            });
        }

        for (i, queue) in self.queues.iter().enumerate() {
            queue.validate()?;
            if self.queues[..i]
                .iter()
                .any(|q| q.queue_type == queue.queue_type)
            {
                return Err(ConfigError::Validation {
                    message: format!("queue '{}' is configured more than once", queue.queue_type),
                });
            }
        }

        if self.queue(&self.default_queue).is_none() {
            return Err(ConfigError::Validation {
                message: format!(
                    "default queue '{}' is not among the configured queues",
                    self.default_queue
                ),
            });
        }

        for (field, interval) in [
            ("tick_interval", self.tick_interval),
            ("watchdog_interval", self.watchdog_interval),
            ("load_sample_interval", self.load_sample_interval),
            ("health_check_interval", self.health_check_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    hint: format!("{} must be greater than zero", field),
                });
            }
        }

        if !(self.timeout_warning_ratio > 0.0 && self.timeout_warning_ratio <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "timeout_warning_ratio".to_string(),
                value: self.timeout_warning_ratio.to_string(),
                hint: "the warning ratio is a fraction in (0, 1]".to_string(),
            });
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_bytes".to_string(),
                value: "0".to_string(),
                hint: "max_frame_bytes must be greater than zero".to_string(),
            });
        }

        if self.stderr_tail_lines == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stderr_tail_lines".to_string(),
                value: "0".to_string(),
                hint: "keep at least one stderr line".to_string(),
            });
        }

        Ok(())
    }

    /// Find the configuration file
    ///
    /// Search order:
    /// 1. `./volterra-plugins.yaml`
    /// 2. `~/.config/volterra-plugins/volterra-plugins.yaml`
    pub fn find_yaml_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home_dir) = dirs::home_dir() {
            search_paths.push(
                home_dir
                    .join(".config")
                    .join("volterra-plugins")
                    .join(CONFIG_FILE_NAME),
            );
        }

        for config_path in search_paths {
            if let Some(path) = Self::check_config_file(&config_path) {
                tracing::debug!("Found configuration file: {:?}", path);
                return Some(path);
            }
        }

        tracing::debug!("No {} found in any search location", CONFIG_FILE_NAME);
        None
    }

    /// Check if a configuration file exists and is readable
    pub fn check_config_file(config_path: &Path) -> Option<PathBuf> {
        match config_path.try_exists() {
            Ok(true) if config_path.is_file() => match std::fs::File::open(config_path) {
                Ok(_) => Some(config_path.to_path_buf()),
                Err(e) => {
                    tracing::warn!(
                        "Configuration file {:?} exists but cannot be read: {}",
                        config_path,
                        e
                    );
                    None
                }
            },
            Ok(false) => None,
            Ok(true) => {
                tracing::debug!("Found {:?} but it is not a file", config_path);
                None
            }
            Err(e) => {
                tracing::warn!("Error checking for configuration file {:?}: {}", config_path, e);
                None
            }
        }
    }
}

/// One queue entry in `volterra-plugins.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlQueueConfig {
    #[serde(rename = "type")]
    pub queue_type: String,
    pub max_concurrent_jobs: Option<usize>,
    pub cpu_load_threshold: Option<f64>,
    pub ram_load_threshold: Option<f64>,
    pub timeout_secs: Option<u64>,
}

/// Configuration loaded from `volterra-plugins.yaml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlConfig {
    pub plugins_dir: Option<PathBuf>,
    pub default_queue: Option<String>,
    #[serde(default)]
    pub queues: Vec<YamlQueueConfig>,
    pub tick_interval_ms: Option<u64>,
    pub watchdog_interval_ms: Option<u64>,
    pub load_sample_interval_ms: Option<u64>,
    pub termination_grace_ms: Option<u64>,
    pub spawn_retry_delay_ms: Option<u64>,
    pub health_check_interval_secs: Option<u64>,
    pub timeout_warning_ratio: Option<f64>,
    pub max_frame_bytes: Option<usize>,
    pub stderr_tail_lines: Option<usize>,
}

impl YamlConfig {
    /// Load YAML configuration from a file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading YAML configuration from: {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: YamlConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(config)
    }

    /// Apply YAML values on top of `config`; queues are merged by type
    pub fn apply_to_config(&self, config: &mut SchedulerConfig) {
        if let Some(ref dir) = self.plugins_dir {
            config.plugins_dir = dir.clone();
        }
        if let Some(ref queue) = self.default_queue {
            config.default_queue = queue.clone();
        }

        for yaml_queue in &self.queues {
            let index = match config
                .queues
                .iter()
                .position(|q| q.queue_type == yaml_queue.queue_type)
            {
                Some(index) => index,
                None => {
                    config.queues.push(QueueConfig::new(&yaml_queue.queue_type));
                    config.queues.len() - 1
                }
            };
            let queue = &mut config.queues[index];
            if let Some(slots) = yaml_queue.max_concurrent_jobs {
                queue.max_concurrent_jobs = slots;
            }
            if let Some(cpu) = yaml_queue.cpu_load_threshold {
                queue.cpu_load_threshold = cpu;
            }
            if let Some(ram) = yaml_queue.ram_load_threshold {
                queue.ram_load_threshold = ram;
            }
            if let Some(secs) = yaml_queue.timeout_secs {
                queue.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        let millis = |value: Option<u64>, target: &mut Duration| {
            if let Some(ms) = value {
                *target = Duration::from_millis(ms);
            }
        };
        millis(self.tick_interval_ms, &mut config.tick_interval);
        millis(self.watchdog_interval_ms, &mut config.watchdog_interval);
        millis(self.load_sample_interval_ms, &mut config.load_sample_interval);
        millis(self.termination_grace_ms, &mut config.termination_grace);
        millis(self.spawn_retry_delay_ms, &mut config.spawn_retry_delay);

        if let Some(secs) = self.health_check_interval_secs {
            config.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(ratio) = self.timeout_warning_ratio {
            config.timeout_warning_ratio = ratio;
        }
        if let Some(bytes) = self.max_frame_bytes {
            config.max_frame_bytes = bytes;
        }
        if let Some(lines) = self.stderr_tail_lines {
            config.stderr_tail_lines = lines;
        }
    }

    /// Example file content
    pub fn example() -> &'static str {
        r#"# volterra-plugins.yaml
plugins_dir: /var/lib/volterra/plugins
default_queue: analysis
queues:
  - type: analysis
    max_concurrent_jobs: 4
    cpu_load_threshold: 90
    ram_load_threshold: 90
    timeout_secs: 1800
health_check_interval_secs: 30
"#
    }
}
