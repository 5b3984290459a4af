use std::time::Duration;

use crate::{FilesError, FilesResult};

/// Prefix for environment overrides: `DOG_FILES__SESSION_TIMEOUT_SECS=600`
pub const ENV_PREFIX: &str = "DOG_FILES__";

/// Configuration for upload, storage and streaming
#[derive(Debug, Clone)]
pub struct FilesConfig {
    /// Rules for chunked uploads
    pub upload_rules: UploadRules,

    /// Inactivity after which an unfinished session is expired
    pub session_timeout: Duration,

    /// How often the expiry sweeper runs
    pub sweep_interval: Duration,

    /// Serve the finalized contiguous prefix of uploads still in progress
    pub allow_partial_reads: bool,

    /// Corrupt chunks tolerated per session before it is aborted
    pub max_corrupt_chunks: u32,

    /// Retries for transient storage failures
    pub storage_retries: u32,

    /// Base delay between storage retries (multiplied by the attempt number)
    pub retry_backoff: Duration,

    /// Size of each segment yielded by download streams
    pub read_segment_bytes: usize,

    /// Compute a SHA-256 over the blob at finalize time
    pub compute_checksum: bool,

    /// `Cache-Control` value attached to downloads
    pub cache_control: String,

    /// Buffer of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            upload_rules: UploadRules::default(),
            session_timeout: Duration::from_secs(3 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            allow_partial_reads: false,
            max_corrupt_chunks: 5,
            storage_retries: 3,
            retry_backoff: Duration::from_millis(50),
            read_segment_bytes: 64 * 1024,
            compute_checksum: true,
            cache_control: "public, max-age=31536000, s-maxage=31536000".to_string(),
            event_capacity: 1024,
        }
    }
}

/// Rules applied when an upload is initiated
#[derive(Debug, Clone)]
pub struct UploadRules {
    /// Chunk size used when the client does not ask for one
    pub default_chunk_size: u64,

    pub min_chunk_size: u64,

    pub max_chunk_size: u64,

    /// Upper bound on chunks per file (bounds bitmap memory)
    pub max_chunks: u64,

    /// Absolute max size allowed for a single file
    pub max_file_bytes: u64,

    /// Lower-case extensions without the dot; `None` accepts everything
    pub allowed_extensions: Option<Vec<String>>,
}

impl Default for UploadRules {
    fn default() -> Self {
        Self {
            default_chunk_size: 512 * 1024,
            min_chunk_size: 1,
            max_chunk_size: 64 * 1024 * 1024,
            max_chunks: 1_000_000,
            max_file_bytes: 100 * 1024 * 1024 * 1024,
            allowed_extensions: None,
        }
    }
}

impl FilesConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_rules(mut self, rules: UploadRules) -> Self {
        self.upload_rules = rules;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Opt in to streaming uploads that are still in progress
    pub fn allow_partial_reads(mut self) -> Self {
        self.allow_partial_reads = true;
        self
    }

    pub fn with_max_corrupt_chunks(mut self, count: u32) -> Self {
        self.max_corrupt_chunks = count;
        self
    }

    pub fn with_storage_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.storage_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_read_segment_bytes(mut self, bytes: usize) -> Self {
        self.read_segment_bytes = bytes;
        self
    }

    pub fn without_checksum(mut self) -> Self {
        self.compute_checksum = false;
        self
    }

    pub fn with_cache_control<S: Into<String>>(mut self, value: S) -> Self {
        self.cache_control = value.into();
        self
    }

    /// Defaults overridden by `DOG_FILES__*` environment variables
    pub fn from_env() -> FilesResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `DOG_FILES__KEY=value` pairs.
    ///
    /// Keys are matched case-insensitively after the prefix; unknown keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> FilesResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            let Some(stripped) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = stripped.to_lowercase().replace("__", ".");
            let value = value.as_ref().trim();

            match key.as_str() {
                "chunk_size" => config.upload_rules.default_chunk_size = parse(&key, value)?,
                "min_chunk_size" => config.upload_rules.min_chunk_size = parse(&key, value)?,
                "max_chunk_size" => config.upload_rules.max_chunk_size = parse(&key, value)?,
                "max_chunks" => config.upload_rules.max_chunks = parse(&key, value)?,
                "max_file_bytes" => config.upload_rules.max_file_bytes = parse(&key, value)?,
                "allowed_extensions" => {
                    let list: Vec<String> = value
                        .split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect();
                    config.upload_rules.allowed_extensions =
                        if list.is_empty() { None } else { Some(list) };
                }
                "session_timeout_secs" => {
                    config.session_timeout = Duration::from_secs(parse(&key, value)?)
                }
                "sweep_interval_secs" => {
                    config.sweep_interval = Duration::from_secs(parse(&key, value)?)
                }
                "allow_partial_reads" => config.allow_partial_reads = parse(&key, value)?,
                "max_corrupt_chunks" => config.max_corrupt_chunks = parse(&key, value)?,
                "storage_retries" => config.storage_retries = parse(&key, value)?,
                "retry_backoff_ms" => {
                    config.retry_backoff = Duration::from_millis(parse(&key, value)?)
                }
                "read_segment_bytes" => config.read_segment_bytes = parse(&key, value)?,
                "compute_checksum" => config.compute_checksum = parse(&key, value)?,
                "cache_control" => config.cache_control = value.to_string(),
                "event_capacity" => config.event_capacity = parse(&key, value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are usable together
    pub fn validate(&self) -> FilesResult<()> {
        let rules = &self.upload_rules;
        if rules.min_chunk_size == 0 {
            return Err(FilesError::invalid("min_chunk_size must be at least 1"));
        }
        if rules.min_chunk_size > rules.max_chunk_size {
            return Err(FilesError::invalid(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                rules.min_chunk_size, rules.max_chunk_size
            )));
        }
        if rules.default_chunk_size < rules.min_chunk_size
            || rules.default_chunk_size > rules.max_chunk_size
        {
            return Err(FilesError::invalid(format!(
                "default chunk size {} outside {}..={}",
                rules.default_chunk_size, rules.min_chunk_size, rules.max_chunk_size
            )));
        }
        if rules.max_chunks == 0 {
            return Err(FilesError::invalid("max_chunks must be at least 1"));
        }
        if self.session_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(FilesError::invalid(
                "session_timeout and sweep_interval must be non-zero",
            ));
        }
        if self.read_segment_bytes == 0 {
            return Err(FilesError::invalid("read_segment_bytes must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(FilesError::invalid("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl UploadRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_chunk_size(mut self, bytes: u64) -> Self {
        self.default_chunk_size = bytes;
        self
    }

    pub fn with_chunk_bounds(mut self, min: u64, max: u64) -> Self {
        self.min_chunk_size = min;
        self.max_chunk_size = max;
        self
    }

    pub fn with_max_chunks(mut self, max: u64) -> Self {
        self.max_chunks = max;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_extensions = Some(
            extensions
                .into_iter()
                .map(|ext| ext.into().trim_start_matches('.').to_lowercase())
                .collect(),
        );
        self
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> FilesResult<T> {
    value
        .parse()
        .map_err(|_| FilesError::invalid(format!("invalid value {:?} for {}", value, key)))
}
