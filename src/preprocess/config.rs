//! Configuration for the preprocess pipeline

/// Configuration for background value preprocessing
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Number of pool threads shared by every task
    pub threads: usize,
    /// Bytes read from a source per step
    pub chunk_bytes: usize,
    /// Largest decoded value accepted; bigger values fail with QuotaExceeded
    pub max_value_bytes: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            chunk_bytes: 32 * 1024,            // 32 KiB
            max_value_bytes: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

impl PreprocessConfig {
    /// One pool thread, for workers and constrained hosts
    pub fn single_threaded() -> Self {
        Self {
            threads: 1,
            ..Default::default()
        }
    }

    /// Bigger chunks and pool for workloads dominated by large values
    pub fn large_values() -> Self {
        Self {
            threads: 4,
            chunk_bytes: 256 * 1024,
            max_value_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_config_defaults() {
        let config = PreprocessConfig::default();
        assert_eq!(config.threads, 2);
        assert_eq!(config.chunk_bytes, 32 * 1024);
    }

    #[test]
    fn test_preprocess_config_presets() {
        assert_eq!(PreprocessConfig::single_threaded().threads, 1);
        let large = PreprocessConfig::large_values();
        assert_eq!(large.threads, 4);
        assert!(large.chunk_bytes > PreprocessConfig::default().chunk_bytes);
    }
}
