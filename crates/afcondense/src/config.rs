use crate::error::{Error, Result};
use crate::source::PagingConfig;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine settings, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timezone every returned timestamp is expressed in.
    pub display_timezone: Tz,

    /// Forwarded untouched with every series request.
    pub paging: PagingConfig,

    /// Upper bound on concurrent data source calls from chunk workers and
    /// per-row attribute fetches.
    pub max_concurrency: usize,

    pub default_chunk_size: usize,

    /// Rows longer than this trigger a warning before extraction.
    pub long_duration_warning_days: i64,

    /// Tables with more rows than this trigger a warning before extraction.
    pub row_count_warning: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_timezone: Tz::UTC,
            paging: PagingConfig::default(),
            max_concurrency: 8,
            default_chunk_size: 1000,
            long_duration_warning_days: 60,
            row_count_warning: 50,
        }
    }
}

impl EngineConfig {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be greater than 0".into()));
        }
        if self.paging.page_size == 0 {
            return Err(Error::Config("paging.page_size must be greater than 0".into()));
        }
        if self.default_chunk_size == 0 {
            return Err(Error::Config("default_chunk_size must be greater than 0".into()));
        }
        if self.long_duration_warning_days < 0 {
            return Err(Error::Config(
                "long_duration_warning_days cannot be negative".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.display_timezone = tz;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PageType;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.display_timezone, Tz::UTC);
        assert_eq!(config.paging.page_type, PageType::EventCount);
        assert_eq!(config.paging.page_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            "display_timezone: Europe/Brussels\nmax_concurrency: 2\n",
        )
        .unwrap();
        assert_eq!(config.display_timezone.name(), "Europe/Brussels");
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.row_count_warning, 50);
    }

    #[test]
    fn test_zero_values_rejected() {
        for yaml in [
            "max_concurrency: 0",
            "default_chunk_size: 0",
            "paging:\n  page_size: 0",
        ] {
            let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{yaml}: {err}");
        }
    }

    #[test]
    fn test_unknown_timezone_is_yaml_error() {
        let err = EngineConfig::from_yaml_str("display_timezone: Mars/Olympus").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "paging:\n  page_type: tag_count\n  page_size: 25").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.paging.page_type, PageType::TagCount);
        assert_eq!(config.paging.page_size, 25);

        assert!(matches!(
            EngineConfig::load("/nonexistent/afcondense.yaml"),
            Err(Error::Config(_))
        ));
    }
}
