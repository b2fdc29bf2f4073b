use crate::io::SourceOptions;
use crate::pipeline::PipelineSettings;
use crate::{LoadError, LoadResult};

pub const DEFAULT_PATTERN: &str = "/data/appsinstalled/*.tsv.gz";
pub const DEFAULT_WORKERS: usize = 8;
/// Lines buffered between the reader and the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// One memcached address per supported device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAddrs {
    pub idfa: String,
    pub gaid: String,
    pub adid: String,
    pub dvid: String,
}

impl Default for ShardAddrs {
    fn default() -> Self {
        Self {
            idfa: "127.0.0.1:33013".into(),
            gaid: "127.0.0.1:33014".into(),
            adid: "127.0.0.1:33015".into(),
            dvid: "127.0.0.1:33016".into(),
        }
    }
}

impl ShardAddrs {
    /// `(device_type, addr)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("idfa", self.idfa.as_str()),
            ("gaid", self.gaid.as_str()),
            ("adid", self.adid.as_str()),
            ("dvid", self.dvid.as_str()),
        ]
        .into_iter()
    }
}

/// Everything the loader needs, already parsed from flags/env.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub dry_run: bool,
    pub pattern: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub shards: ShardAddrs,
    pub source: SourceOptions,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            pattern: DEFAULT_PATTERN.into(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shards: ShardAddrs::default(),
            source: SourceOptions::default(),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> LoadResult<()> {
        if self.workers == 0 {
            return Err(LoadError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(LoadError::Config("queue capacity must be at least 1".into()));
        }
        if self.pattern.trim().is_empty() {
            return Err(LoadError::Config("empty file pattern".into()));
        }
        if let Some((device_type, _)) = self.shards.iter().find(|(_, addr)| addr.trim().is_empty()) {
            return Err(LoadError::Config(format!("no address for {device_type}")));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            dry_run: self.dry_run,
            source: self.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = LoaderConfig::default();
        cfg.validate().unwrap();
        let settings = cfg.pipeline_settings();
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.queue_capacity, 10_000);
        assert!(!settings.dry_run);
    }

    #[test]
    fn rejects_zero_workers_and_blank_addrs() {
        let cfg = LoaderConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(LoadError::Config(_))));

        let mut cfg = LoaderConfig::default();
        cfg.shards.gaid = " ".into();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: no address for gaid");
    }
}
