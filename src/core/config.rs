//! Kernel configuration, consumed before the first preparation.
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::time::TimeConverter;
use super::vp::VirtualProcessMap;
use crate::error::KernelError;

/// The default simulation resolution, in ms.
pub const DEFAULT_RESOLUTION: f64 = 0.1;
/// The default seed of the VP random number generators.
pub const DEFAULT_RNG_SEED: u64 = 42;

/// Settings of a simulation kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// The duration of an elementary step, in ms.
    pub resolution: f64,
    /// The number of threads of this process.
    pub local_num_threads: usize,
    /// The total number of VPs; must equal processes x threads when given.
    pub total_num_virtual_procs: Option<usize>,
    /// The seed from which every VP derives its random stream.
    pub rng_seed: u64,
    /// Whether file-backed sinks may replace existing files.
    pub overwrite_files: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            resolution: DEFAULT_RESOLUTION,
            local_num_threads: 1,
            total_num_virtual_procs: None,
            rng_seed: DEFAULT_RNG_SEED,
            overwrite_files: false,
        }
    }
}

impl KernelConfig {
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_threads(mut self, local_num_threads: usize) -> Self {
        self.local_num_threads = local_num_threads;
        self
    }

    pub fn with_total_vps(mut self, total_num_virtual_procs: usize) -> Self {
        self.total_num_virtual_procs = Some(total_num_virtual_procs);
        self
    }

    pub fn with_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = rng_seed;
        self
    }

    pub fn with_overwrite(mut self, overwrite_files: bool) -> Self {
        self.overwrite_files = overwrite_files;
        self
    }

    /// Check the configuration for a run on `num_processes` processes.
    /// Returns the time converter and the VP map it implies.
    pub fn validate(
        &self,
        num_processes: usize,
    ) -> Result<(TimeConverter, VirtualProcessMap), KernelError> {
        let converter = TimeConverter::build(self.resolution)?;
        if self.local_num_threads == 0 {
            return Err(KernelError::ConfigError(
                "local_num_threads must be positive".to_string(),
            ));
        }
        let map = VirtualProcessMap::build(num_processes, self.local_num_threads)?;
        if let Some(total) = self.total_num_virtual_procs {
            if total != map.total_vps() {
                return Err(KernelError::ConfigError(format!(
                    "total_num_virtual_procs = {} is inconsistent with {} processes x {} threads",
                    total, num_processes, self.local_num_threads
                )));
            }
        }
        Ok((converter, map))
    }

    /// Save the configuration as JSON.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), KernelError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a configuration from JSON; missing fields take their default value.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, KernelError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate() {
        let config = KernelConfig::default().with_threads(2).with_total_vps(4);
        let (converter, map) = config.validate(2).unwrap();
        assert_eq!(converter.resolution(), DEFAULT_RESOLUTION);
        assert_eq!(map.total_vps(), 4);

        assert!(matches!(
            config.validate(1),
            Err(KernelError::ConfigError(_))
        ));
        assert!(KernelConfig::default().with_threads(0).validate(1).is_err());
        assert!(KernelConfig::default()
            .with_resolution(0.0)
            .validate(1)
            .is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        let config = KernelConfig::default()
            .with_resolution(0.25)
            .with_threads(3)
            .with_seed(7);
        config.save_to(&path).unwrap();
        assert_eq!(KernelConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: KernelConfig = serde_json::from_str(r#"{"local_num_threads": 4}"#).unwrap();
        assert_eq!(config.local_num_threads, 4);
        assert_eq!(config.resolution, DEFAULT_RESOLUTION);
        assert_eq!(config.total_num_virtual_procs, None);
    }
}
