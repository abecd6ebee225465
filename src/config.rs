use std::fs;
use std::io::Read;

use serde_derive::{Deserialize, Serialize};

/// Global Config
///
/// Host-level settings of the isolator; per-run quotas come from the CLI.
///
/// Search path:
/// - ./isolator.toml (cwd of the isolator)
/// - /etc/isolator.toml
/// - Default (when no config file available)
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding the per-run box directories
    pub box_root: String,
    /// Delegated cgroup v2 subtree for run cgroups
    pub cgroup_root: String,
    /// Memory sampling interval; bounds the detection window
    pub sample_interval_ms: u64,
}

impl GlobalConfig {
    pub fn read() -> anyhow::Result<Self> {
        for path in ["./isolator.toml", "/etc/isolator.toml"] {
            match Self::read_from(path)? {
                Some(config) => return Ok(config),
                None => continue,
            }
        }
        Ok(Self::default())
    }

    pub fn read_from(path: &str) -> anyhow::Result<Option<Self>> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(None),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config = toml::from_str(&contents)?;
        Ok(Some(config))
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            box_root: "/tmp/isolator".to_owned(),
            cgroup_root: "/sys/fs/cgroup/isolator".to_owned(),
            sample_interval_ms: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = GlobalConfig::default();
        assert_eq!(config.box_root, "/tmp/isolator");
        assert_eq!(config.sample_interval_ms, 10);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: GlobalConfig = toml::from_str("box_root = \"/var/lib/isolator\"").unwrap();
        assert_eq!(config.box_root, "/var/lib/isolator");
        assert_eq!(config.cgroup_root, "/sys/fs/cgroup/isolator");
    }

    #[test]
    fn missing_file_reads_as_none() {
        assert!(GlobalConfig::read_from("/nonexistent/isolator.toml")
            .unwrap()
            .is_none());
    }
}
