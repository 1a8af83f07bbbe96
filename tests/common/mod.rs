//! Common test utilities and fixtures

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

/// A temp directory holding a config file for CLI tests
pub struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config_path = temp_dir.path().join("node.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    pub fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).expect("Failed to write config fixture");
    }

    pub fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}
