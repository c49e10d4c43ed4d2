//! Filesystem layout under a service root directory.
//!
//! Every runtime path is derived deterministically from the root; the files
//! carry no identity beyond their location. Nothing locks these paths: two
//! daemons racing for the same root is an accepted risk, the last one to
//! bind the socket wins.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("tend.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("tend.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir().join("daemon.log")
    }

    pub fn services_file(&self) -> PathBuf {
        self.root.join("services.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.log_dir())
            .with_context(|| format!("failed to create {}", self.log_dir().display()))
    }
}
