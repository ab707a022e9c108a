// src/runtime/sandbox.rs
//! Isolated profile directory of a worker
//!
//! Every worker runs with its own user profile so that two workers never
//! share (or corrupt) each other's state:
//! - created fresh before each start, optionally from a template
//! - deleted once the worker is gone
//! - renamed aside when it cannot be deleted

use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory the profile directory is created in
    pub working_dir: PathBuf,

    /// Name of the profile directory
    pub profile_name: String,

    /// Template copied into the profile directory
    pub template_dir: Option<PathBuf>,
}

/// Profile directory of a single worker
#[derive(Debug)]
pub struct Sandbox {
    profile_dir: PathBuf,
    template_dir: Option<PathBuf>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            profile_dir: config.working_dir.join(config.profile_name),
            template_dir: config.template_dir,
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// `file://` URL of the profile directory
    pub fn profile_url(&self) -> String {
        format!("file://{}", self.profile_dir.display())
    }

    /// Create a fresh profile directory
    pub fn prepare(&self) -> Result<()> {
        if self.profile_dir.exists() {
            warn!(
                "Profile dir '{}' already exists; deleting",
                self.profile_dir.display()
            );
            self.cleanup();
        }

        match &self.template_dir {
            Some(template) => {
                debug!(
                    "Copying profile template '{}' to '{}'",
                    template.display(),
                    self.profile_dir.display()
                );
                copy_dir(template, &self.profile_dir).map_err(|e| {
                    EngineError::Profile(format!(
                        "Failed to create the profile directory from template '{}': {}",
                        template.display(),
                        e
                    ))
                })
            }
            None => fs::create_dir_all(&self.profile_dir).map_err(|e| {
                EngineError::Profile(format!(
                    "Cannot create profile directory '{}': {}",
                    self.profile_dir.display(),
                    e
                ))
            }),
        }
    }

    /// Delete the profile directory, renaming it aside on failure
    pub fn cleanup(&self) {
        if !self.profile_dir.exists() {
            return;
        }

        debug!("Deleting profile directory '{}'", self.profile_dir.display());
        let Err(e) = fs::remove_dir_all(&self.profile_dir) else {
            return;
        };

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut old_name = self.profile_dir.as_os_str().to_os_string();
        old_name.push(format!(".old.{}", stamp));
        let old_dir = PathBuf::from(old_name);

        match fs::rename(&self.profile_dir, &old_dir) {
            Ok(()) => warn!(
                "Could not delete profile dir ({}); renamed it to '{}'",
                e,
                old_dir.display()
            ),
            Err(rename_err) => error!(
                "Could not delete profile dir '{}': {}; rename failed: {}",
                self.profile_dir.display(),
                e,
                rename_err
            ),
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }

    Ok(())
}
