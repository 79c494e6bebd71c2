//! Finding the container for a package at runtime
//!
//! Lookup order:
//!
//! 1. every entry of `ASSETBIN_ARCHIVE__<PACKAGE>` (a path list, split like
//!    `PATH`)
//! 2. the configured candidate paths
//! 3. the running executable, as an appended container (when enabled)
//!
//! A candidate matches when either it or its `.gz` sibling exists.

use crate::container::gz_sibling;
use crate::error::{AssetError, Result};
use regex::Regex;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Prefix of the per-package override variable
pub const ENV_PREFIX: &str = "ASSETBIN_ARCHIVE__";

/// Name of the override variable for `package`
///
/// The package name is upper-cased and every run of non-word characters
/// becomes a single `_`.
pub fn env_var_name(package: &str) -> Result<String> {
    let non_word = Regex::new(r"\W+").map_err(|e| AssetError::Config(e.to_string()))?;
    Ok(format!("{}{}", ENV_PREFIX, non_word.replace_all(&package.to_uppercase(), "_")))
}

/// Where a container was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Uncompressed container path (its `.gz` sibling may be what exists)
    pub path: PathBuf,
    /// The container is appended to the file
    pub ended: bool,
}

#[derive(Debug, Clone)]
pub struct Locator {
    env_var: String,
    candidates: Vec<PathBuf>,
    embedded: bool,
}

impl Locator {
    pub fn new(package: &str) -> Result<Self> {
        Ok(Locator {
            env_var: env_var_name(package)?,
            candidates: Vec::new(),
            embedded: false,
        })
    }

    pub fn candidate(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates.push(path.into());
        self
    }

    pub fn candidates<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.candidates.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Fall back to the running executable
    pub fn embedded(mut self, embedded: bool) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// Resolve using the process environment
    pub fn locate(&self) -> Result<Located> {
        self.locate_with(std::env::var_os(&self.env_var))
    }

    /// Resolve with an explicit value for the override variable
    pub fn locate_with(&self, env_value: Option<OsString>) -> Result<Located> {
        let from_env: Vec<PathBuf> = env_value
            .as_deref()
            .map(|v| std::env::split_paths(v).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        for path in from_env.iter().chain(self.candidates.iter()) {
            if present(path)? {
                debug!("Located container {} via {}", path.display(), self.env_var);
                return Ok(Located {
                    path: path.clone(),
                    ended: false,
                });
            }
        }

        if self.embedded {
            let exe = std::env::current_exe()?;
            debug!("Using container appended to {}", exe.display());
            return Ok(Located { path: exe, ended: true });
        }

        Err(AssetError::NotLocated(self.env_var.clone()))
    }
}

/// `path.gz` or `path` exists; stat errors other than absence are reported
fn present(path: &Path) -> Result<bool> {
    for candidate in [gz_sibling(path), path.to_path_buf()] {
        match std::fs::metadata(&candidate) {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No container at {}", candidate.display());
            }
            Err(e) => return Err(AssetError::io(candidate, e)),
        }
    }
    Ok(false)
}
