//! Runtime adapter (LoRA) management.
//!
//! [`AdapterCache`] remembers which adapter is attached to the engine and at
//! what weight, and only touches the engine when either changes. An identity
//! is a weight file, a directory holding one, or a Hugging Face repository.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use serde::Serialize;

use crate::config::AdapterConfig;
use crate::engine::InferenceEngine;
use crate::request::NO_ADAPTER;
use crate::{Error, Result};

/// Name the attached adapter is registered under in the engine.
const ADAPTER_NAME: &str = "request_adapter";

/// What is attached right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterState {
    pub identity: String,
    pub weight: f64,
}

impl AdapterState {
    pub fn none() -> Self {
        Self {
            identity: NO_ADAPTER.to_string(),
            weight: 0.0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.identity == NO_ADAPTER
    }
}

/// Downloads an adapter repository and returns a local file or directory.
pub trait RemoteFetch: Send {
    fn fetch(&self, repo_id: &str, extensions: &[String]) -> Result<PathBuf>;
}

/// Fetches the lexicographically first recognized weight file of a model repo.
#[derive(Debug, Default, Clone, Copy)]
pub struct HfHubFetch;

impl RemoteFetch for HfHubFetch {
    fn fetch(&self, repo_id: &str, extensions: &[String]) -> Result<PathBuf> {
        let api = Api::new()?;
        let repo = api.model(repo_id.to_string());
        let info = repo.info()?;
        let mut candidates: Vec<&str> = info
            .siblings
            .iter()
            .map(|s| s.rfilename.as_str())
            .filter(|name| has_extension(Path::new(name), extensions))
            .collect();
        candidates.sort_unstable();
        let file = candidates.first().ok_or_else(|| {
            Error::Adapter(format!(
                "repository {repo_id} has no file with extension {extensions:?}"
            ))
        })?;
        tracing::info!(repo = repo_id, file, "downloading adapter");
        Ok(repo.get(file)?)
    }
}

/// Tracks and swaps the engine's adapter.
pub struct AdapterCache {
    config: AdapterConfig,
    remote: Box<dyn RemoteFetch>,
    state: AdapterState,
    /// Weight file backing `state`, kept so a failed swap can re-attach it.
    resolved: Option<PathBuf>,
    swaps: usize,
}

impl AdapterCache {
    pub fn new(config: AdapterConfig) -> Self {
        Self::with_remote(config, Box::new(HfHubFetch))
    }

    pub fn with_remote(config: AdapterConfig, remote: Box<dyn RemoteFetch>) -> Self {
        Self {
            config,
            remote,
            state: AdapterState::none(),
            resolved: None,
            swaps: 0,
        }
    }

    pub fn state(&self) -> &AdapterState {
        &self.state
    }

    /// Number of attach/detach operations performed on the engine.
    pub fn swap_count(&self) -> usize {
        self.swaps
    }

    /// Make `identity` at `weight` the attached adapter.
    ///
    /// Returns whether the engine was touched. On error the recorded state is
    /// unchanged and, as far as the engine allows, so is the attached adapter.
    pub fn apply(
        &mut self,
        engine: &mut dyn InferenceEngine,
        identity: Option<&str>,
        weight: f64,
    ) -> Result<bool> {
        let identity = match identity.map(str::trim) {
            None | Some("") => NO_ADAPTER,
            Some(id) if id.eq_ignore_ascii_case(NO_ADAPTER) => NO_ADAPTER,
            Some(id) => id,
        };

        if identity == NO_ADAPTER {
            if self.state.is_none() {
                return Ok(false);
            }
            engine.unload_adapter()?;
            tracing::info!(previous = %self.state.identity, "adapter detached");
            self.state = AdapterState::none();
            self.resolved = None;
            self.swaps += 1;
            return Ok(true);
        }

        if self.state.identity == identity && self.state.weight == weight {
            return Ok(false);
        }

        let path = self.resolve(identity)?;

        if !self.state.is_none() {
            engine.unload_adapter()?;
        }
        if let Err(error) = attach(engine, &path, weight) {
            tracing::warn!(adapter = identity, %error, "adapter attach failed, restoring previous");
            self.restore(engine);
            return Err(Error::Adapter(format!("attach {identity}: {error}")));
        }

        tracing::info!(
            adapter = identity,
            path = %path.display(),
            weight,
            previous = %self.state.identity,
            "adapter attached"
        );
        self.state = AdapterState {
            identity: identity.to_string(),
            weight,
        };
        self.resolved = Some(path);
        self.swaps += 1;
        Ok(true)
    }

    fn restore(&mut self, engine: &mut dyn InferenceEngine) {
        // A failed activate can leave the new adapter loaded.
        if let Err(error) = engine.unload_adapter() {
            tracing::debug!(%error, "unload after failed attach");
        }
        let Some(previous) = self.resolved.clone() else {
            return;
        };
        if let Err(error) = attach(engine, &previous, self.state.weight) {
            tracing::error!(
                adapter = %self.state.identity,
                %error,
                "could not restore previous adapter, engine has none attached"
            );
            self.state = AdapterState::none();
            self.resolved = None;
        }
    }

    /// Identity to weight file: exact file, directory scan, remote repository.
    pub fn resolve(&self, identity: &str) -> Result<PathBuf> {
        let candidate = Path::new(identity);
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        if candidate.is_dir() {
            return scan_dir(candidate, &self.config.weight_extensions);
        }
        if self.config.allow_remote && looks_like_repo_id(identity) {
            let local = self.remote.fetch(identity, &self.config.weight_extensions)?;
            return if local.is_file() {
                Ok(local)
            } else {
                scan_dir(&local, &self.config.weight_extensions)
            };
        }
        Err(Error::Adapter(format!("adapter {identity} not found")))
    }
}

fn attach(engine: &mut dyn InferenceEngine, path: &Path, weight: f64) -> Result<()> {
    engine.load_adapter(path, ADAPTER_NAME)?;
    engine.activate_adapters(&[ADAPTER_NAME.to_string()], &[weight])
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

/// Lexicographically first file in `dir` with a recognized extension.
fn scan_dir(dir: &Path, extensions: &[String]) -> Result<PathBuf> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, extensions) {
            matches.push(path);
        }
    }
    matches.sort();
    matches.into_iter().next().ok_or_else(|| {
        Error::Adapter(format!(
            "no adapter weights ({}) in {}",
            extensions.join(", "),
            dir.display()
        ))
    })
}

/// `owner/name` with no filesystem-looking prefix.
fn looks_like_repo_id(identity: &str) -> bool {
    let mut parts = identity.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None)
            if !owner.is_empty() && !name.is_empty() && owner != "." && owner != ".."
    )
}
