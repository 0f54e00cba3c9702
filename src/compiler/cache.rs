//! Compilation cache for checkers and interactors
//!
//! Keyed by the SHA-256 of the source text. Each successful compile is kept
//! under `<dir>/<key>/`:
//!
//! ```text
//! artifact        compiled program
//! artifact.json   { "file_name": ... }
//! compile.json    compiler RuntimeData (absent for interpreted languages)
//! source          the source text
//! ```

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{compile_in_sandbox, Artifact, CompileOutcome};
use crate::config::CompileConfig;
use crate::core::request::Language;
use crate::core::utils::content_hash;
use crate::sandbox::{RuntimeConstraints, RuntimeData, SandboxManager};

const ARTIFACT: &str = "artifact";
const ARTIFACT_META: &str = "artifact.json";
const COMPILE_META: &str = "compile.json";
const SOURCE: &str = "source";

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    file_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub compilations: u64,
}

/// Durable compile cache. Identical sources compile once; different
/// sources compile in parallel.
pub struct CompileCache {
    dir: PathBuf,
    sandbox: SandboxManager,
    limits: RuntimeConstraints,
    locks: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    compilations: AtomicU64,
}

impl CompileCache {
    pub fn new(dir: impl Into<PathBuf>, sandbox: SandboxManager, limits: RuntimeConstraints) -> Self {
        Self {
            dir: dir.into(),
            sandbox,
            limits,
            locks: DashMap::new(),
            hits: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CompileConfig, sandbox: SandboxManager) -> Self {
        Self::new(&config.cache_dir, sandbox, config.limits.clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
        }
    }

    /// Get the compiled program for `source`, compiling if necessary
    pub async fn get_compiled(&self, source: &str, language: &Language) -> Result<CompileOutcome> {
        let key = content_hash(source);

        if let Some(artifact) = self.load(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Compile cache hit for {}", key);
            return Ok(CompileOutcome::Compiled(artifact));
        }

        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let outcome = self.compile_locked(&key, &lock, source, language).await;
        // Drop the lock entry once no other caller is queued on it
        self.locks.remove_if(&key, |_, held| Arc::strong_count(held) == 2);
        outcome
    }

    async fn compile_locked(
        &self,
        key: &str,
        lock: &Mutex<()>,
        source: &str,
        language: &Language,
    ) -> Result<CompileOutcome> {
        let _guard = lock.lock().await;

        // Another task may have finished the same compile while we waited
        if let Some(artifact) = self.load(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Compile cache hit for {} after waiting", key);
            return Ok(CompileOutcome::Compiled(artifact));
        }

        self.compilations.fetch_add(1, Ordering::Relaxed);
        info!("Compiling {} ({})", key, language.source_file);
        let outcome = compile_in_sandbox(&self.sandbox, language, source, &self.limits).await?;

        if let CompileOutcome::Compiled(artifact) = &outcome {
            self.persist(key, source, artifact)
                .await
                .with_context(|| format!("Failed to store compiled {}", key))?;
        }
        Ok(outcome)
    }

    async fn load(&self, key: &str) -> Option<Artifact> {
        let entry = self.dir.join(key);
        let meta = fs::read(entry.join(ARTIFACT_META)).await.ok()?;
        let meta: ArtifactMeta = match serde_json::from_slice(&meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Corrupt compile cache entry {}: {}", entry.display(), e);
                return None;
            }
        };
        let bytes = fs::read(entry.join(ARTIFACT)).await.ok()?;
        let runtime = match fs::read(entry.join(COMPILE_META)).await {
            Ok(raw) => serde_json::from_slice::<RuntimeData>(&raw).ok(),
            Err(_) => None,
        };

        Some(Artifact {
            file_name: meta.file_name,
            bytes,
            runtime,
        })
    }

    async fn persist(&self, key: &str, source: &str, artifact: &Artifact) -> Result<()> {
        let staging_root = self.dir.join("tmp");
        fs::create_dir_all(&staging_root).await?;
        // Removed on drop unless renamed into place
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}.", key))
            .tempdir_in(&staging_root)?;

        write_entry(staging.path(), source, artifact).await?;

        let target = self.dir.join(key);
        if let Err(e) = fs::rename(staging.path(), &target).await {
            // Another process stored the same key first
            if !fs::try_exists(target.join(ARTIFACT_META)).await.unwrap_or(false) {
                return Err(e).with_context(|| format!("Failed to move {} into place", key));
            }
        }
        Ok(())
    }
}

async fn write_entry(dir: &Path, source: &str, artifact: &Artifact) -> Result<()> {
    fs::write(dir.join(ARTIFACT), &artifact.bytes).await?;
    fs::write(dir.join(SOURCE), source).await?;
    if let Some(runtime) = &artifact.runtime {
        fs::write(dir.join(COMPILE_META), serde_json::to_vec(runtime)?).await?;
    }
    let meta = ArtifactMeta {
        file_name: artifact.file_name.clone(),
    };
    fs::write(dir.join(ARTIFACT_META), serde_json::to_vec(&meta)?).await?;
    Ok(())
}
