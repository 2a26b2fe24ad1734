//! Turning a test file into something a runtime can load.
//!
//! Compilation itself is delegated to an [`ArtifactCompiler`]; this module owns the cache in front of
//! it. The cache is keyed by `(source file, target)`, glue included, and holds its lock across the whole
//! check-compile-insert sequence, so concurrent controllers asking for the same artifact trigger a
//! single compilation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::CrossTestConfig;

/// What a runtime needs from a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactTarget {
    /// Cache discriminator (`node`, `browser`, ...)
    pub name: String,
    /// Extension of the produced file, without the dot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Glue injected before the compiled module (typically the runner shim bootstrap)
    #[serde(default)]
    pub header: String,
    /// Glue injected after the compiled module
    #[serde(default)]
    pub footer: String,
}

impl ArtifactTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: None,
            header: String::new(),
            footer: String::new(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_glue(mut self, header: impl Into<String>, footer: impl Into<String>) -> Self {
        self.header = header.into();
        self.footer = footer.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error while preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler command is empty")]
    EmptyCommand,

    #[error("failed to spawn compiler `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler exited with {status} for {source_file}:\n{stderr}")]
    Failed {
        source_file: PathBuf,
        status: String,
        stderr: String,
    },
}

/// One compilation job.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub source: &'a Path,
    pub target: &'a ArtifactTarget,
    /// Where the artifact should be written
    pub out: &'a Path,
}

#[async_trait]
pub trait ArtifactCompiler: Send + Sync {
    /// Produce the artifact for `request` and return its path.
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PathBuf, ArtifactError>;
}

/// Artifacts are built elsewhere: the source path is the artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prebuilt;

#[async_trait]
impl ArtifactCompiler for Prebuilt {
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PathBuf, ArtifactError> {
        Ok(request.source.to_path_buf())
    }
}

/// Runs an external command. Arguments may contain `{source}`, `{target}`, `{out}`, `{header}` and
/// `{footer}`; the glue is written to files next to the output and passed by path.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    command: Vec<String>,
}

impl CommandCompiler {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), ArtifactError> {
    tokio::fs::write(path, contents).await.map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl ArtifactCompiler for CommandCompiler {
    async fn compile(&self, request: CompileRequest<'_>) -> Result<PathBuf, ArtifactError> {
        let (program, args) = self.command.split_first().ok_or(ArtifactError::EmptyCommand)?;
        let header = request.out.with_extension("header");
        let footer = request.out.with_extension("footer");
        write_file(&header, &request.target.header).await?;
        write_file(&footer, &request.target.footer).await?;

        let substitutions = [
            ("{source}", request.source.to_string_lossy().into_owned()),
            ("{target}", request.target.name.clone()),
            ("{out}", request.out.to_string_lossy().into_owned()),
            ("{header}", header.to_string_lossy().into_owned()),
            ("{footer}", footer.to_string_lossy().into_owned()),
        ];
        let args: Vec<String> = args
            .iter()
            .map(|arg| {
                substitutions
                    .iter()
                    .fold(arg.clone(), |acc, (placeholder, value)| acc.replace(placeholder, value))
            })
            .collect();

        tracing::debug!(program = %program, ?args, "compiling artifact");
        let output = tokio::process::Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ArtifactError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ArtifactError::Failed {
                source_file: request.source.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(request.out.to_path_buf())
    }
}

/// File name of the artifact for `source` on `target`: `entry-{sha256}-{target}[.ext]`.
///
/// The digest covers the source path and the target's glue, so targets that share a name but
/// inject different code never share a file.
pub fn artifact_file_name(source: &Path, target: &ArtifactTarget) -> String {
    let source = source.to_string_lossy();
    let mut hasher = Sha256::new();
    for part in [source.as_bytes(), target.header.as_bytes(), target.footer.as_bytes()] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    match &target.extension {
        Some(ext) => format!("entry-{hex}-{}.{ext}", target.name),
        None => format!("entry-{hex}-{}", target.name),
    }
}

/// Shared, lock-protected cache of compiled artifacts.
pub struct ArtifactCache {
    dist_root: PathBuf,
    compiler: Arc<dyn ArtifactCompiler>,
    entries: Mutex<HashMap<(PathBuf, ArtifactTarget), PathBuf>>,
}

impl ArtifactCache {
    pub fn new(dist_root: impl Into<PathBuf>, compiler: Arc<dyn ArtifactCompiler>) -> Self {
        Self {
            dist_root: dist_root.into(),
            compiler,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cache `config` describes: its dist root and its compiler, or prebuilt artifacts.
    pub fn from_config(config: &CrossTestConfig) -> Self {
        let compiler: Arc<dyn ArtifactCompiler> = match &config.compiler {
            Some(spec) => Arc::new(CommandCompiler::new(spec.command.clone())),
            None => Arc::new(Prebuilt),
        };
        Self::new(config.dist_root.clone(), compiler)
    }

    pub fn dist_root(&self) -> &Path {
        &self.dist_root
    }

    /// Return the cached artifact for `(source, target)`, compiling it on first request.
    #[tracing::instrument(skip_all, fields(source = %source.display(), target = %target.name))]
    pub async fn get_or_compile(&self, source: &Path, target: &ArtifactTarget) -> Result<PathBuf, ArtifactError> {
        let key = (source.to_path_buf(), target.clone());
        let mut entries = self.entries.lock().await;
        if let Some(path) = entries.get(&key) {
            return Ok(path.clone());
        }

        tokio::fs::create_dir_all(&self.dist_root)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.dist_root.clone(),
                source,
            })?;
        let out = self.dist_root.join(artifact_file_name(source, target));
        let artifact = self
            .compiler
            .compile(CompileRequest { source, target, out: &out })
            .await?;
        tracing::debug!(artifact = %artifact.display(), "artifact ready");
        entries.insert(key, artifact.clone());
        Ok(artifact)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
