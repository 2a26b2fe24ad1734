//! Host configuration.
//!
//! Loaded from a camelCase JSON file, then overlaid with the `CROSSTEST_*` environment variables.
//! Everything has a default, so an absent file means "run in-process only".

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::ArtifactTarget;

/// Enables debug logging in the host and every runner when set to `1`.
pub const DEBUG_ENV: &str = "CROSSTEST_DEBUG";
/// Maximum length of logged protocol payloads.
pub const DEBUG_MAX_LENGTH_ENV: &str = "CROSSTEST_DEBUG_MAX_LENGTH";
/// Placeholder replaced by the artifact path in process commands.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

pub const DEFAULT_DIST_ROOT: &str = ".crosstest_temp";
pub const DEFAULT_DEBUG_MAX_LENGTH: usize = 256;
pub const DEFAULT_RUNTIME: &str = "native";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrossTestConfig {
    /// Where compiled artifacts are written
    pub dist_root: PathBuf,
    /// Runtimes every test runs on, in reporting order
    pub runtimes: Vec<RuntimeSpec>,
    /// External compiler; `None` means artifacts are prebuilt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler: Option<CompilerSpec>,
    pub debug: bool,
    pub debug_max_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: RuntimeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuntimeKind {
    /// Test bodies run directly inside the host.
    InProcess,
    /// Test bodies run in a child process started from `command`.
    Process {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ArtifactTarget>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSpec {
    pub command: Vec<String>,
}

impl RuntimeSpec {
    pub fn in_process(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RuntimeKind::InProcess,
        }
    }

    pub fn process(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: RuntimeKind::Process { command, target: None },
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self.kind, RuntimeKind::InProcess)
    }

    /// The command line for `artifact`: `{artifact}` is substituted, or the path is appended when
    /// the command has no placeholder. `None` for in-process runtimes.
    pub fn command_for(&self, artifact: &Path) -> Option<Vec<String>> {
        let RuntimeKind::Process { command, .. } = &self.kind else {
            return None;
        };
        let artifact = artifact.to_string_lossy();
        let mut argv: Vec<String> = command
            .iter()
            .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, &artifact))
            .collect();
        if !command.iter().any(|arg| arg.contains(ARTIFACT_PLACEHOLDER)) {
            argv.push(artifact.into_owned());
        }
        Some(argv)
    }
}

impl Default for CrossTestConfig {
    fn default() -> Self {
        Self {
            dist_root: PathBuf::from(DEFAULT_DIST_ROOT),
            runtimes: vec![RuntimeSpec::in_process(DEFAULT_RUNTIME)],
            compiler: None,
            debug: false,
            debug_max_length: DEFAULT_DEBUG_MAX_LENGTH,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    #[diagnostic(code(crosstest::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {message}")]
    #[diagnostic(code(crosstest::config::parse))]
    Parse {
        message: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("config declares no runtimes")]
    #[diagnostic(code(crosstest::config::no_runtimes), help("add at least one entry to `runtimes`"))]
    NoRuntimes,

    #[error("runtime `{0}` is declared more than once")]
    #[diagnostic(code(crosstest::config::duplicate_runtime))]
    DuplicateRuntime(String),

    #[error("runtime `{0}` has an empty command")]
    #[diagnostic(code(crosstest::config::empty_command))]
    EmptyCommand(String),

    #[error("compiler command is empty")]
    #[diagnostic(code(crosstest::config::empty_compiler))]
    EmptyCompiler,

    #[error("invalid value for {var}: {value:?}")]
    #[diagnostic(code(crosstest::config::env), help("expected a non-negative integer"))]
    Env { var: &'static str, value: String },
}

impl CrossTestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dist_root(mut self, dist_root: impl Into<PathBuf>) -> Self {
        self.dist_root = dist_root.into();
        self
    }

    pub fn with_runtimes(mut self, runtimes: Vec<RuntimeSpec>) -> Self {
        self.runtimes = runtimes;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeSpec) -> Self {
        self.runtimes.push(runtime);
        self
    }

    pub fn with_compiler(mut self, command: Vec<String>) -> Self {
        self.compiler = Some(CompilerSpec { command });
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_debug_max_length(mut self, max: usize) -> Self {
        self.debug_max_length = max;
        self
    }

    /// Parse a JSON config. `origin` names the source in diagnostics.
    pub fn from_json(origin: &str, raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| ConfigError::Parse {
            message: err.to_string(),
            span: (offset_of(raw, err.line(), err.column()), 1).into(),
            src: NamedSource::new(origin, raw.to_string()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read the config at `path`, or use the defaults when no path is given. The environment is
    /// applied on top either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_json(&path.display().to_string(), &raw)?
            }
            None => Self::default(),
        };
        config.with_env()
    }

    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|var| std::env::var(var).ok())
    }

    /// Apply the `CROSSTEST_*` overrides using `lookup` to read variables.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(DEBUG_ENV) {
            self.debug = value.trim() == "1";
        }
        if let Some(value) = lookup(DEBUG_MAX_LENGTH_ENV) {
            self.debug_max_length = value.trim().parse().map_err(|_| ConfigError::Env {
                var: DEBUG_MAX_LENGTH_ENV,
                value,
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtimes.is_empty() {
            return Err(ConfigError::NoRuntimes);
        }
        let mut seen = HashSet::new();
        for runtime in &self.runtimes {
            if !seen.insert(runtime.name.as_str()) {
                return Err(ConfigError::DuplicateRuntime(runtime.name.clone()));
            }
            if matches!(&runtime.kind, RuntimeKind::Process { command, .. } if command.is_empty()) {
                return Err(ConfigError::EmptyCommand(runtime.name.clone()));
            }
        }
        if self.compiler.as_ref().is_some_and(|compiler| compiler.command.is_empty()) {
            return Err(ConfigError::EmptyCompiler);
        }
        Ok(())
    }

    pub fn runtime(&self, name: &str) -> Option<&RuntimeSpec> {
        self.runtimes.iter().find(|runtime| runtime.name == name)
    }
}

/// Byte offset of a 1-based line/column pair, clamped to the source.
fn offset_of(source: &str, line: usize, column: usize) -> usize {
    let line_start: usize = source.split_inclusive('\n').take(line.saturating_sub(1)).map(str::len).sum();
    (line_start + column.saturating_sub(1)).min(source.len().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CrossTestConfig::default();
        assert_eq!(config.dist_root, PathBuf::from(".crosstest_temp"));
        assert_eq!(config.runtimes, vec![RuntimeSpec::in_process("native")]);
        assert_eq!(config.debug_max_length, 256);
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_process_runtime() {
        let raw = r#"{
            "distRoot": "out",
            "runtimes": [
                {"name": "native", "kind": "inProcess"},
                {"name": "node", "kind": "process", "command": ["node", "--enable-source-maps"],
                 "target": {"name": "node", "extension": "mjs", "header": "// h", "footer": "// f"}}
            ]
        }"#;
        let config = CrossTestConfig::from_json("crosstest.json", raw).unwrap();
        assert_eq!(config.dist_root, PathBuf::from("out"));
        assert_eq!(config.debug_max_length, 256);
        let node = config.runtime("node").unwrap();
        match &node.kind {
            RuntimeKind::Process { command, target } => {
                assert_eq!(command, &vec!["node".to_string(), "--enable-source-maps".to_string()]);
                assert_eq!(target.as_ref().map(|t| t.name.as_str()), Some("node"));
            }
            other => panic!("expected process runtime, got {other:?}"),
        }
    }

    #[test]
    fn test_command_appends_artifact_without_placeholder() {
        let runtime = RuntimeSpec::process("bun", vec!["bun".to_string(), "run".to_string()]);
        assert_eq!(
            runtime.command_for(Path::new("a.mjs")).unwrap(),
            vec!["bun".to_string(), "run".to_string(), "a.mjs".to_string()]
        );
    }

    #[test]
    fn test_command_substitutes_placeholder() {
        let runtime = RuntimeSpec::process("node", vec!["node".to_string(), "--entry={artifact}".to_string()]);
        assert_eq!(
            runtime.command_for(Path::new("a.mjs")).unwrap(),
            vec!["node".to_string(), "--entry=a.mjs".to_string()]
        );
        assert!(RuntimeSpec::in_process("x").command_for(Path::new("a")).is_none());
    }

    #[test]
    fn test_duplicate_runtime_rejected() {
        let config = CrossTestConfig::new().with_runtime(RuntimeSpec::in_process("native"));
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateRuntime(name)) if name == "native"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = CrossTestConfig::new().with_runtime(RuntimeSpec::process("node", vec![]));
        assert!(matches!(config.validate(), Err(ConfigError::EmptyCommand(name)) if name == "node"));
    }

    #[test]
    fn test_no_runtimes_rejected() {
        let config = CrossTestConfig::new().with_runtimes(vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::NoRuntimes)));
    }

    #[test]
    fn test_parse_error_points_at_source() {
        let raw = "{\n  \"debug\": tru\n}";
        let err = CrossTestConfig::from_json("bad.json", raw).unwrap_err();
        match err {
            ConfigError::Parse { span, .. } => {
                assert!(span.offset() > 2);
                assert!(span.offset() < raw.len());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_env_overlay() {
        let config = CrossTestConfig::new()
            .with_env_from(|var| match var {
                DEBUG_ENV => Some("1".to_string()),
                DEBUG_MAX_LENGTH_ENV => Some("32".to_string()),
                _ => None,
            })
            .unwrap();
        assert!(config.debug);
        assert_eq!(config.debug_max_length, 32);
    }

    #[test]
    fn test_env_overlay_rejects_bad_length() {
        let result = CrossTestConfig::new().with_env_from(|var| (var == DEBUG_MAX_LENGTH_ENV).then(|| "lots".to_string()));
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_builder_chain() {
        let config = CrossTestConfig::new()
            .with_dist_root("dist")
            .with_compiler(vec!["esbuild".to_string()])
            .with_debug(true)
            .with_debug_max_length(10);
        assert_eq!(config.dist_root, PathBuf::from("dist"));
        assert!(config.compiler.is_some());
        assert!(config.debug);
        assert_eq!(config.debug_max_length, 10);
    }
}
