//! Configuration for shelf paths and library settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHELF_HOME, SHELF_CONTENT_ROOT)
//! 2. Config file (.shelf/config.yaml)
//! 3. Defaults (~/.shelf)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shelf/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::settings::LibrarySettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".shelf";
const CONFIG_FILE: &str = "config.yaml";
const DATABASE_FILE: &str = "content.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub library: Option<LibrarySettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Library state directory (relative to .shelf/)
    pub home: Option<String>,
    /// Content storage root (relative to the project root)
    pub content_root: Option<String>,
    /// Record database (relative to home)
    pub database: Option<String>,
    /// Scratch space for imports and exports (relative to home)
    pub temp_dir: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Library state directory
    pub home: PathBuf,
    /// Root under which imported content directories are created
    pub content_root: PathBuf,
    pub database_path: PathBuf,
    pub temp_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub library: LibrarySettings,
}

impl ResolvedConfig {
    /// Defaults for a given home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            content_root: home.join("content"),
            database_path: home.join(DATABASE_FILE),
            temp_dir: home.join("tmp"),
            home,
            config_file: None,
            library: LibrarySettings::default(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Apply a parsed config file on top of the defaults
fn resolve_config_file(
    config_path: &Path,
    config: ConfigFile,
    env_home: Option<PathBuf>,
    env_content_root: Option<PathBuf>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let shelf_dir = config_path.parent().unwrap_or(Path::new("."));
    // Project root is the parent of .shelf/
    let base_dir = shelf_dir.parent().unwrap_or(Path::new("."));

    let home = env_home
        .or_else(|| config.paths.home.as_deref().map(|h| resolve_path(shelf_dir, h)))
        .unwrap_or(default_home);

    let mut resolved = ResolvedConfig::with_home(home);

    if let Some(root) = env_content_root
        .or_else(|| config.paths.content_root.as_deref().map(|r| resolve_path(base_dir, r)))
    {
        resolved.content_root = root;
    }
    if let Some(database) = &config.paths.database {
        resolved.database_path = resolve_path(&resolved.home, database);
    }
    if let Some(temp) = &config.paths.temp_dir {
        resolved.temp_dir = resolve_path(&resolved.home, temp);
    }
    if let Some(library) = config.library {
        resolved.library = library;
    }
    resolved.config_file = Some(config_path.to_path_buf());

    resolved
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let env_home = std::env::var("SHELF_HOME").ok().map(PathBuf::from);
    let env_content_root = std::env::var("SHELF_CONTENT_ROOT").ok().map(PathBuf::from);

    if let Some(config_path) = find_config_file() {
        let config = load_config_file(&config_path)?;
        return Ok(resolve_config_file(
            &config_path,
            config,
            env_home,
            env_content_root,
            default_home,
        ));
    }

    // No config file - use env vars or defaults
    let mut resolved = ResolvedConfig::with_home(env_home.unwrap_or(default_home));
    if let Some(root) = env_content_root {
        resolved.content_root = root;
    }
    Ok(resolved)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{e:#}")));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    use crate::core::settings::ExtractionFailurePolicy;

    #[test]
    fn test_defaults_for_home() {
        let config = ResolvedConfig::with_home("/data/.shelf");

        assert_eq!(config.content_root, PathBuf::from("/data/.shelf/content"));
        assert_eq!(config.database_path, PathBuf::from("/data/.shelf/content.db"));
        assert_eq!(config.temp_dir, PathBuf::from("/data/.shelf/tmp"));
        assert!(config.config_file.is_none());
        assert_eq!(config.library, LibrarySettings::default());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let shelf_dir = temp.path().join(".shelf");
        std::fs::create_dir_all(&shelf_dir).unwrap();

        let config_path = shelf_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./
  content_root: ../library
library:
  max_compatibility_level: 4
  extraction_failure_policy: abort
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./".to_string()));
        assert_eq!(config.paths.content_root, Some("../library".to_string()));

        let library = config.library.unwrap();
        assert_eq!(library.max_compatibility_level, 4);
        assert_eq!(library.extraction_failure_policy, ExtractionFailurePolicy::Abort);
        // Unset knobs keep their defaults
        assert_eq!(
            library.supported_manifest_versions,
            LibrarySettings::default().supported_manifest_versions
        );
    }

    #[test]
    fn test_env_overrides_config_file() {
        let config_path = PathBuf::from("/project/.shelf/config.yaml");
        let config: ConfigFile = serde_yaml::from_str(
            r#"
version: "1.0"
paths:
  home: /srv/shelf
  content_root: /srv/content
  temp_dir: scratch
"#,
        )
        .unwrap();

        let resolved = resolve_config_file(
            &config_path,
            config,
            None,
            Some(PathBuf::from("/mnt/sd/content")),
            PathBuf::from("/home/user/.shelf"),
        );

        assert_eq!(resolved.home, PathBuf::from("/srv/shelf"));
        assert_eq!(resolved.content_root, PathBuf::from("/mnt/sd/content"));
        assert_eq!(resolved.temp_dir, PathBuf::from("/srv/shelf/scratch"));
        assert_eq!(resolved.database_path, PathBuf::from("/srv/shelf/content.db"));
        assert_eq!(resolved.config_file, Some(config_path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
