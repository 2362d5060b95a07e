use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Bucket name used when none is configured.
pub const DEFAULT_VERSION: &str = "inventario-pro-cache-v1";

/// App shell seeded at install time when no manifest is configured.
pub const DEFAULT_ASSETS: &[&str] = &[
  ".",
  "index.html",
  "styles.css",
  "script.js",
  "manifest.json",
  "logo.png",
  "logo-192.png",
  "logo-512.png",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Scope of the application; relative asset locators resolve against it
  pub origin: Option<String>,
  /// Version tag, used as the name of the current bucket
  #[serde(default = "default_version")]
  pub version: String,
  /// Asset manifest. Changing it requires a new version tag.
  #[serde(default = "default_assets")]
  pub assets: Vec<String>,
  /// URL schemes that are never intercepted
  #[serde(default = "default_reserved_schemes")]
  pub reserved_schemes: Vec<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Response served when a request misses the cache and the network is down
  pub offline_fallback: Option<OfflineFallback>,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
  /// Network timeout in seconds
  pub timeout_secs: Option<u64>,
}

fn default_version() -> String {
  DEFAULT_VERSION.to_string()
}

fn default_assets() -> Vec<String> {
  DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect()
}

fn default_reserved_schemes() -> Vec<String> {
  vec!["chrome-extension".to_string()]
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      version: default_version(),
      assets: default_assets(),
      reserved_schemes: default_reserved_schemes(),
      storage: StorageConfig::default(),
      offline_fallback: None,
      log_file: None,
      timeout_secs: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
  /// Persistent SQLite database (default location under the data directory)
  Sqlite {
    #[serde(default)]
    path: Option<PathBuf>,
  },
  /// Buckets vanish when the process exits
  Memory,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self::Sqlite { path: None }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OfflineFallback {
  #[serde(default = "default_fallback_status")]
  pub status: u16,
  #[serde(default = "default_fallback_status_text")]
  pub status_text: String,
  #[serde(default = "default_fallback_body")]
  pub body: String,
}

fn default_fallback_status() -> u16 {
  404
}

fn default_fallback_status_text() -> String {
  "Offline".to_string()
}

fn default_fallback_body() -> String {
  "You are offline and this resource is not cached.".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Apply command line overrides on top of the loaded file.
  pub fn with_overrides(
    self,
    origin: Option<String>,
    version: Option<String>,
    log_file: Option<PathBuf>,
  ) -> Result<Self> {
    let config = Self {
      origin: origin.or(self.origin),
      version: version.unwrap_or(self.version),
      log_file: log_file.or(self.log_file),
      ..self
    };
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }
    Ok(())
  }

  /// Parsed application scope.
  ///
  /// A trailing slash is added to the path so that relative locators resolve
  /// inside the scope rather than next to it.
  pub fn origin_url(&self) -> Result<Url> {
    let origin = self.origin.as_deref().ok_or_else(|| {
      eyre!("No origin configured. Set `origin` in the config file or pass --origin.")
    })?;

    let mut url = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }
    Ok(url)
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_reference_manifest() {
    let config = Config::parse("origin: https://app.test/\n").unwrap();

    assert_eq!(config.version, "inventario-pro-cache-v1");
    assert_eq!(config.assets.len(), 8);
    assert_eq!(config.assets[0], ".");
    assert_eq!(config.reserved_schemes, vec!["chrome-extension"]);
    assert_eq!(config.storage, StorageConfig::Sqlite { path: None });
    assert!(config.offline_fallback.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: https://app.test/inventory
version: inventario-pro-cache-v2
assets:
  - index.html
  - styles.css
storage:
  kind: memory
offline_fallback:
  body: offline
timeout_secs: 5
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.version, "inventario-pro-cache-v2");
    assert_eq!(config.assets, vec!["index.html", "styles.css"]);
    assert_eq!(config.storage, StorageConfig::Memory);
    assert_eq!(config.timeout(), Some(Duration::from_secs(5)));

    let fallback = config.offline_fallback.unwrap();
    assert_eq!(fallback.status, 404);
    assert_eq!(fallback.status_text, "Offline");
    assert_eq!(fallback.body, "offline");
  }

  #[test]
  fn test_origin_gets_trailing_slash() {
    let config = Config::parse("origin: https://app.test/inventory").unwrap();
    let url = config.origin_url().unwrap();

    assert_eq!(url.as_str(), "https://app.test/inventory/");
    assert_eq!(url.join("index.html").unwrap().as_str(), "https://app.test/inventory/index.html");
  }

  #[test]
  fn test_missing_origin_is_an_error() {
    assert!(Config::default().origin_url().is_err());
  }

  #[test]
  fn test_empty_version_rejected() {
    assert!(Config::parse("version: ''").is_err());
  }

  #[test]
  fn test_overrides_replace_file_values() {
    let config = Config::parse("origin: https://app.test/\nversion: v1\n")
      .unwrap()
      .with_overrides(None, Some("v2".to_string()), Some(PathBuf::from("shellcache.log")))
      .unwrap();

    assert_eq!(config.origin.as_deref(), Some("https://app.test/"));
    assert_eq!(config.version, "v2");
    assert_eq!(config.log_file, Some(PathBuf::from("shellcache.log")));
  }

  #[test]
  fn test_empty_version_override_rejected() {
    let result = Config::parse("version: v1\n")
      .unwrap()
      .with_overrides(None, Some("  ".to_string()), None);
    assert!(result.is_err());
  }

  #[test]
  fn test_explicit_missing_file_is_an_error() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }
}
