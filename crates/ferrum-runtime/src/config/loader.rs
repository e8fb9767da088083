//! Layered configuration loading on figment.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. [`FerrumConfig::default`]
//! 2. `ferrum.<profile>.<ext>` from the first search directory holding a
//!    config file
//! 3. `ferrum.<ext>` from that same directory (or the single file given to
//!    [`ConfigLoader::file`])
//! 4. `FERRUM_*` environment variables, `__` separating nested keys, so
//!    `FERRUM_COMMANDS__DEFAULT_COOLDOWN__RATE=2` sets
//!    `commands.default_cooldown.rate`
//! 5. values given to [`ConfigLoader::set`] and [`ConfigLoader::merge`]
//!
//! `<ext>` is `toml` with the `toml-config` feature (on by default) and
//! `yaml`/`yml` with `yaml-config`.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .set("commands.prefixes", ["?"])
//!     .load()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "toml-config", feature = "yaml-config"))]
use figment::providers::Format;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::FerrumConfig;

const FILE_STEM: &str = "ferrum";
const ENV_PREFIX: &str = "FERRUM_";

/// File extensions the enabled features can read, in lookup order.
const EXTENSIONS: &[&str] = &[
    #[cfg(feature = "toml-config")]
    "toml",
    #[cfg(feature = "yaml-config")]
    "yaml",
    #[cfg(feature = "yaml-config")]
    "yml",
];

/// Selects the `ferrum.<profile>.*` overlay file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Accepts the short forms `dev` and `prod`; anything else is custom.
    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "dev" | "development" => Self::Development,
            "prod" | "production" => Self::Production,
            _ => Self::Custom(name),
        }
    }

    /// `FERRUM_PROFILE`, or development when unset.
    pub fn from_env() -> Self {
        match std::env::var("FERRUM_PROFILE") {
            Ok(name) => Self::parse(&name),
            Err(_) => Self::default(),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ConfigLoader {
    profile: Profile,
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    load_env: bool,
    overrides: Figment,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            explicit_file: None,
            load_env: true,
            overrides: Figment::new(),
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a directory to search. Without any, the working directory and
    /// `<config dir>/ferrum` are searched.
    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(dir) => self.search_path(dir),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match user_config_dir() {
            Some(dir) => self.search_path(dir),
            None => self,
        }
    }

    /// Reads exactly this file and skips the directory search.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a whole configuration above every other source.
    pub fn merge(mut self, config: FerrumConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    /// Sets one dotted key above every other source, e.g.
    /// `.set("client.token", token)`.
    pub fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.overrides = self.overrides.merge(Serialized::default(key, value));
        self
    }

    pub fn load(self) -> ConfigResult<FerrumConfig> {
        let profile = self.profile.clone();
        let config: FerrumConfig = self.figment()?.extract()?;
        debug!(profile = %profile, level = %config.logging.level, "Configuration loaded");
        Ok(config)
    }

    fn figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(FerrumConfig::default()));

        for path in self.files()? {
            info!(path = %path.display(), "Reading configuration file");
            figment = merge_file(figment, &path)?;
        }
        if self.load_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment.merge(self.overrides))
    }

    /// Files to merge, lowest priority first.
    fn files(&self) -> ConfigResult<Vec<PathBuf>> {
        if let Some(path) = &self.explicit_file {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            return Ok(vec![path.clone()]);
        }

        let dirs = if self.search_paths.is_empty() {
            default_search_paths()
        } else {
            self.search_paths.clone()
        };
        for dir in &dirs {
            let Some(base) = find_file(dir, FILE_STEM) else {
                continue;
            };
            let overlay = find_file(dir, &format!("{FILE_STEM}.{}", self.profile));
            return Ok(overlay.into_iter().chain([base]).collect());
        }

        warn!(searched = ?dirs, "No configuration file found, using defaults");
        Ok(Vec::new())
    }
}

fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(FILE_STEM))
}

fn default_search_paths() -> Vec<PathBuf> {
    std::env::current_dir()
        .ok()
        .into_iter()
        .chain(user_config_dir())
        .collect()
}

/// First `<dir>/<stem>.<ext>` that exists, over the enabled extensions.
fn find_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())
}

#[allow(unused_variables)]
fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(figment::providers::Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(figment::providers::Yaml::file(path))),
        other => Err(ConfigError::UnsupportedFormat(format!(
            "{} (.{other} support is not enabled)",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use ferrum_commands::BucketScope;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|jail| {
            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .without_env()
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, LogLevel::Info);
            assert_eq!(config.commands.prefixes, ["!"]);
            assert!(config.commands.ignore_bots);
            assert_eq!(config.cache.max_messages, 1000);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_then_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ferrum.toml",
                r#"
                [client]
                token = "from-file"
                intents = 513

                [commands]
                prefixes = ["?"]
                default_cooldown = { rate = 2, per_secs = 10.0, scope = "user" }

                [logging]
                level = "debug"
                "#,
            )?;
            jail.set_env("FERRUM_LOGGING__LEVEL", "warn");
            jail.set_env("FERRUM_CLIENT__TOKEN", "from-env");

            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .set("client.intents", 1)
                .load()
                .map_err(|e| e.to_string())?;

            assert_eq!(config.client.token, "from-env");
            assert_eq!(config.client.intents, 1);
            assert_eq!(config.logging.level, LogLevel::Warn);
            assert_eq!(config.commands.prefixes, ["?"]);
            let cooldown = config.commands.default_cooldown.unwrap();
            assert_eq!(cooldown.rate, 2);
            assert_eq!(cooldown.scope, BucketScope::User);
            Ok(())
        });
    }

    #[test]
    fn test_profile_file_is_below_main_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ferrum.production.toml",
                "[client]\ntoken = \"prod\"\nintents = 7\n",
            )?;
            jail.create_file("ferrum.toml", "[client]\ntoken = \"main\"\n")?;

            let config = ConfigLoader::new()
                .profile("prod")
                .search_path(jail.directory())
                .without_env()
                .load()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.client.token, "main");
            assert_eq!(config.client.intents, 7);
            Ok(())
        });
    }

    #[test]
    fn test_profile_file_alone_is_ignored() {
        Jail::expect_with(|jail| {
            jail.create_file("ferrum.production.toml", "[client]\ntoken = \"prod\"\n")?;
            let config = ConfigLoader::new()
                .profile("production")
                .search_path(jail.directory())
                .without_env()
                .load()
                .map_err(|e| e.to_string())?;
            assert!(config.client.token.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = ConfigLoader::new()
            .file("/definitely/not/here/ferrum.toml")
            .without_env()
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        Jail::expect_with(|jail| {
            jail.create_file("ferrum.ini", "token = x")?;
            let result = ConfigLoader::new().file("ferrum.ini").without_env().load();
            assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
            Ok(())
        });
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(Profile::parse("PROD"), Profile::Production);
        assert_eq!(Profile::parse("dev"), Profile::Development);
        assert_eq!(Profile::parse("Staging").as_str(), "staging");
    }
}
