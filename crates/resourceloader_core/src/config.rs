use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER: &str = "/load.php";
pub const DEFAULT_CONTENT_LANGUAGE: &str = "en";
/// 30 days, in seconds.
pub const DEFAULT_MAXAGE: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoaderConfig {
    #[serde(default)]
    pub loader: LoaderSection,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoaderSection {
    pub server: Option<String>,
    pub content_language: Option<String>,
    pub client_maxage: Option<u64>,
    pub server_maxage: Option<u64>,
    #[serde(default)]
    pub handheld_style: bool,
    #[serde(default = "default_true")]
    pub shared_cache: bool,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            server: None,
            content_language: None,
            client_maxage: None,
            server_maxage: None,
            handheld_style: false,
            shared_cache: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    #[default]
    Files,
    Site,
}

/// One style sheet, optionally restricted to a CSS medium.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StyleEntry {
    Path(String),
    Media { path: String, media: String },
}

impl StyleEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(path) | Self::Media { path, .. } => path,
        }
    }

    pub fn media(&self) -> Option<&str> {
        match self {
            Self::Path(_) => None,
            Self::Media { media, .. } => Some(media),
        }
    }
}

impl From<&str> for StyleEntry {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

/// Declarative module definition as written under `[modules.<name>]`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ModuleDefinition {
    pub kind: ModuleKind,
    pub scripts: Vec<String>,
    pub styles: Vec<StyleEntry>,
    pub messages: Vec<String>,
    pub dependencies: Vec<String>,
    pub group: Option<String>,
    pub debug_scripts: Vec<String>,
    pub language_scripts: BTreeMap<String, Vec<String>>,
    pub skin_scripts: BTreeMap<String, Vec<String>>,
    pub skin_styles: BTreeMap<String, Vec<StyleEntry>>,
    pub loaders: Vec<String>,
}

/// Loader-wide settings after env overrides have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSettings {
    pub server: String,
    pub content_language: String,
    pub client_maxage: u64,
    pub server_maxage: u64,
    pub handheld_style: bool,
    pub shared_cache: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        LoaderConfig::default().settings()
    }
}

impl LoaderConfig {
    /// Resolve settings: env > config > default.
    pub fn settings(&self) -> LoaderSettings {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    fn settings_with_lookup<F>(&self, lookup_env: F) -> LoaderSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_string = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_u64 = |key: &str| env_string(key).and_then(|value| value.parse::<u64>().ok());

        LoaderSettings {
            server: env_string("RESOURCELOADER_SERVER")
                .or_else(|| self.loader.server.clone())
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            content_language: self
                .loader
                .content_language
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_LANGUAGE.to_string()),
            client_maxage: env_u64("RESOURCELOADER_CLIENT_MAXAGE")
                .or(self.loader.client_maxage)
                .unwrap_or(DEFAULT_MAXAGE),
            server_maxage: env_u64("RESOURCELOADER_SERVER_MAXAGE")
                .or(self.loader.server_maxage)
                .unwrap_or(DEFAULT_MAXAGE),
            handheld_style: self.loader.handheld_style,
            shared_cache: self.loader.shared_cache,
        }
    }
}

/// Load and parse a LoaderConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<LoaderConfig> {
    if !config_path.exists() {
        return Ok(LoaderConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    parse_config(&content).with_context(|| format!("failed to parse {}", config_path.display()))
}

pub fn parse_config(content: &str) -> Result<LoaderConfig> {
    Ok(toml::from_str(content)?)
}

pub fn render_starter_config() -> String {
    format!(
        "# resourceloader configuration (materialized by `resourceloader init`)\n\n[loader]\nserver = \"{DEFAULT_SERVER}\"\ncontent_language = \"{DEFAULT_CONTENT_LANGUAGE}\"\nclient_maxage = {DEFAULT_MAXAGE}\nserver_maxage = {DEFAULT_MAXAGE}\nhandheld_style = false\nshared_cache = true\n\n# [modules.jquery]\n# scripts = [\"resources/jquery/jquery.js\"]\n#\n# [modules.\"mediawiki.util\"]\n# scripts = [\"resources/mediawiki.util/mediawiki.util.js\"]\n# styles = [\"resources/mediawiki.util/util.css\", {{ path = \"resources/mediawiki.util/print.css\", media = \"print\" }}]\n# dependencies = [\"jquery\"]\n# messages = [\"showtoc\", \"hidetoc\"]\n\n[modules.site]\nkind = \"site\"\n"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        DEFAULT_MAXAGE, LoaderConfig, ModuleKind, StyleEntry, load_config, parse_config,
        render_starter_config,
    };

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.modules.is_empty());
        assert!(config.loader.shared_cache);
    }

    #[test]
    fn load_config_parses_modules() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[loader]
server = "https://wiki.example.org/load.php"
client_maxage = 60

[modules.jquery]
scripts = ["resources/jquery/jquery.js"]

[modules."mediawiki.util"]
scripts = ["resources/util.js"]
styles = ["resources/util.css", { path = "resources/print.css", media = "print" }]
messages = ["showtoc"]
dependencies = ["jquery"]
group = "util"

[modules."mediawiki.util".skin_styles]
vector = ["resources/vector.css"]
default = [{ path = "resources/default-print.css", media = "print" }]

[modules."mediawiki.util".language_scripts]
de = ["resources/util.de.js"]

[modules.site]
kind = "site"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.modules.len(), 3);
        let util = &config.modules["mediawiki.util"];
        assert_eq!(util.kind, ModuleKind::Files);
        assert_eq!(
            util.styles,
            vec![
                StyleEntry::from("resources/util.css"),
                StyleEntry::Media {
                    path: "resources/print.css".to_string(),
                    media: "print".to_string(),
                },
            ]
        );
        assert_eq!(util.group.as_deref(), Some("util"));
        assert_eq!(util.skin_styles["default"][0].media(), Some("print"));
        assert_eq!(util.language_scripts["de"], vec!["resources/util.de.js"]);
        assert_eq!(config.modules["site"].kind, ModuleKind::Site);

        let settings = config.settings_with_lookup(|_| None);
        assert_eq!(settings.server, "https://wiki.example.org/load.php");
        assert_eq!(settings.client_maxage, 60);
        assert_eq!(settings.server_maxage, DEFAULT_MAXAGE);
    }

    #[test]
    fn env_overrides_config_values() {
        let config = parse_config("[loader]\nserver = \"/w/load.php\"\n").expect("parse");
        let env = HashMap::from([
            ("RESOURCELOADER_SERVER".to_string(), "/env/load.php".to_string()),
            ("RESOURCELOADER_SERVER_MAXAGE".to_string(), "300".to_string()),
            ("RESOURCELOADER_CLIENT_MAXAGE".to_string(), "soon".to_string()),
        ]);
        let settings = config.settings_with_lookup(|key| env.get(key).cloned());
        assert_eq!(settings.server, "/env/load.php");
        assert_eq!(settings.server_maxage, 300);
        assert_eq!(settings.client_maxage, DEFAULT_MAXAGE);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[modules.core\nscripts = 1").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn starter_config_parses() {
        let config = parse_config(&render_starter_config()).expect("parse starter");
        assert_eq!(config.loader.server.as_deref(), Some("/load.php"));
        assert_eq!(config.loader.client_maxage, Some(DEFAULT_MAXAGE));
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules["site"].kind, ModuleKind::Site);
        assert_ne!(config, LoaderConfig::default());
    }
}
