use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};

pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_SKIN: &str = "vector";

const RTL_LANGUAGES: &[&str] = &["ar", "arc", "dv", "fa", "he", "ks", "ps", "ur", "yi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Only {
    Scripts,
    Styles,
    Messages,
}

impl Only {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scripts => "scripts",
            Self::Styles => "styles",
            Self::Messages => "messages",
        }
    }
}

impl FromStr for Only {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "scripts" => Ok(Self::Scripts),
            "styles" => Ok(Self::Styles),
            "messages" => Ok(Self::Messages),
            other => bail!("unknown `only` selector: {other}"),
        }
    }
}

impl fmt::Display for Only {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ltr,
    Rtl,
}

impl Direction {
    pub fn for_language(language: &str) -> Self {
        let base = language.split('-').next().unwrap_or(language);
        if RTL_LANGUAGES.contains(&base) {
            Self::Rtl
        } else {
            Self::Ltr
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ltr => "ltr",
            Self::Rtl => "rtl",
        }
    }
}

/// What a single load request varies by. Only language, skin, debug and
/// `only` take part in `hash`; direction and server do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderContext {
    pub language: String,
    pub skin: String,
    pub debug: bool,
    pub only: Option<Only>,
    pub direction: Direction,
    pub server: String,
}

impl LoaderContext {
    pub fn new(language: &str, skin: &str) -> Self {
        Self {
            language: language.to_string(),
            skin: skin.to_string(),
            debug: false,
            only: None,
            direction: Direction::for_language(language),
            server: crate::config::DEFAULT_SERVER.to_string(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_only(mut self, only: Option<Only>) -> Self {
        self.only = only;
        self
    }

    pub fn with_server(mut self, server: &str) -> Self {
        self.server = server.to_string();
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Cache key for per-context memoization.
    pub fn hash(&self) -> String {
        let variant = format!(
            "{}|{}|{}|{}",
            self.language,
            self.skin,
            if self.debug { "1" } else { "0" },
            self.only.map(Only::as_str).unwrap_or("")
        );
        let digest = Sha256::digest(variant.as_bytes());
        let mut output = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            output.push_str(&format!("{byte:02x}"));
        }
        output
    }
}

impl Default for LoaderContext {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGE, DEFAULT_SKIN)
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, LoaderContext, Only};

    #[test]
    fn hash_depends_on_variant_tuple_only() {
        let base = LoaderContext::new("en", "vector");
        let same = LoaderContext::new("en", "vector")
            .with_server("https://other.example/load.php")
            .with_direction(Direction::Rtl);
        assert_eq!(base.hash(), same.hash());

        assert_ne!(base.hash(), LoaderContext::new("de", "vector").hash());
        assert_ne!(base.hash(), LoaderContext::new("en", "monobook").hash());
        assert_ne!(base.hash(), base.clone().with_debug(true).hash());
        assert_ne!(
            base.hash(),
            base.clone().with_only(Some(Only::Scripts)).hash()
        );
    }

    #[test]
    fn direction_follows_language() {
        assert_eq!(LoaderContext::new("he", "vector").direction, Direction::Rtl);
        assert_eq!(Direction::for_language("fa-ir"), Direction::Rtl);
        assert_eq!(Direction::for_language("en"), Direction::Ltr);
    }

    #[test]
    fn only_parses_known_selectors() {
        assert_eq!("styles".parse::<Only>().expect("parse"), Only::Styles);
        assert!("everything".parse::<Only>().is_err());
    }
}
