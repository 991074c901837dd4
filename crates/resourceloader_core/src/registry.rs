use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::context::{Direction, LoaderContext, Only};
use crate::module::Module;
use crate::services::LoaderServices;
use crate::timestamp::{NO_TIMESTAMP, to_iso8601};

pub const STARTUP_MAXAGE: u64 = 5 * 60;
pub const STARTUP_SCRIPT: &str = "resources/startup.js";

/// Modules loaded by the startup script before anything else.
const BOOTSTRAP_MODULES: [&str; 2] = ["jquery", "mediawiki"];

/// Client-side registration of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub modified_time: i64,
    pub dependencies: Vec<String>,
    pub group: Option<String>,
    /// Replaces the generated registration when present.
    pub loader: Option<String>,
}

impl Registration {
    /// `[name, mtime, deps?, group?]` with trailing empty positions dropped.
    pub fn to_json(&self) -> Value {
        let mut entry = vec![json!(self.name), json!(self.modified_time)];
        if !self.dependencies.is_empty() || self.group.is_some() {
            entry.push(json!(self.dependencies));
        }
        if let Some(group) = &self.group {
            entry.push(json!(group));
        }
        Value::Array(entry)
    }
}

pub struct ResourceLoader {
    services: LoaderServices,
    modules: BTreeMap<String, Module>,
    startup_times: Mutex<HashMap<String, i64>>,
}

impl ResourceLoader {
    pub fn new(services: LoaderServices) -> Self {
        Self {
            services,
            modules: BTreeMap::new(),
            startup_times: Mutex::new(HashMap::new()),
        }
    }

    /// Register every module declared in `config`.
    pub fn from_config(config: &LoaderConfig, services: LoaderServices) -> Result<Self> {
        let mut loader = Self::new(services);
        for (name, definition) in &config.modules {
            loader.register(name, Module::from_definition(definition))?;
        }
        info!(modules = loader.modules.len(), "registered modules");
        Ok(loader)
    }

    pub fn register(&mut self, name: &str, module: Module) -> Result<()> {
        if self.modules.contains_key(name) {
            bail!("module {name} is already registered");
        }
        module.assign_name(name)?;
        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    pub fn services(&self) -> &LoaderServices {
        &self.services
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    fn require_module(&self, name: &str) -> Result<&Module> {
        match self.modules.get(name) {
            Some(module) => Ok(module),
            None => bail!("unknown module: {name}"),
        }
    }

    /// Registered modules in name order.
    pub fn modules(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.modules
            .iter()
            .map(|(name, module)| (name.as_str(), module))
    }

    pub fn modified_time(&self, name: &str, context: &LoaderContext) -> Result<i64> {
        self.require_module(name)?
            .modified_time(context, &self.services)
    }

    pub fn highest_modified_time(&self, context: &LoaderContext) -> Result<i64> {
        let mut highest = NO_TIMESTAMP;
        for module in self.modules.values() {
            highest = highest.max(module.modified_time(context, &self.services)?);
        }
        Ok(highest)
    }

    pub fn startup_modified_time(&self, context: &LoaderContext) -> Result<i64> {
        let key = context.hash();
        if let Some(cached) = self
            .startup_times
            .lock()
            .ok()
            .and_then(|times| times.get(&key).copied())
        {
            return Ok(cached);
        }

        let startup = self
            .services
            .clock()
            .modified_time(&self.services.root().join(STARTUP_SCRIPT))?;
        let value = startup.max(self.highest_modified_time(context)?);
        if let Ok(mut times) = self.startup_times.lock() {
            times.insert(key, value);
        }
        Ok(value)
    }

    /// The startup script is mirrored when the request direction differs
    /// from the content language's.
    pub fn startup_flip(&self, context: &LoaderContext) -> bool {
        Direction::for_language(&self.services.settings().content_language) != context.direction
    }

    pub fn registrations(&self, context: &LoaderContext) -> Result<Vec<Registration>> {
        let mut out = Vec::with_capacity(self.modules.len());
        for (name, module) in &self.modules {
            out.push(Registration {
                name: name.clone(),
                modified_time: module.modified_time(context, &self.services)?,
                dependencies: module.dependencies().to_vec(),
                group: module.group().map(str::to_string),
                loader: module.loader_script(&self.services)?,
            });
        }
        Ok(out)
    }

    /// Custom loader scripts followed by one `mediaWiki.loader.register`
    /// call for every other module.
    pub fn registration_script(&self, context: &LoaderContext) -> Result<String> {
        let mut script = String::new();
        let mut entries = Vec::new();
        for registration in self.registrations(context)? {
            match &registration.loader {
                Some(loader) => {
                    script.push_str(loader);
                    script.push('\n');
                }
                None => entries.push(registration.to_json()),
            }
        }
        let entries =
            serde_json::to_string(&entries).context("failed to encode module registrations")?;
        script.push_str(&format!("mediaWiki.loader.register( {entries} );"));
        Ok(script)
    }

    pub fn startup_script(&self, context: &LoaderContext) -> Result<String> {
        let path = self.services.root().join(STARTUP_SCRIPT);
        let mut script = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if context.only != Some(Only::Scripts) {
            return Ok(script);
        }

        let registrations = self.registration_script(context)?;
        let config = json!({ "server": context.server, "debug": context.debug });
        script.push_str(&format!(
            "window.startUp = function() {{ {registrations} mediaWiki.config.set( {config} ); }};"
        ));

        let src = self.bootstrap_url(context)?.replace('&', "&amp;");
        script.push_str(&format!(
            "if ( isCompatible() ) {{ document.write( '<script src=\"{src}\"></script>' ); }}"
        ));
        script.push_str("delete window['isCompatible'];");
        Ok(script)
    }

    /// Load URL for the bootstrap modules, versioned by their freshness
    /// rounded to the nearest 100 seconds.
    pub fn bootstrap_url(&self, context: &LoaderContext) -> Result<String> {
        let mut newest = NO_TIMESTAMP;
        for name in BOOTSTRAP_MODULES {
            if let Some(module) = self.modules.get(name) {
                newest = newest.max(module.modified_time(context, &self.services)?);
            }
        }
        let version = to_iso8601(round_to_hundred(newest));

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("modules", &BOOTSTRAP_MODULES.join("|"))
            .append_pair("only", Only::Scripts.as_str())
            .append_pair("lang", &context.language)
            .append_pair("dir", context.direction.as_str())
            .append_pair("skin", &context.skin);
        if context.debug {
            query.append_pair("debug", "1");
        }
        query.append_pair("version", &version);
        Ok(format!("{}?{}", context.server, query.finish()))
    }

    /// Response body for a load request. Unknown names are reported to the
    /// client as missing instead of failing the request.
    pub fn respond(&self, context: &LoaderContext, names: &[String]) -> Result<String> {
        let wants = |part: Only| context.only.is_none_or(|only| only == part);
        let mut out = String::new();
        let mut missing = BTreeMap::new();

        for name in names {
            let Some(module) = self.modules.get(name) else {
                debug!(module = %name, "requested unknown module");
                missing.insert(name.as_str(), "missing");
                continue;
            };

            let script = if wants(Only::Scripts) {
                module.script(context, &self.services)?
            } else {
                String::new()
            };
            let styles = if wants(Only::Styles) {
                module.styles(context, &self.services)?
            } else {
                BTreeMap::new()
            };
            let messages = if wants(Only::Messages) && !module.messages().is_empty() {
                self.services.blobs().blob(name, &context.language)?
            } else {
                None
            };

            let name = serde_json::to_string(name).context("failed to encode module name")?;
            let styles = serde_json::to_string(&styles).context("failed to encode styles")?;
            let messages = messages.unwrap_or_else(|| "{}".to_string());
            out.push_str(&format!(
                "mediaWiki.loader.implement( {name}, function() {{\n{script}\n}}, {styles}, {messages} );\n"
            ));
        }

        if !missing.is_empty() {
            let states = serde_json::to_string(&missing).context("failed to encode states")?;
            out.push_str(&format!("mediaWiki.loader.state( {states} );\n"));
        }
        Ok(out)
    }
}

fn round_to_hundred(value: i64) -> i64 {
    (value + 50).div_euclid(100) * 100
}
