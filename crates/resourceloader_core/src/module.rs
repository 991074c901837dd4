use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::config::{LoaderSettings, ModuleDefinition, ModuleKind, StyleEntry};
use crate::context::{Direction, LoaderContext};
use crate::css;
use crate::services::LoaderServices;
use crate::timestamp::{NO_TIMESTAMP, max_modified_time};

pub const DEFAULT_SKIN_KEY: &str = "default";
pub const DEFAULT_MEDIA: &str = "all";

/// Value for `skin` when present and non-empty, else the `default` entry,
/// else nothing.
pub fn skin_files<'a, T>(skin: &str, map: &'a BTreeMap<String, Vec<T>>) -> &'a [T] {
    match map.get(skin) {
        Some(values) if !values.is_empty() => values,
        _ => map
            .get(DEFAULT_SKIN_KEY)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    }
}

/// Group style sheets by medium; untagged sheets go under `all`.
pub fn organize_by_media(entries: &[StyleEntry]) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        out.entry(entry.media().unwrap_or(DEFAULT_MEDIA).to_string())
            .or_default()
            .push(entry.path().to_string());
    }
    out
}

/// Module content backed by files under the install root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileModule {
    scripts: Vec<String>,
    styles: Vec<StyleEntry>,
    messages: Vec<String>,
    dependencies: Vec<String>,
    group: Option<String>,
    debug_scripts: Vec<String>,
    language_scripts: BTreeMap<String, Vec<String>>,
    skin_scripts: BTreeMap<String, Vec<String>>,
    skin_styles: BTreeMap<String, Vec<StyleEntry>>,
    loaders: Vec<String>,
}

impl FileModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scripts<I, S>(&mut self, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripts.extend(scripts.into_iter().map(Into::into));
        self
    }

    pub fn add_styles<I, S>(&mut self, styles: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StyleEntry>,
    {
        self.styles.extend(styles.into_iter().map(Into::into));
        self
    }

    pub fn add_messages<I, S>(&mut self, messages: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.messages.extend(messages.into_iter().map(Into::into));
        self
    }

    pub fn add_dependencies<I, S>(&mut self, dependencies: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Scripts only included in debug mode.
    pub fn add_debug_scripts<I, S>(&mut self, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.debug_scripts.extend(scripts.into_iter().map(Into::into));
        self
    }

    pub fn add_language_scripts<I, S>(&mut self, lang: &str, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language_scripts
            .entry(lang.to_string())
            .or_default()
            .extend(scripts.into_iter().map(Into::into));
        self
    }

    /// `skin` may be `default`, used for skins without their own entry.
    pub fn add_skin_scripts<I, S>(&mut self, skin: &str, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skin_scripts
            .entry(skin.to_string())
            .or_default()
            .extend(scripts.into_iter().map(Into::into));
        self
    }

    pub fn add_skin_styles<I, S>(&mut self, skin: &str, styles: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StyleEntry>,
    {
        self.skin_styles
            .entry(skin.to_string())
            .or_default()
            .extend(styles.into_iter().map(Into::into));
        self
    }

    /// Loader scripts replace the default client-side registration.
    pub fn add_loaders<I, S>(&mut self, scripts: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loaders.extend(scripts.into_iter().map(Into::into));
        self
    }

    pub fn set_group(&mut self, group: &str) -> &mut Self {
        self.group = Some(group.to_string());
        self
    }

    fn script(&self, context: &LoaderContext, root: &Path) -> Result<String> {
        let language_scripts = self
            .language_scripts
            .get(&context.language)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut script = [
            concat_files(root, &self.scripts)?,
            concat_files(root, language_scripts)?,
            concat_files(root, skin_files(&context.skin, &self.skin_scripts))?,
        ]
        .join("\n");
        if context.debug {
            script.push_str(&concat_files(root, &self.debug_scripts)?);
        }
        Ok(script)
    }

    fn styles(
        &self,
        name: &str,
        context: &LoaderContext,
        services: &LoaderServices,
    ) -> Result<BTreeMap<String, String>> {
        let root = services.root();
        let mut styles: BTreeMap<String, String> = BTreeMap::new();
        let primary = concat_styles(root, &self.styles)?;
        let skin = concat_styles(root, skin_files(&context.skin, &self.skin_styles))?;
        for (media, css) in primary.into_iter().chain(skin) {
            let entry = styles.entry(media).or_default();
            if !entry.is_empty() {
                entry.push('\n');
            }
            entry.push_str(&css);
        }

        // Only references to existing files are recorded.
        let mut references: Vec<String> = Vec::new();
        for css in styles.values() {
            for file in css::local_file_references(css) {
                if references.contains(&file) {
                    continue;
                }
                match services.clock().modified_time(&root.join(&file)) {
                    Ok(_) => references.push(file),
                    Err(error) if is_not_found(&error) => {
                        debug!(module = name, file = %file, "skipping missing style reference");
                    }
                    Err(error) => return Err(error),
                }
            }
        }
        services
            .dependencies()
            .update(name, &context.skin, &references)?;

        Ok(styles)
    }

    fn loader_script(&self, root: &Path) -> Result<Option<String>> {
        if self.loaders.is_empty() {
            return Ok(None);
        }
        concat_files(root, &self.loaders).map(Some)
    }

    /// Every file whose modification changes this module's output for
    /// `context`, including indirect dependencies recorded for the skin.
    fn freshness_files(
        &self,
        name: &str,
        context: &LoaderContext,
        services: &LoaderServices,
    ) -> Vec<String> {
        let mut files = self.scripts.clone();
        for style_files in organize_by_media(&self.styles).into_values() {
            files.extend(style_files);
        }
        for style_files in
            organize_by_media(skin_files(&context.skin, &self.skin_styles)).into_values()
        {
            files.extend(style_files);
        }
        if context.debug {
            files.extend(self.debug_scripts.iter().cloned());
        }
        if let Some(language_scripts) = self.language_scripts.get(&context.language) {
            files.extend(language_scripts.iter().cloned());
        }
        files.extend(
            skin_files(&context.skin, &self.skin_scripts)
                .iter()
                .cloned(),
        );
        files.extend(self.loaders.iter().cloned());
        files.extend(services.dependencies().get(name, &context.skin));
        files
    }

    fn modified_time(
        &self,
        name: &str,
        context: &LoaderContext,
        services: &LoaderServices,
    ) -> Result<i64> {
        let files = self.freshness_files(name, context, services);
        let files_mtime = max_modified_time(services.clock(), services.root(), &files)?;
        let blob_mtime = services
            .blobs()
            .modified_time(name, &self.messages, &context.language);
        Ok(files_mtime
            .unwrap_or(NO_TIMESTAMP)
            .max(blob_mtime)
            .max(NO_TIMESTAMP))
    }
}

impl From<&ModuleDefinition> for FileModule {
    fn from(definition: &ModuleDefinition) -> Self {
        Self {
            scripts: definition.scripts.clone(),
            styles: definition.styles.clone(),
            messages: definition.messages.clone(),
            dependencies: definition.dependencies.clone(),
            group: definition.group.clone(),
            debug_scripts: definition.debug_scripts.clone(),
            language_scripts: definition.language_scripts.clone(),
            skin_scripts: definition.skin_scripts.clone(),
            skin_styles: definition.skin_styles.clone(),
            loaders: definition.loaders.clone(),
        }
    }
}

/// Module content backed by `MediaWiki:` wiki pages: Common.js/css, the
/// skin's own js/css, Print.css and optionally Handheld.css.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteModule;

impl SiteModule {
    fn script_pages(skin: &str) -> Vec<String> {
        vec!["Common.js".to_string(), format!("{}.js", ucfirst(skin))]
    }

    fn style_pages(skin: &str, settings: &LoaderSettings) -> Vec<(&'static str, Vec<String>)> {
        let mut pages = vec![
            (
                DEFAULT_MEDIA,
                vec!["Common.css".to_string(), format!("{}.css", ucfirst(skin))],
            ),
            ("print", vec!["Print.css".to_string()]),
        ];
        if settings.handheld_style {
            pages.push(("handheld", vec!["Handheld.css".to_string()]));
        }
        pages
    }

    fn page_path(services: &LoaderServices, page: &str) -> PathBuf {
        services.wiki_pages_dir().join("MediaWiki").join(page)
    }

    fn script(&self, context: &LoaderContext, services: &LoaderServices) -> Result<String> {
        let mut parts = Vec::new();
        for page in Self::script_pages(&context.skin) {
            if let Some(content) = read_optional(&Self::page_path(services, &page))? {
                parts.push(content);
            }
        }
        Ok(parts.join("\n"))
    }

    fn styles(
        &self,
        context: &LoaderContext,
        services: &LoaderServices,
    ) -> Result<BTreeMap<String, String>> {
        let mut styles = BTreeMap::new();
        for (media, pages) in Self::style_pages(&context.skin, services.settings()) {
            let mut parts = Vec::new();
            for page in pages {
                if let Some(content) = read_optional(&Self::page_path(services, &page))? {
                    parts.push(content);
                }
            }
            styles.insert(media.to_string(), parts.join("\n"));
        }
        Ok(styles)
    }

    /// Latest touched time among existing pages. Missing pages are skipped,
    /// so deleting a page can move the value backwards.
    fn modified_time(&self, context: &LoaderContext, services: &LoaderServices) -> Result<i64> {
        let mut pages = Self::script_pages(&context.skin);
        for (_, style_pages) in Self::style_pages(&context.skin, services.settings()) {
            pages.extend(style_pages);
        }

        let mut latest = NO_TIMESTAMP;
        for page in pages {
            match services
                .clock()
                .modified_time(&Self::page_path(services, &page))
            {
                Ok(touched) => latest = latest.max(touched),
                Err(error) if is_not_found(&error) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(latest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    Files(FileModule),
    Site(SiteModule),
}

/// A named, independently loadable bundle. The name is assigned once, at
/// registration; freshness is memoized per context hash.
#[derive(Debug)]
pub struct Module {
    name: OnceLock<String>,
    source: ModuleSource,
    modified_times: Mutex<HashMap<String, i64>>,
}

impl Module {
    pub fn new(source: ModuleSource) -> Self {
        Self {
            name: OnceLock::new(),
            source,
            modified_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn files(files: FileModule) -> Self {
        Self::new(ModuleSource::Files(files))
    }

    pub fn site() -> Self {
        Self::new(ModuleSource::Site(SiteModule))
    }

    pub fn from_definition(definition: &ModuleDefinition) -> Self {
        match definition.kind {
            ModuleKind::Files => Self::files(FileModule::from(definition)),
            ModuleKind::Site => Self::site(),
        }
    }

    pub(crate) fn assign_name(&self, name: &str) -> Result<()> {
        self.name.set(name.to_string()).map_err(|_| {
            anyhow!(
                "module {} cannot be renamed to {name}",
                self.name().unwrap_or_default()
            )
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    fn require_name(&self) -> Result<&str> {
        self.name()
            .ok_or_else(|| anyhow!("module has not been registered"))
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn dependencies(&self) -> &[String] {
        match &self.source {
            ModuleSource::Files(files) => &files.dependencies,
            ModuleSource::Site(_) => &[],
        }
    }

    /// Message keys; a key may occur more than once.
    pub fn messages(&self) -> &[String] {
        match &self.source {
            ModuleSource::Files(files) => &files.messages,
            ModuleSource::Site(_) => &[],
        }
    }

    pub fn group(&self) -> Option<&str> {
        match &self.source {
            ModuleSource::Files(files) => files.group.as_deref(),
            ModuleSource::Site(_) => None,
        }
    }

    pub fn client_maxage(&self, settings: &LoaderSettings) -> u64 {
        settings.client_maxage
    }

    pub fn server_maxage(&self, settings: &LoaderSettings) -> u64 {
        settings.server_maxage
    }

    /// Whether CSS should be mirrored for this request.
    pub fn flip(&self, context: &LoaderContext) -> bool {
        context.direction == Direction::Rtl
    }

    /// All script for `context`, excluding loader scripts.
    pub fn script(&self, context: &LoaderContext, services: &LoaderServices) -> Result<String> {
        match &self.source {
            ModuleSource::Files(files) => files.script(context, services.root()),
            ModuleSource::Site(site) => site.script(context, services),
        }
    }

    /// CSS keyed by medium. For file modules this also refreshes the stored
    /// indirect dependencies for the context's skin.
    pub fn styles(
        &self,
        context: &LoaderContext,
        services: &LoaderServices,
    ) -> Result<BTreeMap<String, String>> {
        match &self.source {
            ModuleSource::Files(files) => files.styles(self.require_name()?, context, services),
            ModuleSource::Site(site) => site.styles(context, services),
        }
    }

    pub fn loader_script(&self, services: &LoaderServices) -> Result<Option<String>> {
        match &self.source {
            ModuleSource::Files(files) => files.loader_script(services.root()),
            ModuleSource::Site(_) => Ok(None),
        }
    }

    /// Highest modification time of everything that shapes this module's
    /// output for `context`. Never returns 0. A missing module file fails
    /// the call.
    pub fn modified_time(&self, context: &LoaderContext, services: &LoaderServices) -> Result<i64> {
        let key = context.hash();
        if let Some(cached) = self
            .modified_times
            .lock()
            .ok()
            .and_then(|times| times.get(&key).copied())
        {
            return Ok(cached);
        }

        let name = self.require_name()?;
        let value = match &self.source {
            ModuleSource::Files(files) => files.modified_time(name, context, services),
            ModuleSource::Site(site) => site.modified_time(context, services),
        }
        .with_context(|| format!("failed to compute modified time of module {name}"))?;
        debug!(module = name, context = %key, mtime = value, "computed module modified time");

        if let Ok(mut times) = self.modified_times.lock() {
            times.insert(key, value);
        }
        Ok(value)
    }
}

fn concat_files(root: &Path, files: &[String]) -> Result<String> {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for file in files {
        if seen.insert(file.as_str()) {
            parts.push(read_source(root, file)?);
        }
    }
    Ok(parts.join("\n"))
}

fn concat_styles(root: &Path, entries: &[StyleEntry]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (media, files) in organize_by_media(entries) {
        let mut seen = HashSet::new();
        let mut parts = Vec::new();
        for file in &files {
            if seen.insert(file.as_str()) {
                let content = read_source(root, file)?;
                parts.push(css::remap(&content, parent_dir(file)));
            }
        }
        out.insert(media, parts.join("\n"));
    }
    Ok(out)
}

fn read_source(root: &Path, file: &str) -> Result<String> {
    let path = root.join(file);
    fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn parent_dir(file: &str) -> &str {
    file.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn ucfirst(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .root_cause()
        .downcast_ref::<io::Error>()
        .is_some_and(|error| error.kind() == io::ErrorKind::NotFound)
}
