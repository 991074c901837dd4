use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use resourceloader_core::config::{LoaderSettings, load_config};
use resourceloader_core::context::{DEFAULT_LANGUAGE, DEFAULT_SKIN, LoaderContext, Only};
use resourceloader_core::migrate::run_migrations;
use resourceloader_core::registry::{ResourceLoader, STARTUP_MAXAGE};
use resourceloader_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use resourceloader_core::services::LoaderServices;
use resourceloader_core::storage::Database;
use resourceloader_core::timestamp::unix_now;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "resourceloader",
    version,
    about = "Resolve, bundle and version client-side modules"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    #[command(about = "List registered modules with their modified time")]
    Modules(ContextArgs),
    Mtime(ModuleArgs),
    Script(ModuleArgs),
    Styles(ModuleArgs),
    #[command(about = "Show declared and recorded file dependencies of a module")]
    Deps(ModuleArgs),
    Startup(ContextArgs),
    #[command(about = "Print the response body for a load request")]
    Load(LoadArgs),
    Blob(BlobArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config and startup files")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Clone, Args)]
struct ContextArgs {
    #[arg(long, default_value = DEFAULT_LANGUAGE)]
    lang: String,
    #[arg(long, default_value = DEFAULT_SKIN)]
    skin: String,
    #[arg(long)]
    debug: bool,
    #[arg(long, value_name = "scripts|styles|messages")]
    only: Option<String>,
}

impl ContextArgs {
    fn to_context(&self, settings: &LoaderSettings) -> Result<LoaderContext> {
        let only = self
            .only
            .as_deref()
            .map(str::parse::<Only>)
            .transpose()?;
        Ok(LoaderContext::new(&self.lang, &self.skin)
            .with_debug(self.debug)
            .with_only(only)
            .with_server(&settings.server))
    }
}

#[derive(Debug, Args)]
struct ModuleArgs {
    module: String,
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Debug, Args)]
struct LoadArgs {
    #[arg(required = true)]
    modules: Vec<String>,
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Debug, Args)]
struct BlobArgs {
    #[command(subcommand)]
    command: BlobSubcommand,
}

#[derive(Debug, Subcommand)]
enum BlobSubcommand {
    #[command(about = "Store a message blob for a module and language")]
    Set {
        module: String,
        lang: String,
        blob: String,
        #[arg(long, value_name = "UNIX", help = "Defaults to now")]
        timestamp: Option<i64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Modules(context)) => run_modules(&runtime, &context),
        Some(Commands::Mtime(args)) => run_mtime(&runtime, &args),
        Some(Commands::Script(args)) => run_script(&runtime, &args),
        Some(Commands::Styles(args)) => run_styles(&runtime, &args),
        Some(Commands::Deps(args)) => run_deps(&runtime, &args),
        Some(Commands::Startup(context)) => run_startup(&runtime, &context),
        Some(Commands::Load(args)) => run_load(&runtime, &args),
        Some(Commands::Blob(BlobArgs { command })) => match command {
            BlobSubcommand::Set {
                module,
                lang,
                blob,
                timestamp,
            } => run_blob_set(&runtime, &module, &lang, &blob, timestamp),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized resourceloader runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("resources: {}", normalize_path(&paths.resources_dir));
    println!("wiki_pages: {}", normalize_path(&paths.wiki_pages_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_startup_script: {}", report.wrote_startup_script);
    println!("applied_migrations: {}", migrations.applied.len());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("applied: <none>");
    }
    for migration in &report.applied {
        println!("applied: v{:03} {}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    match Database::open_existing(&paths.db_path)? {
        Some(database) => {
            let stats = database.stats()?;
            println!("schema_version: {}", stats.schema_version);
            println!("pending_migrations: {}", database.pending_migration_count()?);
            println!("module_deps_rows: {}", stats.module_deps_rows);
            println!("msg_resource_rows: {}", stats.msg_resource_rows);
        }
        None => println!("db: <not created> (run `resourceloader init`)"),
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_modules(runtime: &RuntimeOptions, args: &ContextArgs) -> Result<()> {
    let (paths, loader) = open_loader(runtime)?;
    let context = args.to_context(loader.services().settings())?;

    for registration in loader.registrations(&context)? {
        println!(
            "{}: mtime={} group={} dependencies={}{}",
            registration.name,
            registration.modified_time,
            registration.group.as_deref().unwrap_or("-"),
            format_list(&registration.dependencies),
            if registration.loader.is_some() {
                " loader=custom"
            } else {
                ""
            }
        );
    }
    println!(
        "startup: mtime={} maxage={STARTUP_MAXAGE}",
        loader.startup_modified_time(&context)?
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_mtime(runtime: &RuntimeOptions, args: &ModuleArgs) -> Result<()> {
    let (paths, loader) = open_loader(runtime)?;
    let context = args.context.to_context(loader.services().settings())?;
    println!("{}", loader.modified_time(&args.module, &context)?);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_script(runtime: &RuntimeOptions, args: &ModuleArgs) -> Result<()> {
    let (_, loader) = open_loader(runtime)?;
    let context = args.context.to_context(loader.services().settings())?;
    let module = require_module(&loader, &args.module)?;
    println!("{}", module.script(&context, loader.services())?);
    Ok(())
}

fn run_styles(runtime: &RuntimeOptions, args: &ModuleArgs) -> Result<()> {
    let (_, loader) = open_loader(runtime)?;
    let context = args.context.to_context(loader.services().settings())?;
    let module = require_module(&loader, &args.module)?;
    let flip = module.flip(&context);
    for (media, css) in module.styles(&context, loader.services())? {
        println!("/* media: {media} flip: {flip} */");
        println!("{css}");
    }
    Ok(())
}

fn run_deps(runtime: &RuntimeOptions, args: &ModuleArgs) -> Result<()> {
    let (paths, loader) = open_loader(runtime)?;
    let module = require_module(&loader, &args.module)?;
    let files = loader
        .services()
        .dependencies()
        .get(&args.module, &args.context.skin);

    println!("module: {}", args.module);
    println!("dependencies: {}", format_list(module.dependencies()));
    println!("messages: {}", format_list(module.messages()));
    println!("file_dependencies.{}: {}", args.context.skin, format_list(&files));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_startup(runtime: &RuntimeOptions, args: &ContextArgs) -> Result<()> {
    let (_, loader) = open_loader(runtime)?;
    let context = args.to_context(loader.services().settings())?;
    println!("{}", loader.startup_script(&context)?);
    Ok(())
}

fn run_load(runtime: &RuntimeOptions, args: &LoadArgs) -> Result<()> {
    let (_, loader) = open_loader(runtime)?;
    let context = args.context.to_context(loader.services().settings())?;
    print!("{}", loader.respond(&context, &args.modules)?);
    Ok(())
}

fn run_blob_set(
    runtime: &RuntimeOptions,
    module_name: &str,
    lang: &str,
    blob: &str,
    timestamp: Option<i64>,
) -> Result<()> {
    let (_, loader) = open_loader(runtime)?;
    let messages = loader
        .module(module_name)
        .map(|module| module.messages().to_vec())
        .unwrap_or_default();
    let timestamp = match timestamp {
        Some(timestamp) => timestamp,
        None => unix_now()?,
    };
    loader
        .services()
        .blobs()
        .insert_blob(module_name, lang, &messages, blob, timestamp)?;

    println!("stored message blob for {module_name}/{lang} at {timestamp}");
    Ok(())
}

fn open_loader(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ResourceLoader)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let services = LoaderServices::open(&paths, config.settings())?;
    let loader = ResourceLoader::from_config(&config, services)?;
    debug!(root = %normalize_path(&paths.project_root), "opened resource loader");
    Ok((paths, loader))
}

fn require_module<'a>(
    loader: &'a ResourceLoader,
    name: &str,
) -> Result<&'a resourceloader_core::module::Module> {
    loader
        .module(name)
        .with_context(|| format!("unknown module: {name}"))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_list(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}
