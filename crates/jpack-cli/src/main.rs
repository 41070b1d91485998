use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jpack_core::{
    assemble::ManifestAssembler,
    config::Config,
    discover,
    policy::{prefixed_properties, PROPERTY_PREFIX},
    scan::{self, Isolation, RestrictedApiScanner},
    version::{GitVersion, VersionNormalizer},
};
use jpack_manifest::ManifestAttributeSet;
use regex::Regex;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "jpack.toml";

#[derive(Parser, Debug)]
#[command(
    name = "jpack",
    author,
    version,
    about = "Plugin manifest assembly and restricted API checks"
)]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assemble the final manifest from partial manifests and project metadata.
    Manifest {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Partial manifest to merge; later ones win.
        #[arg(long = "partial", value_name = "FILE")]
        partials: Vec<PathBuf>,
        /// Write here instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Produce one partial manifest.
    Discover {
        #[command(subcommand)]
        command: DiscoverCommands,
    },
    /// Scan compiled classes for uses of restricted APIs.
    Check(CheckArgs),
    /// Print the plugin version with any snapshot marker resolved.
    Version(VersionArgs),
    /// Interact with configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Serve one scan request from stdin (used by `check`).
    #[command(hide = true)]
    ScanWorker,
}

#[derive(Args, Debug)]
struct VersionArgs {
    /// Version to normalize instead of the configured one.
    #[arg(value_name = "VERSION", conflicts_with = "git")]
    value: Option<String>,
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Derive the version from git history using `[git_version]`.
    #[arg(long)]
    git: bool,
    /// Git work tree; overrides `git_version.root`.
    #[arg(long, value_name = "DIR", requires = "git")]
    git_root: Option<PathBuf>,
    /// Accept uncommitted changes in the work tree.
    #[arg(long, requires = "git")]
    allow_dirty: bool,
    /// Also write the version and full hash here.
    #[arg(short, long, value_name = "FILE", requires = "git")]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum DiscoverCommands {
    /// `Plugin-Class` from META-INF/services/hudson.Plugin.
    PluginClass(DiscoverArgs),
    /// `Support-Dynamic-Loading` from @Extension annotations.
    DynamicLoading(DiscoverArgs),
    /// `Plugin-Dependencies` from the configured dependencies.
    Dependencies {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    /// Compiled class directory; repeatable.
    #[arg(long = "classes", value_name = "DIR", required = true)]
    classes: Vec<PathBuf>,
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Reads `[check]` from this file when given.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Compiled class directory to scan; repeatable.
    #[arg(long = "classes", value_name = "DIR", required = true)]
    classes: Vec<PathBuf>,
    /// Dependency jar or directory; repeatable.
    #[arg(long = "classpath", value_name = "PATH")]
    classpath: Vec<PathBuf>,
    /// File listing one classpath entry per line.
    #[arg(long, value_name = "FILE")]
    classpath_file: Option<PathBuf>,
    /// Log violations instead of failing.
    #[arg(long)]
    ignore_failures: bool,
    /// Run the checker on a thread of this process instead of a worker process.
    #[arg(long)]
    in_process: bool,
    /// `checkAccessModifier.<key>=<value>`; repeatable.
    #[arg(long = "property", value_name = "KEY=VALUE")]
    properties: Vec<String>,
    /// Directory receiving one report per scanned directory.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Manifest {
            config,
            partials,
            output,
        } => handle_manifest(&config, &partials, output.as_deref()),
        Commands::Discover { command } => handle_discover(command),
        Commands::Check(args) => handle_check(args, &cli.log_level).await,
        Commands::Version(args) => handle_version(args),
        Commands::Config { command } => handle_config(command),
        Commands::ScanWorker => handle_scan_worker().await,
    }
}

/// Logs go to stderr; stdout carries manifests and the worker protocol.
fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
    Ok(())
}

fn handle_manifest(config_path: &Path, partials: &[PathBuf], output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    let partials = partials
        .iter()
        .map(|path| {
            discover::read_manifest(path)
                .with_context(|| format!("failed to read partial manifest {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let overrides =
        ManifestAssembler::overrides(&config.plugin, &config.dependencies, &VersionNormalizer::new())?;
    let manifest = ManifestAssembler::assemble(&partials, &overrides);
    emit_manifest(&manifest, output)
}

fn handle_discover(command: DiscoverCommands) -> Result<()> {
    let (manifest, output) = match command {
        DiscoverCommands::PluginClass(args) => (discover::plugin_class(&args.classes)?, args.output),
        DiscoverCommands::DynamicLoading(args) => {
            (discover::dynamic_loading(&args.classes)?, args.output)
        }
        DiscoverCommands::Dependencies { config, output } => {
            let config = load_config(&config)?;
            (discover::dependencies(&config.dependencies)?, output)
        }
    };
    emit_manifest(&manifest, output.as_deref())
}

fn emit_manifest(manifest: &ManifestAttributeSet, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            discover::write_manifest(path, manifest)?;
            info!(path = %path.display(), attributes = manifest.len(), "manifest written");
        }
        None => print!("{manifest}"),
    }
    Ok(())
}

async fn handle_check(args: CheckArgs, log_level: &str) -> Result<()> {
    let mut check = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            config.validate()?;
            config.check
        }
        None => Default::default(),
    };
    check.ignore_failures |= args.ignore_failures;
    if args.output_dir.is_some() {
        check.output_dir = args.output_dir.clone();
    }
    let flags = parse_properties(&args.properties)?;
    for key in ignored_property_keys(&flags) {
        warn!(property = key, "ignoring --property without the `{PROPERTY_PREFIX}` prefix");
    }
    check.properties.extend(prefixed_properties(
        flags.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        PROPERTY_PREFIX,
    ));

    let mut dependencies = args.classpath.clone();
    if let Some(file) = &args.classpath_file {
        dependencies.extend(read_classpath_file(file)?);
    }

    let isolation = if args.in_process {
        Isolation::InProcess
    } else {
        let program = std::env::current_exe().context("cannot locate the jpack executable")?;
        Isolation::Worker {
            program,
            args: vec!["--log-level".into(), log_level.into(), "scan-worker".into()],
        }
    };
    let scanner = RestrictedApiScanner::new(check.policy(), isolation);
    let scans = scanner.scan_all(&args.classes, &dependencies).await?;

    if let Some(dir) = &check.output_dir {
        for path in scan::write_reports(&scans, dir)? {
            info!(report = %path.display(), "restricted API report written");
        }
    }
    scan::enforce_all(&scans, check.ignore_failures)?;
    Ok(())
}

async fn handle_scan_worker() -> Result<()> {
    tokio::task::spawn_blocking(|| {
        scan::run_worker(std::io::stdin().lock(), std::io::stdout().lock())
    })
    .await
    .context("scan worker thread failed")??;
    Ok(())
}

fn handle_version(args: VersionArgs) -> Result<()> {
    if args.git {
        return handle_git_version(args);
    }
    let version = match args.value {
        Some(version) => version,
        None => load_config(&args.config)?.plugin.version,
    };
    if version.trim().is_empty() {
        bail!("no version given and plugin.version is empty");
    }
    println!("{}", VersionNormalizer::new().normalize(&version));
    Ok(())
}

fn handle_git_version(args: VersionArgs) -> Result<()> {
    let mut git = if args.config.exists() {
        load_config(&args.config)?.git_version
    } else {
        GitVersion::default()
    };
    if let Some(root) = args.git_root {
        git.root = root;
    }
    git.allow_dirty |= args.allow_dirty;
    if args.output.is_some() {
        git.output = args.output;
    }
    let generated = git.generate_to_output()?;
    info!(full_hash = %generated.full_hash, "git version derived");
    println!("{}", generated.version);
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../config/jpack.example.toml"));
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = match RE.get() {
        Some(regex) => regex,
        None => {
            let compiled = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}")?;
            RE.get_or_init(|| compiled)
        }
    };
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

fn parse_properties(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => bail!("--property expects KEY=VALUE, got `{entry}`"),
        })
        .collect()
}

/// Keys of `--property` flags that the policy will never see.
fn ignored_property_keys(flags: &[(String, String)]) -> Vec<&str> {
    flags
        .iter()
        .map(|(key, _)| key.as_str())
        .filter(|key| key.strip_prefix(PROPERTY_PREFIX).map_or(true, str::is_empty))
        .collect()
}

fn read_classpath_file(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read classpath file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}
