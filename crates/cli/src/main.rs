//! pathkeep CLI — manage remembered paths and probe the daemon. Talks to
//! the registry directly, with no server round-trip, the same way the
//! daemon's own binary does (`server/src/main.rs`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pathkeep_core::config::Config;
use pathkeep_core::registry::Registry;
use pathkeep_core::types::{PathConfig, TriState};

#[derive(Parser)]
#[command(name = "pathkeep", version, about = "Manage remembered paths for the pathkeep daemon")]
struct Cli {
    /// Override the registry database path (defaults to config / ~/.config/pathkeep/registry.db).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Daemon config file (TOML), consulted for the default db path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a directory for tracking.
    Remember {
        path: PathBuf,

        /// Treat dotfiles as excluded unless separately included (default true).
        #[arg(long)]
        skip_hidden: Option<bool>,
        #[arg(long = "skip-ext", value_name = "EXT")]
        skip_extensions: Vec<String>,
        #[arg(long = "skip-dir", value_name = "NAME")]
        skip_directories: Vec<String>,
        #[arg(long = "skip-file", value_name = "NAME")]
        skip_files: Vec<String>,
        #[arg(long = "include-ext", value_name = "EXT")]
        include_extensions: Vec<String>,
        #[arg(long = "include-dir", value_name = "NAME")]
        include_directories: Vec<String>,
        #[arg(long = "include-file", value_name = "NAME")]
        include_files: Vec<String>,
        /// "on", "off", or omit to leave unset.
        #[arg(long = "use-vision", value_name = "on|off")]
        use_vision: Option<String>,
    },
    /// Stop tracking a previously remembered directory.
    Forget {
        path: PathBuf,
    },
    /// List every remembered path and its effective config.
    List,
    #[command(subcommand)]
    Daemon(DaemonCommand),
    #[command(subcommand)]
    Integrations(IntegrationsCommand),
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Start `pathkeepd` if it's on `PATH`.
    Start,
    /// Read the registry read-only and report path/queue counts.
    Status,
}

/// Out of scope for the core: each verb here only points at the
/// external collaborator that would implement it.
#[derive(Subcommand)]
enum IntegrationsCommand {
    List,
    Setup { name: Option<String> },
    Remove { name: Option<String> },
    Status,
}

fn parse_use_vision(raw: &str) -> Result<TriState> {
    match raw {
        "on" => Ok(TriState::On),
        "off" => Ok(TriState::Off),
        other => bail!("invalid --use-vision value {other:?}, expected \"on\" or \"off\""),
    }
}

fn build_config(
    skip_hidden: Option<bool>,
    skip_extensions: Vec<String>,
    skip_directories: Vec<String>,
    skip_files: Vec<String>,
    include_extensions: Vec<String>,
    include_directories: Vec<String>,
    include_files: Vec<String>,
    use_vision: Option<String>,
) -> Result<Option<PathConfig>> {
    let use_vision = use_vision.as_deref().map(parse_use_vision).transpose()?.unwrap_or_default();
    let config = PathConfig {
        skip_hidden,
        skip_extensions,
        skip_directories,
        skip_files,
        include_extensions,
        include_directories,
        include_files,
        use_vision,
        unknown: Default::default(),
    };
    Ok(if config == PathConfig::default() { None } else { Some(config) })
}

fn resolved_db_path(cli_override: &Option<PathBuf>, config_path: &Option<PathBuf>) -> PathBuf {
    if let Some(p) = cli_override {
        return p.clone();
    }
    let config_path = config_path.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path).unwrap_or_default();
    if let Some(p) = cli_override {
        config.db_path = Some(p.clone());
    }
    config.resolved_db_path()
}

fn default_config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pathkeep")
        .join("config.toml")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("pathkeep=warn".parse().unwrap()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let db_path = resolved_db_path(&cli.db_path, &cli.config);

    match cli.command {
        Commands::Remember {
            path,
            skip_hidden,
            skip_extensions,
            skip_directories,
            skip_files,
            include_extensions,
            include_directories,
            include_files,
            use_vision,
        } => {
            let registry = Registry::open(&db_path).context("opening registry")?;
            let config = build_config(
                skip_hidden,
                skip_extensions,
                skip_directories,
                skip_files,
                include_extensions,
                include_directories,
                include_files,
                use_vision,
            )?;
            let remembered = registry.add_path(&path, config).context("remembering path")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&remembered_to_json(&remembered))?);
            } else {
                println!("Remembered {}", remembered.path);
            }
        }
        Commands::Forget { path } => {
            let registry = Registry::open(&db_path).context("opening registry")?;
            registry.remove_path(&path).context("forgetting path")?;
            if !cli.json {
                println!("Forgot {}", path.display());
            }
        }
        Commands::List => {
            let registry = Registry::open(&db_path).context("opening registry")?;
            let paths = registry.list_paths().context("listing paths")?;
            if cli.json {
                let items: Vec<_> = paths.iter().map(remembered_to_json).collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if paths.is_empty() {
                println!("No remembered paths. Use `pathkeep remember <path>` to add one.");
            } else {
                for p in &paths {
                    let last_walk = p.last_walk_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into());
                    println!("{}  (last walk: {last_walk})", p.path);
                }
            }
        }
        Commands::Daemon(DaemonCommand::Start) => {
            match std::process::Command::new("pathkeepd").spawn() {
                Ok(mut child) => {
                    println!("started pathkeepd (pid {})", child.id());
                    let _ = child.wait();
                }
                Err(e) => bail!("couldn't launch pathkeepd: {e}; is it installed and on PATH?"),
            }
        }
        Commands::Daemon(DaemonCommand::Status) => {
            let registry = Registry::open(&db_path).context("opening registry")?;
            let paths = registry.list_paths().context("listing paths")?;
            let queue_len = registry.len().context("reading critical-event queue")?;
            let queue_cap = registry.cap();
            if cli.json {
                let output = serde_json::json!({
                    "db_path": db_path,
                    "remembered_paths": paths.len(),
                    "critical_event_queue_len": queue_len,
                    "critical_event_queue_cap": queue_cap,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Registry:      {}", db_path.display());
                println!("Remembered:    {} path(s)", paths.len());
                println!("Queue:         {queue_len}/{queue_cap}");
            }
        }
        Commands::Integrations(cmd) => run_integrations_stub(cmd, cli.json),
    }
    Ok(())
}

/// `integrations` is an external collaborator; the core only needs
/// callers here to go through the registry/bus APIs once one is wired up.
fn run_integrations_stub(cmd: IntegrationsCommand, json: bool) {
    let message = match cmd {
        IntegrationsCommand::List => "no integrations installed (AI-harness wiring is out of scope for this build)",
        IntegrationsCommand::Setup { .. } => "integration setup is handled by an external collaborator, not this binary",
        IntegrationsCommand::Remove { .. } => "integration removal is handled by an external collaborator, not this binary",
        IntegrationsCommand::Status => "no integrations to report on",
    };
    if json {
        println!("{}", serde_json::json!({ "message": message }));
    } else {
        println!("{message}");
    }
}

fn remembered_to_json(p: &pathkeep_core::types::RememberedPath) -> serde_json::Value {
    serde_json::json!({
        "path": p.path,
        "config": p.config,
        "last_walk_at": p.last_walk_at,
        "created_at": p.created_at,
        "updated_at": p.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_is_none_when_every_field_is_default() {
        let config = build_config(None, vec![], vec![], vec![], vec![], vec![], vec![], None).unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn build_config_carries_explicit_fields() {
        let config = build_config(
            Some(false),
            vec![".log".into()],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
            Some("on".into()),
        )
        .unwrap()
        .unwrap();
        assert_eq!(config.skip_hidden, Some(false));
        assert_eq!(config.skip_extensions, vec![".log".to_string()]);
        assert_eq!(config.use_vision, TriState::On);
    }

    #[test]
    fn invalid_use_vision_value_errors() {
        let err = parse_use_vision("sideways").unwrap_err();
        assert!(err.to_string().contains("invalid --use-vision value"));
    }
}
