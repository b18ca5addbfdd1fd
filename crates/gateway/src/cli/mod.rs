//! Command-line entry points for `agentwayd`.

use clap::{Parser, Subcommand};

/// agentway — a multi-tenant agent gateway.
#[derive(Debug, Parser)]
#[command(name = "agentwayd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any validation issues.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Read `AW_CONFIG` (defaulting to `config.toml`) and parse it, falling
/// back to built-in defaults when the file doesn't exist.
pub fn load_config() -> anyhow::Result<(aw_domain::config::Config, String)> {
    let config_path = std::env::var("AW_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path).map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        aw_domain::config::Config::default()
    };

    Ok((config, config_path))
}

/// Run `doctor`: validate config and report engine-registry readiness.
/// Returns `true` if every check passed.
pub fn doctor(config: &aw_domain::config::Config, config_path: &str) -> bool {
    println!("agentwayd doctor — checking {config_path}");
    let issues = config.validate();
    if issues.is_empty() {
        println!("  config: ok");
    }
    let mut passed = true;
    for issue in &issues {
        match issue.severity {
            aw_domain::config::ConfigSeverity::Warning => println!("  warning: {issue}"),
            aw_domain::config::ConfigSeverity::Error => {
                println!("  error: {issue}");
                passed = false;
            }
        }
    }
    println!("  default engine: {}", config.engines.default_engine);
    passed
}

/// Run `config validate`, printing issues and returning `true` if no
/// errors were found.
pub fn validate_config(config: &aw_domain::config::Config, config_path: &str) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{config_path}: no issues");
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !aw_domain::config::Config::has_errors(&issues)
}

/// Run `config show`, printing the resolved configuration as TOML.
pub fn show_config(config: &aw_domain::config::Config) {
    match toml::to_string_pretty(config) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("failed to serialize config: {e}"),
    }
}
