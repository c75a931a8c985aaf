use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use settle::cli::{Cli, Commands, ConfigAction};
use settle::config::Config;
use settle::replay::{ReplayOptions, Settlement, parse_log, replay};
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    settle::logging::init(cli.verbose, cli.quiet);
    tracing::debug!(version = %settle::version_string(), "settle starting");

    match cli.command {
        Commands::Replay {
            input,
            quiet_period,
            frame,
            no_frames,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = ReplayOptions {
                quiet_period: match quiet_period {
                    Some(quiet_period) => quiet_period,
                    None => config.debounce.quiet_period()?,
                },
                frame_interval: (!no_frames).then_some(frame),
            };
            handle_replay(input.as_deref(), &options, json, cli.quiet)?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut settle::cli::Cli::command(),
                "settle",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/settle/config.toml)
/// 3. Built-in defaults
///
/// Environment variable overrides apply on top, then the result is validated.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        },
    };

    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut contents = String::new();
            std::io::stdin()
                .read_to_string(&mut contents)
                .context("Failed to read observations from stdin")?;
            Ok(contents)
        }
    }
}

/// Replay an observation log and print what settled.
fn handle_replay(
    input: Option<&Path>,
    options: &ReplayOptions,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let contents = read_input(input)?;
    let observations = parse_log(&contents)?;
    let settlements = replay(&observations, options)?;

    if json {
        for settlement in &settlements {
            println!("{}", serde_json::to_string(settlement)?);
        }
        return Ok(());
    }

    let color = std::io::stdout().is_terminal();
    for settlement in &settlements {
        println!("{}", format_settlement(settlement, color));
    }
    if !quiet {
        eprintln!(
            "{} observations, {} settlements (quiet period {})",
            observations.len(),
            settlements.len(),
            format_duration(options.quiet_period)
        );
    }
    Ok(())
}

fn format_settlement(settlement: &Settlement, color: bool) -> String {
    let at = format!("{:>8}ms", settlement.at_ms);
    let value = format!("{:?}", settlement.value);
    if color {
        format!("{}  {}", at.dimmed(), value.green())
    } else {
        format!("{at}  {value}")
    }
}

fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path: Option<PathBuf> = custom_path
        .map(Path::to_path_buf)
        .or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => match config_path {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine config directory"),
        },
    }
    Ok(())
}
