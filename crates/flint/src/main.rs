//! flint - context-aware CLI for the Stone-Age.io IoT platform
//!
//! Every command runs against the active environment: a PocketBase backend,
//! its NATS servers, and the credentials cached for both.

mod cli;
mod commands;
mod output;

use anyhow::{anyhow, Result};
use clap::FromArgMatches;
use flint::identity::CollaboratorError;
use flint::{App, CommandResolver, ConfigStore, PreferenceOverrides};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use output::Printer;

fn main() {
    if let Err(e) = run() {
        report(&e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let resolver = CommandResolver::new();
    let argv = cli::expand_abbreviations(&resolver, std::env::args().collect())?;
    let matches = cli::command_with_shortcuts(&resolver).get_matches_from(argv);
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let overrides = PreferenceOverrides::from_env()
        .map_err(|e| anyhow!(e))?
        .merge(flag_overrides(&cli));
    let app = App::load(ConfigStore::open_default(), overrides)?;

    let prefs = app.preferences();
    init_logging(prefs.debug);
    if !prefs.colors_enabled {
        colored::control::set_override(false);
    }

    run_command(app, Printer::new(prefs.output_format), cli.command)
}

fn flag_overrides(cli: &Cli) -> PreferenceOverrides {
    PreferenceOverrides {
        output_format: cli.output,
        colors_enabled: cli.no_color.then_some(false),
        debug: cli.debug.then_some(true),
        ..Default::default()
    }
}

fn init_logging(debug: bool) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else if debug {
        EnvFilter::new("flint=debug,warn")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(mut app: App, printer: Printer, command: Commands) -> Result<()> {
    match command {
        Commands::Environment { command } => commands::environment::run(&mut app, &printer, command),
        Commands::Collections(args) => commands::collections::run(&mut app, &printer, args),
        Commands::Auth { command } => commands::auth::run(&mut app, &printer, command),
        Commands::Nats { command } => commands::nats::run(&app, command),
    }
}

/// Print the error chain, translating collaborator failures for humans
fn report(err: &anyhow::Error) {
    let collaborator = err
        .chain()
        .find_map(|e| e.downcast_ref::<CollaboratorError>());

    match collaborator {
        Some(cause) => {
            let context = err.to_string();
            let friendly = cause.friendly_message();
            if context == cause.to_string() {
                output::error(&friendly);
            } else {
                output::error(&format!("{}: {}", context, friendly));
            }
            if let Some(hint) = cause.suggestion() {
                eprintln!("  {}", hint);
            }
        }
        None => output::error(&format!("{:#}", err)),
    }

    if flint::app::is_missing_environment(err) {
        eprintln!("  List environments with 'flint environment list' and select one with 'flint environment select <name>'.");
    }
}
