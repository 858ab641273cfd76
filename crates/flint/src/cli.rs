//! CLI command definitions

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use flint::environment::{IdentityCollection, MessagingMethod};
use flint::resolver::{AUTH, ENVIRONMENT, NATS, RECORD_ACTIONS, ROOT};
use flint::{CommandResolver, OutputFormat, ResolveError};
use std::path::PathBuf;

/// flint - manage Stone-Age.io environments from the command line
#[derive(Parser)]
#[command(name = "flint")]
#[command(version)]
#[command(about = "Context-aware CLI for the Stone-Age.io IoT platform")]
#[command(after_help = "\
EXAMPLES:
    flint environment create prod --pb-url https://api.stone-age.io --nats-servers nats://nats.stone-age.io:4222
    flint environment select prod
    flint auth pb --email admin@company.com
    flint collections edges list --filter 'active=true' --sort name
    flint nats subscribe 'telemetry.>' --count 10

ENVIRONMENT:
    FLINT_CONFIG_DIR        Configuration root (default ~/.config/flint)
    FLINT_ACTIVE_CONTEXT    Use this environment without selecting it
    FLINT_OUTPUT_FORMAT     json, yaml or table
    FLINT_COLORS_ENABLED    true or false
    FLINT_PAGINATION_SIZE   Default page size for list
    FLINT_DEBUG             Enable debug logging
    RUST_LOG                Log filter (overrides FLINT_DEBUG)")]
pub struct Cli {
    /// Output format (json, yaml, table)
    #[arg(long, global = true)]
    pub output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage environments (PocketBase + NATS pairs)
    Environment {
        #[command(subcommand)]
        command: EnvironmentCommand,
    },

    /// Work with records in the active environment's collections
    Collections(CollectionsArgs),

    /// Authenticate against PocketBase or configure NATS credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },

    /// Publish and subscribe on the active environment's NATS servers
    Nats {
        #[command(subcommand)]
        command: NatsCommand,
    },
}

#[derive(Subcommand)]
pub enum EnvironmentCommand {
    /// Create a new environment
    #[command(after_help = "\
EXAMPLES:
    flint environment create prod --pb-url https://api.stone-age.io --nats-servers nats://a:4222,nats://b:4222
    flint environment create edge --pb-url http://localhost:8090 --nats-servers nats://localhost:4222 --pb-auth-collection edges")]
    Create {
        /// Environment name (letters, numbers, - and _)
        name: String,

        /// PocketBase server URL
        #[arg(long)]
        pb_url: String,

        /// NATS server URLs, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        nats_servers: Vec<String>,

        /// Auth collection (users, clients, edges, things, service_users)
        #[arg(long, default_value = "users")]
        pb_auth_collection: IdentityCollection,

        /// Organization ID (can be set later)
        #[arg(long)]
        organization_id: Option<String>,

        /// NATS auth method (user_pass, token, creds)
        #[arg(long, default_value = "creds")]
        nats_auth_method: MessagingMethod,
    },

    /// List environments
    List,

    /// Make an environment the active one
    Select {
        name: String,
    },

    /// Show an environment (default: the active one)
    Show {
        name: Option<String>,

        /// Include secrets unmasked
        #[arg(long)]
        reveal: bool,
    },

    /// Delete an environment and everything in its directory
    Delete {
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Set the organization of the active environment
    Organization {
        organization_id: String,
    },
}

#[derive(Subcommand)]
pub enum AuthCommand {
    /// Authenticate with PocketBase
    #[command(after_help = "\
EXAMPLES:
    flint auth pb
    flint auth pb --email admin@company.com --organization org_abc123
    flint auth pb --collection edges --email edge-01 --password '...'")]
    Pb {
        /// Email or username
        #[arg(short, long)]
        email: Option<String>,

        /// Password (prompted when omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Auth collection (defaults to the environment's)
        #[arg(short, long)]
        collection: Option<IdentityCollection>,

        /// Organization to act within
        #[arg(long)]
        organization: Option<String>,
    },

    /// Configure NATS credentials
    Nats {
        /// Auth method (user_pass, token, creds)
        #[arg(long)]
        method: Option<MessagingMethod>,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(short, long)]
        password: Option<String>,

        #[arg(long)]
        token: Option<String>,

        /// Credentials file; stored relative when inside the environment directory
        #[arg(long)]
        creds_file: Option<PathBuf>,

        /// Connect once to check the credentials
        #[arg(long)]
        test: bool,
    },

    /// Exchange the stored PocketBase token for a fresh one
    Refresh,

    /// Show authentication state of the active environment
    Status,
}

/// Record operations, exactly one of list, get, create, update, delete
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RecordAction {
    List,
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Args)]
#[command(after_help = "\
EXAMPLES:
    flint collections edges list --filter 'active=true' --fields id,name,code
    flint collections edges get edge_abc123 --expand region
    flint collections things create '{\"name\": \"sensor-1\"}'
    flint collections things update thing_abc123 --file patch.json
    flint collections things delete thing_abc123 --force")]
pub struct CollectionsArgs {
    /// Collection name, typed in full
    pub collection: String,

    pub action: RecordAction,

    /// Record ID and/or JSON data, depending on the action
    pub args: Vec<String>,

    /// PocketBase filter expression
    #[arg(long)]
    pub filter: Option<String>,

    /// Sort expression (e.g. -created,name)
    #[arg(long)]
    pub sort: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Records per page (defaults to the pagination preference)
    #[arg(long)]
    pub per_page: Option<u32>,

    /// Relations to expand, comma-separated
    #[arg(long)]
    pub expand: Option<String>,

    /// Fields to return, comma-separated
    #[arg(long)]
    pub fields: Option<String>,

    /// Read JSON data from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Skip the delete confirmation
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand)]
pub enum NatsCommand {
    /// Publish one message
    #[command(after_help = "\
EXAMPLES:
    flint nats publish 'commands.edge-01' '{\"action\": \"reboot\"}' --json
    flint nats publish events.test hello --header source=cli
    flint nats publish 'command.edge.edge_456' '{\"action\": \"restart\"}' --reply responses.edge.edge_456")]
    Publish {
        subject: String,

        /// Message payload (omit with --file)
        payload: Option<String>,

        /// Header as key=value, repeatable
        #[arg(long = "header")]
        headers: Vec<String>,

        /// Reply subject for request-response
        #[arg(long)]
        reply: Option<String>,

        /// Read the payload from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Require the payload to be valid JSON
        #[arg(long)]
        json: bool,
    },

    /// Subscribe and print messages until interrupted
    #[command(after_help = "\
EXAMPLES:
    flint nats subscribe 'telemetry.>'
    flint nats subscribe 'telemetry.edge-01.*' --count 5 --timeout 30
    flint nats subscribe jobs --queue workers --raw")]
    Subscribe {
        subject: String,

        /// Queue group
        #[arg(short, long)]
        queue: Option<String>,

        /// Stop after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Print payloads only
        #[arg(long)]
        raw: bool,

        /// Print message headers
        #[arg(long)]
        headers: bool,

        /// Print receive timestamps
        #[arg(long)]
        timestamp: bool,
    },
}

/// Command groups listed in the shortcut help, with their display labels
const SHORTCUT_GROUPS: &[(&str, &str)] = &[
    (ROOT, "flint"),
    (ENVIRONMENT, "environment"),
    (AUTH, "auth"),
    (NATS, "nats"),
    (RECORD_ACTIONS, "collections <name>"),
];

/// Shortest accepted form of every command word, one line per group
pub fn shortcut_help(resolver: &CommandResolver) -> String {
    let mut lines = vec!["Commands may be abbreviated to any unambiguous prefix:".to_string()];
    for (category, label) in SHORTCUT_GROUPS {
        let Ok(commands) = resolver.commands(category) else {
            continue;
        };
        let forms: Vec<String> = commands
            .iter()
            .filter_map(|c| {
                let prefix = resolver.minimum_prefix(category, c).ok()?;
                Some(format!("{} ({})", c, prefix))
            })
            .collect();
        lines.push(format!("    {:<20}{}", label, forms.join(", ")));
    }
    lines.push(String::new());
    lines.push("Collection names are never abbreviated.".to_string());
    lines.join("\n")
}

/// The clap command with the shortcut table ahead of the static help text
pub fn command_with_shortcuts(resolver: &CommandResolver) -> clap::Command {
    let command = Cli::command();
    let after = command
        .get_after_help()
        .map(ToString::to_string)
        .unwrap_or_default();
    command.after_help(format!("{}\n\n{}", shortcut_help(resolver), after))
}

/// Flags that consume the following argument as their value
const VALUE_FLAGS: &[&str] = &[
    "--output",
    "--pb-url",
    "--nats-servers",
    "--pb-auth-collection",
    "--organization-id",
    "--nats-auth-method",
    "--email",
    "-e",
    "--password",
    "-p",
    "--collection",
    "-c",
    "--organization",
    "--method",
    "--username",
    "-u",
    "--token",
    "--creds-file",
    "--filter",
    "--sort",
    "--page",
    "--per-page",
    "--expand",
    "--fields",
    "--file",
    "-f",
    "--header",
    "--reply",
    "--queue",
    "-q",
    "--timeout",
    "-t",
    "--count",
    "-n",
];

/// Rewrite abbreviated command words in `argv` to their canonical names.
///
/// Rewrites the root verb, then the sub-verb of `environment`, `auth` and
/// `nats`, or the action after `collections <collection>`. Flags and help
/// requests pass through untouched.
pub fn expand_abbreviations(
    resolver: &CommandResolver,
    argv: Vec<String>,
) -> Result<Vec<String>, ResolveError> {
    let mut out = Vec::with_capacity(argv.len());
    let mut iter = argv.into_iter();
    if let Some(program) = iter.next() {
        out.push(program);
    }

    let mut positionals: Vec<String> = Vec::new();
    let mut expect_value = false;
    let mut passthrough = false;

    for arg in iter {
        if passthrough || expect_value {
            expect_value = false;
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        if arg.starts_with('-') {
            expect_value = !arg.contains('=') && VALUE_FLAGS.contains(&arg.as_str());
            out.push(arg);
            continue;
        }

        let category = match positionals.len() {
            0 => Some(ROOT),
            1 => match positionals[0].as_str() {
                "environment" => Some(ENVIRONMENT),
                "auth" => Some(AUTH),
                "nats" => Some(NATS),
                _ => None,
            },
            2 if positionals[0] == "collections" => Some(RECORD_ACTIONS),
            _ => None,
        };

        let word = match category {
            Some(_) if arg == "help" => {
                passthrough = true;
                arg
            }
            Some(category) => resolver.resolve(category, &arg)?,
            None => arg,
        };
        positionals.push(word.clone());
        out.push(word);

        if positionals.len() >= 3 {
            passthrough = true;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn expand(line: &str) -> Result<Vec<String>, ResolveError> {
        let argv = std::iter::once("flint")
            .chain(line.split_whitespace())
            .map(str::to_string)
            .collect();
        expand_abbreviations(&CommandResolver::new(), argv)
    }

    fn joined(line: &str) -> String {
        expand(line).unwrap()[1..].join(" ")
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_expands_root_and_subcommands() {
        assert_eq!(joined("env cr prod --pb-url http://x"), "environment create prod --pb-url http://x");
        assert_eq!(joined("au st"), "auth status");
        assert_eq!(joined("na pub a.b hi"), "nats publish a.b hi");
        assert_eq!(joined("e o org_1"), "environment organization org_1");
    }

    #[test]
    fn test_collection_names_are_left_alone() {
        assert_eq!(joined("col edges l"), "collections edges list");
        assert_eq!(joined("c edg g e1"), "collections edg get e1");
        assert_eq!(joined("col things del t1 --force"), "collections things delete t1 --force");
    }

    #[test]
    fn test_flags_and_values_are_skipped() {
        assert_eq!(
            joined("--output table env sh"),
            "--output table environment show"
        );
        assert_eq!(joined("--output=yaml a s"), "--output=yaml auth status");
        assert_eq!(
            joined("col edges --filter active l"),
            "collections edges --filter active list"
        );
    }

    #[test]
    fn test_arguments_after_command_untouched() {
        assert_eq!(joined("env sel s"), "environment select s");
        assert_eq!(joined("nats sub l --count 2"), "nats subscribe l --count 2");
    }

    #[test]
    fn test_resolver_errors_surface() {
        assert!(matches!(expand("env s"), Err(ResolveError::Ambiguous { .. })));
        assert!(matches!(expand("bogus"), Err(ResolveError::Unknown { .. })));
        assert!(matches!(expand("col edges x"), Err(ResolveError::Unknown { .. })));
    }

    #[test]
    fn test_help_passes_through() {
        assert_eq!(joined("help env"), "help env");
        assert_eq!(joined("--help"), "--help");
        assert_eq!(joined("env --help"), "environment --help");
    }

    #[test]
    fn test_shortcut_help_lists_shortest_forms() {
        let help = shortcut_help(&CommandResolver::new());
        let line = |label: &str| {
            help.lines()
                .find(|l| l.trim_start().starts_with(label))
                .unwrap()
                .to_string()
        };
        assert!(line("flint").contains("environment (e), collections (c), auth (a), nats (n)"));
        assert!(line("environment").contains("select (se), show (sh)"));
        assert!(line("nats").contains("publish (p), subscribe (s)"));
        assert!(line("collections <name>").contains("delete (d)"));
        assert!(help.ends_with("Collection names are never abbreviated."));
    }

    #[test]
    fn test_shortcut_help_skips_missing_groups() {
        let mut resolver = CommandResolver::empty();
        resolver.insert_category(NATS, &["publish", "purge"]);
        let help = shortcut_help(&resolver);
        assert!(help.contains("publish (pub), purge (pur)"));
        assert!(!help.contains("environment"));
    }

    #[test]
    fn test_command_keeps_static_help() {
        let mut command = command_with_shortcuts(&CommandResolver::new());
        let help = command.render_help().to_string();
        assert!(help.contains("select (se)"));
        assert!(help.contains("EXAMPLES:"));
        assert!(help.contains("FLINT_CONFIG_DIR"));
    }

    #[test]
    fn test_parse_expanded_collections() {
        let argv = expand("col edges l --per-page 5 --filter active=true").unwrap();
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Collections(args) => {
                assert_eq!(args.collection, "edges");
                assert_eq!(args.action, RecordAction::List);
                assert_eq!(args.per_page, Some(5));
            }
            _ => panic!("expected collections"),
        }
    }
}
