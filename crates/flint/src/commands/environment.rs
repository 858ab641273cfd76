//! `flint environment ...`

use anyhow::{bail, Result};
use chrono::Utc;
use colored::*;
use flint::app::{EnvironmentSummary, NewEnvironment};
use flint::environment::MessagingAuth;
use flint::{App, Environment};
use flint_core::format::{mask_secret, relative_time};

use super::{backend, confirm};
use crate::cli::EnvironmentCommand;
use crate::output::{self, Printer};

pub fn run(app: &mut App, printer: &Printer, command: EnvironmentCommand) -> Result<()> {
    match command {
        EnvironmentCommand::Create {
            name,
            pb_url,
            nats_servers,
            pb_auth_collection,
            organization_id,
            nats_auth_method,
        } => cmd_create(
            app,
            printer,
            NewEnvironment {
                name,
                backend_url: pb_url,
                servers: nats_servers,
                auth_collection: pb_auth_collection,
                organization_id,
                messaging_method: nats_auth_method,
            },
        ),
        EnvironmentCommand::List => cmd_list(app, printer),
        EnvironmentCommand::Select { name } => cmd_select(app, &name),
        EnvironmentCommand::Show { name, reveal } => cmd_show(app, printer, name.as_deref(), reveal),
        EnvironmentCommand::Delete { name, force } => cmd_delete(app, &name, force),
        EnvironmentCommand::Organization { organization_id } => {
            cmd_organization(app, &organization_id)
        }
    }
}

fn cmd_create(app: &mut App, printer: &Printer, request: NewEnvironment) -> Result<()> {
    let env = app.create_environment(request)?;

    if !printer.is_table() {
        return printer.print(&masked(&env));
    }

    output::success(&format!("Environment '{}' created", env.name));
    println!("  PocketBase:  {}", env.backend.url);
    println!("  NATS:        {}", env.messaging.servers.join(", "));
    println!("  Collection:  {}", env.backend.auth_collection);
    println!();
    println!("Next steps:");
    println!("  flint environment select {}", env.name);
    println!("  flint auth pb");
    println!("  flint auth nats --method {}", env.messaging.auth.method());
    Ok(())
}

fn cmd_list(app: &App, printer: &Printer) -> Result<()> {
    let rows = app.list_environments()?;

    if !printer.is_table() {
        return printer.print(&rows);
    }

    if rows.is_empty() {
        println!("No environments. Create one with: flint environment create <name> --pb-url <url> --nats-servers <urls>");
        return Ok(());
    }

    println!("{}", list_table(&rows, app.preferences().organization_display));
    Ok(())
}

fn list_table(rows: &[EnvironmentSummary], show_organization: bool) -> String {
    let name_width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let url_width = rows.iter().map(|r| r.url.len()).max().unwrap_or(0).max(3);

    let line = |marker: &str, name: &str, url: &str, collection: &str, organization: &str, session: &str| {
        let mut text = format!(
            "{} {:nw$}  {:uw$}  {:14}",
            marker,
            name,
            url,
            collection,
            nw = name_width,
            uw = url_width
        );
        if show_organization {
            text.push_str(&format!("  {:16}", organization));
        }
        format!("{}  {}", text, session)
    };

    let mut lines = vec![line(" ", "NAME", "URL", "COLLECTION", "ORGANIZATION", "SESSION")];
    for row in rows {
        lines.push(line(
            if row.active { "*" } else { " " },
            &row.name,
            &row.url,
            row.auth_collection.as_str(),
            row.organization_id.as_deref().unwrap_or("-"),
            &row.session,
        ));
    }
    lines.join("\n")
}

fn cmd_select(app: &mut App, name: &str) -> Result<()> {
    let env = app.select_environment(name)?;
    output::success(&format!("Switched to environment '{}'", env.name));

    if !env.backend.session.is_authenticated() {
        output::info("Not authenticated yet. Run: flint auth pb");
    } else if !app.authenticator().session_state(&env.backend.session).is_usable() {
        output::warning("Session expired. Run: flint auth pb");
    }
    Ok(())
}

fn cmd_show(app: &App, printer: &Printer, name: Option<&str>, reveal: bool) -> Result<()> {
    let env = app.show_environment(name)?;
    let env = if reveal { env } else { masked(&env) };

    if !printer.is_table() {
        return printer.print(&env);
    }

    let active = app.preferences().active() == Some(env.name.as_str());
    let state = app.authenticator().session_state(&env.backend.session);

    println!("{}{}", env.name.bold(), if active { " (active)".green() } else { "".normal() });
    println!();
    println!("{}", "PocketBase".bold());
    println!("  URL:           {}", env.backend.url);
    println!("  Collection:    {}", env.backend.auth_collection);
    if app.preferences().organization_display {
        println!(
            "  Organization:  {}",
            env.backend.organization_id.as_deref().unwrap_or("(not set)")
        );
    }
    match env.backend.session.expires {
        Some(expires) => println!(
            "  Session:       {} (expires {})",
            state.label(),
            relative_time(expires, Utc::now())
        ),
        None => println!("  Session:       {}", state.label()),
    }
    println!("  Collections:   {}", env.backend.available_collections.join(", "));
    println!();
    println!("{}", "NATS".bold());
    println!("  Servers:       {}", env.messaging.servers.join(", "));
    println!("  Auth method:   {}", env.messaging.auth.method());
    match &env.messaging.auth {
        MessagingAuth::UserPass { username, .. } => {
            println!("  Username:      {}", username.as_deref().unwrap_or("(not set)"));
        }
        MessagingAuth::Creds { creds_file } => {
            let file = creds_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string());
            println!("  Creds file:    {}", file);
        }
        MessagingAuth::Token { .. } => {}
    }
    println!(
        "  TLS:           {}{}",
        if env.messaging.tls_enabled { "enabled" } else { "disabled" },
        if env.messaging.tls_verify { "" } else { " (no verify)" }
    );
    Ok(())
}

fn cmd_delete(app: &mut App, name: &str, force: bool) -> Result<()> {
    if !app.store().exists(name) {
        bail!("environment '{}' not found", name);
    }
    if !force && !confirm(&format!("Delete environment '{}' and all its files?", name))? {
        println!("Cancelled");
        return Ok(());
    }

    let was_active = app.delete_environment(name)?;
    output::success(&format!("Environment '{}' deleted", name));
    if was_active {
        output::info("It was the active environment; select another with: flint environment select <name>");
    }
    Ok(())
}

fn cmd_organization(app: &mut App, organization_id: &str) -> Result<()> {
    let env = app.active_environment()?;
    let identity = backend(&env)?;
    let update = app.set_organization(&identity, organization_id)?;

    output::success(&format!(
        "Organization set to '{}' for environment '{}'",
        update.organization_id, update.environment
    ));
    if !update.validated {
        output::warning("Session expired; access was not verified. Run 'flint auth pb' to re-authenticate.");
    }
    Ok(())
}

/// Copy of `env` with tokens and passwords masked
pub fn masked(env: &Environment) -> Environment {
    let mut env = env.clone();
    if env.backend.session.is_authenticated() {
        env.backend.session.token = mask_secret(&env.backend.session.token);
    }
    match &mut env.messaging.auth {
        MessagingAuth::UserPass {
            password: Some(password),
            ..
        } => *password = mask_secret(password),
        MessagingAuth::Token { token: Some(token) } => *token = mask_secret(token),
        _ => {}
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::environment::{IdentityCollection, MessagingMethod};

    #[test]
    fn test_masked_hides_secrets() {
        let mut env = Environment::new("prod", "https://api.example.io", vec!["nats://a:4222".into()])
            .with_messaging_method(MessagingMethod::Token);
        env.backend.session.token = "eyJhbGciOiJIUzI1NiJ9.payload.signature".into();
        env.messaging.auth = MessagingAuth::Token {
            token: Some("short".into()),
        };

        let shown = masked(&env);
        assert_eq!(shown.backend.session.token, "eyJhbG...ture");
        assert_eq!(
            shown.messaging.auth,
            MessagingAuth::Token {
                token: Some("*****".into())
            }
        );
        assert_eq!(env.messaging.auth, MessagingAuth::Token { token: Some("short".into()) });
    }

    #[test]
    fn test_list_table_marks_active() {
        let rows = vec![
            EnvironmentSummary {
                name: "dev".into(),
                active: false,
                url: "http://localhost:8090".into(),
                auth_collection: IdentityCollection::Users,
                organization_id: None,
                session: "unauthenticated".into(),
            },
            EnvironmentSummary {
                name: "prod".into(),
                active: true,
                url: "https://api.example.io".into(),
                auth_collection: IdentityCollection::Edges,
                organization_id: Some("org_1".into()),
                session: "valid".into(),
            },
        ];
        let table = list_table(&rows, true);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("ORGANIZATION"));
        assert!(lines[1].starts_with("  dev "));
        assert!(lines[2].starts_with("* prod"));
        assert!(lines[2].contains("org_1"));
        assert!(lines[2].ends_with("valid"));

        let table = list_table(&rows, false);
        assert!(!table.contains("ORGANIZATION"));
        assert!(!table.contains("org_1"));
        assert!(table.lines().nth(2).unwrap().ends_with("valid"));
    }
}
