//! `flint auth ...`

use anyhow::{bail, Context, Result};
use chrono::Utc;
use flint::app::{LoginRequest, MessagingUpdate};
use flint::environment::{IdentityCollection, MessagingMethod};
use flint::membership::OrganizationMembership;
use flint::messaging::NatsMessaging;
use flint::session::{SelectionMode, SessionState};
use flint::App;
use flint_core::format::{relative_time, timestamp};
use std::path::PathBuf;

use super::{backend, prompt_line};
use crate::cli::AuthCommand;
use crate::output::{self, Printer};

pub fn run(app: &mut App, printer: &Printer, command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::Pb {
            email,
            password,
            collection,
            organization,
        } => cmd_pb(app, printer, email, password, collection, organization),
        AuthCommand::Nats {
            method,
            username,
            password,
            token,
            creds_file,
            test,
        } => cmd_nats(app, method, username, password, token, creds_file, test),
        AuthCommand::Refresh => cmd_refresh(app),
        AuthCommand::Status => cmd_status(app, printer),
    }
}

fn cmd_pb(
    app: &mut App,
    printer: &Printer,
    email: Option<String>,
    password: Option<String>,
    collection: Option<IdentityCollection>,
    organization: Option<String>,
) -> Result<()> {
    let env = app.active_environment()?;
    let collection = collection.unwrap_or(env.backend.auth_collection);

    output::info(&format!(
        "Authenticating to '{}' as {}",
        env.name,
        collection.display_name()
    ));

    let identity = match email {
        Some(e) => e,
        None => prompt_line(if collection.has_memberships() { "Email: " } else { "Identity: " })?,
    };
    if collection.has_memberships() && !identity.contains('@') {
        bail!("invalid email format: '{}'", identity);
    }
    let secret = match password {
        Some(p) => p,
        None => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    let client = backend(&env)?;
    client
        .health()
        .with_context(|| format!("Failed to connect to PocketBase at {}", env.backend.url))?;

    let summary = app.authenticate(
        &client,
        LoginRequest {
            identity,
            secret,
            collection: Some(collection),
            organization,
        },
        &mut choose_organization,
    )?;

    if !printer.is_table() {
        return printer.print(&summary);
    }

    let who = summary
        .display_name
        .clone()
        .or_else(|| summary.identity_id.clone())
        .unwrap_or_else(|| "unknown".to_string());
    output::success(&format!("Authenticated as {} ({})", who, summary.collection));

    match (&summary.organization_id, summary.selection) {
        (Some(org), Some(SelectionMode::SoleMembership)) => {
            output::info(&format!("Organization: {} (only membership)", org))
        }
        (Some(org), _) => output::info(&format!("Organization: {}", org)),
        (None, Some(SelectionMode::None)) => {
            output::warning("Not a member of any organization")
        }
        (None, Some(_)) => output::info("No organization selected. Set one with: flint environment organization <id>"),
        (None, None) => {}
    }
    if let Some(expires) = summary.expires {
        println!("  Session expires {} ({})", timestamp(expires), relative_time(expires, Utc::now()));
    }
    Ok(())
}

/// Interactive organization picker; Enter leaves the organization unset
fn choose_organization(membership: &OrganizationMembership) -> Result<Option<String>> {
    println!("Multiple organizations available:");
    for (i, org) in membership.iter().enumerate() {
        println!("  {}) {}", i + 1, org.label());
    }
    let answer = prompt_line("Select organization (number or ID, Enter to skip): ")?;
    parse_choice(&answer, membership)
}

fn parse_choice(answer: &str, membership: &OrganizationMembership) -> Result<Option<String>> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(None);
    }
    if let Ok(n) = answer.parse::<usize>() {
        return match membership.iter().nth(n.wrapping_sub(1)) {
            Some(org) => Ok(Some(org.id.clone())),
            None => bail!("invalid selection {}: choose 1-{}", n, membership.len()),
        };
    }
    if membership.contains(answer) {
        return Ok(Some(answer.to_string()));
    }
    bail!("'{}' is not one of the listed organizations", answer)
}

fn cmd_nats(
    app: &mut App,
    method: Option<MessagingMethod>,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    creds_file: Option<PathBuf>,
    test: bool,
) -> Result<()> {
    let current = app.active_environment()?.messaging.auth.method();
    let method = method.unwrap_or(current);

    // Prompt only for what the chosen method still lacks
    let password = match (method, &username, password) {
        (MessagingMethod::UserPass, Some(_), None) => {
            Some(rpassword::prompt_password("NATS password: ").context("Failed to read password")?)
        }
        (_, _, p) => p,
    };

    let env = app.configure_messaging(MessagingUpdate {
        method: Some(method),
        username,
        password,
        token,
        creds_file,
    })?;
    output::success(&format!(
        "NATS authentication set to {} for environment '{}'",
        method, env.name
    ));

    if let Some(path) = app.credentials_path(&env) {
        if !path.exists() {
            output::warning(&format!("Credentials file not found: {}", path.display()));
        }
    }

    if test {
        let creds = app.credentials_path(&env);
        let runtime = super::nats::runtime()?;
        runtime
            .block_on(NatsMessaging::connect(&env.messaging, creds.as_deref()))
            .context("NATS connection test failed")?;
        output::success("Connected to NATS");
    }
    Ok(())
}

fn cmd_refresh(app: &mut App) -> Result<()> {
    let env = app.active_environment()?;
    let client = backend(&env)?;
    let env = app.refresh_session(&client)?;

    match env.backend.session.expires {
        Some(expires) => output::success(&format!(
            "Session refreshed; expires {}",
            relative_time(expires, Utc::now())
        )),
        None => output::success("Session refreshed"),
    }
    Ok(())
}

fn cmd_status(app: &App, printer: &Printer) -> Result<()> {
    let status = app.session_status()?;

    if !printer.is_table() {
        return printer.print(&status);
    }

    println!("Environment:   {}", status.environment);
    println!("Collection:    {}", status.collection);
    println!(
        "Identity:      {}",
        status.identity_id.as_deref().unwrap_or("-")
    );
    if app.preferences().organization_display {
        println!(
            "Organization:  {}",
            status.organization_id.as_deref().unwrap_or("(not set)")
        );
    }
    match status.session_state {
        SessionState::Unauthenticated => {
            output::warning("Not authenticated. Run: flint auth pb")
        }
        SessionState::Valid { expires: Some(at) } => {
            output::success(&format!("Session valid, expires {}", relative_time(at, Utc::now())))
        }
        SessionState::Valid { expires: None } => output::success("Session valid"),
        SessionState::NearExpiry { expires } => output::warning(&format!(
            "Session expires {}; run 'flint auth refresh'",
            relative_time(expires, Utc::now())
        )),
        SessionState::Expired { .. } => output::warning("Session expired. Run: flint auth pb"),
    }
    println!(
        "NATS:          {} ({})",
        status.messaging_method,
        if status.messaging_configured { "configured" } else { "not configured" }
    );
    Ok(())
}
