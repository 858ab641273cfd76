//! Command handlers
//!
//! Each handler gathers input (flags, prompts), calls into [`flint::App`]
//! with the real collaborators, and prints the result.

pub mod auth;
pub mod collections;
pub mod environment;
pub mod nats;

use anyhow::{Context, Result};
use flint::identity::HttpBackend;
use flint::Environment;
use std::io::{self, BufRead, Write};

/// Print `label` and read one trimmed line from stdin
pub fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin()
        .lock()
        .read_line(&mut input)
        .context("Failed to read from stdin")?;
    Ok(input.trim().to_string())
}

/// Ask a yes/no question; anything but y/yes is no
pub fn confirm(question: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{} [y/N]: ", question))?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_lowercase().as_str(), "y" | "yes")
}

/// Unauthenticated client for the environment's PocketBase
pub fn backend(env: &Environment) -> Result<HttpBackend> {
    HttpBackend::new(&env.backend.url)
        .with_context(|| format!("Failed to create PocketBase client for '{}'", env.backend.url))
}

/// Client carrying the environment's session token
pub fn authorized_backend(env: &Environment) -> Result<HttpBackend> {
    Ok(backend(env)?.with_token(&env.backend.session.token))
}
