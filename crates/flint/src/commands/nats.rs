//! `flint nats publish|subscribe`

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use colored::*;
use flint::messaging::{
    self, parse_header, Flow, MessagingService, NatsMessaging, OutgoingMessage, ReceivedMessage,
    StopReason,
};
use flint::App;
use flint_core::format::timestamp;
use std::fs;
use std::path::{Component, PathBuf};
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::cli::NatsCommand;
use crate::output;

/// Single-threaded runtime for one messaging command
pub fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

pub fn run(app: &App, command: NatsCommand) -> Result<()> {
    match command {
        NatsCommand::Publish {
            subject,
            payload,
            headers,
            reply,
            file,
            json,
        } => {
            let message = build_message(subject, payload, &headers, reply, file, json)?;
            cmd_publish(app, &message)
        }
        NatsCommand::Subscribe {
            subject,
            queue,
            timeout,
            count,
            raw,
            headers,
            timestamp,
        } => cmd_subscribe(
            app,
            &subject,
            queue.as_deref(),
            SubscribeOptions {
                timeout: timeout.map(Duration::from_secs),
                count,
                style: PrintStyle {
                    raw,
                    headers,
                    timestamp,
                },
            },
        ),
    }
}

async fn connect(app: &App) -> Result<NatsMessaging> {
    let env = app.active_environment()?;
    let creds = app.credentials_path(&env);
    let client = NatsMessaging::connect(&env.messaging, creds.as_deref())
        .await
        .with_context(|| format!("Failed to connect to NATS for environment '{}'", env.name))?;
    Ok(client)
}

/// Validate the command line pieces of a publish and assemble the message
fn build_message(
    subject: String,
    payload: Option<String>,
    headers: &[String],
    reply: Option<String>,
    file: Option<PathBuf>,
    json: bool,
) -> Result<OutgoingMessage> {
    validate_subject(&subject, false)?;
    if let Some(reply) = &reply {
        validate_subject(reply, false).context("Invalid reply subject")?;
    }
    let payload = read_payload(payload, file)?;
    if json {
        serde_json::from_slice::<serde_json::Value>(&payload).context("Payload is not valid JSON")?;
    }
    let headers = headers
        .iter()
        .map(|h| parse_header(h).map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    Ok(OutgoingMessage {
        subject,
        reply,
        payload,
        headers,
    })
}

async fn send(client: &dyn MessagingService, message: &OutgoingMessage) -> Result<()> {
    client
        .publish(message)
        .await
        .with_context(|| format!("Failed to publish to {}", message.subject))
}

fn cmd_publish(app: &App, message: &OutgoingMessage) -> Result<()> {
    runtime()?.block_on(async {
        let client = connect(app).await?;
        send(&client, message).await
    })?;

    output::success(&format!(
        "Published {} bytes to {}",
        message.payload.len(),
        message.subject
    ));
    if let Some(reply) = &message.reply {
        println!("  Reply subject: {}", reply);
    }
    Ok(())
}

fn read_payload(inline: Option<String>, file: Option<PathBuf>) -> Result<Bytes> {
    match (inline, file) {
        (Some(_), Some(_)) => bail!("cannot specify both a payload and --file"),
        (None, None) => bail!("a payload or --file is required"),
        (Some(text), None) => Ok(Bytes::from(text)),
        (None, Some(path)) => {
            if path.components().any(|c| c == Component::ParentDir) {
                bail!("file path cannot contain '..'");
            }
            let data = fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Bytes::from(data))
        }
    }
}

/// Subjects are dot-separated tokens; wildcards only when subscribing
fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<()> {
    if subject.is_empty() {
        bail!("subject cannot be empty");
    }
    if subject.chars().any(char::is_whitespace) {
        bail!("subject cannot contain whitespace: '{}'", subject);
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            bail!("subject has an empty token: '{}'", subject);
        }
        let wildcard = *token == "*" || *token == ">";
        if wildcard && !allow_wildcards {
            bail!("wildcards are not allowed when publishing: '{}'", subject);
        }
        if *token == ">" && i != tokens.len() - 1 {
            bail!("'>' must be the last token: '{}'", subject);
        }
    }
    Ok(())
}

struct SubscribeOptions {
    timeout: Option<Duration>,
    count: Option<u64>,
    style: PrintStyle,
}

#[derive(Debug, Clone, Copy, Default)]
struct PrintStyle {
    raw: bool,
    headers: bool,
    timestamp: bool,
}

fn cmd_subscribe(app: &App, subject: &str, queue: Option<&str>, options: SubscribeOptions) -> Result<()> {
    validate_subject(subject, true)?;
    if options.count == Some(0) {
        bail!("--count must be at least 1");
    }

    let outcome = runtime()?.block_on(async {
        let client = connect(app).await?;
        let mut stream = client.subscribe(subject, queue).await?;

        if !options.style.raw {
            let group = queue.map(|q| format!(" (queue {})", q)).unwrap_or_default();
            output::info(&format!("Listening on {}{}; Ctrl-C to stop", subject, group));
        }

        let mut seen = 0u64;
        let limit = options.count;
        let style = options.style;
        let outcome = messaging::run_subscription(
            stream.as_mut(),
            |message: &ReceivedMessage| {
                println!("{}", format_message(message, style));
                seen += 1;
                Ok::<_, std::convert::Infallible>(match limit {
                    Some(max) if seen >= max => Flow::Stop,
                    _ => Flow::Continue,
                })
            },
            options.timeout,
            messaging::ctrl_c(),
        )
        .await;
        Ok::<_, anyhow::Error>(outcome)
    })?;

    if !options.style.raw {
        let line = format!("{} messages received ({})", outcome.delivered, outcome.reason);
        match outcome.reason {
            StopReason::StreamClosed => output::warning(&line),
            _ => output::info(&line),
        }
    }
    Ok(())
}

fn format_message(message: &ReceivedMessage, style: PrintStyle) -> String {
    let body = match message.payload_json() {
        Some(value) if !style.raw => {
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| message.payload_text())
        }
        _ => message.payload_text(),
    };
    if style.raw {
        return body;
    }

    let mut lines = Vec::new();
    let mut title = format!("[{}]", message.subject).bold().to_string();
    if style.timestamp {
        title = format!("{} {}", timestamp(message.received_at).dimmed(), title);
    }
    if let Some(reply) = &message.reply {
        title = format!("{} reply={}", title, reply);
    }
    lines.push(title);
    if style.headers {
        for (key, value) in &message.headers {
            lines.push(format!("  {}: {}", key, value));
        }
    }
    lines.push(body);
    lines.join("\n")
}
