//! `bastion` operator shell.
//!
//! Loads settings (`BASTION_CONFIG` or the first argument), seeds an
//! in-memory record store from the policy file, and runs a line-oriented
//! REPL over the authorizer and the approval workflow.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bastion::audit::Actor;
use bastion::config::Settings;
use bastion::enforcement::decision::ExecutionDecision;
use bastion::exec::{CommandInvocation, SshExecutor};
use bastion::model::{ApprovalDecision, CommandScope, FoldedName, GroupId, RequestId, ServerScope};
use bastion::protect::{FieldProtector, PassthroughProtector};
use bastion::store::{GrantStore, MemoryStore};
use bastion::store::seed::PolicyDocument;
use bastion::tickets::http::HttpTicketResolver;
use bastion::workflow::RequestDraft;
use bastion::{Backends, Engine};

const PROMPT: &str = "bastion> ";

const HELP: &str = "\
commands:
  as <subject>                         act as another subject
  check <host> <command...>            quick authorization check
  inventory <host>                     commands visible on a host
  request <scope> <hours> <commands|-> <reason...>
                                       scope: group:<id> or host1,host2
                                       commands: cmd1,cmd2 | groups:<id>,<id> | -
  pending                              requests awaiting your decision
  requests                             all requests, newest first
  show <request-id>                    one request as JSON
  approve <request-id> [until=<rfc3339>] [comment...]
  deny <request-id> [comment...]
  cancel <request-id>
  grants                               your active grants
  exec <host> <command...>             authorize, then run over ssh
  help
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let fallback = std::env::args().nth(1).map(PathBuf::from);
    let settings_path = Settings::resolve_path(fallback.as_deref());
    let mut settings = Settings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;

    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let store = Arc::new(MemoryStore::new(protector()?));
    PolicyDocument::load(&settings.policy_path)
        .with_context(|| format!("loading policy from {}", settings.policy_path.display()))?
        .seed(&store)
        .await?;

    let mut backends = Backends::in_memory(store);
    if let Some(endpoint) = settings.tickets.endpoint.as_deref() {
        let resolver = HttpTicketResolver::new(
            endpoint,
            settings.tickets.token.take(),
            settings.tickets.timeout,
        )?;
        tracing::info!(endpoint, "change-ticket lookups enabled");
        backends = backends.with_tickets(Arc::new(resolver));
    }
    let engine = Engine::new(backends, settings.tickets.timeout);
    let executor = SshExecutor::new(
        settings.ssh.options.clone(),
        settings.ssh.user.clone(),
        settings.ssh.timeout,
    );

    let mut actor = Actor::new(&initial_subject());
    println!("bastion: acting as {} (type `help`)", actor.subject);

    let (mut lines, ready) = spawn_readline_thread();
    while let Some(event) = lines.recv().await {
        let line = match event {
            ReadlineEvent::Line(line) => line,
            ReadlineEvent::Eof => break,
        };
        let line = line.trim();
        if !line.is_empty() {
            match dispatch(&engine, &executor, &mut actor, line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => eprintln!("error: {e:#}"),
            }
        }
        if ready.send(()).is_err() {
            break;
        }
    }
    Ok(())
}

enum ReadlineEvent {
    Line(String),
    Eof,
}

/// rustyline blocks, so it gets its own OS thread. The thread prompts again
/// only after the previous line has been handled and acknowledged on the
/// returned sender.
fn spawn_readline_thread() -> (
    tokio::sync::mpsc::UnboundedReceiver<ReadlineEvent>,
    std::sync::mpsc::Sender<()>,
) {
    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();

    let spawned = std::thread::Builder::new()
        .name("bastion-readline".into())
        .spawn(move || {
            let config = rustyline::Config::builder().auto_add_history(true).build();
            let mut editor = match DefaultEditor::with_config(config) {
                Ok(editor) => editor,
                Err(e) => {
                    tracing::error!("failed to create readline editor: {e}");
                    let _ = event_tx.send(ReadlineEvent::Eof);
                    return;
                }
            };
            loop {
                match editor.readline(PROMPT) {
                    Ok(line) => {
                        if event_tx.send(ReadlineEvent::Line(line)).is_err() {
                            break;
                        }
                        // Wait until the line is handled; a dropped sender means shutdown.
                        if ready_rx.recv().is_err() {
                            break;
                        }
                    }
                    Err(ReadlineError::Interrupted) => continue,
                    Err(ReadlineError::Eof) => {
                        let _ = event_tx.send(ReadlineEvent::Eof);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("readline error: {e}");
                        let _ = event_tx.send(ReadlineEvent::Eof);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("failed to spawn readline thread: {e}");
    }
    (event_rx, ready_tx)
}

enum Flow {
    Continue,
    Quit,
}

#[cfg(feature = "at-rest")]
fn protector() -> Result<Arc<dyn FieldProtector>> {
    match bastion::protect::AesGcmProtector::from_env()? {
        Some(aes) => Ok(Arc::new(aes)),
        None => {
            tracing::warn!("BASTION_MASTER_KEY unset; grant fields stored in the clear");
            Ok(Arc::new(PassthroughProtector))
        }
    }
}

#[cfg(not(feature = "at-rest"))]
fn protector() -> Result<Arc<dyn FieldProtector>> {
    Ok(Arc::new(PassthroughProtector))
}

fn initial_subject() -> String {
    ["BASTION_SUBJECT", "USER"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "operator".to_owned())
}

async fn dispatch(
    engine: &Engine,
    executor: &SshExecutor,
    actor: &mut Actor,
    line: &str,
) -> Result<Flow> {
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match verb {
        "help" | "?" => println!("{HELP}"),
        "quit" | "exit" => return Ok(Flow::Quit),
        "as" => {
            if rest.is_empty() {
                bail!("usage: as <subject>");
            }
            *actor = Actor::new(rest);
            println!("acting as {}", actor.subject);
        }
        "check" => {
            let (host, command) = host_and_command(rest)?;
            let decision = engine.authorizer.quick_authorize(actor, host, command).await?;
            println!(
                "{} ({}) prefix={}",
                if decision.allowed { "ALLOW" } else { "DENY" },
                decision.reason_text(),
                decision.prefix
            );
        }
        "inventory" => {
            if rest.is_empty() {
                bail!("usage: inventory <host>");
            }
            let inventory = engine.authorizer.resolve_inventory(actor, rest).await?;
            for entry in &inventory.entries {
                println!(
                    "{:<5} {:<3} {:<32} group={} cr={} ctask={}",
                    if entry.is_allowed { "allow" } else { "-" },
                    if entry.exclusion { "ex" } else { "" },
                    entry.command.text,
                    entry.group.as_ref().map_or("-", |g| g.as_str()),
                    entry.cr_number.as_deref().unwrap_or("-"),
                    entry.ctask.as_deref().unwrap_or("-"),
                );
            }
            if inventory.enforcement_suspended {
                println!("enforcement suspended on {}", inventory.host);
            }
            if inventory.grant_data_unavailable {
                println!("warning: grant data unavailable");
            }
            if inventory.ticket_data_unavailable {
                println!("warning: change-ticket data unavailable");
            }
        }
        "request" => {
            let draft = parse_request(rest, engine.authorizer.now())?;
            let request = engine.workflow.submit_request(actor, draft).await?;
            println!(
                "submitted {} with {} approval level(s)",
                request.id,
                request.approval_levels.len()
            );
        }
        "pending" => {
            for request in engine.workflow.awaiting(&actor.subject).await? {
                println!("{}  {}  {}", request.id, request.requester, request.reason);
            }
        }
        "requests" => {
            for request in engine.workflow.list().await? {
                println!(
                    "{}  {:?}  {}  {}",
                    request.id, request.status, request.requester, request.reason
                );
            }
        }
        "show" => {
            let request = engine.workflow.request(&request_id(rest)?).await?;
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
        "approve" => {
            let (id, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let mut rest = rest.trim();
            let mut end_date = None;
            if let Some(arg) = rest.strip_prefix("until=") {
                let (raw, tail) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
                end_date = Some(
                    DateTime::parse_from_rfc3339(raw)
                        .with_context(|| format!("bad until= timestamp `{raw}`"))?
                        .with_timezone(&Utc),
                );
                rest = tail.trim();
            }
            let request = engine
                .workflow
                .act(
                    &request_id(id)?,
                    actor,
                    ApprovalDecision::Assigned,
                    comment(rest),
                    end_date,
                )
                .await?;
            println!("{} is {:?}", request.id, request.status);
        }
        "deny" => {
            let (id, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let request = engine
                .workflow
                .act(&request_id(id)?, actor, ApprovalDecision::Denied, comment(rest), None)
                .await?;
            println!("{} is {:?}", request.id, request.status);
        }
        "cancel" => {
            let request = engine.workflow.cancel(&request_id(rest)?, actor).await?;
            println!("{} is {:?}", request.id, request.status);
        }
        "grants" => {
            let grants = engine
                .backends()
                .grants
                .active_grants_for(&actor.subject, engine.authorizer.now())
                .await?;
            for grant in grants {
                println!(
                    "{}  until={}  blocked={}  request={}",
                    grant.id,
                    grant.valid_until.to_rfc3339(),
                    grant.blocked,
                    grant.request_number.as_deref().unwrap_or("-")
                );
            }
        }
        "exec" => {
            let (host, command) = host_and_command(rest)?;
            let invocation = CommandInvocation::new(host, command);
            let (evaluated, decision) = engine.authorizer.evaluate(actor, invocation).await?;
            match decision {
                ExecutionDecision::Allow(token) => {
                    let output = evaluated.execute(executor, token).await?;
                    print!("{}", output.stdout);
                    eprint!("{}", output.stderr);
                    if !output.success() {
                        println!("exit status: {:?}", output.exit_code);
                    }
                }
                ExecutionDecision::Deny(denied) => {
                    println!("DENY ({})", denied.reason_text());
                }
            }
        }
        other => bail!("unknown command `{other}` (try `help`)"),
    }
    Ok(Flow::Continue)
}

fn host_and_command(rest: &str) -> Result<(&str, &str)> {
    match rest.split_once(char::is_whitespace) {
        Some((host, command)) if !command.trim().is_empty() => Ok((host, command.trim())),
        _ => bail!("usage: <host> <command...>"),
    }
}

fn request_id(raw: &str) -> Result<RequestId> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("a request id is required");
    }
    Ok(RequestId::from(raw))
}

fn comment(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| raw.to_owned())
}

fn parse_request(rest: &str, now: DateTime<Utc>) -> Result<RequestDraft> {
    let mut parts = rest.splitn(4, char::is_whitespace);
    let (Some(scope), Some(hours), Some(commands), Some(reason)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("usage: request <scope> <hours> <commands|-> <reason...>");
    };

    let server_scope = match scope.strip_prefix("group:") {
        Some(id) => ServerScope::Group(id.into()),
        None => ServerScope::Hosts(split_list(scope).map(FoldedName::new).collect()),
    };
    let command_scope = if commands == "-" {
        None
    } else if let Some(groups) = commands.strip_prefix("groups:") {
        Some(CommandScope::Groups(split_list(groups).map(GroupId::from).collect()))
    } else {
        Some(CommandScope::Commands(split_list(commands).map(str::to_owned).collect()))
    };
    let hours: i64 = hours
        .parse()
        .with_context(|| format!("hours must be a whole number, got `{hours}`"))?;
    if hours <= 0 {
        bail!("hours must be positive, got {hours}");
    }
    let Some(valid_until) = ChronoDuration::try_hours(hours).and_then(|d| now.checked_add_signed(d))
    else {
        bail!("{hours} hours is out of range");
    };

    Ok(RequestDraft {
        on_behalf_of: None,
        server_scope,
        command_scope,
        reason: reason.trim().to_owned(),
        valid_from: now,
        valid_until,
    })
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_with_hosts_and_commands() {
        let now = Utc::now();
        let draft = parse_request("web01,web02 4 ls,uptime disk is filling up", now).unwrap();
        assert_eq!(
            draft.server_scope,
            ServerScope::Hosts(vec![FoldedName::new("web01"), FoldedName::new("web02")])
        );
        assert_eq!(
            draft.command_scope,
            Some(CommandScope::Commands(vec!["ls".into(), "uptime".into()]))
        );
        assert_eq!(draft.reason, "disk is filling up");
        assert_eq!(draft.valid_until - draft.valid_from, ChronoDuration::hours(4));
    }

    #[test]
    fn request_line_with_group_scope_and_no_commands() {
        let draft = parse_request("group:web 1 - patching", Utc::now()).unwrap();
        assert_eq!(draft.server_scope, ServerScope::Group("web".into()));
        assert!(draft.command_scope.is_none());

        let draft = parse_request("h1 1 groups:diag,net triage", Utc::now()).unwrap();
        assert_eq!(
            draft.command_scope,
            Some(CommandScope::Groups(vec![GroupId::from("diag"), GroupId::from("net")]))
        );
    }

    #[test]
    fn short_request_line_is_rejected() {
        assert!(parse_request("h1 1 -", Utc::now()).is_err());
        assert!(parse_request("h1 soon - why", Utc::now()).is_err());
    }

    #[test]
    fn request_hours_must_be_positive_and_in_range() {
        let now = Utc::now();
        for line in ["h1 9999999999999 - why", "h1 0 - why", "h1 -3 - why"] {
            assert!(parse_request(line, now).is_err(), "{line}");
        }
        let draft = parse_request("h1 8 - why", now).unwrap();
        assert_eq!(draft.valid_until, now + ChronoDuration::hours(8));
    }
}
