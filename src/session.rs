//! Interactive terminal session
//!
//! # Error Handling
//!
//! Stdout flushes use `let _ =`: if the terminal is gone there is nobody
//! left to tell. Failed channel sends end the background thread that made them.

use crate::approval::{self, PendingApproval, RiskPolicy};
use crate::config::{Config, ResolvedModel};
use crate::controller::{Controller, Session, TurnError, TurnEvent, TurnOutcome};
use crate::conversation::{Role, ToolStatus};
use crate::dispatch::Dispatcher;
use crate::format::ResultFormatter;
use crate::llm::{ClientSettings, OpenAiClient};
use crate::sandbox::Workspace;
use crate::util::truncate;
use anyhow::{anyhow, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options from the command line that override the config file.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub workspace: PathBuf,
    pub max_turns: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlashCommand {
    Exit,
    Help,
    Clear,
    History,
    Unknown,
}

fn parse_command(line: &str) -> Option<SlashCommand> {
    let command = line.trim().strip_prefix('/')?;
    let name = command.split_whitespace().next().unwrap_or("");
    Some(match name {
        "exit" | "quit" => SlashCommand::Exit,
        "help" => SlashCommand::Help,
        "clear" | "reset" => SlashCommand::Clear,
        "history" => SlashCommand::History,
        _ => SlashCommand::Unknown,
    })
}

/// Run the read-eval loop until the user exits or stdin closes.
pub async fn run_interactive(config: Config, options: SessionOptions) -> Result<()> {
    let workspace = Workspace::open(&options.workspace)
        .with_context(|| format!("cannot use {} as the workspace", options.workspace.display()))?;
    let model = config.active_model(|name| std::env::var(name).ok())?;
    let agent = &config.agent;

    let client = OpenAiClient::new(ClientSettings {
        base_url: model.base_url.clone(),
        model: model.model.clone(),
        api_key: model.api_key.clone(),
        timeout: agent.request_timeout(),
        stream: agent.stream,
    })
    .map_err(|e| anyhow!("{e}"))?;

    let policy = RiskPolicy::new(&agent.extra_risk_patterns)
        .context("invalid pattern in agent.extra_risk_patterns")?;
    let approval_timeout = agent.approval_timeout();
    let (gate, inbox) = approval::channel(approval_timeout);
    let dispatcher = Dispatcher::new(
        Arc::new(workspace.clone()),
        agent.tool_limits(),
        Arc::new(policy),
        gate,
    );
    let controller = Controller::new(
        client,
        dispatcher,
        ResultFormatter::new(agent.max_result_chars()),
        options.max_turns.unwrap_or(agent.max_turns),
    );

    info!(
        provider = %model.provider,
        model = %model.model,
        workspace = %workspace.root().display(),
        "session started"
    );
    print_banner(&model, &workspace, controller.max_turns());

    let mut lines = spawn_stdin_reader();
    let mut approvals = spawn_approval_bridge(inbox);
    let active = Arc::new(Mutex::new(None::<CancellationToken>));
    spawn_interrupt_handler(active.clone());

    let mut session = Session::default();
    loop {
        prompt("> ");
        let Some(line) = lines.recv().await else {
            println!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse_command(input) {
            Some(SlashCommand::Exit) => break,
            Some(SlashCommand::Help) => print_help(),
            Some(SlashCommand::Clear) => {
                session = Session::default();
                println!("  Conversation cleared.");
            }
            Some(SlashCommand::History) => print_history(&session),
            Some(SlashCommand::Unknown) => println!("  Unknown command. Type /help."),
            None => {
                let cancel = CancellationToken::new();
                set_active(&active, Some(cancel.clone()));
                let result = drive_turn(
                    &controller,
                    &mut session,
                    input,
                    &cancel,
                    &mut approvals,
                    &mut lines,
                    approval_timeout,
                )
                .await;
                set_active(&active, None);
                println!("{}", describe_result(&result));
            }
        }
    }

    info!(messages = session.conversation().len(), "session ended");
    Ok(())
}

/// Run one turn while answering approval prompts that arrive meanwhile.
async fn drive_turn(
    controller: &Controller<OpenAiClient>,
    session: &mut Session,
    input: &str,
    cancel: &CancellationToken,
    approvals: &mut mpsc::UnboundedReceiver<PendingApproval>,
    lines: &mut mpsc::UnboundedReceiver<String>,
    approval_timeout: Duration,
) -> Result<TurnOutcome, TurnError> {
    let mut render = |event: TurnEvent| println!("{}", describe_event(&event));
    let turn = controller.run_turn(session, input, cancel, &mut render);
    tokio::pin!(turn);

    loop {
        tokio::select! {
            result = &mut turn => return result,
            Some(pending) = approvals.recv() => {
                answer_approval(pending, lines, cancel, approval_timeout).await;
            }
        }
    }
}

async fn answer_approval(
    pending: PendingApproval,
    lines: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    timeout: Duration,
) {
    let request = &pending.request;
    println!();
    println!("  ⚠ Approval needed: {}", request.reason);
    println!("    $ {}", request.command);
    prompt(&format!(
        "  Run this command? [y/N] (auto-deny in {}s): ",
        timeout.as_secs()
    ));

    let answer = tokio::select! {
        _ = cancel.cancelled() => None,
        line = tokio::time::timeout(timeout, lines.recv()) => line.ok().flatten(),
    };
    let approved = answer.as_deref().is_some_and(is_yes);
    debug!(call_id = %request.call_id, approved, "approval answered");

    if answer.is_none() {
        println!();
        println!("  No answer; the command will not run.");
    }
    if !pending.respond(approved) {
        println!("  The approval window had already closed.");
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn set_active(active: &Mutex<Option<CancellationToken>>, token: Option<CancellationToken>) {
    if let Ok(mut slot) = active.lock() {
        *slot = token;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  BACKGROUND THREADS
// ═══════════════════════════════════════════════════════════════════════════

/// Stdin blocks, so it gets its own thread. The channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Forward blocking approval requests into the async loop.
fn spawn_approval_bridge(
    inbox: approval::ApprovalInbox,
) -> mpsc::UnboundedReceiver<PendingApproval> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Some(pending) = inbox.recv() {
            if tx.send(pending).is_err() {
                break;
            }
        }
    });
    rx
}

/// Ctrl-C cancels the running turn, or exits when idle.
fn spawn_interrupt_handler(active: Arc<Mutex<Option<CancellationToken>>>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let token = active.lock().ok().and_then(|slot| slot.clone());
            match token {
                Some(token) => {
                    println!("\n  Cancelling...");
                    token.cancel();
                }
                None => {
                    println!();
                    std::process::exit(130);
                }
            }
        }
    });
}

// ═══════════════════════════════════════════════════════════════════════════
//  RENDERING
// ═══════════════════════════════════════════════════════════════════════════

fn prompt(text: &str) {
    print!("{text}");
    let _ = io::stdout().flush();
}

fn print_banner(model: &ResolvedModel, workspace: &Workspace, max_turns: usize) {
    println!();
    println!("  craft-code {}", env!("CARGO_PKG_VERSION"));
    println!("  model:     {} ({})", model.model, model.provider);
    println!("  endpoint:  {}", model.base_url);
    println!("  workspace: {}", workspace.root().display());
    println!("  config:    {}", Config::config_location());
    println!("  up to {max_turns} model requests per message. /help for commands.");
    println!();
}

fn print_help() {
    println!("  /help      show this help");
    println!("  /clear     start a new conversation");
    println!("  /history   show message counts");
    println!("  /exit      quit (also /quit or Ctrl-D)");
    println!("  Ctrl-C cancels the current request.");
}

fn print_history(session: &Session) {
    let conversation = session.conversation();
    println!(
        "  {} messages: {} user, {} assistant, {} tool",
        conversation.len(),
        conversation.count_role(Role::User),
        conversation.count_role(Role::Assistant),
        conversation.count_role(Role::Tool)
    );
}

fn describe_event(event: &TurnEvent) -> String {
    match event {
        TurnEvent::AssistantText(text) => text.trim().to_string(),
        TurnEvent::ToolStarted(call) => {
            format!("  → {} {}", call.name, truncate(call.arguments.trim(), 80))
        }
        TurnEvent::ToolFinished { call, result } => {
            let icon = match result.status {
                ToolStatus::Success => "✓",
                ToolStatus::Error => "✗",
                ToolStatus::Denied => "⊘",
            };
            let first_line = result.output.lines().next().unwrap_or("").trim();
            format!("  {icon} {}: {}", call.name, truncate(first_line, 100))
        }
    }
}

fn describe_result(result: &Result<TurnOutcome, TurnError>) -> String {
    match result {
        Ok(TurnOutcome::Answer(text)) if text.trim().is_empty() => {
            "  (the model returned an empty answer)".to_string()
        }
        Ok(TurnOutcome::Answer(text)) => format!("\n{}\n", text.trim_end()),
        Ok(TurnOutcome::TurnLimit { turns }) => format!(
            "\n  Stopped after {turns} model requests without a final answer. \
             Send another message to let it continue."
        ),
        Err(TurnError::Cancelled) => "  Cancelled.".to_string(),
        Err(err) => format!("  {err}\n  The conversation was kept; send a message to retry."),
    }
}
