//! Thin demonstration binary over `kagent-core`.
//!
//! Exercises the library end to end: resolves a provider from a URI
//! scheme, registers the built-in tools, and drives the Agent loop for
//! one query. This is not a claim to implement spec.md §6's full CLI
//! surface (flag parsing / config loading are out of scope collaborators)
//! — it accepts just enough of the documented flags to prove the gateway,
//! agent loop, and safety classifier link and run together.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use kagent_core::agent::{Agent, AgentStep, Journal, MetaCommand, PermissionDecision};
use kagent_core::provider::gateway::Client;
use kagent_core::provider::registry::{build_client, parse_provider_uri};
use kagent_core::provider::retry::{RetryConfig, RetryingClient};
use kagent_core::shim::PromptTemplate;
use kagent_core::tools::{ToolContext, ToolRegistry};

const DEFAULT_MAX_ITERATIONS: usize = 20;
const SYSTEM_PROMPT: &str =
    "You are an assistant that translates requests about a Kubernetes cluster into kubectl and \
     shell commands, runs them, and explains the results.";

/// A single-shot, single-turn demonstration client for `kagent-core` (spec.md §6).
#[derive(Parser)]
#[command(name = "kagent", about = "Demonstration CLI over kagent-core", long_about = None)]
struct Cli {
    /// Natural-language query. With no query and a non-TTY stdin, stdin
    /// content is appended as a prefix (spec.md §6); with no query and a
    /// TTY, starts an interactive REPL.
    query: Option<String>,

    /// Provider URI or bare scheme, e.g. `openai`, `gemini://`,
    /// `ollama://localhost:11434` (spec.md §6 `llm-provider`).
    #[arg(long = "llm-provider", default_value = "openai")]
    llm_provider: String,

    /// Provider-specific model id (spec.md §6 `model`).
    #[arg(long, default_value = "")]
    model: String,

    /// Cap on the Agent loop's iterations (spec.md §6 `max-iterations`).
    #[arg(long = "max-iterations", default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: usize,

    /// Never prompt for mutating commands (spec.md §6 `skip-permissions`).
    #[arg(long = "skip-permissions")]
    skip_permissions: bool,

    /// Non-interactive: run exactly one query and exit (spec.md §6 `quiet`).
    #[arg(long)]
    quiet: bool,

    /// Path for NDJSON journal events; a discarding journal is used when
    /// omitted (spec.md §6 `trace-path`).
    #[arg(long = "trace-path")]
    trace_path: Option<PathBuf>,

    /// Drive the Tool-Use Shim (spec.md §4.7) instead of native function
    /// calling — for backends with no function-calling support.
    #[arg(long = "enable-tool-use-shim")]
    enable_tool_use_shim: bool,

    /// Overrides the shim's default prompt template (spec.md §6
    /// `prompt-template-file-path`). Ignored unless the shim is enabled.
    #[arg(long = "prompt-template-file-path")]
    prompt_template_file_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let (scheme, host) = parse_provider_uri(&cli.llm_provider)?;
    let client = build_client(scheme, cli.model, host)?;
    let client = RetryingClient::new(client, RetryConfig::default());

    let work_dir = std::env::temp_dir().join(format!("kagent-{}", std::process::id()));
    std::fs::create_dir_all(&work_dir)?;
    let ctx = ToolContext::new(work_dir).with_kubeconfig(resolve_kubeconfig());

    let registry = ToolRegistry::new().register_builtin();
    let journal = match &cli.trace_path {
        Some(path) => std::sync::Arc::new(Journal::open(path)?),
        None => std::sync::Arc::new(Journal::discard()),
    };

    let chat = client.start_chat(Some(SYSTEM_PROMPT.to_string()));
    let cancel = CancellationToken::new();
    let mut agent = Agent::new(chat, registry, ctx, journal, cli.max_iterations, cli.skip_permissions, cancel);

    if cli.enable_tool_use_shim {
        let template = match &cli.prompt_template_file_path {
            Some(path) => PromptTemplate::from_file(path)?,
            None => PromptTemplate::default(),
        };
        agent = agent.with_shim(template.with_strict_json_directive_for(scheme));
    }

    let query = resolve_query(cli.query);

    if cli.quiet {
        let query = query.ok_or("quiet mode requires a query")?;
        return run_single_turn(&mut agent, &query).await;
    }

    match query {
        Some(query) => {
            run_single_turn(&mut agent, &query).await?;
            repl(&mut agent).await
        }
        None => repl(&mut agent).await,
    }
}

/// Appends piped stdin content as a prefix to the positional query when
/// stdin is not a TTY (spec.md §6).
fn resolve_query(positional: Option<String>) -> Option<String> {
    if io::stdin().is_terminal() {
        return positional;
    }
    let mut piped = String::new();
    if io::stdin().read_to_string(&mut piped).is_err() || piped.trim().is_empty() {
        return positional;
    }
    match positional {
        Some(query) => Some(format!("{query}\n{piped}")),
        None => Some(piped),
    }
}

fn resolve_kubeconfig() -> PathBuf {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir().unwrap_or_default().join(".kube").join("config")
}

async fn run_single_turn(agent: &mut Agent, query: &str) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut step = agent.handle_input(query).await?;
    loop {
        match step {
            AgentStep::FinalAnswer(text) => {
                println!("{text}");
                return Ok(ExitCode::SUCCESS);
            }
            AgentStep::Failed(text) => {
                println!("{text}");
                return Ok(ExitCode::FAILURE);
            }
            AgentStep::Exited => return Ok(ExitCode::SUCCESS),
            AgentStep::Meta(meta) => {
                print_meta(agent, meta);
                return Ok(ExitCode::SUCCESS);
            }
            AgentStep::PermissionRequest(request) => {
                let decision = prompt_permission(&request.tool_name, &request.command);
                step = agent.resolve_permission(decision).await?;
            }
        }
    }
}

async fn repl(agent: &mut Agent) -> Result<ExitCode, Box<dyn std::error::Error>> {
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            return Ok(ExitCode::SUCCESS);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut step = agent.handle_input(line).await?;
        loop {
            match step {
                AgentStep::FinalAnswer(text) => {
                    println!("{text}");
                    break;
                }
                AgentStep::Failed(text) => {
                    println!("{text}");
                    break;
                }
                AgentStep::Exited => return Ok(ExitCode::SUCCESS),
                AgentStep::Meta(meta) => {
                    if matches!(meta, MetaCommand::Exit) {
                        return Ok(ExitCode::SUCCESS);
                    }
                    print_meta(agent, meta);
                    break;
                }
                AgentStep::PermissionRequest(request) => {
                    let decision = prompt_permission(&request.tool_name, &request.command);
                    step = agent.resolve_permission(decision).await?;
                }
            }
        }
    }
}

fn print_meta(agent: &Agent, meta: MetaCommand) {
    match meta {
        MetaCommand::Tools => {
            for name in agent.tool_names() {
                println!("{name}");
            }
        }
        MetaCommand::Version => println!("{}", env!("CARGO_PKG_VERSION")),
        MetaCommand::Reset | MetaCommand::Clear => println!("(conversation reset)"),
        MetaCommand::Exit => println!("(goodbye)"),
        MetaCommand::Model | MetaCommand::Models | MetaCommand::Session | MetaCommand::Sessions => {
            println!("(not implemented by the demonstration binary)");
        }
    }
}

/// Prompts `{yes, yes-and-remember, no}` on the controlling terminal
/// (spec.md §4.6); a non-interactive invocation without
/// `--skip-permissions` can't safely auto-approve, so it declines.
fn prompt_permission(tool_name: &str, command: &str) -> PermissionDecision {
    if !io::stdin().is_terminal() {
        return PermissionDecision::Deny;
    }
    println!("'{tool_name}' wants to run: {command}");
    print!("Allow? [y]es / [a]lways / [N]o: ");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return PermissionDecision::Deny;
    }
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::Allow,
        "a" | "always" => PermissionDecision::AllowAndRemember,
        _ => PermissionDecision::Deny,
    }
}
