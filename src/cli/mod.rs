mod oauth;
mod output;
mod serve;

use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;
use std::sync::Arc;

use conductor::config::RuntimeConfig;
use conductor::core::agent::Runtime;
use conductor::core::engine::RemoteEngine;
use conductor::logging;
use conductor::platform::{NativePlatform, Platform};

pub(crate) use output::{print_error, print_status, print_step, print_success, print_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Serve,
    Run(RunArgs),
    Oauth(oauth::OauthCommand),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunArgs {
    pub user: String,
    pub agent: String,
    pub prompt: String,
    pub session: Option<String>,
}

/// Read the value following a flag, advancing past both.
pub(crate) fn flag_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    match args.get(*i + 1) {
        Some(value) if !value.starts_with("--") => {
            *i += 2;
            Ok(value.clone())
        }
        _ => Err(anyhow!("{} needs a value", flag)),
    }
}

fn parse_run_args(args: &[String], start: usize) -> Result<RunArgs> {
    let mut user = None;
    let mut agent = None;
    let mut prompt = None;
    let mut session = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--user" | "-u" => user = Some(flag_value(args, &mut i, "--user")?),
            "--agent" | "-a" => agent = Some(flag_value(args, &mut i, "--agent")?),
            "--prompt" | "-p" => prompt = Some(flag_value(args, &mut i, "--prompt")?),
            "--session" | "-s" => session = Some(flag_value(args, &mut i, "--session")?),
            other => return Err(anyhow!("Unknown option for run: {}", other)),
        }
    }

    let prompt = prompt.ok_or_else(|| anyhow!("--prompt is required"))?;
    if prompt.trim().is_empty() {
        return Err(anyhow!("--prompt must not be empty"));
    }
    Ok(RunArgs {
        user: user.ok_or_else(|| anyhow!("--user is required"))?,
        agent: agent.ok_or_else(|| anyhow!("--agent is required"))?,
        prompt,
        session,
    })
}

pub(crate) fn parse_command(args: &[String]) -> Result<Command> {
    match args.get(1).map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => Ok(Command::Help),
        Some("serve") => Ok(Command::Serve),
        Some("run") => Ok(Command::Run(parse_run_args(args, 2)?)),
        Some("oauth") => Ok(Command::Oauth(oauth::parse(args, 2)?)),
        Some(other) => Err(anyhow!("Unknown command: {}", other)),
    }
}

fn print_help() {
    println!(
        "\n {} agent runtime control plane",
        style("conductor").bold().green()
    );

    output::HelpSection::new("Runtime")
        .command("serve", "Run the scheduler and cache sweeps until Ctrl+C")
        .command(
            "run --user <id> --agent <name> --prompt <text> [--session <id>]",
            "Run one chat turn",
        )
        .print();

    output::HelpSection::new("Credentials")
        .command("oauth list", "List known providers")
        .command("oauth url --service <id> [--redirect-uri <uri>]", "Print an authorization URL")
        .command(
            "oauth exchange --user <id> --service <id> --code <code> [--redirect-uri <uri>]",
            "Store a grant from an authorization code",
        )
        .command("oauth revoke --user <id> --service <id>", "Delete a stored grant")
        .print();

    println!(
        "\n {} data directory is {} (override with CONDUCTOR_DATA_DIR)\n",
        style("Note:").bold(),
        style(NativePlatform::data_dir().display()).cyan()
    );
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            print_error(&e.to_string());
            print_help();
            std::process::exit(2);
        }
    };

    if command == Command::Help {
        print_help();
        return Ok(());
    }

    logging::init("info");
    let data_dir = NativePlatform::data_dir();
    let config = RuntimeConfig::load(&data_dir)?;

    match command {
        Command::Serve => serve::run_serve(&data_dir, &config).await,
        Command::Run(run) => run_once(&data_dir, &config, run).await,
        Command::Oauth(cmd) => oauth::run_oauth_command(&data_dir, &config, cmd).await,
        Command::Help => Ok(()),
    }
}

async fn run_once(data_dir: &Path, config: &RuntimeConfig, args: RunArgs) -> Result<()> {
    let engine = Arc::new(RemoteEngine::new(&config.engine)?);
    let runtime = Runtime::bootstrap(data_dir, config, engine).await?;
    let session = args
        .session
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));

    match runtime
        .chat(&args.user, &args.agent, &session, &args.prompt)
        .await
    {
        Ok(response) => {
            for call in &response.tool_invocations {
                let mark = if call.success { "ok" } else { "failed" };
                print_status(&call.tool, mark);
            }
            println!("{}", response.output);
            Ok(())
        }
        Err(e) => Err(anyhow!(e.user_message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        std::iter::once("conductor")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn no_arguments_is_help() {
        assert_eq!(parse_command(&argv(&[])).unwrap(), Command::Help);
        assert_eq!(parse_command(&argv(&["-h"])).unwrap(), Command::Help);
    }

    #[test]
    fn run_collects_flags_in_any_order() {
        let cmd = parse_command(&argv(&[
            "run", "--prompt", "hi there", "-a", "helper", "--user", "u1",
        ]))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Run(RunArgs {
                user: "u1".into(),
                agent: "helper".into(),
                prompt: "hi there".into(),
                session: None,
            })
        );
    }

    #[test]
    fn run_requires_prompt_user_and_agent() {
        assert!(parse_command(&argv(&["run", "--user", "u1", "--agent", "a"])).is_err());
        assert!(parse_command(&argv(&["run", "--agent", "a", "--prompt", "x"])).is_err());
        assert!(parse_command(&argv(&["run", "--user", "u1", "--prompt", "x"])).is_err());
        assert!(parse_command(&argv(&["run", "--user"])).is_err());
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse_command(&argv(&["dance"])).is_err());
    }
}
