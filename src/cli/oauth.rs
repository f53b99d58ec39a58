use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use conductor::config::RuntimeConfig;
use conductor::core::agent::init_core_subsystems;
use conductor::core::oauth::{self, OOB_REDIRECT_URI, ProviderRegistry};

use super::{flag_value, print_error, print_status, print_step, print_success, print_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OauthCommand {
    List,
    Url {
        service: String,
        redirect_uri: String,
    },
    Exchange {
        user: String,
        service: String,
        code: String,
        redirect_uri: String,
    },
    Revoke {
        user: String,
        service: String,
    },
}

pub(crate) fn parse(args: &[String], start: usize) -> Result<OauthCommand> {
    let sub_cmd = args.get(start).map(String::as_str).unwrap_or("");

    let mut user = None;
    let mut service = None;
    let mut code = None;
    let mut redirect_uri = None;
    let mut i = start + 1;
    while i < args.len() {
        match args[i].as_str() {
            "--user" | "-u" => user = Some(flag_value(args, &mut i, "--user")?),
            "--service" => service = Some(flag_value(args, &mut i, "--service")?),
            "--code" => code = Some(flag_value(args, &mut i, "--code")?),
            "--redirect-uri" => redirect_uri = Some(flag_value(args, &mut i, "--redirect-uri")?),
            other => return Err(anyhow!("Unknown option for oauth: {}", other)),
        }
    }

    let redirect_uri = redirect_uri.unwrap_or_else(|| OOB_REDIRECT_URI.to_string());
    let need = |value: Option<String>, flag: &str| {
        value.ok_or_else(|| anyhow!("{} is required for oauth {}", flag, sub_cmd))
    };

    match sub_cmd {
        "list" => Ok(OauthCommand::List),
        "url" => Ok(OauthCommand::Url {
            service: need(service, "--service")?,
            redirect_uri,
        }),
        "exchange" => Ok(OauthCommand::Exchange {
            user: need(user, "--user")?,
            service: need(service, "--service")?,
            code: need(code, "--code")?,
            redirect_uri,
        }),
        "revoke" => Ok(OauthCommand::Revoke {
            user: need(user, "--user")?,
            service: need(service, "--service")?,
        }),
        "" => Err(anyhow!("Missing oauth subcommand (list, url, exchange, revoke)")),
        other => Err(anyhow!("Unknown oauth subcommand: {}", other)),
    }
}

pub(crate) async fn run_oauth_command(
    data_dir: &Path,
    config: &RuntimeConfig,
    command: OauthCommand,
) -> Result<()> {
    match command {
        OauthCommand::List => {
            let providers = ProviderRegistry::embedded()?.with_overrides(&config.providers);
            println!("\n  {:<20} {}", style("Service").bold(), style("Token URL").dim());
            println!("  {}", "─".repeat(60));
            for id in providers.ids() {
                if let Some(provider) = providers.get(id) {
                    println!("  {:<20} {}", provider.id, provider.token_url);
                }
            }
            println!();
            Ok(())
        }
        OauthCommand::Url {
            service,
            redirect_uri,
        } => {
            let providers = ProviderRegistry::embedded()?.with_overrides(&config.providers);
            let provider = providers
                .get(&service)
                .ok_or_else(|| anyhow!("Unknown service '{}'", service))?;
            let state = oauth::generate_state();
            let url = oauth::build_auth_url(provider, &redirect_uri, &state)?;

            print_step(&format!("Authorize {} in your browser:", provider.name));
            println!("\n  {}\n", style(&url).underlined().cyan());
            print_status("State", &state);
            println!(
                "  Then run {}",
                style(format!(
                    "conductor oauth exchange --user <id> --service {} --code <code>",
                    provider.id
                ))
                .cyan()
            );
            Ok(())
        }
        OauthCommand::Exchange {
            user,
            service,
            code,
            redirect_uri,
        } => {
            let (_, bridge) = init_core_subsystems(data_dir, config).await?;
            print_step("Exchanging authorization code for tokens...");
            match bridge
                .exchange_code(&user, &service, code.trim(), &redirect_uri)
                .await
            {
                Ok(()) => {
                    print_success(&format!("{} connected for user '{}'.", service, user));
                    Ok(())
                }
                Err(e) => {
                    print_error(&e.user_message());
                    Err(e.into())
                }
            }
        }
        OauthCommand::Revoke { user, service } => {
            let (_, bridge) = init_core_subsystems(data_dir, config).await?;
            if bridge.revoke(&user, &service).await? {
                print_success(&format!("Removed {} grant for user '{}'.", service, user));
            } else {
                print_warn(&format!("No {} grant stored for user '{}'.", service, user));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        ["conductor", "oauth"]
            .into_iter()
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn exchange_defaults_redirect_uri() {
        let cmd = parse(
            &argv(&["exchange", "--user", "u1", "--service", "gmail", "--code", "abc"]),
            2,
        )
        .unwrap();
        assert_eq!(
            cmd,
            OauthCommand::Exchange {
                user: "u1".into(),
                service: "gmail".into(),
                code: "abc".into(),
                redirect_uri: OOB_REDIRECT_URI.into(),
            }
        );
    }

    #[test]
    fn missing_flags_are_named() {
        let err = parse(&argv(&["revoke", "--user", "u1"]), 2).unwrap_err();
        assert!(err.to_string().contains("--service"));
        assert!(parse(&argv(&[]), 2).is_err());
        assert!(parse(&argv(&["teleport"]), 2).is_err());
    }
}
