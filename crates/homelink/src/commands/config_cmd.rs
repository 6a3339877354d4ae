//! Config subcommand handlers.

use std::fmt::Write as _;

use homelink_config::PasswordSource;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config::{self, Config};
use crate::error::CliError;
use crate::output;

// ── Helpers ─────────────────────────────────────────────────────────

/// Format config for display, masking the password.
fn format_config_redacted(cfg: &Config, source: PasswordSource) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "base_url = \"{}\"", cfg.base_url);
    let _ = writeln!(out, "username = \"{}\"", cfg.username);
    let password = match source {
        PasswordSource::Env => "**** (from HOMELINK_PASSWORD)",
        PasswordSource::Keyring => "**** (from keyring)",
        PasswordSource::Config => "****",
        PasswordSource::Empty => "(not set)",
    };
    let _ = writeln!(out, "password = {password}");
    let _ = writeln!(out, "refresh_interval = {}", cfg.refresh_interval);
    let _ = writeln!(out, "insecure = {}", cfg.insecure);
    if let Some(ref ca) = cfg.ca_cert {
        let _ = writeln!(out, "ca_cert = \"{}\"", ca.display());
    }
    let _ = writeln!(out, "timeout = {}", cfg.timeout);

    let _ = writeln!(out);
    let _ = writeln!(out, "[mqtt]");
    let _ = writeln!(out, "broker = \"{}\"", cfg.mqtt.broker);
    let _ = writeln!(out, "port = {}", cfg.mqtt.port);
    let _ = writeln!(out, "use_tls = {}", cfg.mqtt.use_tls);
    let _ = writeln!(out, "use_client_certs = {}", cfg.mqtt.use_client_certs);
    if let Some(ref dir) = cfg.mqtt.asset_dir {
        let _ = writeln!(out, "asset_dir = \"{}\"", dir.display());
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "[cache]");
    if let Some(ref path) = cfg.cache.path {
        let _ = writeln!(out, "path = \"{}\"", path.display());
    }
    let _ = write!(out, "history_cap = {}", cfg.cache.history_cap);

    out
}

fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init { force } => {
            let path = config::config_path();
            if path.exists() && !force {
                return Err(CliError::Validation {
                    field: "config".into(),
                    reason: format!("{} already exists (use --force to overwrite)", path.display()),
                });
            }
            let mut cfg = Config::default();
            config::apply_overrides(&mut cfg, global);
            let written = config::save_config(&cfg)?;
            output::notice(&format!("Wrote {}", written.display()), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let mut cfg = config::load_config()?;
            config::apply_overrides(&mut cfg, global);
            let (_, source) = config::resolve_password(&cfg);

            let out = match global.output {
                OutputFormat::Table | OutputFormat::Plain => format_config_redacted(&cfg, source),
                OutputFormat::Json | OutputFormat::JsonCompact => {
                    if cfg.password.is_some() {
                        cfg.password = Some("****".into());
                    }
                    if global.output == OutputFormat::Json {
                        serde_json::to_string_pretty(&cfg)?
                    } else {
                        serde_json::to_string(&cfg)?
                    }
                }
            };
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::SetPassword { user } => {
            let username = match user.or_else(|| global.username.clone()) {
                Some(name) => name,
                None => config::load_config()?.username,
            };

            let password = rpassword::prompt_password(format!("Password for {username}: "))
                .map_err(prompt_err)?;
            if password.is_empty() {
                return Err(CliError::Validation {
                    field: "password".into(),
                    reason: "cannot be empty".into(),
                });
            }

            config::store_password(&username, &password)?;
            output::notice(
                &format!("Password for '{username}' stored in system keyring"),
                global.quiet,
            );
            Ok(())
        }
    }
}
