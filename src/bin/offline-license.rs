use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use offline_license::config::Settings;
use offline_license::logging::{init_tracing, LogFormat};
use offline_license::{
    FingerprintSource, HostFingerprint, LicenseRecord, LicenseVerification, SystemClock,
};

#[derive(Debug, Parser)]
#[command(
    name = "offline-license",
    version,
    about = "Issue and verify offline machine-bound licenses"
)]
struct Cli {
    /// TOML settings file.
    #[arg(long, global = true, env = "OFFLINE_LICENSE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Issue and sign a new license.
    Generate {
        /// Machine id to bind to; defaults to this machine.
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        app: String,
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// Comma separated feature tags.
        #[arg(long, value_delimiter = ',')]
        features: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Fingerprint in container mode.
        #[arg(long)]
        container: bool,
        /// Only print this machine's id.
        #[arg(long)]
        show_id: bool,
    },
    /// Verify a license on this machine.
    Verify {
        #[arg(long)]
        license: Option<PathBuf>,
        #[arg(long)]
        timestamp: Option<PathBuf>,
        #[arg(long)]
        app: String,
        #[arg(long)]
        container: bool,
    },
    /// Print this machine's id.
    MachineId {
        #[arg(long)]
        container: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::Generate {
            machine,
            app,
            days,
            features,
            out,
            container,
            show_id,
        } => {
            if show_id {
                println!("{}", machine_id(container)?);
                return Ok(());
            }

            let machine_id = match machine {
                Some(id) => id,
                None => {
                    let id = machine_id(container)?;
                    info!(machine_id = %id, "using current machine id");
                    id
                }
            };
            let features = features
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();

            let signer = settings.signing.signer()?;
            let mut license = LicenseRecord::issue(machine_id, app, days, features, &SystemClock)
                .context("failed to create license")?;
            license.sign(signer.as_ref())?;

            let out = out.unwrap_or(settings.license_path);
            license
                .save(&out)
                .with_context(|| format!("failed to save license to {}", out.display()))?;
            info!(
                license_path = %out.display(),
                expiry_date = %license.expiry_date,
                "license created"
            );

            println!("{}", serde_json::to_string_pretty(&license)?);
        }
        Command::Verify {
            license,
            timestamp,
            app,
            container,
        } => {
            let machine_id = machine_id(container)?;
            let verifier = settings.signing.verifier()?;
            let license_path = license.unwrap_or_else(|| settings.license_path.clone());
            let guard_path = timestamp.unwrap_or_else(|| settings.clock_guard_path.clone());

            let record = LicenseVerification::new(verifier.as_ref(), &SystemClock)
                .with_rollback_tolerance(settings.rollback_tolerance()?)
                .verify_and_update(&license_path, &guard_path, &machine_id, &app)
                .context("license verification failed")?;

            println!("License verification successful");
            println!("  Machine ID:    {}", record.machine_id);
            println!("  App ID:        {}", record.app_id);
            println!("  Expiry Date:   {}", record.expiry_date.to_rfc3339());
            println!("  Features:      {}", record.features.join(", "));
            println!("  Creation Date: {}", record.creation_date.to_rfc3339());
        }
        Command::MachineId { container } => {
            println!("{}", machine_id(container)?);
        }
    }

    Ok(())
}

fn machine_id(container: bool) -> Result<String> {
    HostFingerprint::new(container)
        .current_machine_id()
        .context("failed to get machine id")
}
