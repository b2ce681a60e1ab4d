//! wgadmin binary entrypoint.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use wgadmin_cli::cli::{Cli, Commands, LogFormat};
use wgadmin_cli::commands::{
    DeleteCommand, KeyCommand, KeyKind, ListCommand, ShowCommand, UpCommand, ValidateCommand,
};
use wgadmin_cli::context::{self, CAN_START_TUNNELS};
use wgadmin_cli::output::OutputFormat;
use wgadmin_cli::CliError;

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr);
    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.report_line());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::List => {
            let manager = context::platform_manager(context::load_settings(&cli)?)?;
            ListCommand.execute(&manager, &mut stdout, &format)?;
        }
        Commands::Up { ref name } => {
            if !CAN_START_TUNNELS {
                return Err(CliError::Unsupported("up".to_string()));
            }
            let manager = context::platform_manager(context::load_settings(&cli)?)?;
            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if matches!(tokio::signal::ctrl_c().await, Ok(())) {
                    on_signal.cancel();
                }
            });
            UpCommand::new(name.clone())
                .execute(&manager, &mut stdout, &format, &shutdown)
                .await?;
        }
        Commands::Show { ref path } => ShowCommand::new(path.clone()).execute(&mut stdout, &format)?,
        Commands::Validate { ref path } => ValidateCommand::new(path.clone()).execute(&mut stdout, &format)?,
        Commands::Genkey => KeyCommand::new(KeyKind::Private).execute(&mut io::stdin().lock(), &mut stdout, &format)?,
        Commands::Pubkey => KeyCommand::new(KeyKind::Public).execute(&mut io::stdin().lock(), &mut stdout, &format)?,
        Commands::Genpsk => KeyCommand::new(KeyKind::Preshared).execute(&mut io::stdin().lock(), &mut stdout, &format)?,
        Commands::Delete { ref name, no_backup } => {
            let manager = context::platform_manager(context::load_settings(&cli)?)?;
            DeleteCommand::new(name.clone(), !no_backup).execute(&manager, &mut stdout, &format)?;
        }
    }

    Ok(())
}
