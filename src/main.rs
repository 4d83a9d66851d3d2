//! Binary entry point: parse arguments, load configuration, set up
//! logging, write the pid file, replay any leftover journals, and hand
//! off to the event loop.

use auditlogd::cli::Cli;
use auditlogd::config::ServerConfig;
use auditlogd::pidfile::PidFile;
use auditlogd::sink::local::RandomDrop;
use auditlogd::Server;
use clap::Parser;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let pid_file = match PidFile::write(&config.pid_file) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            tracing::error!(error = %e, "failed to write pid file");
            return ExitCode::FAILURE;
        }
    };

    let random_drop = RandomDrop(cli.random_drop_probability());

    let mut server = match Server::new(config, cli.config.clone(), random_drop) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            drop(pid_file);
            return ExitCode::FAILURE;
        }
    };

    match server.replay_pending_journals() {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "replayed pending journals from a previous run"),
        Err(e) => tracing::warn!(error = %e, "journal replay failed, continuing"),
    }

    let result = server.run();
    drop(pid_file);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}
