use std::io::{self, BufReader};
use std::process::ExitCode;

use banter_nrepl::EmbeddedBackend;
use clap::Parser;
use tracing::{error, info};

use banter_mcp::config::{BackendTarget, Cli};
use banter_mcp::server::McpServer;
use banter_mcp::telemetry;
use banter_mcp::tools::Bridge;

const TARGET: &str = env!("CARGO_PKG_NAME");

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(error) = telemetry::initialise(cli.log_filter.as_deref(), cli.log_format) {
        eprintln!("banter-mcp: {error}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(target: TARGET, error = %error, "bridge terminated");
            eprintln!("banter-mcp: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let directory = std::env::current_dir()?;
    let bridge = match cli.resolve_backend(&directory)? {
        BackendTarget::Embedded => {
            let mut backend = EmbeddedBackend::new();
            let port = backend.launch()?;
            info!(target: TARGET, port, "embedded backend listening");
            Bridge::embedded(backend)
        }
        BackendTarget::External(port) => {
            info!(target: TARGET, port, "targeting external backend");
            Bridge::external(port)
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut server = McpServer::new(bridge);
    server.run(BufReader::new(stdin.lock()), stdout.lock())?;
    Ok(())
}
