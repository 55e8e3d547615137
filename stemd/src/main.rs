use clap::Parser;
use stemd::{Application, Config, config::Args, shutdown_signal, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Config errors surface before logging is set up
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!("{:?}", args);
    tracing::info!(
        program = %config.separation.program,
        model = %config.separation.model,
        "Separation tool configured"
    );

    // In-flight separations finish before the process exits
    Application::new(config).await?.serve(shutdown_signal()).await
}
