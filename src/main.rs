//! `modelql` command line entry point

use modelql::cli::{self, CliOptions, USAGE};
use modelql::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = match CliOptions::from_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    let config = EngineConfig::from_env()?;
    modelql::logging::init(config.log_format);
    tracing::debug!(?config, "Configuration loaded");

    let output = cli::run(options, config).await?;
    println!("{output}");
    Ok(())
}
