//! # Application Entry Point
//!
//! Parse the CLI configuration, initialize logging, and dispatch to the
//! requested pipeline: imputation (default), reference compression, or
//! legacy m3vcf conversion.

use tracing_subscriber::EnvFilter;

use remac::config::Config;
use remac::pipelines::{compress, convert, imputation::ImputationPipeline};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::parse_and_validate() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = if config.update_m3vcf {
        convert::run(&config)
    } else if config.compress_reference {
        compress::run(&config)
    } else {
        ImputationPipeline::new(config).and_then(|p| p.run())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
