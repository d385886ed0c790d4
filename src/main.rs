use anyhow::{Context, Result};
use clap::Parser;
use faros_tunnel::cli::{Cli, Mode};
use faros_tunnel::{client, server, tls};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level, RUST_LOG takes precedence
    let log_level = match cli.verbose {
        0 => "off",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Faros reverse proxy v{}", env!("CARGO_PKG_VERSION"));

    match cli.mode {
        Mode::Server => {
            let config = cli.server_config()?;
            server::run_server(config).await
        }
        Mode::Client => {
            let config = cli.client_config()?;
            client::run_client(config).await
        }
        Mode::Cert => generate_certificate(&cli),
    }
}

fn generate_certificate(cli: &Cli) -> Result<()> {
    let cert_out = cli
        .cert_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("cert.pem"));
    let key_out = cli
        .key_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("key.pem"));
    let common_name = cli.common_name();

    tls::generate_self_signed_cert(&common_name, &cli.alt_names, &cert_out, &key_out)
        .context("Failed to generate certificate")?;

    println!("Generated self-signed certificate: {}", cert_out.display());
    println!("Generated private key: {}", key_out.display());
    Ok(())
}
