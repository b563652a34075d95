//! Local relay binary: SOCKS5 on the client side of the tunnel.
//!
//! Usage: sslocal [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -t, --test <FILE>    Validate a configuration file and exit
//!   -h, --help           Print help information

use std::env;

use ssrelay::{Mode, RelayConfig, RelayConfigFile};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-t" | "--test" => {
            if args.len() < 3 {
                eprintln!("Error: --test requires a config file path");
                return Ok(());
            }
            let config = load_config(&args[2])?;
            println!("Configuration OK: {:?}", config);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_local(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"sslocal - encrypted SOCKS5 tunnel, local side

USAGE:
    sslocal [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -t, --test <FILE>    Validate a configuration file and exit
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "server": "203.0.113.7",
        "server_port": 8388,
        "local_address": "127.0.0.1",
        "local_port": 1080,
        "password": "secret",
        "method": "aes-256-gcm",
        "timeout": 300
    }}

EXAMPLES:
    Run the local relay:
        sslocal --config local.json
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<RelayConfig> {
    let content = std::fs::read_to_string(path)?;
    let file = RelayConfigFile::from_json(&content)?;
    Ok(file.to_config(Mode::Local)?)
}

async fn run_local(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        "Tunnelling through {}:{} ({})",
        config.server,
        config.server_port,
        config.method
    );

    let handle = ssrelay::start(config)?;
    tracing::info!("SOCKS5 proxy listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    tokio::task::spawn_blocking(move || handle.stop()).await??;
    Ok(())
}
