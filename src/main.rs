use std::env;

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "Usage: warden serve --config <path> | warden verify-audit <path>";

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => serve(args).await,
        "verify-audit" => verify_audit(args.next()),
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(mut args: impl Iterator<Item = String>) {
    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match warden_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.logging);

    if let Err(e) = warden_server::serve(cfg).await {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

fn verify_audit(path: Option<String>) {
    let Some(path) = path else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    match warden_server::verify_audit_chain(&path) {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("audit verification failed: {e}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(logging: &warden_config::Logging) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
