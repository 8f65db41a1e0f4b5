use std::env;

use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: rolegate serve --config <path> | rolegate verify-audit --path <file>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rolegate=info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    match cmd.as_str() {
        "serve" => {
            let config_path = flag_value(args, "--config")
                .unwrap_or_else(|| String::from("./config/example-config.yaml"));
            let cfg = match rolegate_config::load_and_validate(&config_path) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            tracing::info!(config = %config_path, "starting rolegate");
            if let Err(e) = rolegate_server::serve(cfg).await {
                eprintln!("server exited with error: {e}");
                std::process::exit(1);
            }
        }
        "verify-audit" => {
            let Some(path) = flag_value(args, "--path") else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            match rolegate_server::verify_audit_chain(&path) {
                Ok(summary) => println!("{summary}"),
                Err(e) => {
                    eprintln!("audit verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

fn flag_value(mut args: impl Iterator<Item = String>, flag: &str) -> Option<String> {
    let mut value = None;
    while let Some(arg) = args.next() {
        if arg == flag {
            if let Some(v) = args.next() {
                value = Some(v);
            }
        }
    }
    value
}
