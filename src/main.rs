use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_bridge::config::Config;
use llm_bridge::error::BridgeError;
use llm_bridge::http;
use llm_bridge::provider;
use llm_bridge::registry::{Metadata, ToolRegistry};
use llm_bridge::service::{Service, ServiceOptions};
use llm_bridge::transport::{serve_worker_gateway, WorkerHub};

fn print_help() {
    println!(
        "\
llm-bridge v{}

Bridge between OpenAI-compatible chat clients and serverless function workers.

USAGE:
    llm-bridge [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/bridge.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                      Log level filter for tracing
                                  (e.g. debug, llm_bridge=debug,warn)
    OPENAI_API_KEY                API key for the OpenAI provider
    OPENAI_API_ENDPOINT           Override for the OpenAI base URL
    OPENAI_MODEL                  Default model for the OpenAI provider
    AZURE_OPENAI_API_KEY          API key for the Azure OpenAI provider
    AZURE_OPENAI_API_ENDPOINT     Azure OpenAI resource endpoint
    AZURE_OPENAI_DEPLOYMENT_ID    Azure OpenAI deployment name
    AZURE_OPENAI_API_VERSION      Azure OpenAI API version

EXAMPLES:
    llm-bridge                            # uses config/bridge.toml
    llm-bridge /etc/llm-bridge/bridge.toml
    RUST_LOG=debug llm-bridge             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("llm-bridge v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llm_bridge=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/bridge.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // An absent config means this host does not run the bridge;
            // exit cleanly instead of failing.
            if matches!(
                e.downcast_ref::<BridgeError>(),
                Some(BridgeError::ConfigNotFound(_))
            ) {
                info!("{e}; bridge disabled");
                return Ok(());
            }
            return Err(e);
        }
    };

    info!("Bridge: {}", config.name);
    info!("Provider: {}", config.provider.name);

    let llm = provider::from_config(&config.provider)?;
    let registry = Arc::new(ToolRegistry::new());
    let hub = WorkerHub::new(Arc::clone(&registry));

    let options = ServiceOptions {
        caller_cache_size: config.caller.cache_size,
        caller_cache_ttl: match config.caller.cache_ttl_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        },
        caller_call_timeout: std::time::Duration::from_secs(config.caller.call_timeout_secs),
        source_builder: {
            let hub = Arc::clone(&hub);
            Arc::new(move |_credential| hub.source())
        },
        reducer_builder: {
            let hub = Arc::clone(&hub);
            Arc::new(move |credential| hub.reducer(credential))
        },
        // Single-tenant default: the credential is the tenant id, so
        // workers register under the same app_id their clients present.
        metadata_exchanger: {
            let registry = Arc::clone(&registry);
            Arc::new(move |credential| Ok(Metadata::new(credential, Arc::clone(&registry))))
        },
    };
    let service = Service::new(llm, options);

    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let worker_addr = format!("{}:{}", config.worker.host, config.worker.port);

    tokio::select! {
        result = http::serve(service, &api_addr) => result,
        result = serve_worker_gateway(hub, &worker_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}
