use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcpforge::config::GatewayRegistryFile;
use mcpforge::deploy::docker::DockerBackend;
use mcpforge::deploy::kubernetes::KubernetesBackend;
use mcpforge::deploy::manager::DeploymentManager;
use mcpforge::deploy::mock::MockBackend;
use mcpforge::deploy::BackendPort;
use mcpforge::gateway::Gateway;
use mcpforge::template_registry::TemplateRegistry;

#[derive(Parser)]
#[command(name = "mcpforge", version, about = "Deployment and routing platform for MCP servers")]
struct Cli {
    /// Minimum log level, overridden by RUST_LOG.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway: discover templates, load the registry, serve HTTP.
    Serve {
        /// Directory of template bundles (`template.json` + Dockerfile per subdirectory).
        #[arg(long, default_value = "templates")]
        templates: PathBuf,

        /// Gateway registry file (JSON or YAML).
        #[arg(long, default_value = "registry.yaml")]
        registry: PathBuf,

        /// Default backend driver for deploys with no explicit backend tag.
        #[arg(long, default_value = "mock")]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match cli.command {
        Command::Serve {
            templates,
            registry,
            backend,
        } => serve(templates, registry, backend).await,
    }
}

async fn serve(templates: PathBuf, registry_path: PathBuf, default_backend: String) -> Result<()> {
    let template_registry = TemplateRegistry::discover(&templates)
        .with_context(|| format!("failed to discover templates under {}", templates.display()))?;
    info!(templates = template_registry.all().len(), "template registry loaded");

    let mut backends: HashMap<String, Arc<dyn BackendPort>> = HashMap::new();
    backends.insert("mock".to_string(), Arc::new(MockBackend::new()));
    backends.insert("docker".to_string(), Arc::new(DockerBackend::new()));
    backends.insert(
        "kubernetes".to_string(),
        Arc::new(KubernetesBackend::new("default")),
    );

    let deployment_manager = Arc::new(DeploymentManager::new(
        Arc::clone(&template_registry),
        backends,
        default_backend,
    ));

    let registry_file = GatewayRegistryFile::load(&registry_path)
        .with_context(|| format!("failed to load registry file {}", registry_path.display()))?;
    let host = registry_file.gateway.host.clone();
    let port = registry_file.gateway.port;
    let reload_enabled = registry_file.gateway.reload_registry;
    let health_check_interval = registry_file.gateway.health_check_interval;

    let gateway = Gateway::load(
        registry_file,
        Some(Arc::clone(&template_registry)),
        Some(Arc::clone(&deployment_manager)),
    )
    .await
    .context("failed to build gateway from registry")?;

    let shutdown = Arc::new(tokio::sync::Notify::new());

    tokio::spawn(mcpforge::gateway::health::run_gateway_health_checker(
        gateway.pools_for_health_checker(),
        health_check_interval,
        Arc::clone(&shutdown),
    ));

    if let Some(tool_source) = gateway.tool_source_for_refresh() {
        let refresh_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                tool_source.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(health_check_interval) => {}
                    _ = refresh_shutdown.notified() => break,
                }
            }
        });
    }

    if reload_enabled {
        let watch_gateway = Arc::clone(&gateway);
        let watch_shutdown = Arc::clone(&shutdown);
        tokio::spawn(mcpforge::config::watch_registry(
            registry_path.clone(),
            watch_gateway,
            watch_shutdown,
        ));
    }

    let router = Arc::clone(&gateway).into_router();
    let listen = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = %listen, "gateway listening");

    let shutdown_signal = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.notify_waiters();
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("gateway server error")?;

    info!("gateway stopped");
    Ok(())
}
