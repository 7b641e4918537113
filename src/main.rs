use std::panic;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc::channel;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use crate::config::{CliArgs, SandboxKind};
use crate::constants::BUILD_QUEUE_CAPACITY;
use crate::core::checkers::{
    quota::CheckerQuotas, registry::CheckerRegistry, service::CheckerService, store::ArtifactStore,
};
use crate::core::compiler::SandboxCompiler;
use crate::core::domain::LanguageCatalog;
use crate::core::limits::LimitPolicy;
use crate::core::notify::TracingNotifier;
use crate::core::pipeline::building::{BuildContext, handle_building};
use crate::core::pipeline::grading::{Grader, GraderSettings};
use crate::core::runner::ProcessRunner;
use crate::core::traits::{compiler::Compiler, notifier::Notifier, runner::Runner, sandbox::Sandbox};
use crate::docker::sandbox::DockerSandbox;
use crate::grpc::models::grading_service_server::GradingServiceServer;
use crate::grpc::services::GradingServiceImpl;
use crate::native::sandbox::NativeSandbox;

mod config;
mod constants;
mod core;
mod docker;
mod grpc;
mod native;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let args = CliArgs::parse();
    let config = args.to_config()?;

    let sandbox: Arc<dyn Sandbox> = match args.sandbox {
        SandboxKind::Native => {
            tracing::warn!("native sandbox gives no filesystem or network isolation");
            Arc::new(NativeSandbox::new())
        }
        SandboxKind::Docker => Arc::new(DockerSandbox::new(&config.sandbox)),
    };
    let policy = LimitPolicy::from(&config.container);
    let runner: Arc<dyn Runner> = Arc::new(ProcessRunner::new(sandbox));
    let compiler: Arc<dyn Compiler> = Arc::new(SandboxCompiler::new(runner.clone(), policy.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let catalog = Arc::new(LanguageCatalog::new(config.languages.iter().cloned()));
    let registry = Arc::new(CheckerRegistry::new());
    let store = ArtifactStore::new(&config.checker.base_path, &config.checker.base_log_path);

    let (events_tx, events_rx) = channel(BUILD_QUEUE_CAPACITY);
    handle_building(
        events_rx,
        BuildContext::new(registry.clone(), store.clone(), compiler.clone(), notifier.clone()),
    );

    let checkers = CheckerService::new(
        registry.clone(),
        catalog.clone(),
        store,
        CheckerQuotas::from(&config.checker),
        events_tx,
    );
    let grader = Grader::new(
        runner,
        compiler,
        registry,
        catalog.clone(),
        notifier,
        GraderSettings {
            policy,
            max_concurrent: config.queue.max_concurrent_executions,
            queue_timeout: Duration::from_secs_f64(config.queue.wait_timeout),
            work_dir: config.sandbox.work_dir.clone(),
        },
    );

    let service = GradingServiceServer::new(GradingServiceImpl::new(grader, checkers));
    let addr = args
        .bind
        .as_deref()
        .unwrap_or(&config.server.bind_address)
        .parse()?;

    tracing::info!(
        %addr,
        sandbox = ?args.sandbox,
        languages = catalog.len(),
        "gRPC server listening"
    );
    Server::builder()
        .add_service(service)
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
