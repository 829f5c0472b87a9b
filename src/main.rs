use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wood_anomaly_api::{
    router, AppState, Args, ModelRegistry, PreprocessConfig, Processor, ServiceSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let registry = ModelRegistry::with_default_models(Path::new(&args.model_dir), args.cuda);
    info!(models = ?registry.model_names(), "registered models");
    let processor = Processor::new(PreprocessConfig {
        enhance_contrast: args.enhance_contrast,
        ..PreprocessConfig::default()
    });

    let state = AppState {
        registry: Arc::new(registry),
        processor: Arc::new(processor),
        settings: ServiceSettings {
            threshold: args.threshold,
            include_processed: args.include_processed,
        },
    };

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, model_dir = %args.model_dir, threshold = args.threshold, "serving");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
