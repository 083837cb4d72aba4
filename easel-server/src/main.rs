use anyhow::{Context, Result};
use clap::Parser;
use easel_core::{load_model, DeviceMap};
use easel_server::{router, AppState};
use hf_hub::api::tokio::ApiBuilder;
use tokio::{self, net::TcpListener};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "EASEL_CPU")]
    cpu: bool,

    /// GPU ordinal to load the model on
    #[arg(long, default_value_t = 0)]
    device_ordinal: usize,

    /// Hugging Face model id of the checkpoint to serve
    #[arg(long, env = "MODEL_ID", default_value = "runwayml/stable-diffusion-v1-5")]
    model: String,

    /// Hugging Face token, for gated repositories
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,
}

impl From<&Args> for DeviceMap {
    fn from(args: &Args) -> Self {
        if args.cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(args.device_ordinal)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut api = ApiBuilder::new();
    if let Some(token) = args.hf_token.clone() {
        api = api.with_token(Some(token));
    }
    let api = api.build().context("failed to create hf hub API")?;

    // --- Load the model once, before serving anything ---
    let model = match load_model(&args.model, api, DeviceMap::from(&args)).await {
        Ok(model) => model,
        Err(e) => {
            error!("Failed to load model {}: {e:#}", args.model);
            return Err(e);
        }
    };
    info!(info = ?model.info(), "model loaded");

    let app = router(AppState::with_model(model));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
