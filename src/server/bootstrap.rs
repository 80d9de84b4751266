use crate::config::LimiterSettings;
use crate::server::{self, AppState};
use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub admin_listen: Option<String>,
}

/// Limiter lifecycle: init → connect store → configure resources → serve.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut settings = LimiterSettings::load(&args.config_path)?;
    if let Some(listen) = args.admin_listen {
        settings.admin.listen = listen;
    }

    let listen = settings.admin.listen.clone();
    let state = AppState::new(settings).await?;

    let admin_handle = tokio::spawn({
        let state = state.clone();
        async move { server::run_admin_server(&listen, state).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("server: shutdown signal received");
        }
        result = admin_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("server: admin server failed, error={}", e),
                Err(e) => tracing::error!("server: admin task panicked, error={}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}
