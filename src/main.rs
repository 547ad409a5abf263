use anyhow::Context;

use mail_digest::config::AppConfig;
use mail_digest::web::build_app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📧 Mail Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   IMAP: {}:{} (folder: {})", config.imap_host, config.imap_port, config.folder);
    eprintln!("   Model: {}", config.model);
    eprintln!("   UI: http://{}/", config.bind_addr);
    if config.email_address.is_none() || config.email_password.is_none() {
        tracing::warn!("EMAIL_ADDRESS / EMAIL_PASSWORD not set; both pipelines will report a configuration error");
    }
    if config.gemini_api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY not set; summarization is disabled");
    }

    let bind_addr = config.bind_addr.clone();
    let app = build_app(config).context("failed to build application")?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "Mail digest server started");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
