use detection_server::{config, start_app};
use object_detection::config::Validatable;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_configuration()?;

    // ort is chatty at debug level, keep it at warn unless RUST_LOG says otherwise.
    let default_filter = format!("{},ort=warn", config.log_level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true),
        )
        .init();

    let model_path = config.model.get_path();
    tracing::info!(
        address = %config.server.get_address(),
        model = %model_path.display(),
        frame_buffer_capacity = config.session.frame_buffer_capacity,
        "Configuration loaded"
    );

    start_app(config).await
}
