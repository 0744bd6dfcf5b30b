use chain_gateway_core::config::GatewayConfig;
use chain_gateway_core::{build_state, create_app};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chain_gateway_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gateway_config = GatewayConfig::from_env().expect("failed to load gateway configuration");

    let state = build_state(&gateway_config)
        .await
        .expect("failed to build gateway state");

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&gateway_config.bind_addr)
        .await
        .expect("failed to bind gateway listener");
    tracing::info!("gateway listening on {}", gateway_config.bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .expect("server error");
}
