mod config;
mod frame;
mod routes;
mod services;
mod state;
mod validate;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();
    let state = state::AppState::new(config);

    // Spawn the background expiry sweeper.
    let _sweeper = services::sweeper::spawn_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "playgrid listening");
    axum::serve(listener, app).await.expect("server failed");
}
