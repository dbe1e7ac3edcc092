//! LUMEN chat server

use lumen_chat::api;
use lumen_chat::config::AppConfig;
use lumen_chat::core::assistant::GeminiAssistant;
use lumen_chat::core::chat::ChatOrchestrator;
use lumen_chat::core::services::{ConversationStore, MessageStore};
use lumen_chat::infrastructure::database::DatabaseConnection;
use lumen_chat::infrastructure::repositories::DbConversationRepository;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::response::Html;
use axum::{Router, routing::get};
use di::{Injectable, Ref, ServiceCollection, ServiceProvider, singleton_factory};
use di_axum::RouterServiceProviderExtensions;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    // no point in starting anything without a usable configuration
    let config = AppConfig::from_env()?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    let web_task_handle = runtime.spawn(web_server_task(config));

    runtime.block_on(async { web_task_handle.await.context("web server task panicked")? })
}

fn build_provider(config: AppConfig) -> anyhow::Result<ServiceProvider> {
    let config = Ref::new(config);

    let provider = ServiceCollection::new()
        .add(singleton_factory(move |_| config.clone()))
        .add(DatabaseConnection::singleton())
        .add(DbConversationRepository::singleton())
        .add(GeminiAssistant::singleton())
        .add(ConversationStore::singleton())
        .add(MessageStore::singleton())
        .add(ChatOrchestrator::singleton())
        .build_provider()?;

    Ok(provider)
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_headers(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_origin(origins))
}

async fn web_server_task(config: AppConfig) -> anyhow::Result<()> {
    let listen_addr = config.listen_addr.clone();
    let cors = cors_layer(&config.allowed_origins)?;

    let provider = build_provider(config)?;
    provider
        .get_required::<DatabaseConnection>()
        .migrate()
        .await?;

    // build our application with a route
    let app = Router::new()
        .route("/", get(index))
        .nest_service(
            "/static",
            ServiceBuilder::new().service(ServeDir::new("static")),
        )
        .merge(api::router())
        .layer(cors)
        .with_provider(provider);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    info!("Shutting down...");

    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}
