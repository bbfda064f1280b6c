use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    Router, middleware,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use clique_api::identity::require_auth;
use clique_api::{AppStateInner, friends, messages, rooms, sockets};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clique=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CLIQUE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("CLIQUE_DB_PATH").unwrap_or_else(|_| "clique.db".into());
    let host = std::env::var("CLIQUE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CLIQUE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database and shared state
    let db = clique_db::Database::open(&PathBuf::from(&db_path))?;
    let state = AppStateInner::new(db, jwt_secret);

    // Nobody is connected yet; clear stale presence flags and rebuild the
    // co-membership index from the store.
    state.db.reset_presence()?;
    let pairs = state.db.comember_pairs()?;
    state.roster.rebuild(&pairs).await;
    info!("presence roster rebuilt from {} co-membership rows", pairs.len());

    // Routes
    let rest_routes = Router::new()
        .route("/rooms", get(rooms::list_rooms_handler))
        .route("/rooms/{room_id}/messages", get(messages::get_history))
        .route(
            "/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/groups", post(rooms::create_group_handler))
        .route(
            "/groups/{room_id}/members/{user_id}",
            post(rooms::add_member_handler).delete(rooms::kick_member_handler),
        )
        .route("/groups/{room_id}/leave", post(rooms::leave_group_handler))
        .route(
            "/groups/{room_id}/admin/{user_id}",
            post(rooms::transfer_admin_handler),
        )
        .route("/groups/{room_id}", delete(rooms::delete_group_handler))
        .route("/friends", get(friends::list_handler))
        .route("/friends/requests", get(friends::pending_handler))
        .route("/friends/{friend_id}/chat", post(rooms::start_private_chat))
        .route("/friends/requests/{user_id}", post(friends::send_request_handler))
        .route(
            "/friends/requests/{request_id}/accept",
            post(friends::accept_handler),
        )
        .route(
            "/friends/requests/{request_id}/reject",
            post(friends::reject_handler),
        )
        .route("/friends/requests/{request_id}", delete(friends::cancel_handler))
        .layer(middleware::from_fn(require_auth))
        .with_state(state.clone());

    // Socket auth happens inside the upgrade handlers, before accept.
    let ws_routes = Router::new()
        .route("/ws/rooms/{room_id}", get(sockets::room_socket))
        .route("/ws/notifications", get(sockets::notify_socket))
        .with_state(state.clone());

    let app = Router::new()
        .merge(rest_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Clique server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
