use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use strand::config::Config;
use strand::http::handler::{Handling, Responder};
use strand::http::request::{Method, Request};
use strand::http::response::Response;
use strand::server::Server;
use strand::ws::frame::Opcode;
use strand::ws::{Message, WsHandle};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let static_root = cfg.server.static_root.clone().map(Arc::new);

    let server = Server::new(cfg, move |req: Request, res: Responder| route(req, res, static_root.as_deref()))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
}

fn route(req: Request, res: Responder, static_root: Option<&PathBuf>) -> Handling {
    let path = req.path();

    match (req.method, path.as_str()) {
        (Method::GET, "/") | (Method::HEAD, "/") => {
            let _ = res.respond(Response::ok("Hello from strand\n"));
            Handling::Accepted
        }
        (Method::GET, "/ws") => {
            if let Err(e) = res.upgrade(&req, echo) {
                tracing::debug!("Rejected websocket upgrade: {}", e);
            }
            Handling::Accepted
        }
        (Method::GET, p) | (Method::HEAD, p) if p.starts_with("/files/") => {
            let response = static_root
                .and_then(|root| resolve(root, &p["/files/".len()..]))
                .and_then(|file| Response::file(file).ok())
                .unwrap_or_else(Response::not_found);
            let _ = res.respond(response);
            Handling::Accepted
        }
        (Method::GET, _) | (Method::HEAD, _) => {
            let _ = res.respond(Response::not_found());
            Handling::Accepted
        }
        _ => Handling::Rejected,
    }
}

/// Maps a request path below the static root, refusing anything that
/// would leave it.
fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    let path = root.join(relative);
    path.is_file().then_some(path)
}

fn echo(handle: &WsHandle, message: Message) {
    if matches!(message.opcode, Opcode::Text | Opcode::Binary | Opcode::Continuation) {
        let _ = handle.send(message);
    }
}
