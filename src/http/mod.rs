//! HTTP/1.x protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: the per-connection state machine
//! - **`parser`**: incremental request parser (Content-Length and chunked bodies)
//! - **`request`**: request representation
//! - **`response`**: response representation with builder pattern
//! - **`writer`**: serializes response heads and splits responses into output fragments
//! - **`pipeline`**: in-flight requests, answered strictly in arrival order
//! - **`output`**: vectored writes and file transmission of queued fragments
//! - **`sendfile`**: resumable, chunked file transfer
//! - **`handler`**: the application boundary
//!
//! # Request lifecycle
//!
//! A parsed request gets a slot in the connection's [`pipeline::PipelineQueue`]
//! and is handed to the [`handler::Handler`] together with a
//! [`handler::Responder`]. Reading continues while the pipeline has room.
//! Responses may arrive in any order; they are serialized by `writer` and
//! queued on the [`output::OutputCoordinator`] strictly in request order.
//! A response streamed through [`handler::ResponseStream`] holds its place
//! until its last part; its earlier parts go out as they arrive.
//! After the last byte of a response leaves, the connection keeps reading,
//! closes, or hands the transport to the WebSocket layer.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strand::http::connection::serve_connection;
//! use strand::http::handler::{Handling, Responder};
//! use strand::http::request::Request;
//! use strand::http::response::Response;
//! use strand::settings::ConnectionSettings;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Arc::new(ConnectionSettings::new(|_req: Request, res: Responder| {
//!         let _ = res.respond(Response::ok("hello\n"));
//!         Handling::Accepted
//!     }));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!
//!     loop {
//!         let (socket, _addr) = listener.accept().await?;
//!         let settings = Arc::clone(&settings);
//!         tokio::spawn(async move {
//!             if let Err(e) = serve_connection(socket, settings).await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```

pub mod connection;
pub mod handler;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod sendfile;
pub mod writer;
