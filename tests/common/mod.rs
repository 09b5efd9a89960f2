#![allow(dead_code)]

use std::sync::Arc;

use strand::config::Config;
use strand::http::connection::serve_connection;
use strand::http::handler::Handler;
use strand::settings::ConnectionSettings;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

pub struct ParsedResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Starts a connection on one end of an in-memory pipe and returns the
/// client end.
pub fn connect(
    config: &Config,
    handler: impl Handler,
) -> (BufReader<DuplexStream>, JoinHandle<anyhow::Result<()>>, Arc<ConnectionSettings>) {
    connect_with_capacity(config, handler, 64 * 1024)
}

/// Like [`connect`], with a pipe holding at most `capacity` unread bytes.
pub fn connect_with_capacity(
    config: &Config,
    handler: impl Handler,
    capacity: usize,
) -> (BufReader<DuplexStream>, JoinHandle<anyhow::Result<()>>, Arc<ConnectionSettings>) {
    let settings = Arc::new(ConnectionSettings::from_config(config, handler));
    let (client, server) = tokio::io::duplex(capacity);
    let task = tokio::spawn(serve_connection(server, Arc::clone(&settings)));
    (BufReader::new(client), task, settings)
}

/// Reads one response; the body length comes from `Content-Length`.
pub async fn read_response(client: &mut BufReader<DuplexStream>) -> ParsedResponse {
    let mut status_line = String::new();
    client.read_line(&mut status_line).await.unwrap();
    assert!(!status_line.is_empty(), "connection closed before a response");

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (k, v) = line.split_once(':').unwrap();
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    let mut response = ParsedResponse {
        status_line: status_line.trim_end().to_string(),
        headers,
        body: Vec::new(),
    };
    let len: usize = response
        .header("Content-Length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    response.body = vec![0; len];
    client.read_exact(&mut response.body).await.unwrap();
    response
}

/// Reads the status line and fields of a response.
pub async fn read_head(client: &mut BufReader<DuplexStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_string();
        if line.is_empty() {
            return lines;
        }
        lines.push(line);
    }
}

/// Reads a chunked body up to and including the last chunk.
pub async fn read_chunked_body(client: &mut BufReader<DuplexStream>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        let size = usize::from_str_radix(line.trim_end(), 16).unwrap();

        let mut chunk = vec![0; size + 2];
        client.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk[size..], b"\r\n");
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

/// Reads until the server closes its side; returns whatever arrived.
pub async fn read_to_close(client: &mut BufReader<DuplexStream>) -> Vec<u8> {
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    rest
}
