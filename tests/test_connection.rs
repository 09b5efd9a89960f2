mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{connect, connect_with_capacity, read_chunked_body, read_head, read_response, read_to_close};
use strand::config::Config;
use strand::http::handler::{Handling, Responder};
use strand::http::request::{Method, Request};
use strand::http::response::{Response, ResponseBuilder, StatusCode};
use strand::http::sendfile::FileBody;
use tokio::io::AsyncWriteExt;

fn pipelined_config(depth: usize) -> Config {
    let mut cfg = Config::default();
    cfg.connection.max_pipelined_requests = depth;
    cfg
}

#[tokio::test]
async fn test_single_request_keep_alive() {
    let (mut client, task, _) = connect(&Config::default(), |req: Request, res: Responder| {
        let _ = res.respond(Response::ok(format!("you asked for {}", req.path())));
        Handling::Accepted
    });

    client.write_all(b"GET /hello HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.status_line, "HTTP/1.1 200 OK");
    assert_eq!(resp.header("Connection"), Some("keep-alive"));
    assert_eq!(resp.body, b"you asked for /hello");

    // the same connection serves a second request
    client.write_all(b"GET /again HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.body, b"you asked for /again");

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_out_of_order_completion_is_written_in_order() {
    let (mut client, task, _) = connect(&pipelined_config(4), |req: Request, res: Responder| {
        let n: u64 = req.path()[1..].parse().unwrap();
        tokio::spawn(async move {
            // later requests finish first
            tokio::time::sleep(Duration::from_millis((5 - n) * 20)).await;
            let _ = res.respond(Response::ok(format!("response {n}")));
        });
        Handling::Accepted
    });

    client
        .write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\nGET /4 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    for n in 1..=4 {
        let resp = read_response(&mut client).await;
        assert_eq!(resp.body, format!("response {n}").into_bytes());
    }

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_depth_one_serialises_pipelined_requests() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let (mut client, task, _) = connect(&Config::default(), move |req: Request, res: Responder| {
        record.lock().unwrap().push(req.target.clone());
        let _ = res.respond(Response::ok(req.target));
        Handling::Accepted
    });

    client
        .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_response(&mut client).await.body, b"/a");
    assert_eq!(read_response(&mut client).await.body, b"/b");
    assert_eq!(*seen.lock().unwrap(), vec!["/a".to_string(), "/b".to_string()]);

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_gets_gateway_timeout() {
    let mut cfg = Config::default();
    cfg.connection.handle_request_timeout = Duration::from_millis(100);

    let parked = Arc::new(Mutex::new(Vec::new()));
    let keep = Arc::clone(&parked);
    let (mut client, task, _) = connect(&cfg, move |_req: Request, res: Responder| {
        keep.lock().unwrap().push(res);
        Handling::Accepted
    });

    client.write_all(b"GET /slow HTTP/1.1\r\n\r\n").await.unwrap();
    let start = tokio::time::Instant::now();
    let resp = read_response(&mut client).await;

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(resp.status_line, "HTTP/1.1 504 Gateway Time-out");
    assert_eq!(resp.header("Connection"), Some("close"));
    assert_eq!(resp.body, b"504 Gateway Time-out");
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();

    // answering after the timeout reaches nobody
    let late = parked.lock().unwrap().pop().unwrap();
    assert!(late.respond(Response::ok("too late")).is_err());
}

#[tokio::test]
async fn test_malformed_request_gets_400_and_close() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, _res: Responder| -> Handling {
        unreachable!("handler must not run for a malformed request")
    });

    client
        .write_all(b"GET / HTTP/1.1\r\nNo colon here\r\n\r\n")
        .await
        .unwrap();
    let resp = read_response(&mut client).await;

    assert_eq!(resp.status_line, "HTTP/1.1 400 Bad Request");
    assert_eq!(resp.header("Connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_method_gets_501() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, _res: Responder| -> Handling {
        unreachable!("handler must not run for an unknown method")
    });

    client.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;

    assert_eq!(resp.status_line, "HTTP/1.1 501 Not Implemented");
    assert_eq!(resp.header("Connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_earlier_responses_survive_a_parse_error() {
    let (mut client, task, _) = connect(&pipelined_config(4), |_req: Request, res: Responder| {
        let _ = res.respond(Response::ok("fine"));
        Handling::Accepted
    });

    client
        .write_all(b"GET /ok HTTP/1.1\r\n\r\nGET / HTTP/9.9\r\n\r\n")
        .await
        .unwrap();

    let first = read_response(&mut client).await;
    assert_eq!(first.status_line, "HTTP/1.1 200 OK");
    let second = read_response(&mut client).await;
    assert_eq!(second.status_line, "HTTP/1.1 400 Bad Request");
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_request_gets_501() {
    let (mut client, task, _) = connect(&Config::default(), |req: Request, res: Responder| {
        if req.method == Method::GET {
            let _ = res.respond(Response::ok("got it"));
            Handling::Accepted
        } else {
            Handling::Rejected
        }
    });

    client.write_all(b"DELETE /thing HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.status_line, "HTTP/1.1 501 Not Implemented");
    assert_eq!(resp.header("Connection"), Some("close"));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_responder_gets_500() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        drop(res);
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.status_line, "HTTP/1.1 500 Internal Server Error");
    assert_eq!(resp.header("Connection"), Some("close"));
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let _ = res.respond(Response::ok("old school"));
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;

    assert_eq!(resp.status_line, "HTTP/1.0 200 OK");
    assert_eq!(resp.header("Connection"), Some("close"));
    assert_eq!(resp.body, b"old school");
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_requested_close() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let _ = res.respond(ResponseBuilder::new(StatusCode::Ok).body("bye").close().build());
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.header("Connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_head_response_has_length_but_no_body() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let _ = res.respond(Response::ok("twelve bytes"));
        Handling::Accepted
    });

    client.write_all(b"HEAD / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut client_head = read_head(&mut client).await;
    assert_eq!(client_head.remove(0), "HTTP/1.1 200 OK");
    assert!(client_head.contains(&"Content-Length: 12".to_string()));

    // nothing of the body was sent: the next response starts right away
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.status_line, "HTTP/1.1 200 OK");
    assert_eq!(resp.body, b"twelve bytes");

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_chunked_request_body_reaches_handler() {
    let (mut client, task, _) = connect(&Config::default(), |req: Request, res: Responder| {
        let _ = res.respond(Response::ok(req.body));
        Handling::Accepted
    });

    client
        .write_all(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
        .await
        .unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.body, b"hello world");

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_file_body_is_streamed() {
    let contents: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, &contents).unwrap();

    let served = path.clone();
    let (mut client, task, _) = connect(&Config::default(), move |_req: Request, res: Responder| {
        let body = FileBody::open(&served).unwrap().chunk_size(4096);
        let response = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "application/octet-stream")
            .file(body)
            .build();
        let _ = res.respond(response);
        Handling::Accepted
    });

    client.write_all(b"GET /file HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.header("Content-Length"), Some("50000"));
    assert_eq!(resp.header("Content-Type"), Some("application/octet-stream"));
    assert_eq!(resp.body, contents);

    // the connection stays usable after a file body
    client.write_all(b"GET /file HTTP/1.1\r\n\r\n").await.unwrap();
    assert_eq!(read_response(&mut client).await.body.len(), 50_000);

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_closed() {
    let mut cfg = Config::default();
    cfg.connection.read_next_http_message_timelimit = Duration::from_millis(500);
    let (mut client, task, settings) = connect(&cfg, |_req: Request, _res: Responder| Handling::Rejected);

    let start = tokio::time::Instant::now();
    assert!(read_to_close(&mut client).await.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(500));

    task.await.unwrap().unwrap();
    assert_eq!(settings.registry.live(), 0);
}

#[tokio::test]
async fn test_peer_half_close_finishes_connection() {
    let (client, task, settings) = connect(&Config::default(), |_req: Request, res: Responder| {
        let _ = res.respond(Response::ok("last"));
        Handling::Accepted
    });
    let mut client = client.into_inner();

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut client = tokio::io::BufReader::new(client);
    let resp = read_response(&mut client).await;
    assert_eq!(resp.body, b"last");
    assert!(read_to_close(&mut client).await.is_empty());
    task.await.unwrap().unwrap();
    assert_eq!(settings.registry.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_is_aborted() {
    let mut cfg = Config::default();
    cfg.connection.write_http_response_timelimit = Duration::from_millis(200);
    let (mut client, task, settings) = connect_with_capacity(
        &cfg,
        |_req: Request, res: Responder| {
            let _ = res.respond(Response::ok(vec![b'x'; 1024 * 1024]));
            Handling::Accepted
        },
        1024,
    );

    client.write_all(b"GET /big HTTP/1.1\r\n\r\n").await.unwrap();
    let start = tokio::time::Instant::now();

    // the client never reads, so the response cannot leave
    task.await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(settings.registry.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_file_transfer_is_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![7u8; 1024 * 1024]).unwrap();

    let mut cfg = Config::default();
    cfg.sendfile.timelimit = Duration::from_millis(200);
    let served = path.clone();
    let (mut client, task, settings) = connect_with_capacity(
        &cfg,
        move |_req: Request, res: Responder| {
            let _ = res.respond(Response::file(&served).unwrap());
            Handling::Accepted
        },
        1024,
    );

    client.write_all(b"GET /big HTTP/1.1\r\n\r\n").await.unwrap();
    let start = tokio::time::Instant::now();

    task.await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));
    // well before the five second write limit
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(settings.registry.live(), 0);

    // the head went out before the body stalled
    let head = read_head(&mut client).await;
    assert_eq!(head[0], "HTTP/1.1 200 OK");
}

#[tokio::test]
async fn test_chunked_stream_holds_later_responses_back() {
    let (mut client, task, _) = connect(&pipelined_config(2), |req: Request, res: Responder| {
        if req.path() == "/stream" {
            let head = ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body("first ")
                .build();
            let mut stream = res.chunked(head).unwrap();
            tokio::spawn(async move {
                for part in ["second ", "third"] {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    stream.send_part(part).unwrap();
                }
                stream.finish().unwrap();
            });
        } else {
            let _ = res.respond(Response::ok("after"));
        }
        Handling::Accepted
    });

    client
        .write_all(b"GET /stream HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert_eq!(head[0], "HTTP/1.1 200 OK");
    assert!(head.contains(&"Connection: keep-alive".to_string()));
    assert!(head.contains(&"Transfer-Encoding: chunked".to_string()));
    assert!(head.contains(&"Content-Type: text/plain".to_string()));
    assert!(!head.iter().any(|line| line.starts_with("Content-Length")));
    assert_eq!(read_chunked_body(&mut client).await, b"first second third");

    // the second response was ready long before, but follows the stream
    let next = read_response(&mut client).await;
    assert_eq!(next.body, b"after");

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_user_controlled_stream_with_length_keeps_connection() {
    let (mut client, task, _) = connect(&Config::default(), |req: Request, res: Responder| {
        if req.path() == "/parts" {
            let head = ResponseBuilder::new(StatusCode::Ok).header("Content-Length", "11").build();
            let mut stream = res.user_controlled(head).unwrap();
            stream.send_part("hello ").unwrap();
            stream.send_part("world").unwrap();
            stream.finish().unwrap();
        } else {
            let _ = res.respond(Response::ok("again"));
        }
        Handling::Accepted
    });

    client.write_all(b"GET /parts HTTP/1.1\r\n\r\n").await.unwrap();
    let resp = read_response(&mut client).await;
    assert_eq!(resp.header("Connection"), Some("keep-alive"));
    assert_eq!(resp.header("Content-Length"), Some("11"));
    assert_eq!(resp.body, b"hello world");

    client.write_all(b"GET /other HTTP/1.1\r\n\r\n").await.unwrap();
    assert_eq!(read_response(&mut client).await.body, b"again");

    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_user_controlled_stream_without_length_closes() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let mut stream = res.user_controlled(Response::builder(StatusCode::Ok).build()).unwrap();
        stream.send_part("abc").unwrap();
        stream.finish().unwrap();
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.contains(&"Connection: close".to_string()));
    assert!(!head.iter().any(|line| line.starts_with("Content-Length")));
    assert_eq!(read_to_close(&mut client).await, b"abc");
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_chunked_stream_to_http10_peer_is_close_delimited() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let mut stream = res.chunked(Response::builder(StatusCode::Ok).build()).unwrap();
        stream.send_part("a").unwrap();
        stream.send_part("b").unwrap();
        stream.finish().unwrap();
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let head = read_head(&mut client).await;
    assert_eq!(head[0], "HTTP/1.0 200 OK");
    assert!(head.contains(&"Connection: close".to_string()));
    assert!(!head.iter().any(|line| line.starts_with("Transfer-Encoding")));
    assert_eq!(read_to_close(&mut client).await, b"ab");
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_stream_cuts_the_body_and_closes() {
    let (mut client, task, _) = connect(&Config::default(), |_req: Request, res: Responder| {
        let mut stream = res.chunked(Response::builder(StatusCode::Ok).build()).unwrap();
        stream.send_part("partial").unwrap();
        drop(stream);
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.contains(&"Transfer-Encoding: chunked".to_string()));
    // no last chunk: the peer can tell the body is incomplete
    assert_eq!(read_to_close(&mut client).await, b"7\r\npartial\r\n");
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stream_is_cut_after_handle_timeout() {
    let mut cfg = Config::default();
    cfg.connection.handle_request_timeout = Duration::from_millis(100);

    let parked = Arc::new(Mutex::new(Vec::new()));
    let keep = Arc::clone(&parked);
    let (mut client, task, _) = connect(&cfg, move |_req: Request, res: Responder| {
        let stream = res.chunked(Response::builder(StatusCode::Ok).build()).unwrap();
        keep.lock().unwrap().push(stream);
        Handling::Accepted
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let start = tokio::time::Instant::now();
    let head = read_head(&mut client).await;
    assert_eq!(head[0], "HTTP/1.1 200 OK");

    assert!(read_to_close(&mut client).await.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(100));
    task.await.unwrap().unwrap();

    let mut late = parked.lock().unwrap().pop().unwrap();
    assert!(late.send_part("too late").is_err());
}
