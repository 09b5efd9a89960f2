use bytes::{BufMut, Bytes, BytesMut};

use crate::http::output::OutputItem;
use crate::http::request::Version;
use crate::http::response::{Body, Response};

/// Value of the `Connection` header written with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAttr {
    KeepAlive,
    Close,
    Upgrade,
}

impl ConnectionAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionAttr::KeepAlive => "keep-alive",
            ConnectionAttr::Close => "close",
            ConnectionAttr::Upgrade => "Upgrade",
        }
    }
}

/// How the end of a response body is made known to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length` of the body the response carries.
    Sized,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Whatever `Content-Length` the handler set; none means close-delimited.
    UserControlled,
}

/// Status line, `Connection`, `Content-Length`, user fields, blank line.
pub fn serialize_head(resp: &Response, version: Version, attr: ConnectionAttr) -> Bytes {
    serialize_head_framed(resp, version, attr, Framing::Sized)
}

pub fn serialize_head_framed(resp: &Response, version: Version, attr: ConnectionAttr, framing: Framing) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        version,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.put_slice(status_line.as_bytes());

    buf.put_slice(b"Connection: ");
    buf.put_slice(attr.as_str().as_bytes());
    buf.put_slice(b"\r\n");

    if !resp.status.is_bodiless() {
        match framing {
            Framing::Sized => buf.put_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes()),
            Framing::Chunked => buf.put_slice(b"Transfer-Encoding: chunked\r\n"),
            Framing::UserControlled => {
                if let Some(len) = resp.header("Content-Length") {
                    buf.put_slice(format!("Content-Length: {len}\r\n").as_bytes());
                }
            }
        }
    }

    // Headers
    for (k, v) in &resp.headers {
        if k.eq_ignore_ascii_case("Connection")
            || k.eq_ignore_ascii_case("Content-Length")
            || k.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }

    // Header/body separator
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Turns a response into output fragments: the serialized head followed by
/// the body, which is omitted for HEAD requests and bodiless statuses.
pub fn response_items(resp: Response, version: Version, attr: ConnectionAttr, head_only: bool) -> Vec<OutputItem> {
    let mut items = vec![OutputItem::Buffer(serialize_head(&resp, version, attr))];
    if head_only || resp.status.is_bodiless() {
        return items;
    }

    match resp.body {
        Body::Empty => {}
        Body::Bytes(bytes) => items.push(OutputItem::Buffer(bytes)),
        Body::File(file) if file.is_empty() => {}
        Body::File(file) => items.push(OutputItem::File(file)),
    }
    items
}

/// One part of a streamed body, chunk-framed when `chunked`.
pub fn body_part_items(body: Body, chunked: bool) -> Vec<OutputItem> {
    let len = body.len();
    if len == 0 {
        return Vec::new();
    }
    let payload = match body {
        Body::Empty => return Vec::new(),
        Body::Bytes(bytes) => OutputItem::Buffer(bytes),
        Body::File(file) => OutputItem::File(file),
    };
    if !chunked {
        return vec![payload];
    }

    vec![
        OutputItem::Buffer(Bytes::from(format!("{len:x}\r\n"))),
        payload,
        OutputItem::Buffer(Bytes::from_static(b"\r\n")),
    ]
}

/// Zero-size chunk ending a chunked body, without trailers.
pub fn last_chunk() -> OutputItem {
    OutputItem::Buffer(Bytes::from_static(b"0\r\n\r\n"))
}
