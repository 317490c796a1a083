//! In-process HTTP/1.1 server for tests: records requests and answers from
//! a routing closure. Handles chunked and gzip request bodies.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use flate2::read::GzDecoder;

use crate::protocol::{HEADER_LOCATION_URI_INTENT, LOCATION_URI_INTENT_VALUE};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Body after chunked and gzip decoding.
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::status(status)
            .header("Content-Type", "application/json")
            .body(body.as_bytes())
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::status(status)
            .header("Content-Type", "text/plain")
            .body(body.as_bytes())
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }
}

type Handler = dyn Fn(&Recorded, &str) -> Reply + Send + Sync;

pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    stopped: Arc<AtomicBool>,
}

impl MockServer {
    /// Start serving. The handler receives each request and the server's
    /// own base URL (`http://127.0.0.1:<port>/nifi-api`).
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded, &str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let handler: Arc<Handler> = Arc::new(handler);
        let base = format!("http://{addr}/nifi-api");

        let accept_requests = requests.clone();
        let accept_stopped = stopped.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let handler = handler.clone();
                let requests = accept_requests.clone();
                let base = base.clone();
                thread::spawn(move || serve(stream, handler, requests, &base));
            }
        });

        Self {
            addr,
            requests,
            stopped,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/nifi-api", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose method matches and whose path ends with `suffix`.
    pub fn matching(&self, method: &str, suffix: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.ends_with(suffix))
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(self.addr);
    }
}

/// A base URL nothing listens on.
pub fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/nifi-api")
}

fn serve(
    stream: TcpStream,
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Recorded>>>,
    base: &str,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let Some(request) = read_request(&mut reader) else {
        return;
    };
    requests.lock().unwrap().push(request.clone());
    let reply = handler(&request, base);
    let _ = write_reply(&stream, &reply);
    let _ = stream.shutdown(Shutdown::Both);
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Recorded> {
    let mut head = Vec::new();
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).ok()? == 0 {
            return None;
        }
        head.extend_from_slice(&line);
        if line == b"\r\n" {
            break;
        }
    }

    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_buf);
    if !req.parse(&head).ok()?.is_complete() {
        return None;
    }
    let method = req.method?.to_string();
    let target = req.path?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();
    let lookup = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let mut body = Vec::new();
    if lookup("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        read_chunked(reader, &mut body)?;
    } else if let Some(len) = lookup("content-length").and_then(|v| v.parse::<usize>().ok()) {
        body.resize(len, 0);
        reader.read_exact(&mut body).ok()?;
    }
    if lookup("content-encoding").is_some_and(|v| v.eq_ignore_ascii_case("gzip")) {
        let mut plain = Vec::new();
        GzDecoder::new(body.as_slice()).read_to_end(&mut plain).ok()?;
        body = plain;
    }

    Some(Recorded {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn read_chunked(reader: &mut BufReader<TcpStream>, body: &mut Vec<u8>) -> Option<()> {
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let size_field = line.trim().split(';').next()?;
        let size = usize::from_str_radix(size_field, 16).ok()?;
        if size == 0 {
            // Trailers, then the terminating blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).ok()? == 0 || trailer == "\r\n" {
                    return Some(());
                }
            }
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).ok()?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).ok()?;
    }
}

fn write_reply(mut stream: &TcpStream, reply: &Reply) -> std::io::Result<()> {
    let reason = match reply.status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let mut out = format!("HTTP/1.1 {} {reason}\r\n", reply.status);
    for (k, v) in &reply.headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        reply.body.len()
    ));
    stream.write_all(out.as_bytes())?;
    stream.write_all(&reply.body)?;
    stream.flush()
}

/// Parse a flow-file body back into `(attributes, payload)` records.
pub fn decode_frames(mut body: &[u8]) -> Vec<(HashMap<String, String>, Vec<u8>)> {
    fn take<'a>(buf: &mut &'a [u8], n: usize) -> &'a [u8] {
        let (head, rest) = buf.split_at(n);
        *buf = rest;
        head
    }
    fn take_u32(buf: &mut &[u8]) -> usize {
        u32::from_be_bytes(take(buf, 4).try_into().unwrap()) as usize
    }
    fn take_string(buf: &mut &[u8]) -> String {
        let len = take_u32(buf);
        String::from_utf8(take(buf, len).to_vec()).unwrap()
    }

    let mut out = Vec::new();
    while !body.is_empty() {
        let count = take_u32(&mut body);
        let mut attributes = HashMap::new();
        for _ in 0..count {
            let key = take_string(&mut body);
            let value = take_string(&mut body);
            attributes.insert(key, value);
        }
        let size = u64::from_be_bytes(take(&mut body, 8).try_into().unwrap()) as usize;
        out.push((attributes, take(&mut body, size).to_vec()));
    }
    out
}

/// Knobs for [`fake_nifi`].
#[derive(Debug, Clone)]
pub struct FakeNifi {
    /// Peer listing body; `None` answers 404.
    pub peers_json: Option<String>,
    pub ports: Vec<(String, String)>,
    pub create_status: u16,
    pub confirm_status: u16,
    /// Report a checksum one off from the real one.
    pub corrupt_checksum: bool,
}

impl Default for FakeNifi {
    fn default() -> Self {
        Self {
            peers_json: None,
            ports: vec![("port-1".into(), "From Edge".into())],
            create_status: 201,
            confirm_status: 202,
            corrupt_checksum: false,
        }
    }
}

/// Handler speaking enough of the protocol for one input port.
pub fn fake_nifi(options: FakeNifi) -> impl Fn(&Recorded, &str) -> Reply + Send + Sync {
    let counter = AtomicUsize::new(0);
    move |req, base| {
        let path = req.path.strip_prefix("/nifi-api").unwrap_or(&req.path);
        match (req.method.as_str(), path) {
            ("GET", "/site-to-site/peers") => match &options.peers_json {
                Some(json) => Reply::json(200, json),
                None => Reply::status(404),
            },
            ("GET", "/site-to-site") => {
                let ports: Vec<String> = options
                    .ports
                    .iter()
                    .map(|(id, name)| format!(r#"{{"id":"{id}","name":"{name}"}}"#))
                    .collect();
                Reply::json(
                    200,
                    &format!(r#"{{"controller":{{"inputPorts":[{}]}}}}"#, ports.join(",")),
                )
            }
            ("POST", p) if p.ends_with("/transactions") => {
                if !(200..300).contains(&options.create_status) {
                    return Reply::status(options.create_status);
                }
                let id = counter.fetch_add(1, Ordering::SeqCst);
                Reply::status(options.create_status)
                    .header("Location", &format!("{base}{p}/tx-{id}"))
                    .header(HEADER_LOCATION_URI_INTENT, LOCATION_URI_INTENT_VALUE)
            }
            ("POST", p) if p.ends_with("/flow-files") => {
                let mut crc = u64::from(crate::integrity::checksum(&req.body));
                if options.corrupt_checksum {
                    crc += 1;
                }
                Reply::text(options.confirm_status, &crc.to_string())
            }
            ("DELETE", _) => Reply::json(200, r#"{"responseCode":13,"message":"ok"}"#),
            _ => Reply::status(404),
        }
    }
}

/// Peer listing body naming the given `(base_url, flow_file_count)` pairs.
pub fn peers_json(peers: &[(&str, i64)]) -> String {
    let entries: Vec<String> = peers
        .iter()
        .map(|(url, count)| {
            let parsed = reqwest::Url::parse(url).unwrap();
            format!(
                r#"{{"hostname":"{}","port":{},"secure":false,"flowFileCount":{count}}}"#,
                parsed.host_str().unwrap(),
                parsed.port_or_known_default().unwrap()
            )
        })
        .collect();
    format!(r#"{{"peers":[{}]}}"#, entries.join(","))
}
