//! One send-side transaction: stream framed packets to the peer, confirm the
//! checksum, then complete or cancel.
//!
//! `Created -> Sending -> Confirmed -> Completed | Cancelled`. A checksum
//! mismatch or a broken stream moves to `Failed`, from which only `cancel`
//! is allowed. Nothing is valid after `Completed` or `Cancelled`.

use std::fmt;
use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::blocking::{Body, Response};
use reqwest::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Method;

use crate::error::{Error, Result};
use crate::integrity::{self, ChecksumWriter};
use crate::packet::DataPacket;
use crate::protocol::{
    ResponseCode, CONTENT_TYPE_OCTET_STREAM, CONTENT_TYPE_TEXT, HEADER_USE_COMPRESSION,
};
use crate::rest;
use crate::transport::RequestManager;
use crate::wire;

const PIPE_DEPTH: usize = 16;
const BODY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Sending,
    Confirmed,
    Failed,
    Completed,
    Cancelled,
}

impl TransactionState {
    fn name(self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::Sending => "sending",
            TransactionState::Confirmed => "confirmed",
            TransactionState::Failed => "failed",
            TransactionState::Completed => "completed",
            TransactionState::Cancelled => "cancelled",
        }
    }
}

/// Metrics of a completed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionCompletion {
    pub packets_transferred: u64,
    pub bytes_transferred: u64,
    pub duration: Duration,
}

pub struct Transaction {
    transport: Arc<RequestManager>,
    url: String,
    use_compression: bool,
    server_ttl: Option<Duration>,
    state: TransactionState,
    stream: Option<FlowFileStream>,
    /// The server already ended this transaction (bad checksum reported).
    server_closed: bool,
    packets: u64,
    bytes: u64,
    started: Instant,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("packets", &self.packets)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        transport: Arc<RequestManager>,
        url: String,
        use_compression: bool,
        server_ttl: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            url,
            use_compression,
            server_ttl,
            state: TransactionState::Created,
            stream: None,
            server_closed: false,
            packets: 0,
            bytes: 0,
            started: Instant::now(),
        }
    }

    /// Transaction URL handed out by the peer.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Server-side time to live, when the peer reported one.
    pub fn server_ttl(&self) -> Option<Duration> {
        self.server_ttl
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets
    }

    /// Frame `packet` onto the open flow-file stream, opening it on first use.
    pub fn send(&mut self, packet: &dyn DataPacket) -> Result<()> {
        self.require(&[TransactionState::Created, TransactionState::Sending], "send")?;
        if self.stream.is_none() {
            let stream = self.open_stream()?;
            self.stream = Some(stream);
        }
        self.state = TransactionState::Sending;

        let written = match self.stream.as_mut() {
            Some(stream) => wire::write_packet(&mut stream.writer, packet),
            None => return Err(Error::Protocol("flow-file stream not open".into())),
        };
        match written {
            Ok(bytes) => {
                self.packets += 1;
                self.bytes += bytes;
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(self.abort_stream(e))
            }
        }
    }

    /// Close the stream and check the server's checksum against ours.
    ///
    /// On mismatch the transaction is ended with `BAD_CHECKSUM` before the
    /// integrity error is returned.
    pub fn confirm(&mut self) -> Result<()> {
        self.require(&[TransactionState::Created, TransactionState::Sending], "confirm")?;
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.open_stream()?,
        };
        let local = stream.writer.checksum();

        let server = match stream.finish().and_then(read_confirmation) {
            Ok(server) => server,
            Err(e) => {
                self.state = TransactionState::Failed;
                return Err(e);
            }
        };

        if let Err(e) = integrity::verify_checksum(local, server) {
            tracing::error!(url = %self.url, local, server, "checksum mismatch, ending transaction");
            self.state = TransactionState::Failed;
            match rest::end_transaction(&self.transport, &self.url, ResponseCode::BadChecksum) {
                Ok(_) => self.server_closed = true,
                Err(end_err) => {
                    tracing::warn!(url = %self.url, error = %end_err, "failed to report bad checksum")
                }
            }
            return Err(e);
        }

        tracing::debug!(url = %self.url, checksum = local, packets = self.packets, "transaction confirmed");
        self.state = TransactionState::Confirmed;
        Ok(())
    }

    /// Commit the confirmed transaction on the server.
    pub fn complete(&mut self) -> Result<TransactionCompletion> {
        self.require(&[TransactionState::Confirmed], "complete")?;
        match rest::end_transaction(&self.transport, &self.url, ResponseCode::ConfirmTransaction) {
            Ok(result) => {
                self.state = TransactionState::Completed;
                if let Some(sent) = result.and_then(|r| r.flow_file_sent) {
                    if sent != self.packets {
                        tracing::debug!(url = %self.url, local = self.packets, server = sent, "server counted a different number of packets");
                    }
                }
                let completion = TransactionCompletion {
                    packets_transferred: self.packets,
                    bytes_transferred: self.bytes,
                    duration: self.started.elapsed(),
                };
                tracing::info!(
                    url = %self.url,
                    packets = completion.packets_transferred,
                    bytes = completion.bytes_transferred,
                    duration_ms = completion.duration.as_millis() as u64,
                    "transaction completed"
                );
                Ok(completion)
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    /// Abort: nothing sent in this transaction is committed.
    pub fn cancel(&mut self) -> Result<()> {
        self.require(
            &[
                TransactionState::Created,
                TransactionState::Sending,
                TransactionState::Confirmed,
                TransactionState::Failed,
            ],
            "cancel",
        )?;
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
        self.state = TransactionState::Cancelled;
        if self.server_closed {
            return Ok(());
        }
        rest::end_transaction(&self.transport, &self.url, ResponseCode::CancelTransaction)?;
        tracing::info!(url = %self.url, "transaction cancelled");
        Ok(())
    }

    fn require(&self, allowed: &[TransactionState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn open_stream(&self) -> Result<FlowFileStream> {
        let url = format!("{}/flow-files", self.url);
        let mut headers = vec![
            (CONTENT_TYPE.as_str(), CONTENT_TYPE_OCTET_STREAM),
            (ACCEPT.as_str(), CONTENT_TYPE_TEXT),
        ];
        if self.use_compression {
            headers.push((CONTENT_ENCODING.as_str(), "gzip"));
            headers.push((HEADER_USE_COMPRESSION, "true"));
        }
        let (pipe_writer, pipe_reader) = pipe();
        let request = self
            .transport
            .open_streaming_connection(&url, &headers, Method::POST)?
            .body(Body::new(pipe_reader));
        let (response_tx, response) = mpsc::channel();
        thread::Builder::new()
            .name("s2s-flow-files".into())
            .spawn(move || {
                let _ = response_tx.send(request.send());
            })?;

        let buffered = BufWriter::with_capacity(BODY_BUFFER, pipe_writer);
        let encoder = if self.use_compression {
            BodyEncoder::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            BodyEncoder::Plain(buffered)
        };
        Ok(FlowFileStream {
            writer: ChecksumWriter::new(encoder),
            response,
            answer_timeout: self.transport.timeout(),
        })
    }

    /// Tear down the stream after a write failure. A broken pipe means the
    /// request itself failed; surface that error instead.
    fn abort_stream(&mut self, err: Error) -> Error {
        let Some(mut stream) = self.stream.take() else {
            return err;
        };
        let broken_pipe = matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe);
        stream.writer.get_mut().pipe_mut().abort();
        drop(stream.writer);
        match stream.response.recv() {
            Ok(Err(request_err)) if broken_pipe => Error::Connection(request_err),
            _ => err,
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

fn read_confirmation(response: Response) -> Result<u64> {
    let status = response.status().as_u16();
    if status != 200 && status != 202 {
        let body = response.text().unwrap_or_default();
        return Err(Error::Protocol(format!(
            "confirm returned {status}: {}",
            body.trim()
        )));
    }
    integrity::parse_server_checksum(&response.text()?)
}

/// Open flow-file request: the body writer plus the outcome of the thread
/// driving the request.
struct FlowFileStream {
    writer: ChecksumWriter<BodyEncoder>,
    response: Receiver<reqwest::Result<Response>>,
    answer_timeout: Duration,
}

impl FlowFileStream {
    /// End the body and wait, at most `answer_timeout`, for the peer's answer.
    fn finish(self) -> Result<Response> {
        let FlowFileStream {
            writer,
            response,
            answer_timeout,
        } = self;
        let closed = writer.into_inner().finish();
        let joined = match response.recv_timeout(answer_timeout) {
            Ok(joined) => joined,
            Err(RecvTimeoutError::Timeout) => {
                return Err(Error::Protocol(format!(
                    "no confirmation within {} ms of the end of the body",
                    answer_timeout.as_millis()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Protocol("flow-file request thread panicked".into()))
            }
        };
        match (closed, joined) {
            (_, Err(request_err)) => Err(Error::Connection(request_err)),
            (Err(io_err), Ok(_)) => Err(Error::Io(io_err)),
            (Ok(()), Ok(response)) => Ok(response),
        }
    }

    /// Make the request fail instead of sending a truncated body.
    fn abort(mut self) {
        self.writer.get_mut().pipe_mut().abort();
    }
}

enum BodyEncoder {
    Plain(BufWriter<PipeWriter>),
    Gzip(GzEncoder<BufWriter<PipeWriter>>),
}

impl BodyEncoder {
    fn pipe_mut(&mut self) -> &mut PipeWriter {
        match self {
            BodyEncoder::Plain(w) => w.get_mut(),
            BodyEncoder::Gzip(w) => w.get_mut().get_mut(),
        }
    }

    /// Flush everything and close the pipe so the body ends.
    fn finish(self) -> io::Result<()> {
        let mut buffered = match self {
            BodyEncoder::Plain(w) => w,
            BodyEncoder::Gzip(w) => w.finish()?,
        };
        buffered.flush()?;
        let pipe = buffered.into_inner().map_err(|e| e.into_error())?;
        drop(pipe);
        Ok(())
    }
}

impl Write for BodyEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BodyEncoder::Plain(w) => w.write(buf),
            BodyEncoder::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BodyEncoder::Plain(w) => w.flush(),
            BodyEncoder::Gzip(w) => w.flush(),
        }
    }
}

enum Chunk {
    Data(Vec<u8>),
    Abort,
}

/// Bounded in-memory pipe feeding the request body.
fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(PIPE_DEPTH);
    (
        PipeWriter { tx, aborted: false },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            aborted: false,
        },
    )
}

struct PipeWriter {
    tx: SyncSender<Chunk>,
    aborted: bool,
}

impl PipeWriter {
    fn abort(&mut self) {
        if !self.aborted {
            self.aborted = true;
            let _ = self.tx.send(Chunk::Abort);
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.aborted {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "request body aborted"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "request body closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    aborted: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.current.len() {
            if self.aborted {
                return Err(io::Error::new(io::ErrorKind::Other, "request body aborted"));
            }
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.current = data;
                    self.pos = 0;
                }
                Ok(Chunk::Abort) => self.aborted = true,
                // Writer dropped: end of body.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
