//! One live duplex session: a read pump decoding frames and a write pump
//! draining a FIFO queue, both tied to a single stop signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chatblue_core::frame::checked_len;
use chatblue_core::{
    encode_header, Direction, DisconnectReason, Event, FrameDecoder, FrameKind, LinkError,
    PeerDescriptor, SessionId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::sink::EventSink;
use crate::transport::Connection;

/// Called once when the session ends on its own (EOF or read error).
pub type CloseHook = Box<dyn FnOnce(SessionId, DisconnectReason) + Send>;

struct Outbound {
    kind: FrameKind,
    payload: Vec<u8>,
}

struct SessionShared {
    id: SessionId,
    remote: PeerDescriptor,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
    events: Arc<EventSink>,
    max_frame_len: u32,
}

impl SessionShared {
    fn cancel(&self, reason: DisconnectReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.send_replace(true);
        info!(session = %self.id, remote = ?self.remote.address, %reason, "session closed");
        self.events.emit(Event::Disconnected { reason });
        true
    }
}

#[derive(Clone)]
pub struct DuplexSession {
    shared: Arc<SessionShared>,
}

impl DuplexSession {
    /// Split the stream and start both pumps on `runtime`.
    pub fn spawn(
        id: SessionId,
        conn: Connection,
        events: Arc<EventSink>,
        config: &LinkConfig,
        runtime: &Handle,
        on_closed: CloseHook,
    ) -> Self {
        let (reader, writer) = tokio::io::split(conn.stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let (stop, read_stop) = watch::channel(false);
        let write_stop = stop.subscribe();
        let shared = Arc::new(SessionShared {
            id,
            remote: conn.remote,
            outbound,
            stop,
            closed: AtomicBool::new(false),
            events,
            max_frame_len: config.max_frame_len,
        });
        runtime.spawn(read_pump(
            shared.clone(),
            reader,
            read_stop,
            config.read_buffer_size,
            on_closed,
        ));
        runtime.spawn(write_pump(
            shared.clone(),
            writer,
            queue,
            write_stop,
            config.write_chunk_size,
        ));
        debug!(session = %id, "session pumps started");
        Self { shared }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn is_active(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue one frame. Frames go out whole and in call order.
    pub fn send(&self, kind: FrameKind, payload: Vec<u8>) -> Result<(), LinkError> {
        if !self.is_active() {
            return Err(LinkError::NotConnected);
        }
        checked_len(payload.len(), self.shared.max_frame_len)?;
        self.shared
            .outbound
            .send(Outbound { kind, payload })
            .map_err(|_| LinkError::NotConnected)
    }

    /// Stop both pumps and report `reason`. Only the first call has any effect.
    /// Never calls back into the owner, so it is safe under the owner's lock.
    pub fn cancel(&self, reason: DisconnectReason) -> bool {
        self.shared.cancel(reason)
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn read_pump<R: AsyncRead + Unpin>(
    shared: Arc<SessionShared>,
    mut reader: R,
    mut stop: watch::Receiver<bool>,
    buffer_size: usize,
    on_closed: CloseHook,
) {
    let mut decoder = FrameDecoder::new(shared.max_frame_len);
    let mut buf = vec![0u8; buffer_size.max(1)];
    let reason = loop {
        let read = tokio::select! {
            biased;
            _ = stopped(&mut stop) => return,
            r = reader.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => break DisconnectReason::Eof,
            Ok(n) => n,
            Err(e) => break DisconnectReason::Io(e.to_string()),
        };
        decoder.push(&buf[..n]);
        if let Some(p) = decoder.in_flight() {
            shared
                .events
                .emit(Event::progress(Direction::In, p.current, p.total, p.kind));
        }
        while let Some(item) = decoder.next_frame() {
            match item {
                Ok(frame) => {
                    let len = frame.len() as u32;
                    let kind = frame.kind;
                    let text = frame.as_text().map(str::to_owned);
                    shared.events.emit(Event::MessageReceived {
                        kind,
                        bytes: frame.payload,
                        text,
                    });
                    shared
                        .events
                        .emit(Event::progress(Direction::In, len, len, kind));
                }
                Err(e) => {
                    warn!(session = %shared.id, "dropping frame: {e}");
                    shared.events.emit(Event::socket_error(LinkError::from(e)));
                }
            }
        }
    };
    if shared.cancel(reason.clone()) {
        on_closed(shared.id, reason);
    }
}

async fn write_pump<W: AsyncWrite + Unpin>(
    shared: Arc<SessionShared>,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    mut stop: watch::Receiver<bool>,
    chunk_size: usize,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            m = queue.recv() => m,
        };
        let Some(out) = next else { break };
        let result = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            r = write_frame(&mut writer, &out, chunk_size, &shared.events) => r,
        };
        if let Err(e) = result {
            // The read side decides whether the session is gone.
            warn!(session = %shared.id, "write failed: {e}");
            shared
                .events
                .emit(Event::socket_error(format!("write failed: {e}")));
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    out: &Outbound,
    chunk_size: usize,
    events: &EventSink,
) -> std::io::Result<()> {
    let total = out.payload.len() as u32;
    events.emit(Event::progress(Direction::Out, 0, total, out.kind));
    writer.write_all(&encode_header(out.kind, total)).await?;
    let mut written = 0u32;
    for piece in out.payload.chunks(chunk_size.max(1)) {
        writer.write_all(piece).await?;
        written += piece.len() as u32;
        events.emit(Event::progress(Direction::Out, written, total, out.kind));
    }
    writer.flush().await
}
