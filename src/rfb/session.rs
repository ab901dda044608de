use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::decode::{Framebuffer, Rect, RectDecoder};
use super::errors::{ConnectionError, NegotiationError, SessionError};
use super::handshake::{negotiate, ServerInit};
use super::messages::{
    ClientMessage, Encoding, FramebufferUpdateRequest, PixelFormat, ServerMessage,
};
use crate::canvas::Canvas;

const SERVER_CHANNEL_CAPACITY: usize = 64;
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound for ServerCutText payloads.
const MAX_CUT_TEXT_LEN: u32 = 16 * 1024 * 1024;

/// Receiving ends of the session's message channels.
pub struct SessionChannels {
    /// Decoded server messages. A `FramebufferUpdate` is only sent once the
    /// canvas reflects it.
    pub server_rx: mpsc::Receiver<ServerMessage>,
    /// Echo of every client message written to the server.
    pub client_rx: mpsc::Receiver<ClientMessage>,
    /// At most one session-fatal error; the session stops after sending it.
    pub error_rx: mpsc::Receiver<SessionError>,
}

/// Anything that can forward an update request to the server.
pub trait UpdateRequestSink {
    fn request_update(&self, request: FramebufferUpdateRequest) -> Result<(), SessionError>;
}

/// Cloneable sender half of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl SessionHandle {
    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.outgoing
            .send(message)
            .map_err(|_| SessionError::WriterClosed)
    }
}

impl UpdateRequestSink for SessionHandle {
    fn request_update(&self, request: FramebufferUpdateRequest) -> Result<(), SessionError> {
        self.send(ClientMessage::FramebufferUpdateRequest(request))
    }
}

/// Opens the TCP connection, bounded by `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let address = format!("{}:{}", host, port);

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| ConnectionError::Timeout {
            address: address.clone(),
            timeout,
        })?
        .map_err(|source| ConnectionError::Dial {
            address: address.clone(),
            source,
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(target: "rfb", "[SESSION] Could not set TCP_NODELAY: {}", e);
    }

    tracing::info!(target: "rfb", "[SESSION] Connected to {}", address);
    Ok(stream)
}

/// A negotiated session with its reader and writer tasks running.
pub struct Session {
    init: ServerInit,
    canvas: Arc<Canvas>,
    handle: SessionHandle,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Session {
    /// Negotiates over `stream`, asks for the BGR0 pixel layout and the
    /// supported encodings, then starts the background tasks.
    ///
    /// No update request is sent; that is the caller's job.
    pub async fn start<S>(
        mut stream: S,
        password: &str,
    ) -> Result<(Session, SessionChannels), NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        S: Unpin,
    {
        let init = negotiate(&mut stream, password).await?;

        if init.pixel_format == PixelFormat::BGR0 {
            tracing::debug!(target: "rfb", "[SESSION] Server already sends {}", init.pixel_format);
        } else {
            tracing::info!(target: "rfb", "[SESSION] Server format is {}, requesting {}",
                init.pixel_format, PixelFormat::BGR0);
        }

        let (reader, mut writer) = tokio::io::split(stream);

        // Written before the writer task starts so they precede any request
        let setup = [
            ClientMessage::SetPixelFormat(PixelFormat::BGR0),
            ClientMessage::SetEncodings(Encoding::PREFERRED.to_vec()),
        ];
        for message in &setup {
            writer.write_all(&message.encode()).await?;
        }
        writer.flush().await?;

        let canvas = Arc::new(Canvas::new(init.width, init.height));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::channel(SERVER_CHANNEL_CAPACITY);
        let (client_tx, client_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);

        for message in setup {
            let _ = client_tx.try_send(message);
        }

        let writer_task = tokio::spawn(write_loop(writer, outgoing_rx, client_tx, error_tx.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Framebuffer::new(init.width, init.height),
            Arc::clone(&canvas),
            server_tx,
            error_tx,
        ));

        let session = Session {
            init,
            canvas,
            handle: SessionHandle {
                outgoing: outgoing_tx,
            },
            reader_task,
            writer_task,
        };

        let channels = SessionChannels {
            server_rx,
            client_rx,
            error_rx,
        };

        Ok((session, channels))
    }

    pub fn canvas(&self) -> Arc<Canvas> {
        Arc::clone(&self.canvas)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn width(&self) -> u16 {
        self.init.width
    }

    pub fn height(&self) -> u16 {
        self.init.height
    }

    pub fn desktop_name(&self) -> &str {
        &self.init.name
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    echo: mpsc::Sender<ClientMessage>,
    errors: mpsc::Sender<SessionError>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let result = async {
            writer.write_all(&message.encode()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(target: "rfb", "[SESSION] Write failed: {}", e);
            let _ = errors.try_send(SessionError::from_io(e));
            return;
        }

        if echo.try_send(message).is_err() {
            tracing::trace!(target: "rfb", "[SESSION] Client echo channel full, dropping echo");
        }
    }
    tracing::debug!(target: "rfb", "[SESSION] Writer finished");
}

async fn read_loop<R>(
    mut reader: R,
    mut framebuffer: Framebuffer,
    canvas: Arc<Canvas>,
    server_tx: mpsc::Sender<ServerMessage>,
    errors: mpsc::Sender<SessionError>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = RectDecoder::new();

    loop {
        let message = match read_server_message(&mut reader, &mut framebuffer, &mut decoder).await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(target: "rfb", "[SESSION] Read failed: {}", e);
                let _ = errors.try_send(e);
                return;
            }
        };

        if matches!(message, ServerMessage::FramebufferUpdate { .. }) {
            canvas.publish(framebuffer.pixels());
        }

        if server_tx.send(message).await.is_err() {
            tracing::debug!(target: "rfb", "[SESSION] Server channel closed, reader finished");
            return;
        }
    }
}

/// Reads one complete server message, applying framebuffer updates to
/// `framebuffer`.
pub async fn read_server_message<R>(
    reader: &mut R,
    framebuffer: &mut Framebuffer,
    decoder: &mut RectDecoder,
) -> Result<ServerMessage, SessionError>
where
    R: AsyncRead + Unpin,
{
    read_server_message_inner(reader, framebuffer, decoder)
        .await
        .map_err(|e| match e {
            SessionError::Io(io) => SessionError::from_io(io),
            other => other,
        })
}

async fn read_server_message_inner<R>(
    reader: &mut R,
    framebuffer: &mut Framebuffer,
    decoder: &mut RectDecoder,
) -> Result<ServerMessage, SessionError>
where
    R: AsyncRead + Unpin,
{
    let message_type = reader.read_u8().await?;

    match message_type {
        0 => {
            reader.read_u8().await?;
            let rectangles = reader.read_u16().await?;
            for _ in 0..rectangles {
                let rect = Rect {
                    x: reader.read_u16().await?,
                    y: reader.read_u16().await?,
                    width: reader.read_u16().await?,
                    height: reader.read_u16().await?,
                };
                let encoding = reader.read_i32().await?;
                decoder.decode(reader, framebuffer, rect, encoding).await?;
            }
            Ok(ServerMessage::FramebufferUpdate { rectangles })
        }
        1 => {
            reader.read_u8().await?;
            let first_colour = reader.read_u16().await?;
            let colours = reader.read_u16().await?;
            let mut entries = vec![0u8; colours as usize * 6];
            reader.read_exact(&mut entries).await?;
            Ok(ServerMessage::SetColourMapEntries {
                first_colour,
                colours,
            })
        }
        2 => Ok(ServerMessage::Bell),
        3 => {
            let mut padding = [0u8; 3];
            reader.read_exact(&mut padding).await?;
            let len = reader.read_u32().await?;
            if len > MAX_CUT_TEXT_LEN {
                return Err(SessionError::malformed(
                    "ServerCutText",
                    format!("{} bytes", len),
                ));
            }
            let mut text = vec![0u8; len as usize];
            reader.read_exact(&mut text).await?;
            // ISO 8859-1
            Ok(ServerMessage::ServerCutText(
                text.into_iter().map(char::from).collect(),
            ))
        }
        other => Err(SessionError::UnknownMessage(other)),
    }
}
