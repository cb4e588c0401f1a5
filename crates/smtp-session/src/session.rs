//! The per-connection session engine: serializes submissions onto one
//! SMTP connection and hands back completions for their responses.
use crate::codec::{ResponseReader, END_OF_CONTENT};
use crate::command::Command;
use crate::config::SmtpSessionConfig;
use crate::error::SessionError;
use crate::extension::{Extension, ExtensionSet};
use crate::handler::{ResponseFuture, ResponseHandler};
use crate::pipelining::validate_pipelined_commands;
use crate::response::Response;
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

/// Wire units handed to the writer task, in submission order.
#[derive(Debug)]
enum Frame {
    Command(Command),
    Content(Vec<u8>),
    EndOfContent,
    Flush,
    Close,
}

/// State shared between the session handle and its I/O tasks.
struct ChannelState {
    connection_id: String,
    handler: Arc<ResponseHandler>,
    terminal_error: Mutex<Option<SessionError>>,
    closed_tx: watch::Sender<Option<Result<(), SessionError>>>,
    close_requested: Notify,
    closing: AtomicBool,
}

impl ChannelState {
    /// Record a transport failure: remember the first cause for the
    /// close completion, fail the outstanding expectation, and start
    /// tearing the connection down.
    fn record_failure(&self, error: SessionError) {
        {
            let mut terminal = self.terminal_error.lock();
            if terminal.is_none() {
                *terminal = Some(error.clone());
            }
        }
        self.closing.store(true, Ordering::SeqCst);
        self.handler.on_exception(error);
        self.close_requested.notify_one();
    }

    /// The connection is down: fail anything still outstanding and
    /// resolve the close completion exactly once.
    fn mark_closed(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.handler.on_channel_inactive();

        let result = match self.terminal_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        self.closed_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }
}

struct SessionInner {
    state: Arc<ChannelState>,
    frames: mpsc::UnboundedSender<Frame>,
    extensions: Mutex<ExtensionSet>,
    closed_rx: watch::Receiver<Option<Result<(), SessionError>>>,
}

impl SessionInner {
    fn request_close(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        let _ = self.frames.send(Frame::Close);
        self.state.close_requested.notify_one();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.request_close();
    }
}

/// Handle to one live SMTP session. Cheap to clone; the session owns
/// its connection exclusively and tears it down when the last handle
/// is dropped or `close` is called.
#[derive(Clone)]
pub struct SmtpSession {
    inner: Arc<SessionInner>,
}

impl SmtpSession {
    /// Establish a TCP connection per the config and run a session
    /// over it. Returns the session together with the future for the
    /// server's `220` greeting, which the server sends unprompted.
    pub async fn connect(
        config: SmtpSessionConfig,
    ) -> Result<
        (
            Self,
            impl Future<Output = Result<ClientResponse, SessionError>> + Send + 'static,
        ),
        SessionError,
    > {
        config.check()?;
        let stream = connect_stream(&config).await?;
        Self::with_stream(stream, config)
    }

    /// Run a session over an already-established stream: a TCP
    /// connection, a TLS stream (implicit TLS), or an in-memory
    /// duplex in tests. Must be called from within a tokio runtime.
    ///
    /// The greeting expectation is reserved before the reader starts,
    /// so the server's banner can never arrive uncorrelated.
    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        config: SmtpSessionConfig,
    ) -> Result<
        (
            Self,
            impl Future<Output = Result<ClientResponse, SessionError>> + Send + 'static,
        ),
        SessionError,
    > {
        config.check()?;

        let handler = Arc::new(ResponseHandler::new(
            config.connection_id.clone(),
            config.read_timeout,
        ));
        let greeting = handler.create_response_future(1, "initial response")?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let state = Arc::new(ChannelState {
            connection_id: config.connection_id.clone(),
            handler,
            terminal_error: Mutex::new(None),
            closed_tx,
            close_requested: Notify::new(),
            closing: AtomicBool::new(false),
        });

        let (read_half, write_half) = tokio::io::split(Box::new(stream) as BoxedAsyncReadAndWrite);
        tokio::spawn(write_loop(Arc::clone(&state), write_half, frames_rx));
        tokio::spawn(read_loop(Arc::clone(&state), read_half));

        let session = Self {
            inner: Arc::new(SessionInner {
                state,
                frames: frames_tx,
                extensions: Mutex::new(ExtensionSet::empty()),
                closed_rx,
            }),
        };
        let greeting = session.wrap_single(Ok(greeting));
        Ok((session, greeting))
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.state.connection_id
    }

    /// Send a single command and await its one response.
    pub fn send(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<ClientResponse, SessionError>> + Send + 'static {
        let reserved = self.submit(
            1,
            command.verb().to_string(),
            vec![Frame::Command(command), Frame::Flush],
        );
        self.wrap_single(reserved)
    }

    /// Send a pre-encoded message payload (CRLF normalized and
    /// dot-stuffed by the caller, ending with CRLF). The payload is
    /// terminated with the `.` line and draws a single response.
    pub fn send_content(
        &self,
        content: Vec<u8>,
    ) -> impl Future<Output = Result<ClientResponse, SessionError>> + Send + 'static {
        let reserved = self.submit(
            1,
            "message content".to_string(),
            vec![Frame::Content(content), Frame::EndOfContent, Frame::Flush],
        );
        self.wrap_single(reserved)
    }

    /// Send several commands in one batch per RFC 2920, optionally
    /// led by the content payload that concludes the previous
    /// transaction. One response is expected per wire unit; the
    /// responses come back in submission order.
    pub fn send_pipelined(
        &self,
        content: Option<Vec<u8>>,
        commands: Vec<Command>,
    ) -> impl Future<Output = Result<Vec<ClientResponse>, SessionError>> + Send + 'static {
        let session = Arc::downgrade(&self.inner);
        let connection_id = self.connection_id().to_string();

        let reserved = match validate_pipelined_commands(&commands) {
            Err(err) => Err(err),
            Ok(()) => {
                let expected = commands.len() + usize::from(content.is_some());
                let debug = describe_pipeline(content.is_some(), &commands);

                let mut frames = Vec::with_capacity(expected + 2);
                if let Some(content) = content {
                    frames.push(Frame::Content(content));
                    frames.push(Frame::EndOfContent);
                }
                frames.extend(commands.into_iter().map(Frame::Command));
                frames.push(Frame::Flush);

                self.submit(expected, debug, frames)
            }
        };

        async move {
            let responses = await_responses(reserved, &connection_id).await?;
            Ok(responses
                .into_iter()
                .map(|response| ClientResponse {
                    session: session.clone(),
                    response,
                })
                .collect())
        }
    }

    /// Replace the set of extensions the server advertised, typically
    /// after parsing an EHLO response.
    pub fn set_supported_extensions(&self, extensions: ExtensionSet) {
        *self.inner.extensions.lock() = extensions;
    }

    pub fn is_supported(&self, extension: Extension) -> bool {
        self.inner.extensions.lock().contains(extension)
    }

    pub fn supported_extensions(&self) -> ExtensionSet {
        *self.inner.extensions.lock()
    }

    /// Start closing the connection. Any outstanding expectation
    /// fails with `ChannelClosed`. Resolves once the connection is
    /// down.
    pub fn close(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        self.inner.request_close();
        self.closed()
    }

    /// The session's close completion: resolves `Ok` when the
    /// connection closes cleanly, or with the recorded transport
    /// error when one caused the closure. Any number of observers may
    /// await it.
    pub fn closed(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let mut closed_rx = self.inner.closed_rx.clone();
        async move {
            loop {
                if let Some(result) = closed_rx.borrow_and_update().clone() {
                    return result;
                }
                if closed_rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    /// Reserve the expectation slot, then hand the wire frames to the
    /// writer. On reservation failure nothing is written; if the
    /// session is already going away the fresh expectation is failed
    /// instead of left dangling.
    fn submit(
        &self,
        expected: usize,
        debug: String,
        frames: Vec<Frame>,
    ) -> Result<ResponseFuture, SessionError> {
        let state = &self.inner.state;
        let rx = state.handler.create_response_future(expected, debug)?;

        let mut enqueue_failed = false;
        for frame in frames {
            if self.inner.frames.send(frame).is_err() {
                enqueue_failed = true;
                break;
            }
        }

        if enqueue_failed || state.closing.load(Ordering::SeqCst) {
            state.handler.on_exception(SessionError::ChannelClosed(format!(
                "[{}] The connection is closed",
                state.connection_id
            )));
        }

        Ok(rx)
    }

    fn wrap_single(
        &self,
        reserved: Result<ResponseFuture, SessionError>,
    ) -> impl Future<Output = Result<ClientResponse, SessionError>> + Send + 'static {
        let session = Arc::downgrade(&self.inner);
        let connection_id = self.connection_id().to_string();
        async move {
            let responses = await_responses(reserved, &connection_id).await?;
            let response = responses.into_iter().next().ok_or_else(|| {
                SessionError::ChannelClosed(format!(
                    "[{connection_id}] The session closed before a response arrived"
                ))
            })?;
            Ok(ClientResponse { session, response })
        }
    }
}

impl fmt::Debug for SmtpSession {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("SmtpSession")
            .field("connection_id", &self.connection_id())
            .finish_non_exhaustive()
    }
}

/// A server response annotated with the session that produced it. The
/// back-reference is non-owning: it does not keep the session alive.
#[derive(Clone)]
pub struct ClientResponse {
    session: Weak<SessionInner>,
    response: Response,
}

impl ClientResponse {
    /// The session this response arrived on, if it is still alive.
    pub fn session(&self) -> Option<SmtpSession> {
        self.session.upgrade().map(|inner| SmtpSession { inner })
    }

    pub fn code(&self) -> u16 {
        self.response.code
    }

    pub fn content(&self) -> &str {
        &self.response.content
    }

    pub fn enhanced_code(&self) -> Option<crate::response::EnhancedStatusCode> {
        self.response.enhanced_code
    }

    pub fn is_transient(&self) -> bool {
        self.response.is_transient()
    }

    pub fn is_permanent(&self) -> bool {
        self.response.is_permanent()
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ClientResponse")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

async fn await_responses(
    reserved: Result<ResponseFuture, SessionError>,
    connection_id: &str,
) -> Result<Vec<Response>, SessionError> {
    match reserved {
        Err(err) => Err(err),
        Ok(rx) => match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ChannelClosed(format!(
                "[{connection_id}] The session terminated before a response arrived"
            ))),
        },
    }
}

fn describe_pipeline(has_content: bool, commands: &[Command]) -> String {
    let mut parts = Vec::with_capacity(commands.len() + 1);
    if has_content {
        parts.push("message content");
    }
    parts.extend(commands.iter().map(Command::verb));
    parts.join(" ")
}

async fn connect_stream(config: &SmtpSessionConfig) -> Result<TcpStream, SessionError> {
    let address = &config.remote_address;
    let stream = match config.local_address {
        Some(local) => {
            let socket = match local {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(|err| connect_error(address, &err))?;
            socket
                .bind(local)
                .map_err(|err| connect_error(address, &err))?;

            let mut remotes = lookup_host(address.as_str())
                .await
                .map_err(|err| connect_error(address, &err))?;
            let remote = remotes.next().ok_or_else(|| SessionError::ConnectError {
                address: address.clone(),
                error: "no addresses resolved".to_string(),
            })?;
            socket
                .connect(remote)
                .await
                .map_err(|err| connect_error(address, &err))?
        }
        None => TcpStream::connect(address.as_str())
            .await
            .map_err(|err| connect_error(address, &err))?,
    };
    // No need for Nagle with SMTP request/response
    stream
        .set_nodelay(true)
        .map_err(|err| connect_error(address, &err))?;
    Ok(stream)
}

fn connect_error(address: &str, err: &std::io::Error) -> SessionError {
    SessionError::ConnectError {
        address: address.to_string(),
        error: format!("{err:#}"),
    }
}

/// Writer half of the bridge: drains wire frames in order. A write or
/// flush failure becomes the session's terminal error.
async fn write_loop(
    state: Arc<ChannelState>,
    write_half: WriteHalf<BoxedAsyncReadAndWrite>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    let mut writer = BufWriter::new(write_half);

    loop {
        let Some(frame) = frames.recv().await else {
            break;
        };

        let result = match frame {
            Frame::Command(command) => {
                let line = command.encode();
                tracing::trace!("[{}] send-> {}", state.connection_id, line.trim_end());
                writer.write_all(line.as_bytes()).await
            }
            Frame::Content(bytes) => {
                tracing::trace!(
                    "[{}] send-> {} bytes of message content",
                    state.connection_id,
                    bytes.len()
                );
                writer.write_all(&bytes).await
            }
            Frame::EndOfContent => writer.write_all(END_OF_CONTENT).await,
            Frame::Flush => match writer.flush().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    state.record_failure(SessionError::FlushError {
                        connection_id: state.connection_id.clone(),
                        error: format!("{err:#}"),
                    });
                    return;
                }
            },
            Frame::Close => break,
        };

        if let Err(err) = result {
            state.record_failure(SessionError::WriteError {
                connection_id: state.connection_id.clone(),
                error: format!("{err:#}"),
            });
            return;
        }
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    state.close_requested.notify_one();
}

/// Reader half of the bridge: feeds responses into the handler and
/// turns stream failures and EOF into the session's terminal events.
async fn read_loop(state: Arc<ChannelState>, mut read_half: ReadHalf<BoxedAsyncReadAndWrite>) {
    let mut reader = ResponseReader::new(state.connection_id.clone());

    loop {
        tokio::select! {
            _ = state.close_requested.notified() => break,
            read = reader.read_response(&mut read_half) => match read {
                Ok(Some(response)) => state.handler.on_response(response),
                Ok(None) => break,
                Err(error) => {
                    state.record_failure(error);
                    break;
                }
            },
        }
    }

    state.mark_closed();
}
