use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as TlsClientStream;

/// Combined stream trait so that plain TCP, TLS and in-memory test
/// streams are interchangeable to the session engine.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for TlsClientStream<TcpStream> {}
impl AsyncReadAndWrite for TlsClientStream<BoxedAsyncReadAndWrite> {}
impl AsyncReadAndWrite for tokio::io::DuplexStream {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
