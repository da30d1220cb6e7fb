//! rustls 无 I/O 引擎的薄封装与密文读取适配。

use std::io::{self, Read, Write};

use kindle_core::stream::ReceiveStream;
use rustls::{ClientConnection, HandshakeKind, IoState, ServerConnection};

/// 客户端或服务端会话。
pub(crate) enum Engine {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Engine {
    pub(crate) fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    pub(crate) fn read_tls(&mut self, source: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.read_tls(source),
            Self::Server(conn) => conn.read_tls(source),
        }
    }

    pub(crate) fn write_tls(&mut self, sink: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.write_tls(sink),
            Self::Server(conn) => conn.write_tls(sink),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            Self::Client(conn) => conn.process_new_packets(),
            Self::Server(conn) => conn.process_new_packets(),
        }
    }

    /// 取出已解密的明文；没有明文时返回 `WouldBlock`。
    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.reader().read(buf),
            Self::Server(conn) => conn.reader().read(buf),
        }
    }

    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Client(conn) => conn.writer().write_all(data),
            Self::Server(conn) => conn.writer().write_all(data),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            Self::Client(conn) => conn.send_close_notify(),
            Self::Server(conn) => conn.send_close_notify(),
        }
    }

    pub(crate) fn wants_read(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_read(),
            Self::Server(conn) => conn.wants_read(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_write(),
            Self::Server(conn) => conn.wants_write(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(conn) => conn.is_handshaking(),
            Self::Server(conn) => conn.is_handshaking(),
        }
    }

    pub(crate) fn handshake_kind(&self) -> Option<HandshakeKind> {
        match self {
            Self::Client(conn) => conn.handshake_kind(),
            Self::Server(conn) => conn.handshake_kind(),
        }
    }

    pub(crate) fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            Self::Client(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
            Self::Server(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
        }
    }
}

/// 把底层连接的接收流适配为引擎的拉取源。
///
/// 读空时返回 `WouldBlock` 而不是 `Ok(0)`：引擎会把 `Ok(0)` 当作传输层 EOF，
/// 而这里的“空”只表示本轮快照已经读完。
pub(crate) struct CipherReader<'a> {
    stream: &'a mut ReceiveStream,
}

impl<'a> CipherReader<'a> {
    pub(crate) fn new(stream: &'a mut ReceiveStream) -> Self {
        Self { stream }
    }
}

impl Read for CipherReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.stream.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.stream.read(buf)
    }
}
