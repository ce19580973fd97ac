// Socket-level protocol reading and the connection handshake.
use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader, ReadHalf, WriteHalf};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;

use lariat_wire::{ControlLine, HeaderMap, HmsgArgs, MsgArgs, ServerInfo};
use lariat_wire::{OP_ERR, OP_HMSG, OP_INFO, OP_MSG, OP_OK, OP_PING, OP_PONG};

use crate::errors::{Error, Result};
use crate::message::Message;
use crate::options::{MAX_CONTROL_LINE, Options};
use crate::server::ServerAddr;
use crate::transport::{BoxedStream, dial, upgrade_tls};

const READ_BUFFER: usize = 32 * 1024;

// One decoded inbound protocol unit.
pub(crate) enum ServerOp {
    Info(ServerInfo),
    Msg(Message),
    Ping,
    Pong,
    Ok,
    Err(String),
}

// Buffered protocol reader over the socket read half. Reads a control
// line, then for message ops the declared header/payload byte counts.
pub(crate) struct OpReader {
    reader: BufReader<ReadHalf<BoxedStream>>,
    line: Vec<u8>,
}

impl OpReader {
    pub(crate) fn new(read_half: ReadHalf<BoxedStream>) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER, read_half),
            line: Vec::with_capacity(256),
        }
    }

    pub(crate) async fn read_op(&mut self) -> Result<ServerOp> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Err(Error::Io("connection reset by broker".to_string()));
        }
        if self.line.last() != Some(&b'\n') {
            return Err(Error::Io("truncated control line".to_string()));
        }
        if self.line.len() > MAX_CONTROL_LINE {
            return Err(Error::LineTooLong(MAX_CONTROL_LINE));
        }
        let line = std::str::from_utf8(&self.line)
            .map_err(|_| Error::Protocol("control line is not valid UTF-8".to_string()))?
            .trim_end_matches(['\r', '\n']);
        let control = ControlLine::parse(line);

        match control.op.as_str() {
            OP_PING => Ok(ServerOp::Ping),
            OP_PONG => Ok(ServerOp::Pong),
            OP_OK => Ok(ServerOp::Ok),
            OP_ERR => Ok(ServerOp::Err(control.args)),
            OP_INFO => Ok(ServerOp::Info(serde_json::from_str(&control.args)?)),
            OP_MSG => {
                let args = MsgArgs::parse(&control.args)?;
                let payload = self.read_payload(args.payload_len).await?;
                Ok(ServerOp::Msg(Message {
                    subject: args.subject,
                    reply: args.reply,
                    payload,
                    headers: None,
                    sid: args.sid,
                }))
            }
            OP_HMSG => {
                let args = HmsgArgs::parse(&control.args)?;
                let block = self.read_chunk(args.header_len).await?;
                let headers = HeaderMap::decode(&block)?;
                let payload = self.read_payload(args.total_len - args.header_len).await?;
                Ok(ServerOp::Msg(Message {
                    subject: args.subject,
                    reply: args.reply,
                    payload,
                    headers: Some(headers),
                    sid: args.sid,
                }))
            }
            other => Err(Error::Protocol(format!("unknown operation {other:?}"))),
        }
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; len];
        self.reader.read_exact(&mut chunk).await?;
        Ok(chunk)
    }

    // Payloads are followed by a terminating CRLF on the wire.
    async fn read_payload(&mut self, len: usize) -> Result<Bytes> {
        let payload = self.read_chunk(len).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(Error::Protocol("payload not CRLF terminated".to_string()));
        }
        Ok(Bytes::from(payload))
    }
}

// A freshly dialed transport: handshake consumed through the initial
// INFO line and an optional TLS upgrade, no CONNECT sent yet.
pub(crate) struct Established {
    pub(crate) reader: OpReader,
    pub(crate) writer: WriteHalf<BoxedStream>,
    pub(crate) info: ServerInfo,
}

pub(crate) async fn establish(opts: &Options, addr: &ServerAddr) -> Result<Established> {
    let mut tcp = dial(addr, opts.connect_timeout).await?;

    // The INFO line arrives in plaintext before any TLS handshake, so
    // it is read unbuffered from the raw socket.
    let line = tokio::time::timeout(opts.connect_timeout, read_line_raw(&mut tcp))
        .await
        .map_err(|_| Error::Timeout)??;
    let control = ControlLine::parse(&line);
    if control.op != OP_INFO {
        return Err(Error::Protocol(format!(
            "expected INFO, got {:?}",
            control.op
        )));
    }
    let info: ServerInfo = serde_json::from_str(&control.args)?;

    let want_secure = opts.secure || addr.tls;
    if want_secure && !info.tls_required {
        return Err(Error::SecureConnWanted);
    }
    if info.tls_required && !want_secure {
        return Err(Error::SecureConnRequired);
    }

    let stream: BoxedStream = if want_secure {
        upgrade_tls(tcp, &addr.host).await?
    } else {
        Box::new(tcp)
    };
    let (read_half, write_half) = tokio::io::split(stream);
    Ok(Established {
        reader: OpReader::new(read_half),
        writer: write_half,
        info,
    })
}

async fn read_line_raw(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io("connection reset during handshake".to_string()));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_CONTROL_LINE {
            return Err(Error::LineTooLong(MAX_CONTROL_LINE));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::Protocol("info line is not valid UTF-8".to_string()))
}
