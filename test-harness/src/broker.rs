// Minimal broker implementation behind a real TCP listener.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lariat_wire::{ControlLine, HeaderMap, subject};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_payload: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_payload: 1024 * 1024,
        }
    }
}

struct SubEntry {
    pattern: String,
    queue: String,
    delivered: u64,
    // Total message budget set by a bounded UNSUB, counted from SUB.
    max: Option<u64>,
}

struct ClientHandle {
    out: mpsc::UnboundedSender<Bytes>,
    subs: HashMap<u64, SubEntry>,
    tasks: Vec<JoinHandle<()>>,
}

struct BrokerState {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    config: BrokerConfig,
}

/// A broker bound to an ephemeral local port.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    client_ids: Arc<AtomicU64>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockBroker {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(BrokerConfig::default()).await
    }

    pub async fn spawn_with(config: BrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind broker listener")?;
        let addr = listener.local_addr().context("broker local addr")?;
        let state = Arc::new(BrokerState {
            clients: Mutex::new(HashMap::new()),
            config,
        });
        let client_ids = Arc::new(AtomicU64::new(0));
        let accept_task = spawn_accept_loop(listener, Arc::clone(&state), Arc::clone(&client_ids));
        Ok(Self {
            addr,
            state,
            client_ids,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Stop accepting new connections, keeping existing ones alive.
    pub fn stop_listening(&self) {
        let mut task = self.accept_task.lock().expect("accept task lock");
        if let Some(task) = task.take() {
            task.abort();
        }
    }

    /// Rebind the original port and resume accepting.
    pub async fn resume_listening(&self) -> Result<()> {
        self.stop_listening();
        let listener = TcpListener::bind(self.addr)
            .await
            .context("rebind broker listener")?;
        let task = spawn_accept_loop(
            listener,
            Arc::clone(&self.state),
            Arc::clone(&self.client_ids),
        );
        *self.accept_task.lock().expect("accept task lock") = Some(task);
        Ok(())
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of currently connected clients.
    pub fn connection_count(&self) -> usize {
        self.state.clients.lock().expect("clients lock").len()
    }

    /// Forcibly disconnect every client, e.g. to exercise reconnect.
    pub fn drop_clients(&self) {
        let mut clients = self.state.clients.lock().expect("clients lock");
        for (_, client) in clients.drain() {
            for task in client.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop_listening();
        self.drop_clients();
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    state: Arc<BrokerState>,
    client_ids: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let id = client_ids.fetch_add(1, Ordering::Relaxed) + 1;
            serve_client(Arc::clone(&state), id, stream);
        }
    })
}

fn serve_client(state: Arc<BrokerState>, id: u64, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let info = serde_json::json!({
        "server_id": format!("mock-{id}"),
        "host": "127.0.0.1",
        "port": 0,
        "version": "0.3.0",
        "auth_required": false,
        "tls_required": false,
        "max_payload": state.config.max_payload,
    });
    let mut buf = BytesMut::new();
    lariat_wire::encode_info(&mut buf, &info.to_string());
    let _ = out_tx.send(buf.freeze());

    // Register before the reader task runs so the first SUB always
    // finds its client entry.
    state.clients.lock().expect("clients lock").insert(
        id,
        ClientHandle {
            out: out_tx,
            subs: HashMap::new(),
            tasks: Vec::new(),
        },
    );

    let writer_task = tokio::spawn(run_client_writer(write_half, out_rx));
    let reader_state = Arc::clone(&state);
    let reader_task = tokio::spawn(async move {
        if let Err(err) = run_client_reader(Arc::clone(&reader_state), id, read_half).await {
            tracing::debug!(error = %err, client = id, "broker client stopped");
        }
        reader_state.clients.lock().expect("clients lock").remove(&id);
    });

    let mut clients = state.clients.lock().expect("clients lock");
    match clients.get_mut(&id) {
        Some(client) => client.tasks = vec![writer_task, reader_task],
        // Already gone again; stop serving.
        None => {
            writer_task.abort();
            reader_task.abort();
        }
    }
}

async fn run_client_writer(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = out_rx.recv().await {
        if write_half.write_all(&chunk).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

async fn run_client_reader(
    state: Arc<BrokerState>,
    id: u64,
    read_half: OwnedReadHalf,
) -> Result<()> {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let text = std::str::from_utf8(&line)
            .context("control line utf8")?
            .trim_end_matches(['\r', '\n']);
        let control = ControlLine::parse(text);
        match control.op.as_str() {
            "CONNECT" | "+OK" | "PONG" => {}
            "PING" => state.send_to(id, b"PONG\r\n"),
            "SUB" => state.handle_sub(id, &control.args)?,
            "UNSUB" => state.handle_unsub(id, &control.args)?,
            "PUB" => {
                let (subj, reply, len) = parse_pub_args(&control.args)?;
                let payload = read_payload(&mut reader, len).await?;
                state.route(&subj, reply.as_deref(), None, &payload);
            }
            "HPUB" => {
                let (subj, reply, header_len, total_len) = parse_hpub_args(&control.args)?;
                let block = read_payload(&mut reader, total_len).await?;
                let headers = block.slice(0..header_len);
                let payload = block.slice(header_len..);
                state.route(&subj, reply.as_deref(), Some(&headers), &payload);
            }
            other => {
                let mut buf = BytesMut::new();
                lariat_wire::encode_err(&mut buf, "Unknown Protocol Operation");
                state.send_to(id, &buf);
                bail!("unsupported op {other:?}");
            }
        }
    }
}

async fn read_payload(reader: &mut BufReader<OwnedReadHalf>, len: usize) -> Result<Bytes> {
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        bail!("payload not CRLF terminated");
    }
    Ok(Bytes::from(payload))
}

fn parse_pub_args(args: &str) -> Result<(String, Option<String>, usize)> {
    let toks: Vec<&str> = args.split_ascii_whitespace().collect();
    match toks.as_slice() {
        [subj, len] => Ok((subj.to_string(), None, len.parse()?)),
        [subj, reply, len] => Ok((subj.to_string(), Some(reply.to_string()), len.parse()?)),
        _ => bail!("bad PUB args {args:?}"),
    }
}

fn parse_hpub_args(args: &str) -> Result<(String, Option<String>, usize, usize)> {
    let toks: Vec<&str> = args.split_ascii_whitespace().collect();
    match toks.as_slice() {
        [subj, hdr, total] => Ok((subj.to_string(), None, hdr.parse()?, total.parse()?)),
        [subj, reply, hdr, total] => Ok((
            subj.to_string(),
            Some(reply.to_string()),
            hdr.parse()?,
            total.parse()?,
        )),
        _ => bail!("bad HPUB args {args:?}"),
    }
}

impl BrokerState {
    fn send_to(&self, id: u64, bytes: &[u8]) {
        let clients = self.clients.lock().expect("clients lock");
        if let Some(client) = clients.get(&id) {
            let _ = client.out.send(Bytes::copy_from_slice(bytes));
        }
    }

    fn handle_sub(&self, id: u64, args: &str) -> Result<()> {
        let toks: Vec<&str> = args.split_ascii_whitespace().collect();
        let (pattern, queue, sid) = match toks.as_slice() {
            [pattern, sid] => (*pattern, "", *sid),
            [pattern, queue, sid] => (*pattern, *queue, *sid),
            _ => bail!("bad SUB args {args:?}"),
        };
        let sid: u64 = sid.parse()?;
        let mut clients = self.clients.lock().expect("clients lock");
        if let Some(client) = clients.get_mut(&id) {
            client.subs.insert(
                sid,
                SubEntry {
                    pattern: pattern.to_string(),
                    queue: queue.to_string(),
                    delivered: 0,
                    max: None,
                },
            );
        }
        Ok(())
    }

    fn handle_unsub(&self, id: u64, args: &str) -> Result<()> {
        let toks: Vec<&str> = args.split_ascii_whitespace().collect();
        let (sid, max) = match toks.as_slice() {
            [sid] => (*sid, None),
            [sid, max] => (*sid, Some(max.parse::<u64>()?)),
            _ => bail!("bad UNSUB args {args:?}"),
        };
        let sid: u64 = sid.parse()?;
        let mut clients = self.clients.lock().expect("clients lock");
        let Some(client) = clients.get_mut(&id) else {
            return Ok(());
        };
        match max {
            None | Some(0) => {
                client.subs.remove(&sid);
            }
            Some(max) => {
                if let Some(entry) = client.subs.get_mut(&sid) {
                    // The budget counts from SUB; an exhausted one
                    // removes the interest immediately.
                    if entry.delivered >= max {
                        client.subs.remove(&sid);
                    } else {
                        entry.max = Some(max);
                    }
                }
            }
        }
        Ok(())
    }

    // Deliver to every matching plain subscription and to one random
    // member of each matching queue group. Emits a 503 status reply
    // when a request finds no interest at all.
    fn route(&self, subj: &str, reply: Option<&str>, headers: Option<&Bytes>, payload: &[u8]) {
        let mut clients = self.clients.lock().expect("clients lock");

        let mut plain: Vec<(u64, u64)> = Vec::new();
        let mut groups: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        for (client_id, client) in clients.iter() {
            for (sid, entry) in &client.subs {
                if !subject::matches(&entry.pattern, subj) {
                    continue;
                }
                if entry.queue.is_empty() {
                    plain.push((*client_id, *sid));
                } else {
                    groups
                        .entry(entry.queue.clone())
                        .or_default()
                        .push((*client_id, *sid));
                }
            }
        }

        let mut targets = plain;
        let mut rng = rand::rng();
        for (_, members) in groups {
            let pick = members[rng.random_range(0..members.len())];
            targets.push(pick);
        }

        if targets.is_empty() {
            if let Some(reply) = reply {
                // No interest: tell the requester, if anyone listens on
                // the reply subject.
                drop(clients);
                let mut status = HeaderMap::new();
                status.set_status(503, Some("No Responders"));
                let mut block = BytesMut::new();
                status.encode(&mut block);
                self.route(reply, None, Some(&block.freeze()), b"");
            }
            return;
        }

        for (client_id, sid) in targets {
            let Some(client) = clients.get_mut(&client_id) else {
                continue;
            };
            let Some(entry) = client.subs.get_mut(&sid) else {
                continue;
            };
            if entry.max.is_some_and(|max| entry.delivered >= max) {
                client.subs.remove(&sid);
                continue;
            }
            entry.delivered += 1;
            let exhausted = entry.max.is_some_and(|max| entry.delivered >= max);
            let mut buf = BytesMut::new();
            match headers {
                Some(block) => encode_hmsg_raw(&mut buf, subj, sid, reply, block, payload),
                None => lariat_wire::encode_msg(&mut buf, subj, sid, reply, payload),
            }
            let _ = client.out.send(buf.freeze());
            if exhausted {
                client.subs.remove(&sid);
            }
        }
    }
}

// HMSG with an already-encoded header block, as received from HPUB.
fn encode_hmsg_raw(
    buf: &mut BytesMut,
    subj: &str,
    sid: u64,
    reply: Option<&str>,
    block: &Bytes,
    payload: &[u8],
) {
    buf.extend_from_slice(b"HMSG ");
    buf.extend_from_slice(subj.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(block.len().to_string().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice((block.len() + payload.len()).to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(block);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}
