//! TCP transport: listener, dialer, and the single event loop that owns the
//! mesh node. Every socket event funnels through one mpsc consumer, so all
//! node state mutation is serialized.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use cascade_core::{Action, ConnId, MeshNode, PeerAddr};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;

/// Everything that can wake the event loop.
enum Event {
    Accepted(TcpStream),
    Dialed(ConnId, TcpStream),
    DialFailed(ConnId),
    Data(ConnId, Vec<u8>),
    Closed(ConnId),
    Tick,
}

/// Unix time in whole seconds; the clock the node's timestamps use.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Run the node until the listener fails or the process is stopped.
pub async fn run(mut node: MeshNode, bind: (String, u16), bootstrap: Vec<PeerAddr>) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind.0.as_str(), bind.1)).await?;
    info!(addr = %format!("{}:{}", bind.0, bind.1), id = %node.id(), "listening");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let accept_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    if accept_tx.send(Event::Accepted(stream)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    });

    let tick_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            if tick_tx.send(Event::Tick).is_err() {
                break;
            }
        }
    });

    let mut writers: HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
    // Bytes the node asked to send before the dial finished.
    let mut parked: HashMap<ConnId, Vec<Vec<u8>>> = HashMap::new();

    for addr in bootstrap {
        match node.connect(addr.clone(), None, unix_now()) {
            Ok((_, actions)) => {
                apply(actions, &mut writers, &mut parked, &event_tx)
            }
            Err(err) => warn!(%addr, %err, "skipping bootstrap peer"),
        }
    }

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Accepted(stream) => {
                let (token, actions) = node.on_accepted(unix_now());
                attach(token, stream, &mut writers, &mut parked, &event_tx);
                apply(actions, &mut writers, &mut parked, &event_tx);
            }
            Event::Dialed(token, stream) => {
                // The node may have reaped the token while the dial was in
                // flight (handshake timeout); drop the late socket.
                if node.has_connection(token) {
                    attach(token, stream, &mut writers, &mut parked, &event_tx);
                } else {
                    parked.remove(&token);
                }
            }
            Event::DialFailed(token) => {
                let actions = node.on_disconnected(token, unix_now());
                apply(actions, &mut writers, &mut parked, &event_tx);
            }
            Event::Data(token, bytes) => {
                let actions = node.on_data(token, &bytes, unix_now());
                apply(actions, &mut writers, &mut parked, &event_tx);
                while let Some(delivery) = node.recv() {
                    let body = delivery
                        .payload()
                        .get(1)
                        .map(|p| String::from_utf8_lossy(p).into_owned())
                        .unwrap_or_default();
                    info!(sender = %delivery.sender(), %body, "message received");
                }
            }
            Event::Closed(token) => {
                writers.remove(&token);
                parked.remove(&token);
                let actions = node.on_disconnected(token, unix_now());
                apply(actions, &mut writers, &mut parked, &event_tx);
            }
            Event::Tick => {
                let actions = node.tick(unix_now());
                apply(actions, &mut writers, &mut parked, &event_tx);
            }
        }
    }
    Ok(())
}

/// Carry out the node's actions: write, dial, or close.
fn apply(
    actions: Vec<Action>,
    writers: &mut HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>,
    parked: &mut HashMap<ConnId, Vec<Vec<u8>>>,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    for action in actions {
        match action {
            Action::Send(token, bytes) => match writers.get(&token) {
                Some(tx) => {
                    // A closed channel means the writer task already died;
                    // the Closed event will clean up.
                    let _ = tx.send(bytes);
                }
                None => parked.entry(token).or_default().push(bytes),
            },
            Action::Open(token, addr) => {
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    match TcpStream::connect((addr.host.as_str(), addr.port)).await {
                        Ok(stream) => {
                            let _ = tx.send(Event::Dialed(token, stream));
                        }
                        Err(err) => {
                            debug!(%addr, %err, "dial failed");
                            let _ = tx.send(Event::DialFailed(token));
                        }
                    }
                });
            }
            Action::Close(token) => {
                // Dropping the writer closes the socket; the reader task then
                // reports Closed, which is idempotent on the node.
                writers.remove(&token);
                parked.remove(&token);
            }
        }
    }
}

/// Wire a connected stream to the event loop: a reader task feeding Data
/// events and a writer task draining a per-connection channel.
fn attach(
    token: ConnId,
    stream: TcpStream,
    writers: &mut HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>,
    parked: &mut HashMap<ConnId, Vec<Vec<u8>>>,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    let (read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Some(backlog) = parked.remove(&token) {
        for bytes in backlog {
            let _ = write_tx.send(bytes);
        }
    }
    writers.insert(token, write_tx);
    tokio::spawn(run_writer(write_rx, write_half));
    let tx = event_tx.clone();
    tokio::spawn(run_reader(token, read_half, tx));
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut half: OwnedWriteHalf) {
    while let Some(bytes) = rx.recv().await {
        if half.write_all(&bytes).await.is_err() || half.flush().await.is_err() {
            break;
        }
    }
}

async fn run_reader(token: ConnId, mut half: OwnedReadHalf, tx: mpsc::UnboundedSender<Event>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Event::Data(token, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
    let _ = tx.send(Event::Closed(token));
}
