use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io::{BufWriter, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Mutex,
    },
};
use tracing::{debug, info};

/// Failures a bus can report on publish.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("channel {0} was never registered")]
    Unregistered(String),
    #[error("consumer disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Publish/subscribe bus the driver announces frames on. The bus also owns
/// the liveness flag the acquisition loop polls: once `shutdown` is called
/// `is_alive` turns false and the loop drains.
pub trait Bus: Send + Sync {
    /// Declare an output channel. Must happen before the first publish on it.
    fn register(&self, channel: &str);

    /// Emit `payload` on `channel`. No acknowledgement is awaited.
    fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    fn is_alive(&self) -> bool;

    /// Flip liveness to false.
    fn shutdown(&self);
}

/// One published message as delivered to a consumer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Serialized record.
    pub payload: String,
}

/// Keeps track of the registered channels and the liveness flag, shared by
/// the bus implementations below.
struct BusState {
    alive: AtomicBool,
    channels: Mutex<HashSet<String>>,
}

impl BusState {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            channels: Mutex::new(HashSet::new()),
        }
    }

    fn register(&self, channel: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(channel.to_string());
        }
    }

    fn check_registered(&self, channel: &str) -> Result<(), BusError> {
        let registered = self
            .channels
            .lock()
            .map(|channels| channels.contains(channel))
            .unwrap_or(false);
        if registered {
            Ok(())
        } else {
            Err(BusError::Unregistered(channel.to_string()))
        }
    }
}

/// In-process bus. Messages land on the receiver returned by
/// [`ChannelBus::new`], which the consumer drains on its own thread.
pub struct ChannelBus {
    state: BusState,
    sender: Mutex<Sender<BusMessage>>,
}

impl ChannelBus {
    /// Create the bus together with the consumer side.
    pub fn new() -> (Self, Receiver<BusMessage>) {
        let (sender, receiver) = mpsc::channel::<BusMessage>();
        let bus = Self {
            state: BusState::new(),
            sender: Mutex::new(sender),
        };
        (bus, receiver)
    }
}

impl Bus for ChannelBus {
    fn register(&self, channel: &str) {
        debug!(channel, "registered channel");
        self.state.register(channel);
    }

    fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.state.check_registered(channel)?;
        let sender = self.sender.lock().map_err(|_| BusError::Disconnected)?;
        sender
            .send(BusMessage {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| BusError::Disconnected)
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }
}

/// Bus forwarding every message as one line of JSON to a TCP consumer.
/// Each line is a serialized [`BusMessage`].
pub struct TcpBus {
    state: BusState,
    stream: Mutex<BufWriter<TcpStream>>,
}

impl TcpBus {
    /// Connect to a consumer listening on `address`.
    pub fn connect(address: SocketAddr) -> Result<Self, BusError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        info!(%address, "connected to bus consumer");
        Ok(Self {
            state: BusState::new(),
            stream: Mutex::new(BufWriter::new(stream)),
        })
    }
}

impl Bus for TcpBus {
    fn register(&self, channel: &str) {
        debug!(channel, "registered channel");
        self.state.register(channel);
    }

    fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.state.check_registered(channel)?;
        let message = BusMessage {
            channel: channel.to_string(),
            payload,
        };
        let mut stream = self.stream.lock().map_err(|_| BusError::Disconnected)?;
        serde_json::to_writer(&mut *stream, &message)?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        if let Ok(mut stream) = self.stream.lock() {
            let _ = stream.flush();
            let _ = stream.get_ref().shutdown(Shutdown::Write);
        }
    }
}
