//! Client for the QEMU machine protocol (QMP), used to hot-plug and
//! hot-unplug devices of a running virtual machine.
//!
//! Messages are newline delimited json objects. After connecting, the server
//! sends a greeting and the client has to negotiate capabilities before any
//! other command is accepted. Asynchronous events may arrive interleaved with
//! command replies; they are queued so that they can be waited for later.

pub mod error;
pub mod types;

use std::{collections::VecDeque, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snafu::{OptionExt, ResultExt};
use tokio::{
    io::{
        AsyncBufReadExt,
        AsyncRead,
        AsyncWrite,
        AsyncWriteExt,
        BufReader,
        Lines,
    },
    net::{TcpStream, UnixStream},
    time::Instant,
};
use tracing::{debug, trace};

pub use error::Error;
use error::{
    ConnectionClosed,
    Decode,
    Encode,
    Io,
    Request,
    Socket,
    UnexpectedGreeting,
};
use types::{ChardevInfo, PciInfo};

/// Where the QMP monitor of a virtual machine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp {
        host: String,
        port: u16,
    },
    Unix(String),
}

impl Address {
    /// A tcp address when a port is given, a unix socket path otherwise.
    pub fn new(host: &str, port: Option<u16>) -> Self {
        match port {
            Some(port) => Self::Tcp {
                host: host.to_string(),
                port,
            },
            None => Self::Unix(host.to_string()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Tcp {
                host,
                port,
            } => write!(f, "{}:{}", host, port),
            Address::Unix(path) => write!(f, "{}", path),
        }
    }
}

/// An asynchronous notification sent by QEMU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type Reader = Lines<BufReader<ReadHalf>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected and negotiated QMP session.
pub struct Client {
    reader: Reader,
    writer: Writer,
    timeout: Duration,
    next_id: u64,
    events: VecDeque<Event>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("timeout", &self.timeout)
            .field("next_id", &self.next_id)
            .field("events", &self.events.len())
            .finish()
    }
}

impl Client {
    /// Connect to the monitor at `address` and negotiate capabilities.
    /// `timeout` bounds connecting as well as every later command.
    pub async fn connect(
        address: &Address,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let (reader, writer) = tokio::time::timeout(timeout, open(address))
            .await
            .map_err(|_| Error::Timeout {
                what: format!("connection to {}", address),
                timeout,
            })??;

        let mut client = Self {
            reader: BufReader::new(reader).lines(),
            writer,
            timeout,
            next_id: 0,
            events: VecDeque::new(),
        };

        let deadline = Instant::now() + timeout;
        let greeting = client.read_message("greeting", deadline).await?;
        if greeting.get("QMP").is_none() {
            return UnexpectedGreeting {
                greeting: greeting.to_string(),
            }
            .fail();
        }
        client.execute("qmp_capabilities", None).await?;
        debug!("Connected to QMP monitor at {}", address);
        Ok(client)
    }

    /// Execute a command and return the contents of its `return` member.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, Error> {
        let id = self.next_id;
        self.next_id += 1;

        let mut message = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            message["arguments"] = arguments;
        }
        let mut buf = serde_json::to_vec(&message).context(Encode {
            command,
        })?;
        buf.push(b'\n');
        trace!("QMP request: {}", message);
        self.writer.write_all(&buf).await.context(Io {})?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let reply = self.read_message(command, deadline).await?;
            if reply.get("event").is_some() {
                self.queue_event(reply)?;
                continue;
            }
            if reply.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("Ignoring unrelated QMP reply: {}", reply);
                continue;
            }
            if let Some(error) = reply.get("error") {
                let field = |name: &str| {
                    error
                        .get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                return Request {
                    command,
                    class: field("class"),
                    desc: field("desc"),
                }
                .fail();
            }
            return Ok(reply.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    /// Wait for an event named `name` for which `filter` holds. Events that
    /// arrived while executing earlier commands are considered first.
    pub async fn wait_for_event<F>(
        &mut self,
        name: &str,
        filter: F,
    ) -> Result<Event, Error>
    where
        F: Fn(&Event) -> bool,
    {
        let matches = |event: &Event| event.event == name && filter(event);
        let queued = self
            .events
            .iter()
            .position(matches)
            .and_then(|pos| self.events.remove(pos));
        if let Some(event) = queued {
            return Ok(event);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let message = self.read_message(name, deadline).await?;
            if message.get("event").is_none() {
                continue;
            }
            let event: Event =
                serde_json::from_value(message).context(Decode {})?;
            if matches(&event) {
                return Ok(event);
            }
            self.events.push_back(event);
        }
    }

    /// Execute a command and then wait for the event signalling that it
    /// completed.
    pub async fn execute_and_wait<F>(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        event: &str,
        filter: F,
    ) -> Result<Event, Error>
    where
        F: Fn(&Event) -> bool,
    {
        self.execute(command, arguments).await?;
        self.wait_for_event(event, filter).await
    }

    /// Hot-plug a device. `arguments` carries `driver`, `id` and the driver
    /// specific properties.
    pub async fn device_add(&mut self, arguments: Value) -> Result<(), Error> {
        self.execute("device_add", Some(arguments)).await.map(|_| ())
    }

    /// Request removal of a device, optionally waiting until the guest has
    /// released it.
    pub async fn device_del(
        &mut self,
        id: &str,
        wait: bool,
    ) -> Result<(), Error> {
        let arguments = json!({ "id": id });
        if !wait {
            return self
                .execute("device_del", Some(arguments))
                .await
                .map(|_| ());
        }
        self.execute_and_wait(
            "device_del",
            Some(arguments),
            "DEVICE_DELETED",
            |event| {
                event.data.get("device").and_then(Value::as_str) == Some(id)
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn chardev_add(
        &mut self,
        id: &str,
        backend: Value,
    ) -> Result<(), Error> {
        let arguments = json!({ "id": id, "backend": backend });
        self.execute("chardev-add", Some(arguments)).await.map(|_| ())
    }

    pub async fn chardev_remove(&mut self, id: &str) -> Result<(), Error> {
        let arguments = json!({ "id": id });
        self.execute("chardev-remove", Some(arguments))
            .await
            .map(|_| ())
    }

    pub async fn query_pci(&mut self) -> Result<Vec<PciInfo>, Error> {
        let reply = self.execute("query-pci", None).await?;
        serde_json::from_value(reply).context(Decode {})
    }

    pub async fn query_chardev(&mut self) -> Result<Vec<ChardevInfo>, Error> {
        let reply = self.execute("query-chardev", None).await?;
        serde_json::from_value(reply).context(Decode {})
    }

    fn queue_event(&mut self, message: Value) -> Result<(), Error> {
        let event: Event =
            serde_json::from_value(message).context(Decode {})?;
        trace!("Queued QMP event {}", event.event);
        self.events.push_back(event);
        Ok(())
    }

    async fn read_message(
        &mut self,
        what: &str,
        deadline: Instant,
    ) -> Result<Value, Error> {
        loop {
            let next = self.reader.next_line();
            let line = tokio::time::timeout_at(deadline, next)
                .await
                .map_err(|_| Error::Timeout {
                    what: what.to_string(),
                    timeout: self.timeout,
                })?
                .context(Io {})?
                .context(ConnectionClosed {})?;
            if line.trim().is_empty() {
                continue;
            }
            trace!("QMP message: {}", line);
            return serde_json::from_str(&line).context(Decode {});
        }
    }
}

async fn open(address: &Address) -> Result<(ReadHalf, Writer), Error> {
    match address {
        Address::Tcp {
            host,
            port,
        } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .context(Socket {
                    address: address.to_string(),
                })?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Address::Unix(path) => {
            let stream = UnixStream::connect(path).await.context(Socket {
                address: path.clone(),
            })?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}
