//! json-rpc protocol client talking to the storage engine over a unix domain
//! socket or a tcp connection, as described in spec:
//! https://www.jsonrpc.org/specification.

pub mod error;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use self::error::{Error, RpcCode};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
};
use tracing::{error, trace};

/// Time a single call may take before it is abandoned.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC request object
pub struct Request<'a> {
    /// The name of the RPC call
    pub method: &'a str,
    /// Parameters to the RPC call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Identifier for this Request, which should appear in the response
    pub id: serde_json::Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC response object
pub struct Response {
    /// A result if there is one, or null
    pub result: Option<serde_json::Value>,
    /// An error if there is one, or null
    pub error: Option<RpcError>,
    /// Identifier for this Request, which should match that of the request
    pub id: serde_json::Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i32,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    pub data: Option<serde_json::Value>,
}

/// Where the json-rpc server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Path of a unix domain socket.
    Unix(String),
    /// `host:port` of a tcp listener.
    Tcp(String),
}

impl From<&str> for Address {
    fn from(addr: &str) -> Self {
        // anything that looks like a path, or has no port, is a socket path
        if addr.starts_with('/') || addr.starts_with('.') || !addr.contains(':')
        {
            Self::Unix(addr.to_string())
        } else {
            Self::Tcp(addr.to_string())
        }
    }
}

impl From<String> for Address {
    fn from(addr: String) -> Self {
        Self::from(addr.as_str())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "{}", path),
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// json-rpc client bound to one server address. Every call opens a new
/// connection, so the client can be shared freely between tasks.
#[derive(Debug)]
pub struct Client {
    address: Address,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Client {
    /// Return a new `Self` which talks to the server at `address`.
    pub fn new(address: impl Into<Address>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Address of the server.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Make json-rpc request and parse reply and return user data to caller.
    pub async fn call<A, R>(
        &self,
        method: &str,
        args: Option<A>,
    ) -> Result<R, Error>
    where
        A: serde::ser::Serialize,
        R: 'static + serde::de::DeserializeOwned + Send,
    {
        let params = args.map(serde_json::to_value).transpose()?;
        let value = self.call_raw(method, params).await?;
        serde_json::from_value::<R>(value).map_err(Error::ParseError)
    }

    /// Same as `call` but without any (de)serialization of user data.
    pub async fn call_raw(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            method,
            params,
            id: From::from(id),
            jsonrpc: Some("2.0"),
        };

        let buf = serde_json::to_vec(&request)?;
        trace!("JSON request: {}", String::from_utf8_lossy(&buf));

        let reply = tokio::time::timeout(self.timeout, self.exchange(&buf))
            .await
            .map_err(|_| Error::Timeout {
                method: method.to_string(),
                timeout: self.timeout,
            })??;

        parse_reply(method, id, &reply)
    }

    async fn exchange(&self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        match &self.address {
            Address::Unix(path) => {
                let socket = UnixStream::connect(path).await.map_err(|err| {
                    Error::ConnectError {
                        sock: path.clone(),
                        err,
                    }
                })?;
                send_recv(socket, buf).await
            }
            Address::Tcp(addr) => {
                let socket = TcpStream::connect(addr).await.map_err(|err| {
                    Error::ConnectError {
                        sock: addr.clone(),
                        err,
                    }
                })?;
                send_recv(socket, buf).await
            }
        }
    }
}

/// Make a one-off json-rpc request to the server listening on `sock_path`.
pub async fn call<A, R>(
    sock_path: &str,
    method: &str,
    args: Option<A>,
) -> Result<R, Error>
where
    A: serde::ser::Serialize,
    R: 'static + serde::de::DeserializeOwned + Send,
{
    Client::new(sock_path, DEFAULT_TIMEOUT)
        .call(method, args)
        .await
}

/// Write the request and read until a complete json value was received or
/// the server closed the connection.
async fn send_recv<S>(mut socket: S, buf: &[u8]) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socket.write_all(buf).await?;

    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let len = socket.read(&mut chunk).await?;
        if len == 0 {
            break;
        }
        reply.extend_from_slice(&chunk[.. len]);
        match serde_json::from_slice::<serde::de::IgnoredAny>(&reply) {
            Err(err) if err.is_eof() => continue,
            _ => break,
        }
    }
    Ok(reply)
}

fn rpc_code(code: i32) -> RpcCode {
    match code {
        -32700 => RpcCode::ParseError,
        -32600 => RpcCode::InvalidRequest,
        -32601 => RpcCode::MethodNotFound,
        -32602 => RpcCode::InvalidParams,
        -32603 => RpcCode::InternalError,
        val => {
            if val == -(Errno::ENOENT as i32) || val == -(Errno::ENODEV as i32)
            {
                RpcCode::NotFound
            } else if val == -(Errno::EEXIST as i32) {
                RpcCode::AlreadyExists
            } else if val == -(Errno::EINVAL as i32) {
                RpcCode::InvalidParams
            } else {
                error!("Unknown json-rpc error code {}", val);
                RpcCode::InternalError
            }
        }
    }
}

/// Parse json-rpc reply (defined by spec) and return user data embedded in
/// the reply.
fn parse_reply(
    method: &str,
    id: u64,
    reply_raw: &[u8],
) -> Result<serde_json::Value, Error> {
    trace!("JSON response: {}", String::from_utf8_lossy(reply_raw));

    let reply = serde_json::from_slice::<Response>(reply_raw)?;
    if let Some(vers) = reply.jsonrpc {
        if vers != "2.0" {
            return Err(Error::InvalidVersion);
        }
    }
    if reply.id.as_u64() != Some(id) {
        return Err(Error::InvalidReplyId);
    }

    match reply.error {
        Some(err) => Err(Error::RpcError {
            code: rpc_code(err.code),
            msg: err.message,
            method: method.to_string(),
        }),
        // if there is no result fabricate null value == ()
        None => Ok(reply.result.unwrap_or(serde_json::Value::Null)),
    }
}
