use std::{
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::StorageError,
    protocol::{Request, Response, read_message, write_message},
};

/// Idle connections kept around for reuse; extra ones are closed on return.
const MAX_IDLE_CONNECTIONS: usize = 16;

/// One request/response stream to a store endpoint.
pub(crate) struct Connection {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub(crate) async fn round_trip(&mut self, request: &Request) -> Result<Response, StorageError> {
        write_message(&mut self.writer, request).await?;
        read_message::<_, Response>(&mut self.reader)
            .await?
            .ok_or(StorageError::ConnectionClosed)
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Connections shared by every caller of one client.
///
/// A connection is checked out for exactly one request and checked back in
/// only after its response was read in full. A request that is abandoned
/// midway (timeout, cancellation) drops its connection instead, so a late
/// response can never be read by the next caller.
pub(crate) struct ConnectionPool {
    endpoints: Vec<String>,
    connection_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    next_endpoint: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(endpoints: Vec<String>, connection_timeout: Duration) -> Self {
        Self {
            endpoints,
            connection_timeout,
            idle: Mutex::new(Vec::new()),
            next_endpoint: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn checkout(&self) -> Result<Connection, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let idle = self.lock_idle().pop();
        if let Some(connection) = idle {
            return Ok(connection);
        }
        self.connect().await
    }

    pub(crate) fn checkin(&self, connection: Connection) {
        if self.is_closed() {
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }

    /// Tries every endpoint once, starting after the one that last worked,
    /// each attempt bounded by the connection timeout.
    pub(crate) async fn connect(&self) -> Result<Connection, StorageError> {
        let start = self.next_endpoint.load(Ordering::Relaxed);
        let mut last_error = io::Error::new(io::ErrorKind::InvalidInput, "no endpoints configured");

        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            match timeout(self.connection_timeout, TcpStream::connect(endpoint.as_str())).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(endpoint = %endpoint, error = %err, "failed to set TCP_NODELAY");
                    }
                    self.next_endpoint.store(index, Ordering::Relaxed);
                    let (reader, writer) = stream.into_split();
                    debug!(endpoint = %endpoint, "connected to store");
                    return Ok(Connection {
                        endpoint: endpoint.clone(),
                        reader: BufReader::new(reader),
                        writer,
                    });
                }
                Ok(Err(err)) => {
                    warn!(endpoint = %endpoint, error = %err, "store endpoint unreachable");
                    last_error = err;
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, timeout = ?self.connection_timeout, "store connect timed out");
                    last_error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                }
            }
        }

        Err(StorageError::Connect {
            endpoints: self.endpoints.clone(),
            timeout: self.connection_timeout,
            source: last_error,
        })
    }

    /// Drops every idle connection and refuses further checkouts.
    /// Returns false if the pool was already closed.
    pub(crate) fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::AcqRel);
        self.lock_idle().clear();
        was_open
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        // The guarded Vec stays consistent even if a holder panicked.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
