//! A fixed set of reusable connections. A connection is handed to one caller at a time.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{PoisonError, RwLock};

use crate::connection::{Connection, Connector};
use crate::error::SendError;

pub struct ConnectionPool<C: Connector> {
    connector: C,
    capacity: usize,
    tx: Sender<C::Conn>,
    rx: Receiver<C::Conn>,
    closed: RwLock<bool>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Open `capacity` connections. If one of them fails, the ones already open are closed.
    pub fn new(connector: C, capacity: usize) -> Result<Self, SendError> {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            match connector.connect() {
                Ok(conn) => {
                    // cannot be full: at most `capacity` connections are pushed
                    let _ = tx.try_send(conn);
                }
                Err(e) => {
                    for mut conn in rx.try_iter() {
                        conn.close();
                    }
                    return Err(e);
                }
            }
        }
        log::debug!(
            "Connection pool ready with {capacity} {} connections",
            connector.protocol()
        );
        Ok(ConnectionPool {
            connector,
            capacity,
            tx,
            rx,
            closed: RwLock::new(false),
        })
    }

    /// Take an idle connection, or open a new one if none is idle. A dead idle connection is
    /// closed and replaced.
    pub fn get(&self) -> Result<C::Conn, SendError> {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(SendError::PoolClosed);
        }
        match self.rx.try_recv() {
            Ok(mut conn) => {
                if conn.is_alive() {
                    Ok(conn)
                } else {
                    log::debug!("Connection {} is dead, replacing it", conn.id());
                    conn.close();
                    self.connector.connect()
                }
            }
            Err(_) => self.connector.connect(),
        }
    }

    /// Give a connection back. It is closed instead if it is dead, the pool is full or closed.
    pub fn put(&self, mut conn: C::Conn) {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed || !conn.is_alive() {
            conn.close();
            return;
        }
        match self.tx.try_send(conn) {
            Ok(()) => (),
            Err(TrySendError::Full(mut conn)) | Err(TrySendError::Disconnected(mut conn)) => {
                log::trace!("Pool full, closing connection {}", conn.id());
                conn.close();
            }
        }
    }

    /// Close every idle connection. Later `get` calls fail. Only the first call has an effect.
    pub fn close(&self) {
        let mut closed = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return;
        }
        *closed = true;
        for mut conn in self.rx.try_iter() {
            conn.close();
        }
        log::debug!("Connection pool closed");
    }

    /// Number of idle connections
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}
