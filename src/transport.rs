//! Blocking transport to a bus daemon, on top of zbus.
//!
//! zbus finds the bus, authenticates and says `Hello`; this module only
//! moves messages across. Outgoing messages are framed by
//! [`Message::to_bytes`] and handed to zbus as raw frames. Incoming ones
//! come off a [`zbus::MessageStream`] and are parsed back with
//! [`Message::from_bytes`]. A frame that zbus accepts but that does not
//! parse as a message is logged and dropped, and the stream carries on.
//!
//! The session and system buses are found the way zbus finds them
//! (`DBUS_SESSION_BUS_ADDRESS`, `DBUS_SYSTEM_BUS_ADDRESS` and their
//! defaults). The starter bus is `DBUS_STARTER_ADDRESS`, or failing that
//! whichever bus `DBUS_STARTER_BUS_TYPE` names.

use crate::connection::{no_reply, Bus, Connector, Transport};
use crate::error::{Error, Result};
use crate::message::Message;

use async_io::Timer;
use futures::future::{self, Either};
use futures::{FutureExt, StreamExt};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::env;
use std::time::{Duration, Instant};
use zbus::blocking::connection::Builder;
use zbus::zvariant::serialized::{Context, Data};
use zbus::zvariant::Endian;

/// How many received messages zbus holds for us between reads.
const MAX_QUEUED: usize = 1024;
/// Most messages taken by one read that does not wait.
const MAX_READ_BATCH: usize = 64;

/// Hands a complete frame to zbus.
fn wrap_frame(bytes: Vec<u8>) -> Result<zbus::Message> {
    let endian = match bytes.first() {
        Some(b'B') => Endian::Big,
        _ => Endian::Little,
    };
    let data = Data::new(bytes, Context::new_dbus(endian, 0));
    // zbus checks the header but trusts the body, which the marshaller wrote.
    Ok(unsafe { zbus::Message::from_bytes(data) }?)
}

/// Frames `message` with `serial` as a zbus message.
pub(crate) fn to_zbus(message: &Message, serial: u32) -> Result<zbus::Message> {
    wrap_frame(message.to_bytes(serial)?)
}

// The counter zbus uses for the messages it frames itself, Hello included.
fn next_serial() -> u32 {
    zbus::message::PrimaryHeader::new(zbus::message::Type::MethodCall, 0)
        .serial_num()
        .get()
}

/// Opens [`BusTransport`]s, to the address from the environment unless
/// one is given explicitly.
#[derive(Clone, Debug, Default)]
pub struct BusConnector {
    address: Option<String>,
}

impl BusConnector {
    /// Connects to `address`, in DBus address syntax, whichever bus is
    /// asked for.
    pub fn with_address(address: impl Into<String>) -> Self {
        BusConnector {
            address: Some(address.into()),
        }
    }

    fn builder(&self, bus: Bus) -> Result<Builder<'static>> {
        if let Some(address) = &self.address {
            return Ok(Builder::address(address.as_str())?);
        }
        let from_env = |var: &str| env::var(var).ok().filter(|value| !value.is_empty());
        match bus {
            Bus::Session => Ok(Builder::session()?),
            Bus::System => Ok(Builder::system()?),
            Bus::Starter => match from_env("DBUS_STARTER_ADDRESS") {
                Some(address) => Ok(Builder::address(address.as_str())?),
                None => match from_env("DBUS_STARTER_BUS_TYPE").as_deref() {
                    Some("system") => self.builder(Bus::System),
                    Some("session") => self.builder(Bus::Session),
                    _ => Err(Error::Connection(
                        "not started by a bus: DBUS_STARTER_ADDRESS is not set".to_owned(),
                    )),
                },
            },
        }
    }
}

impl Connector for BusConnector {
    type Transport = BusTransport;

    fn open(&self, bus: Bus) -> Result<BusTransport> {
        let connection = self
            .builder(bus)?
            .max_queued(MAX_QUEUED)
            .build()
            .map_err(|e| Error::Connection(format!("cannot connect to the {} bus: {}", bus, e)))?;
        Ok(BusTransport::new(connection))
    }
}

pub struct BusTransport {
    connection: zbus::blocking::Connection,
    stream: zbus::MessageStream,
    unique_name: String,
    incoming: VecDeque<Message>,
    // Why the stream ended, once it has.
    closed: Option<String>,
}

impl BusTransport {
    /// Takes over an established zbus connection. Messages it received
    /// before this call are not seen.
    pub fn new(connection: zbus::blocking::Connection) -> Self {
        let stream = zbus::MessageStream::from(connection.inner());
        let unique_name = connection
            .unique_name()
            .map(|name| name.to_string())
            .unwrap_or_default();
        BusTransport {
            connection,
            stream,
            unique_name,
            incoming: VecDeque::new(),
            closed: None,
        }
    }

    fn receive(&mut self, received: Option<zbus::Result<zbus::Message>>) {
        match received {
            Some(Ok(raw)) => match Message::from_bytes(raw.data().bytes()) {
                Ok(message) => {
                    trace!("received {}", message);
                    self.incoming.push_back(message);
                }
                Err(e) => warn!(
                    "dropping malformed message #{}: {}",
                    raw.primary_header().serial_num(),
                    e
                ),
            },
            Some(Err(e)) => {
                warn!("bus connection failed: {}", e);
                self.closed = Some(e.to_string());
            }
            None => {
                debug!("bus closed the connection");
                self.closed = Some("bus closed the connection".to_owned());
            }
        }
    }

    /// Takes what has already arrived, up to a batch.
    fn read_ready(&mut self) {
        for _ in 0..MAX_READ_BATCH {
            if self.closed.is_some() {
                return;
            }
            match self.stream.next().now_or_never() {
                Some(received) => self.receive(received),
                None => return,
            }
        }
    }

    /// Waits up to `timeout` for one message.
    fn read_one(&mut self, timeout: Duration) {
        let next = future::select(self.stream.next(), Timer::after(timeout));
        let received = match async_io::block_on(next) {
            Either::Left((received, _)) => Some(received),
            Either::Right(_) => None,
        };
        if let Some(received) = received {
            self.receive(received);
        }
    }

    fn closed_error(&self) -> Option<Error> {
        self.closed.clone().map(Error::Connection)
    }
}

impl Transport for BusTransport {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn send(&mut self, message: Message) -> Result<u32> {
        if let Some(e) = self.closed_error() {
            return Err(e);
        }
        let serial = next_serial();
        let raw = to_zbus(&message, serial)?;
        trace!("sending {} as #{}", message, serial);
        self.connection.send(&raw)?;
        Ok(serial)
    }

    fn send_with_reply_and_block(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let serial = self.send(message)?;
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .incoming
                .iter()
                .position(|m| m.reply_serial() == Some(serial));
            if let Some(reply) = found.and_then(|ix| self.incoming.remove(ix)) {
                return Ok(reply);
            }
            if let Some(e) = self.closed_error() {
                return Err(e);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(no_reply(timeout));
            }
            self.read_write(deadline - now)?;
        }
    }

    /// Queues incoming messages, waiting up to `timeout` for the first.
    /// A zero timeout only takes what has already arrived. Once the
    /// connection has closed, this keeps succeeding until the queue is
    /// empty and fails after that.
    fn read_write(&mut self, timeout: Duration) -> Result<()> {
        if self.closed.is_none() && !timeout.is_zero() {
            self.read_one(timeout);
        }
        self.read_ready();
        match self.closed_error() {
            Some(e) if self.incoming.is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    fn pop_message(&mut self) -> Option<Message> {
        self.incoming.pop_front()
    }

    // zbus has written each message by the time `send` returns.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
