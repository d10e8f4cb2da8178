//! The connection façade.
//!
//! A [`Connection`] owns at most one open transport to one bus and turns
//! application-level requests (call this method with these values, add
//! this match rule, take this name) into messages on it. Which transport
//! gets opened is decided by a [`Connector`]: [`BusConnector`] talks to
//! a real bus daemon through zbus, [`MemoryBus`] is an in-process bus for
//! tests.
//!
//! Every operation takes `&mut self`, so a connection serves one call at a
//! time. To share one between threads, put it behind a `Mutex`.
//!
//! [`BusConnector`]: crate::transport::BusConnector
//! [`MemoryBus`]: crate::memory::MemoryBus

use crate::app_value::AppValue;
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use crate::transport::BusConnector;

use bitflags::bitflags;
use log::{debug, error};
use std::fmt;
use std::time::Duration;

/// How long a blocking call waits for its reply unless told otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Error name for calls that got no reply in time.
pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bus {
    Session,
    System,
    /// The bus that started this process through service activation.
    Starter,
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Bus::Session => "session",
            Bus::System => "system",
            Bus::Starter => "starter",
        })
    }
}

bitflags! {
    /// Flags for [`Connection::request_name`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NameFlags: u32 {
        /// Let a later request with `REPLACE_EXISTING` take the name away.
        const ALLOW_REPLACEMENT = 0x1;
        /// Take the name from its owner, if the owner allows it.
        const REPLACE_EXISTING = 0x2;
        /// Fail rather than wait in line for the name.
        const DO_NOT_QUEUE = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl TryFrom<u32> for RequestNameReply {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            other => Err(Error::mismatch("a RequestName reply code", other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl TryFrom<u32> for ReleaseNameReply {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            other => Err(Error::mismatch("a ReleaseName reply code", other.to_string())),
        }
    }
}

/// An open, authenticated link to a bus.
pub trait Transport {
    /// The name the bus assigned to this end of the link.
    fn unique_name(&self) -> &str;

    /// Queues `message` for sending with a fresh serial, which is
    /// returned.
    fn send(&mut self, message: Message) -> Result<u32>;

    /// Sends a method call and waits up to `timeout` for its reply, which
    /// may be an error message. Anything else that arrives meanwhile is
    /// queued for [`Transport::pop_message`]. Running out of time is
    /// reported as an [`Error::Bus`] named [`NO_REPLY`].
    fn send_with_reply_and_block(&mut self, message: Message, timeout: Duration)
        -> Result<Message>;

    /// Moves data in both directions for at most `timeout`.
    fn read_write(&mut self, timeout: Duration) -> Result<()>;

    /// Takes the oldest queued incoming message.
    fn pop_message(&mut self) -> Option<Message>;

    fn flush(&mut self) -> Result<()>;
}

/// Opens transports to buses.
pub trait Connector {
    type Transport: Transport;

    fn open(&self, bus: Bus) -> Result<Self::Transport>;
}

pub(crate) fn no_reply(timeout: Duration) -> Error {
    Error::Bus {
        name: NO_REPLY.to_owned(),
        message: format!("no reply within {:?}", timeout),
    }
}

pub struct Connection<C: Connector = BusConnector> {
    connector: C,
    active: Option<(Bus, C::Transport)>,
    timeout: Duration,
}

impl Default for Connection<BusConnector> {
    fn default() -> Self {
        Connection::new(BusConnector::default())
    }
}

impl<C: Connector> Connection<C> {
    /// A disconnected connection that will open transports with
    /// `connector`.
    pub fn new(connector: C) -> Self {
        Connection {
            connector,
            active: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Connects to `bus`. Does nothing if already connected to it; a
    /// connection to another bus is closed first.
    pub fn connect(&mut self, bus: Bus) -> Result<()> {
        if let Some((current, _)) = &self.active {
            if *current == bus {
                debug!("already connected to the {} bus", bus);
                return Ok(());
            }
            self.disconnect();
        }
        let transport = self.connector.open(bus)?;
        debug!(
            "connected to the {} bus as {}",
            bus,
            transport.unique_name()
        );
        self.active = Some((bus, transport));
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some((bus, mut transport)) = self.active.take() {
            if let Err(e) = transport.flush() {
                error!("flushing the {} bus connection failed: {}", bus, e);
            }
            debug!("disconnected from the {} bus", bus);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    pub fn bus(&self) -> Option<Bus> {
        self.active.as_ref().map(|(bus, _)| *bus)
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|(_, transport)| transport.unique_name())
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn transport(&mut self) -> Result<&mut C::Transport> {
        match &mut self.active {
            Some((_, transport)) => Ok(transport),
            None => Err(Error::Connection("not connected to a bus".to_owned())),
        }
    }

    /// Sends a message without waiting for anything back, for signals and
    /// calls flagged as not expecting a reply. Returns its serial.
    pub fn send(&mut self, message: Message) -> Result<u32> {
        let transport = self.transport()?;
        let serial = transport.send(message)?;
        transport.flush()?;
        Ok(serial)
    }

    /// Sends a method call and waits for the reply, turning error replies
    /// into [`Error::Bus`].
    pub fn call(&mut self, message: Message, timeout: Duration) -> Result<Message> {
        let transport = self.transport()?;
        debug!("calling {}", message);
        let reply = transport.send_with_reply_and_block(message, timeout)?;
        debug!("reply {}", reply);
        if reply.message_type() == MessageType::Error {
            return Err(Error::Bus {
                name: reply.error_name().unwrap_or_default().to_owned(),
                message: reply.error_text().unwrap_or_default(),
            });
        }
        Ok(reply)
    }

    /// Calls `interface.method` on the object at `path` owned by
    /// `destination`, with `args` marshalled against `signature`, and
    /// waits up to the default timeout for the reply.
    pub fn send_with_reply_and_block(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &[AppValue],
        signature: &str,
    ) -> Result<Message> {
        let timeout = self.timeout;
        self.send_with_reply_and_block_timeout(
            destination,
            path,
            interface,
            method,
            args,
            signature,
            timeout,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_with_reply_and_block_timeout(
        &mut self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &[AppValue],
        signature: &str,
        timeout: Duration,
    ) -> Result<Message> {
        self.transport()?;
        let message =
            Message::method_call(destination, path, interface, method).with_args(args, signature)?;
        self.call(message, timeout)
    }

    /// Services the transport without blocking and takes one queued
    /// message, if there is one.
    pub fn pop_message(&mut self) -> Result<Option<Message>> {
        let transport = self.transport()?;
        transport.read_write(Duration::ZERO)?;
        Ok(transport.pop_message())
    }

    fn call_bus(&mut self, method: &str, args: &[AppValue], signature: &str) -> Result<Message> {
        self.send_with_reply_and_block(BUS_NAME, BUS_PATH, BUS_INTERFACE, method, args, signature)
    }

    /// Asks the bus to route messages matching `rule` to this connection.
    pub fn add_match(&mut self, rule: &str) -> Result<()> {
        self.call_bus("AddMatch", &[rule.into()], "s")?;
        Ok(())
    }

    pub fn remove_match(&mut self, rule: &str) -> Result<()> {
        self.call_bus("RemoveMatch", &[rule.into()], "s")?;
        Ok(())
    }

    pub fn request_name(&mut self, name: &str, flags: NameFlags) -> Result<RequestNameReply> {
        let reply = self.call_bus(
            "RequestName",
            &[name.into(), AppValue::uint32(flags.bits())],
            "su",
        )?;
        RequestNameReply::try_from(reply_u32(&reply)?)
    }

    pub fn release_name(&mut self, name: &str) -> Result<ReleaseNameReply> {
        let reply = self.call_bus("ReleaseName", &[name.into()], "s")?;
        ReleaseNameReply::try_from(reply_u32(&reply)?)
    }

    pub fn name_has_owner(&mut self, name: &str) -> Result<bool> {
        let reply = self.call_bus("NameHasOwner", &[name.into()], "s")?;
        reply
            .args()
            .first()
            .and_then(|arg| arg.as_bool())
            .ok_or_else(|| Error::mismatch("b", reply.signature()))
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn reply_u32(reply: &Message) -> Result<u32> {
    reply
        .args()
        .first()
        .and_then(|arg| arg.as_u32())
        .ok_or_else(|| Error::mismatch("u", reply.signature()))
}

#[cfg(test)]
mod tests {
    use super::{Bus, Connection, NameFlags, ReleaseNameReply, RequestNameReply, NO_REPLY};
    use crate::app_value::AppValue;
    use crate::error::{Error, Result};
    use crate::memory::MemoryBus;
    use crate::message::{Message, MessageType};
    use std::time::Duration;
    use test_log::test;

    const ECHO: &str = "org.test.Echo";
    const ECHO_PATH: &str = "/org/test/Echo";

    fn connected(bus: &MemoryBus) -> Result<Connection<MemoryBus>> {
        let mut connection = Connection::new(bus.clone());
        connection.connect(Bus::Session)?;
        Ok(connection)
    }

    fn ping(connection: &mut Connection<MemoryBus>, args: &[AppValue], sig: &str) -> Result<Message> {
        connection.send_with_reply_and_block(ECHO, ECHO_PATH, ECHO, "Ping", args, sig)
    }

    #[test]
    fn echo_round_trip() -> Result<()> {
        let bus = MemoryBus::new();
        bus.serve_echo(ECHO);
        let mut connection = connected(&bus)?;
        let reply = ping(&mut connection, &["hello".into()], "s")?;
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
        assert_eq!(reply.signature(), "s");
        assert_eq!(reply.app_args(), vec![AppValue::from("hello")]);
        assert_eq!(reply.sender(), Some(ECHO));
        Ok(())
    }

    #[test]
    fn not_connected() {
        let bus = MemoryBus::new();
        let mut connection = Connection::new(bus);
        assert!(!connection.is_connected());
        assert!(matches!(
            ping(&mut connection, &["hello".into()], "s"),
            Err(Error::Connection(_))
        ));
        assert!(matches!(connection.add_match("type='signal'"), Err(Error::Connection(_))));
        assert!(matches!(connection.pop_message(), Err(Error::Connection(_))));
        assert!(matches!(
            connection.request_name("org.test.X", NameFlags::empty()),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn connect_is_idempotent() -> Result<()> {
        let bus = MemoryBus::new();
        let mut connection = connected(&bus)?;
        let name = connection.unique_name().map(str::to_owned);
        connection.connect(Bus::Session)?;
        assert_eq!(connection.unique_name().map(str::to_owned), name);

        connection.connect(Bus::System)?;
        assert_eq!(connection.bus(), Some(Bus::System));
        assert_ne!(connection.unique_name().map(str::to_owned), name);

        connection.disconnect();
        assert!(!connection.is_connected());
        assert_eq!(connection.unique_name(), None);
        Ok(())
    }

    #[test]
    fn marshalling_errors_surface() -> Result<()> {
        let bus = MemoryBus::new();
        bus.serve_echo(ECHO);
        let mut connection = connected(&bus)?;
        assert!(matches!(
            ping(&mut connection, &[1.into()], "a{i"),
            Err(Error::InvalidSignature { .. })
        ));
        assert!(matches!(
            ping(&mut connection, &[1.into(), 2.into()], "iii"),
            Err(Error::ArityMismatch { .. })
        ));
        assert!(matches!(
            ping(&mut connection, &[AppValue::Array(vec![1.into(), "x".into()])], "ai"),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            ping(&mut connection, &[AppValue::Object("Node".to_owned())], "v"),
            Err(Error::UnsupportedVariantType(_))
        ));

        // The connection is still usable afterwards.
        let reply = ping(&mut connection, &[AppValue::Array(vec![1.into(), 2.into()])], "ai")?;
        assert_eq!(
            reply.app_args(),
            vec![AppValue::Array(vec![1.into(), 2.into()])]
        );
        Ok(())
    }

    #[test]
    fn error_replies_become_errors() -> Result<()> {
        let bus = MemoryBus::new();
        bus.serve("org.test.Broken", |call: &Message| {
            Some(Message::error(call, "org.test.Error.Broken", "always broken"))
        });
        let mut connection = connected(&bus)?;
        let result = connection.send_with_reply_and_block(
            "org.test.Broken",
            "/",
            "org.test.Broken",
            "Anything",
            &[],
            "",
        );
        match result {
            Err(Error::Bus { name, message }) => {
                assert_eq!(name, "org.test.Error.Broken");
                assert_eq!(message, "always broken");
            }
            other => panic!("expected a bus error, got {:?}", other),
        }

        let unknown = ping(&mut connection, &[], "");
        assert_eq!(
            unknown.err().as_ref().and_then(Error::bus_error_name),
            Some("org.freedesktop.DBus.Error.ServiceUnknown")
        );
        Ok(())
    }

    #[test]
    fn timeout_reports_no_reply() -> Result<()> {
        let bus = MemoryBus::new();
        bus.serve("org.test.Silent", |_: &Message| None);
        let mut connection = connected(&bus)?;
        let result = connection.send_with_reply_and_block_timeout(
            "org.test.Silent",
            "/",
            "org.test.Silent",
            "Wait",
            &[],
            "",
            Duration::from_millis(20),
        );
        assert_eq!(
            result.err().as_ref().and_then(Error::bus_error_name),
            Some(NO_REPLY)
        );
        Ok(())
    }

    #[test]
    fn name_ownership() -> Result<()> {
        let bus = MemoryBus::new();
        let mut first = connected(&bus)?;
        let mut second = connected(&bus)?;

        assert!(!first.name_has_owner("org.test.Name")?);
        assert_eq!(
            first.request_name("org.test.Name", NameFlags::empty())?,
            RequestNameReply::PrimaryOwner
        );
        assert_eq!(
            first.request_name("org.test.Name", NameFlags::empty())?,
            RequestNameReply::AlreadyOwner
        );
        assert!(second.name_has_owner("org.test.Name")?);
        assert_eq!(
            second.request_name("org.test.Name", NameFlags::DO_NOT_QUEUE)?,
            RequestNameReply::Exists
        );
        assert_eq!(
            second.request_name("org.test.Name", NameFlags::empty())?,
            RequestNameReply::InQueue
        );
        assert_eq!(
            second.release_name("org.test.Other")?,
            ReleaseNameReply::NonExistent
        );

        // Releasing hands the name to the next in line.
        assert_eq!(first.release_name("org.test.Name")?, ReleaseNameReply::Released);
        assert_eq!(
            second.request_name("org.test.Name", NameFlags::empty())?,
            RequestNameReply::AlreadyOwner
        );
        assert_eq!(first.release_name("org.test.Name")?, ReleaseNameReply::NotOwner);
        Ok(())
    }

    #[test]
    fn replacing_an_owner() -> Result<()> {
        let bus = MemoryBus::new();
        let mut first = connected(&bus)?;
        let mut second = connected(&bus)?;
        first.request_name("org.test.Name", NameFlags::ALLOW_REPLACEMENT)?;
        assert_eq!(
            second.request_name("org.test.Name", NameFlags::REPLACE_EXISTING)?,
            RequestNameReply::PrimaryOwner
        );
        assert_eq!(
            first.request_name("org.test.Name", NameFlags::DO_NOT_QUEUE)?,
            RequestNameReply::Exists
        );
        Ok(())
    }

    #[test]
    fn pop_filters_by_match_rule() -> Result<()> {
        let bus = MemoryBus::new();
        let mut connection = connected(&bus)?;
        assert!(connection.pop_message()?.is_none());

        connection.add_match("type='signal',interface='org.test.Wanted'")?;
        bus.emit(Message::signal("/a", "org.test.Ignored", "Changed"))?;
        bus.emit(
            Message::signal("/a", "org.test.Wanted", "Changed").with_args(&[3.into()], "i")?,
        )?;

        let popped = connection.pop_message()?.ok_or_else(|| {
            Error::Connection("expected a signal".to_owned())
        })?;
        assert_eq!(popped.interface(), Some("org.test.Wanted"));
        assert_eq!(popped.app_args(), vec![AppValue::Int(3)]);
        assert!(connection.pop_message()?.is_none());

        connection.remove_match("type='signal',interface='org.test.Wanted'")?;
        bus.emit(Message::signal("/a", "org.test.Wanted", "Changed"))?;
        assert!(connection.pop_message()?.is_none());
        assert!(connection.remove_match("type='signal'").is_err());
        Ok(())
    }

    #[test]
    fn signals_between_connections() -> Result<()> {
        let bus = MemoryBus::new();
        let mut listener = connected(&bus)?;
        let mut emitter = connected(&bus)?;
        listener.add_match("type='signal',member='Tick'")?;
        emitter.send(Message::signal("/clock", "org.test.Clock", "Tick"))?;
        let tick = listener.pop_message()?.ok_or_else(|| {
            Error::Connection("expected a signal".to_owned())
        })?;
        assert_eq!(tick.sender(), emitter.unique_name());
        Ok(())
    }

    #[test]
    fn shared_behind_a_mutex() -> Result<()> {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let bus = MemoryBus::new();
        bus.serve_echo(ECHO);
        let connection = Arc::new(Mutex::new(connected(&bus)?));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let connection = Arc::clone(&connection);
                thread::spawn(move || -> Result<Vec<AppValue>> {
                    let mut connection = connection
                        .lock()
                        .map_err(|_| Error::Connection("poisoned".to_owned()))?;
                    Ok(ping(&mut connection, &[i.into()], "i")?.app_args())
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let args = handle
                .join()
                .map_err(|_| Error::Connection("thread panicked".to_owned()))??;
            assert_eq!(args, vec![AppValue::Int(i as i64)]);
        }
        Ok(())
    }
}
