//! An in-process bus.
//!
//! [`MemoryBus`] stands in for a bus daemon: every transport opened on it
//! gets a unique name, can own well-known names, add match rules and
//! exchange messages with the others. Messages are framed with
//! [`Message::to_bytes`] and parsed back on the way through, so they
//! arrive exactly as they would over a socket.
//!
//! Services can also be implemented as plain closures with
//! [`MemoryBus::serve`].

use crate::connection::{
    no_reply, Bus, Connector, NameFlags, ReleaseNameReply, RequestNameReply, Transport, BUS_NAME,
};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};

use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const ERROR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

/// Answers a method call addressed to a served name. Returning `None`
/// leaves the call unanswered.
pub type Handler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// Which messages a connection wants to see beyond those addressed to it.
///
/// Parsed from the bus's textual form, `key='value'` pairs separated by
/// commas. Keys that are left out match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
}

impl MatchRule {
    /// Whether `message` passes the rule. `is_sender` decides whether a
    /// name in the rule refers to the message's sender, so that rules can
    /// use well-known names.
    pub fn matches(&self, message: &Message, is_sender: impl Fn(&str) -> bool) -> bool {
        fn field(rule: &Option<String>, actual: Option<&str>) -> bool {
            rule.as_deref().map_or(true, |want| actual == Some(want))
        }
        if let Some(message_type) = self.message_type {
            if message.message_type() != message_type {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if !is_sender(sender) {
                return false;
            }
        }
        if let Some(namespace) = &self.path_namespace {
            let in_namespace = message.path().map_or(false, |path| {
                namespace == "/"
                    || path == namespace
                    || path
                        .strip_prefix(namespace.as_str())
                        .map_or(false, |rest| rest.starts_with('/'))
            });
            if !in_namespace {
                return false;
            }
        }
        field(&self.interface, message.interface())
            && field(&self.member, message.member())
            && field(&self.path, message.path())
            && field(&self.destination, message.destination())
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Malformed(format!("match rule {:?}: {}", text, reason));
        let mut rule = MatchRule::default();
        let mut rest = text.trim();
        while !rest.is_empty() {
            let eq = rest.find('=').ok_or_else(|| invalid("key without a value"))?;
            let key = rest[..eq].trim();
            rest = &rest[eq + 1..];
            let value = if let Some(quoted) = rest.strip_prefix('\'') {
                let end = quoted.find('\'').ok_or_else(|| invalid("unterminated quote"))?;
                let value = &quoted[..end];
                rest = quoted[end + 1..].trim_start();
                value
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                let value = rest[..end].trim();
                rest = &rest[end..];
                value
            };
            match rest.strip_prefix(',') {
                Some(after) => rest = after.trim_start(),
                None if rest.is_empty() => {}
                None => return Err(invalid("expected a comma")),
            }

            let slot = match key {
                "type" => {
                    let message_type = [
                        MessageType::MethodCall,
                        MessageType::MethodReturn,
                        MessageType::Error,
                        MessageType::Signal,
                    ]
                    .into_iter()
                    .find(|t| t.match_name() == value)
                    .ok_or_else(|| invalid("unknown message type"))?;
                    rule.message_type = Some(message_type);
                    continue;
                }
                "sender" => &mut rule.sender,
                "interface" => &mut rule.interface,
                "member" => &mut rule.member,
                "path" => &mut rule.path,
                "path_namespace" => &mut rule.path_namespace,
                "destination" => &mut rule.destination,
                _ => return Err(invalid("unsupported key")),
            };
            if slot.is_some() {
                return Err(invalid("repeated key"));
            }
            *slot = Some(value.to_owned());
        }
        if rule.path.is_some() && rule.path_namespace.is_some() {
            return Err(invalid("path and path_namespace together"));
        }
        Ok(rule)
    }
}

#[derive(Clone)]
enum Owner {
    Peer(String),
    Service(Handler),
}

impl Owner {
    fn is_peer(&self, unique_name: &str) -> bool {
        matches!(self, Owner::Peer(name) if name == unique_name)
    }
}

struct NameEntry {
    owner: Owner,
    flags: NameFlags,
    queue: VecDeque<(String, NameFlags)>,
}

#[derive(Default)]
struct Peer {
    inbox: VecDeque<Message>,
    rules: Vec<MatchRule>,
}

#[derive(Default)]
struct BusState {
    next_peer: u64,
    serial: u32,
    peers: HashMap<String, Peer>,
    names: HashMap<String, NameEntry>,
}

/// Gives `message` a sender and serial, then sends it through the wire
/// format and back.
fn frame(mut message: Message, sender: &str, serial: u32) -> Result<Message> {
    message.set_sender(sender);
    Message::from_bytes(&message.to_bytes(serial)?)
}

fn reply(call: &Message, args: &[crate::AppValue], signature: &str) -> Message {
    Message::method_return(call)
        .with_args(args, signature)
        .unwrap_or_else(|e| Message::error(call, ERROR_FAILED, &e.to_string()))
}

impl BusState {
    fn register(&mut self) -> String {
        self.next_peer += 1;
        let name = format!(":1.{}", self.next_peer);
        self.peers.insert(name.clone(), Peer::default());
        name
    }

    fn unregister(&mut self, unique_name: &str) {
        self.peers.remove(unique_name);
        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, entry)| entry.owner.is_peer(unique_name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.release_name(&name, unique_name);
        }
        for entry in self.names.values_mut() {
            entry.queue.retain(|(queued, _)| queued != unique_name);
        }
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1).max(1);
        self.serial
    }

    fn owner(&self, name: &str) -> Option<Owner> {
        if name.starts_with(':') {
            self.peers
                .contains_key(name)
                .then(|| Owner::Peer(name.to_owned()))
        } else {
            self.names.get(name).map(|entry| entry.owner.clone())
        }
    }

    fn owner_name(&self, name: &str) -> Option<String> {
        match self.owner(name)? {
            Owner::Peer(unique_name) => Some(unique_name),
            Owner::Service(_) => Some(name.to_owned()),
        }
    }

    fn push(&mut self, unique_name: &str, message: Message) {
        if let Some(peer) = self.peers.get_mut(unique_name) {
            trace!("queueing {} for {}", message, unique_name);
            peer.inbox.push_back(message);
        }
    }

    fn broadcast(&mut self, message: &Message) {
        let sender = message.sender().unwrap_or_default();
        let recipients: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.rules.iter().any(|rule| {
                    rule.matches(message, |name| {
                        name == sender || self.owner_name(name).as_deref() == Some(sender)
                    })
                })
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in recipients {
            self.push(&name, message.clone());
        }
    }

    /// Sends a message from the bus itself.
    fn answer(&mut self, reply: Message) -> Result<()> {
        let serial = self.next_serial();
        let reply = frame(reply, BUS_NAME, serial)?;
        self.dispatch(reply).map(|_| ())
    }

    /// Routes a framed message. Calls to closure-backed services are
    /// handed back, to be run without the lock held.
    fn dispatch(&mut self, message: Message) -> Result<Option<(Handler, Message)>> {
        let destination = match message.destination() {
            None => {
                self.broadcast(&message);
                return Ok(None);
            }
            Some(destination) => destination.to_owned(),
        };
        if destination == BUS_NAME {
            let answer = self.bus_method(&message);
            if message.expects_reply() {
                self.answer(answer)?;
            }
            return Ok(None);
        }
        match self.owner(&destination) {
            Some(Owner::Peer(unique_name)) => {
                self.push(&unique_name, message);
                Ok(None)
            }
            Some(Owner::Service(handler)) => Ok(Some((handler, message))),
            None => {
                debug!("nobody owns {}", destination);
                if message.expects_reply() {
                    let text = format!("the name {} is not owned", destination);
                    self.answer(Message::error(&message, ERROR_SERVICE_UNKNOWN, &text))?;
                }
                Ok(None)
            }
        }
    }

    fn bus_method(&mut self, call: &Message) -> Message {
        let sender = call.sender().unwrap_or_default().to_owned();
        let args = call.app_args();
        let string_arg = |ix: usize| args.get(ix).and_then(|arg| arg.as_str());
        let invalid_args = || {
            Message::error(
                call,
                ERROR_INVALID_ARGS,
                &format!("unexpected arguments of type {:?}", call.signature()),
            )
        };

        if call.interface() == Some("org.freedesktop.DBus.Peer") {
            return match call.member() {
                Some("Ping") => Message::method_return(call),
                _ => Message::error(call, ERROR_UNKNOWN_METHOD, "unknown Peer method"),
            };
        }

        match call.member().unwrap_or_default() {
            "Hello" => reply(call, &[sender.as_str().into()], "s"),
            "RequestName" => {
                let flags = args.get(1).and_then(|arg| arg.as_i64());
                match (string_arg(0), flags) {
                    (Some(name), Some(flags)) if !name.starts_with(':') && !name.is_empty() => {
                        let flags = NameFlags::from_bits_truncate(flags as u32);
                        let result = self.request_name(name, &sender, flags);
                        reply(call, &[crate::AppValue::uint32(result as u32)], "u")
                    }
                    _ => invalid_args(),
                }
            }
            "ReleaseName" => match string_arg(0) {
                Some(name) => {
                    let result = self.release_name(name, &sender);
                    reply(call, &[crate::AppValue::uint32(result as u32)], "u")
                }
                None => invalid_args(),
            },
            "NameHasOwner" => match string_arg(0) {
                Some(name) => reply(call, &[self.owner(name).is_some().into()], "b"),
                None => invalid_args(),
            },
            "GetNameOwner" => match string_arg(0).map(|name| (name, self.owner_name(name))) {
                Some((_, Some(owner))) => reply(call, &[owner.into()], "s"),
                Some((name, None)) => Message::error(
                    call,
                    ERROR_NAME_HAS_NO_OWNER,
                    &format!("the name {} has no owner", name),
                ),
                None => invalid_args(),
            },
            "ListNames" => {
                let mut names: Vec<String> = std::iter::once(BUS_NAME.to_owned())
                    .chain(self.names.keys().cloned())
                    .chain(self.peers.keys().cloned())
                    .collect();
                names.sort();
                let names = names.into_iter().map(Into::into).collect::<Vec<_>>();
                reply(call, &[crate::AppValue::Array(names)], "as")
            }
            "AddMatch" => match string_arg(0).map(MatchRule::from_str) {
                Some(Ok(rule)) => {
                    if let Some(peer) = self.peers.get_mut(&sender) {
                        peer.rules.push(rule);
                    }
                    Message::method_return(call)
                }
                Some(Err(e)) => Message::error(call, ERROR_MATCH_RULE_INVALID, &e.to_string()),
                None => invalid_args(),
            },
            "RemoveMatch" => match string_arg(0).map(MatchRule::from_str) {
                Some(Ok(rule)) => {
                    let rules = self.peers.get_mut(&sender).map(|peer| &mut peer.rules);
                    match rules.and_then(|rules| {
                        let ix = rules.iter().position(|r| *r == rule)?;
                        Some(rules.remove(ix))
                    }) {
                        Some(_) => Message::method_return(call),
                        None => Message::error(call, ERROR_MATCH_RULE_NOT_FOUND, "no such rule"),
                    }
                }
                Some(Err(e)) => Message::error(call, ERROR_MATCH_RULE_INVALID, &e.to_string()),
                None => invalid_args(),
            },
            member => Message::error(
                call,
                ERROR_UNKNOWN_METHOD,
                &format!("the bus has no method {:?}", member),
            ),
        }
    }

    fn request_name(&mut self, name: &str, requester: &str, flags: NameFlags) -> RequestNameReply {
        let entry = match self.names.get_mut(name) {
            Some(entry) => entry,
            None => {
                self.names.insert(
                    name.to_owned(),
                    NameEntry {
                        owner: Owner::Peer(requester.to_owned()),
                        flags,
                        queue: VecDeque::new(),
                    },
                );
                return RequestNameReply::PrimaryOwner;
            }
        };
        if entry.owner.is_peer(requester) {
            entry.flags = flags;
            return RequestNameReply::AlreadyOwner;
        }

        let replaceable = matches!(entry.owner, Owner::Peer(_))
            && entry.flags.contains(NameFlags::ALLOW_REPLACEMENT);
        if replaceable && flags.contains(NameFlags::REPLACE_EXISTING) {
            entry.queue.retain(|(queued, _)| queued != requester);
            let previous = mem::replace(&mut entry.owner, Owner::Peer(requester.to_owned()));
            let previous_flags = mem::replace(&mut entry.flags, flags);
            if let Owner::Peer(previous) = previous {
                if !previous_flags.contains(NameFlags::DO_NOT_QUEUE) {
                    entry.queue.push_front((previous, previous_flags));
                }
            }
            return RequestNameReply::PrimaryOwner;
        }

        if flags.contains(NameFlags::DO_NOT_QUEUE) {
            entry.queue.retain(|(queued, _)| queued != requester);
            return RequestNameReply::Exists;
        }
        match entry.queue.iter_mut().find(|(queued, _)| queued == requester) {
            Some(slot) => slot.1 = flags,
            None => entry.queue.push_back((requester.to_owned(), flags)),
        }
        RequestNameReply::InQueue
    }

    fn release_name(&mut self, name: &str, requester: &str) -> ReleaseNameReply {
        let entry = match self.names.get_mut(name) {
            Some(entry) => entry,
            None => return ReleaseNameReply::NonExistent,
        };
        if entry.owner.is_peer(requester) {
            match entry.queue.pop_front() {
                Some((next, flags)) => {
                    debug!("{} passes from {} to {}", name, requester, next);
                    entry.owner = Owner::Peer(next);
                    entry.flags = flags;
                }
                None => {
                    self.names.remove(name);
                }
            }
            return ReleaseNameReply::Released;
        }
        match entry.queue.iter().position(|(queued, _)| queued == requester) {
            Some(ix) => {
                entry.queue.remove(ix);
                ReleaseNameReply::Released
            }
            None => ReleaseNameReply::NotOwner,
        }
    }
}

struct Shared {
    state: Mutex<BusState>,
    arrived: Condvar,
}

/// A bus living in this process. Clones share the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        MemoryBus::new()
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus").finish_non_exhaustive()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Connection("memory bus lock poisoned".to_owned())
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                arrived: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BusState>> {
        self.shared.state.lock().map_err(poisoned)
    }

    /// Answers method calls addressed to `name` with `handler`. Replaces
    /// whoever owned the name before.
    pub fn serve<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    {
        let entry = NameEntry {
            owner: Owner::Service(Arc::new(handler)),
            flags: NameFlags::empty(),
            queue: VecDeque::new(),
        };
        match self.lock() {
            Ok(mut state) => {
                state.names.insert(name.to_owned(), entry);
            }
            Err(e) => debug!("cannot serve {}: {}", name, e),
        }
    }

    /// Serves `name` with a handler that replies to every call with the
    /// call's own arguments.
    pub fn serve_echo(&self, name: &str) {
        self.serve(name, |call: &Message| {
            Some(Message::method_return(call).with_body(call.body().clone()))
        });
    }

    /// Broadcasts `signal` from the bus to every connection with a
    /// matching rule.
    pub fn emit(&self, signal: Message) -> Result<()> {
        let serial = self.lock()?.next_serial();
        self.route(frame(signal, BUS_NAME, serial)?)
    }

    fn route(&self, message: Message) -> Result<()> {
        debug!("routing {}", message);
        let service = self.lock()?.dispatch(message);
        let service = match service {
            Ok(service) => service,
            Err(e) => {
                self.shared.arrived.notify_all();
                return Err(e);
            }
        };
        if let Some((handler, call)) = service {
            let destination = call.destination().unwrap_or_default().to_owned();
            if let Some(answer) = handler(&call) {
                if call.expects_reply() {
                    let mut state = self.lock()?;
                    let serial = state.next_serial();
                    state.dispatch(frame(answer, &destination, serial)?)?;
                }
            }
        }
        self.shared.arrived.notify_all();
        Ok(())
    }
}

impl Connector for MemoryBus {
    type Transport = MemoryTransport;

    /// All bus kinds share the same in-process bus.
    fn open(&self, bus: Bus) -> Result<MemoryTransport> {
        let unique_name = self.lock()?.register();
        debug!("{} joined the in-process {} bus", unique_name, bus);
        Ok(MemoryTransport {
            bus: self.clone(),
            unique_name,
            serial: 0,
        })
    }
}

/// One connection's end of a [`MemoryBus`].
pub struct MemoryTransport {
    bus: MemoryBus,
    unique_name: String,
    serial: u32,
}

impl MemoryTransport {
    fn take(&self, state: &mut BusState, want: impl Fn(&Message) -> bool) -> Option<Message> {
        let inbox = &mut state.peers.get_mut(&self.unique_name)?.inbox;
        let ix = inbox.iter().position(want)?;
        inbox.remove(ix)
    }
}

impl Transport for MemoryTransport {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn send(&mut self, message: Message) -> Result<u32> {
        self.serial = self.serial.wrapping_add(1).max(1);
        let serial = self.serial;
        self.bus.route(frame(message, &self.unique_name, serial)?)?;
        Ok(serial)
    }

    fn send_with_reply_and_block(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let serial = self.send(message)?;
        let deadline = Instant::now() + timeout;
        let mut state = self.bus.lock()?;
        loop {
            if let Some(reply) = self.take(&mut state, |m| m.reply_serial() == Some(serial)) {
                return Ok(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(no_reply(timeout));
            }
            state = self
                .bus
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map_err(poisoned)?
                .0;
        }
    }

    fn read_write(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.bus.lock()?;
        loop {
            let waiting = state
                .peers
                .get(&self.unique_name)
                .map_or(false, |peer| !peer.inbox.is_empty());
            let now = Instant::now();
            if waiting || now >= deadline {
                return Ok(());
            }
            state = self
                .bus
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map_err(poisoned)?
                .0;
        }
    }

    fn pop_message(&mut self) -> Option<Message> {
        let mut state = self.bus.lock().ok()?;
        self.take(&mut state, |_| true)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.bus.lock() {
            state.unregister(&self.unique_name);
            debug!("{} left the in-process bus", self.unique_name);
        }
        self.bus.shared.arrived.notify_all();
    }
}
