//! Message types exchanged between server and peers.
//!
//! Every message is either built in memory through its constructor or decoded
//! lazily from a packet. Accessors return `Result` because a lazily decoded
//! field is only validated when it is first read.

use crate::binary;
use crate::error::Result;
use crate::object::{ObjectCodec, ObjectView, ObjectWriter, Origin};
use crate::segment::{CacheSegment, FixedField, FixedSlot};
use std::fmt;

/// Wire tag written before every object envelope in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Authenticate = 1,
    MapChange = 2,
    Ping = 3,
    Pong = 4,
    Terminate = 5,
}

impl MessageTag {
    pub const ALL: [MessageTag; 5] = [
        MessageTag::Authenticate,
        MessageTag::MapChange,
        MessageTag::Ping,
        MessageTag::Pong,
        MessageTag::Terminate,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| *tag as u8 == byte)
    }
}

/// Result of verifying a peer's platform authentication ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    #[default]
    Ok,
    UserNotConnectedToSteam,
    NoLicenseOrExpired,
    VacBanned,
    LoggedInElseWhere,
    VacCheckTimedOut,
    AuthTicketCanceled,
    AuthTicketInvalidAlreadyUsed,
    AuthTicketInvalid,
    PublisherIssuedBan,
    Unknown(i32),
}

impl AuthStatus {
    pub fn code(self) -> i32 {
        match self {
            AuthStatus::Ok => 0,
            AuthStatus::UserNotConnectedToSteam => 1,
            AuthStatus::NoLicenseOrExpired => 2,
            AuthStatus::VacBanned => 3,
            AuthStatus::LoggedInElseWhere => 4,
            AuthStatus::VacCheckTimedOut => 5,
            AuthStatus::AuthTicketCanceled => 6,
            AuthStatus::AuthTicketInvalidAlreadyUsed => 7,
            AuthStatus::AuthTicketInvalid => 8,
            AuthStatus::PublisherIssuedBan => 9,
            AuthStatus::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => AuthStatus::Ok,
            1 => AuthStatus::UserNotConnectedToSteam,
            2 => AuthStatus::NoLicenseOrExpired,
            3 => AuthStatus::VacBanned,
            4 => AuthStatus::LoggedInElseWhere,
            5 => AuthStatus::VacCheckTimedOut,
            6 => AuthStatus::AuthTicketCanceled,
            7 => AuthStatus::AuthTicketInvalidAlreadyUsed,
            8 => AuthStatus::AuthTicketInvalid,
            9 => AuthStatus::PublisherIssuedBan,
            other => AuthStatus::Unknown(other),
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStatus::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

impl FixedField for AuthStatus {
    const WIDTH: usize = 4;

    fn read(bytes: &[u8], offset: usize) -> Result<Self> {
        binary::read_i32(bytes, offset).map(AuthStatus::from_code)
    }

    fn write(self, buf: &mut Vec<u8>, offset: usize) -> usize {
        binary::write_i32(buf, offset, self.code())
    }
}

/// Peer asks to be admitted with a platform ticket.
#[derive(Debug, Clone)]
pub struct Authenticate {
    origin: Option<Origin>,
    account_id: FixedSlot<u64>,
    ticket: CacheSegment<Option<Vec<u8>>>,
}

impl Authenticate {
    pub fn new(account_id: u64, ticket: Option<Vec<u8>>) -> Self {
        Self {
            origin: None,
            account_id: FixedSlot::from_value(account_id),
            ticket: CacheSegment::from_value(ticket),
        }
    }

    pub fn account_id(&self) -> Result<u64> {
        self.account_id.get()
    }

    pub fn set_account_id(&mut self, account_id: u64) {
        self.account_id.set(account_id);
    }

    pub fn ticket(&self) -> Result<Option<&[u8]>> {
        self.ticket.get().map(Option::as_deref)
    }

    pub fn set_ticket(&mut self, ticket: Option<Vec<u8>>) {
        self.ticket.set(ticket);
    }
}

impl ObjectCodec for Authenticate {
    const NAME: &'static str = "Authenticate";
    const FIXED_WIDTHS: &'static [usize] = &[8];
    const VARIABLE_COUNT: usize = 1;

    fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn from_view(view: &ObjectView) -> Result<Self> {
        Ok(Self {
            origin: Some(view.origin()),
            account_id: view.fixed(0)?,
            ticket: view.variable(0)?,
        })
    }

    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()> {
        writer.fixed(&self.account_id);
        writer.variable(&self.ticket)
    }
}

impl PartialEq for Authenticate {
    fn eq(&self, other: &Self) -> bool {
        self.account_id() == other.account_id() && self.ticket() == other.ticket()
    }
}

/// Server tells peers which map to load.
#[derive(Debug, Clone)]
pub struct MapChange {
    origin: Option<Origin>,
    map_name: CacheSegment<Option<String>>,
}

impl MapChange {
    pub fn new(map_name: Option<String>) -> Self {
        Self {
            origin: None,
            map_name: CacheSegment::from_value(map_name),
        }
    }

    pub fn map_name(&self) -> Result<Option<&str>> {
        self.map_name.get().map(Option::as_deref)
    }

    pub fn set_map_name(&mut self, map_name: Option<String>) {
        self.map_name.set(map_name);
    }
}

impl ObjectCodec for MapChange {
    const NAME: &'static str = "MapChange";
    const FIXED_WIDTHS: &'static [usize] = &[];
    const VARIABLE_COUNT: usize = 1;

    fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn from_view(view: &ObjectView) -> Result<Self> {
        Ok(Self {
            origin: Some(view.origin()),
            map_name: view.variable(0)?,
        })
    }

    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()> {
        writer.variable(&self.map_name)
    }
}

impl PartialEq for MapChange {
    fn eq(&self, other: &Self) -> bool {
        self.map_name() == other.map_name()
    }
}

/// Heartbeat probe sent by the server.
#[derive(Debug, Clone)]
pub struct Ping {
    origin: Option<Origin>,
    ping_id: FixedSlot<u64>,
}

impl Ping {
    pub fn new(ping_id: u64) -> Self {
        Self {
            origin: None,
            ping_id: FixedSlot::from_value(ping_id),
        }
    }

    pub fn ping_id(&self) -> Result<u64> {
        self.ping_id.get()
    }

    pub fn set_ping_id(&mut self, ping_id: u64) {
        self.ping_id.set(ping_id);
    }
}

impl ObjectCodec for Ping {
    const NAME: &'static str = "Ping";
    const FIXED_WIDTHS: &'static [usize] = &[8];
    const VARIABLE_COUNT: usize = 0;

    fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn from_view(view: &ObjectView) -> Result<Self> {
        Ok(Self {
            origin: Some(view.origin()),
            ping_id: view.fixed(0)?,
        })
    }

    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()> {
        writer.fixed(&self.ping_id);
        Ok(())
    }
}

impl PartialEq for Ping {
    fn eq(&self, other: &Self) -> bool {
        self.ping_id() == other.ping_id()
    }
}

/// Peer's answer to a [`Ping`], echoing its id.
#[derive(Debug, Clone)]
pub struct Pong {
    origin: Option<Origin>,
    ping_id: FixedSlot<u64>,
}

impl Pong {
    pub fn new(ping_id: u64) -> Self {
        Self {
            origin: None,
            ping_id: FixedSlot::from_value(ping_id),
        }
    }

    pub fn ping_id(&self) -> Result<u64> {
        self.ping_id.get()
    }

    pub fn set_ping_id(&mut self, ping_id: u64) {
        self.ping_id.set(ping_id);
    }
}

impl ObjectCodec for Pong {
    const NAME: &'static str = "Pong";
    const FIXED_WIDTHS: &'static [usize] = &[8];
    const VARIABLE_COUNT: usize = 0;

    fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn from_view(view: &ObjectView) -> Result<Self> {
        Ok(Self {
            origin: Some(view.origin()),
            ping_id: view.fixed(0)?,
        })
    }

    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()> {
        writer.fixed(&self.ping_id);
        Ok(())
    }
}

impl PartialEq for Pong {
    fn eq(&self, other: &Self) -> bool {
        self.ping_id() == other.ping_id()
    }
}

/// Sent right before the server drops a peer. Carries either a free-text
/// reason or an authentication failure, never both.
#[derive(Debug, Clone)]
pub struct Terminate {
    origin: Option<Origin>,
    reason: CacheSegment<Option<String>>,
    auth_failure: FixedSlot<AuthStatus>,
}

impl Terminate {
    pub fn new(reason: Option<String>, auth_failure: AuthStatus) -> Self {
        Self {
            origin: None,
            reason: CacheSegment::from_value(reason),
            auth_failure: FixedSlot::from_value(auth_failure),
        }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self::new(Some(reason.into()), AuthStatus::Ok)
    }

    pub fn with_auth_failure(status: AuthStatus) -> Self {
        Self::new(None, status)
    }

    pub fn reason(&self) -> Result<Option<&str>> {
        self.reason.get().map(Option::as_deref)
    }

    pub fn set_reason(&mut self, reason: Option<String>) {
        self.reason.set(reason);
    }

    pub fn auth_failure(&self) -> Result<AuthStatus> {
        self.auth_failure.get()
    }

    pub fn set_auth_failure(&mut self, status: AuthStatus) {
        self.auth_failure.set(status);
    }
}

impl ObjectCodec for Terminate {
    const NAME: &'static str = "Terminate";
    const FIXED_WIDTHS: &'static [usize] = &[4];
    const VARIABLE_COUNT: usize = 1;

    fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn from_view(view: &ObjectView) -> Result<Self> {
        Ok(Self {
            origin: Some(view.origin()),
            reason: view.variable(0)?,
            auth_failure: view.fixed(0)?,
        })
    }

    fn write_fields(&self, writer: &mut ObjectWriter<'_>) -> Result<()> {
        writer.variable(&self.reason)?;
        writer.fixed(&self.auth_failure);
        Ok(())
    }
}

impl PartialEq for Terminate {
    fn eq(&self, other: &Self) -> bool {
        self.reason() == other.reason() && self.auth_failure() == other.auth_failure()
    }
}

/// Every message the protocol knows.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Authenticate(Authenticate),
    MapChange(MapChange),
    Ping(Ping),
    Pong(Pong),
    Terminate(Terminate),
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Authenticate(_) => MessageTag::Authenticate,
            Message::MapChange(_) => MessageTag::MapChange,
            Message::Ping(_) => MessageTag::Ping,
            Message::Pong(_) => MessageTag::Pong,
            Message::Terminate(_) => MessageTag::Terminate,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Authenticate(_) => Authenticate::NAME,
            Message::MapChange(_) => MapChange::NAME,
            Message::Ping(_) => Ping::NAME,
            Message::Pong(_) => Pong::NAME,
            Message::Terminate(_) => Terminate::NAME,
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Message::Authenticate(m) => m.is_dirty(),
            Message::MapChange(m) => m.is_dirty(),
            Message::Ping(m) => m.is_dirty(),
            Message::Pong(m) => m.is_dirty(),
            Message::Terminate(m) => m.is_dirty(),
        }
    }
}

/// Ties a message struct to its tag and its [`Message`] variant.
pub trait Payload: ObjectCodec {
    const TAG: MessageTag;

    fn wrap(self) -> Message;

    fn peel(message: &Message) -> Option<&Self>;
}

macro_rules! payload {
    ($ty:ident) => {
        impl Payload for $ty {
            const TAG: MessageTag = MessageTag::$ty;

            fn wrap(self) -> Message {
                Message::$ty(self)
            }

            fn peel(message: &Message) -> Option<&Self> {
                match message {
                    Message::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Message {
            fn from(value: $ty) -> Self {
                Message::$ty(value)
            }
        }
    };
}

payload!(Authenticate);
payload!(MapChange);
payload!(Ping);
payload!(Pong);
payload!(Terminate);
