//! Reserved control codes and firmware client identifiers.
//!
//! Only the connect handshake is interpreted by the session itself; every
//! other code is an opaque payload concern forwarded through
//! [`Session::send_control`](crate::Session::send_control).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Control code returning the interface driver version.
pub const HECI_VERSION: u32 = 0x8000_E000;

/// Control code connecting the session to a firmware client.
pub const CLIENT_CONNECT: u32 = 0x8000_E004;

/// Response capacity requested for the connect handshake.
pub const CONNECT_RESPONSE_CAPACITY: usize = 16;

/// Minimum response length carrying the maximum message size.
pub const CONNECT_RESPONSE_MIN: usize = 4;

/// Device interface class under which the host controller is enumerated.
pub const HECI_INTERFACE: Uuid = Uuid::from_u128(0xE2D1FF34_3458_49A9_88DA_8E6915CE9BE5);

/// Identifier of a firmware client (the 16-byte connect payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientGuid(Uuid);

impl ClientGuid {
    /// Active Management Technology host interface.
    pub const AMT: ClientGuid = ClientGuid(Uuid::from_u128(0x12F80028_B4B7_4B2D_ACA8_46E0FF65814C));

    /// Local Manageability Engine service.
    pub const LME: ClientGuid = ClientGuid(Uuid::from_u128(0x6733A4DB_0476_4E7B_B3AF_BCFC29BEE7A7));

    /// Builds an identifier from its 16-byte wire layout.
    pub fn from_wire(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }

    /// The 16-byte wire layout (mixed-endian GUID order) sent to the device.
    pub fn to_wire(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }
}

impl fmt::Display for ClientGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Error returned when a client identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid client identifier: {0}")]
pub struct ParseClientError(String);

impl FromStr for ClientGuid {
    type Err = ParseClientError;

    /// Accepts `amt`, `lme` (case-insensitive) or any UUID string form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amt" => Ok(Self::AMT),
            "lme" => Ok(Self::LME),
            _ => Uuid::parse_str(s)
                .map(Self)
                .map_err(|_| ParseClientError(s.to_string())),
        }
    }
}

impl TryFrom<String> for ClientGuid {
    type Error = ParseClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientGuid> for String {
    fn from(guid: ClientGuid) -> Self {
        guid.to_string()
    }
}

/// Extracts the negotiated maximum message size from a connect response.
///
/// The first four bytes hold an unsigned 32-bit value in native byte order.
/// Returns `None` when the response is shorter than [`CONNECT_RESPONSE_MIN`].
pub fn max_message_size(response: &[u8]) -> Option<u32> {
    let head: [u8; CONNECT_RESPONSE_MIN] = response.get(..CONNECT_RESPONSE_MIN)?.try_into().ok()?;
    Some(u32::from_ne_bytes(head))
}
