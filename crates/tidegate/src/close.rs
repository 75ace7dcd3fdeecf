//! WebSocket close status codes, RFC 6455 Section 7.4.

/// Status code carried in the first two bytes of a Close frame payload.
///
/// A thin wrapper around the raw registry value, so any code a peer sends —
/// assigned, reserved, or out of range — survives a round trip unchanged
/// when it is echoed back. The associated constants name the codes assigned
/// by RFC 6455 Section 7.4.1; the server itself only ever emits
/// [`NORMAL`](Self::NORMAL), [`GOING_AWAY`](Self::GOING_AWAY),
/// [`PROTOCOL_ERROR`](Self::PROTOCOL_ERROR) and
/// [`MESSAGE_TOO_BIG`](Self::MESSAGE_TOO_BIG).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(u16);

impl CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    pub const NORMAL: Self = Self(1000);
    /// 1001, the endpoint is going away (server shutdown, page navigation).
    pub const GOING_AWAY: Self = Self(1001);
    /// 1002, a WebSocket protocol violation was detected.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// 1003, the endpoint cannot accept the kind of data it received.
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// 1005, reserved: no status code was present in the close frame.
    pub const NO_STATUS: Self = Self(1005);
    /// 1006, reserved: the connection dropped without a close frame.
    pub const ABNORMAL: Self = Self(1006);
    /// 1007, the message data was inconsistent with its type.
    pub const INVALID_PAYLOAD: Self = Self(1007);
    /// 1008, a policy violation with no more specific code.
    pub const POLICY_VIOLATION: Self = Self(1008);
    /// 1009, the message is too large to process.
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    /// 1010, the client required an extension the server did not offer.
    pub const EXTENSION_REQUIRED: Self = Self(1010);
    /// 1011, the server hit an unexpected internal condition.
    pub const INTERNAL_ERROR: Self = Self(1011);
    /// 1012, the server is restarting.
    pub const SERVICE_RESTART: Self = Self(1012);
    /// 1013, try again later.
    pub const TRY_AGAIN_LATER: Self = Self(1013);
    /// 1015, reserved: TLS handshake failure.
    pub const TLS_HANDSHAKE: Self = Self(1015);

    /// The raw registry value.
    pub fn code(self) -> u16 {
        self.0
    }

    /// Whether an endpoint may legally put this code on the wire.
    ///
    /// Rules out the reserved markers (1004..=1006, 1015), the unassigned
    /// stretch up to 2999, and everything below 1000 or above 4999.
    /// IANA-registered (3000..=3999) and private-use (4000..=4999) codes
    /// pass.
    pub fn is_allowed(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        CloseCode(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.0
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
