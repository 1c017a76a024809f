use std::fmt;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt};

/// Transport-level errors occur when a peer violates the protocol specification
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportError {
    /// Type of error
    pub code: Code,
    /// Human-readable explanation of the reason
    pub reason: String,
}

impl TransportError {
    /// An error reported by the cryptographic handshake, carried in the
    /// reserved alert range
    #[allow(unused)]
    pub(crate) fn crypto(alert: u8, reason: impl Into<String>) -> Self {
        Self {
            code: Code::crypto(alert),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

/// Transport-level error code, as carried by CONNECTION_CLOSE frames
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(u16);

impl Code {
    /// Error code indicating that the cryptographic handshake failed with the given TLS alert
    pub fn crypto(alert: u8) -> Self {
        Code(0x100 | u16::from(alert))
    }
}

impl From<Code> for u16 {
    fn from(x: Code) -> u16 {
        x.0
    }
}

impl coding::Codec for Code {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Code(buf.get::<u16>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u16>(self.0)
    }
}

macro_rules! errors {
    {$($name:ident($val:expr) $desc:expr;)*} => {
        impl TransportError {
            $(
                #[doc = $desc]
                #[allow(non_snake_case, unused)]
                pub(crate) fn $name<T>(reason: T) -> Self where T: Into<String> {
                    Self {
                        code: Code::$name,
                        reason: reason.into(),
                    }
                }
            )*
        }

        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code($val);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x100..0x200).contains(&x) => write!(f, "Code::crypto({:02x})", self.0 as u8),
                    _ => write!(f, "Code({:04x})", self.0),
                }
            }
        }

        impl fmt::Display for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let x = match self.0 {
                    $($val => $desc,)*
                    _ if self.0 >= 0x100 && self.0 < 0x200 => "the cryptographic handshake failed",
                    _ => "unknown error",
                };
                f.write_str(x)
            }
        }
    }
}

errors! {
    NO_ERROR(0x0) "the connection is being closed abruptly in the absence of any error";
    INTERNAL_ERROR(0x1) "the endpoint encountered an internal error and cannot continue with the connection";
    SERVER_BUSY(0x2) "the server is currently busy and does not accept any new connections";
    FLOW_CONTROL_ERROR(0x3) "an endpoint received more data than it permitted in its advertised data limits";
    STREAM_ID_ERROR(0x4) "an endpoint received a frame for a stream identifier that exceeded its advertised maximum stream ID";
    STREAM_STATE_ERROR(0x5) "an endpoint received a frame for a stream that was not in a state that permitted that frame";
    FINAL_OFFSET_ERROR(0x6) "an endpoint received a STREAM frame containing data that exceeded the previously established final offset, or a RST_STREAM frame containing a different final offset to the one already established";
    FRAME_ENCODING_ERROR(0x7) "an endpoint received a frame that was badly formatted";
    TRANSPORT_PARAMETER_ERROR(0x8) "an endpoint received transport parameters that were badly formatted, included an invalid value, omitted a mandatory parameter, or included a forbidden parameter";
    VERSION_NEGOTIATION_ERROR(0x9) "an endpoint received transport parameters that disagreed with the version negotiation it performed, constituting a potential version downgrade attack";
    PROTOCOL_VIOLATION(0xA) "an endpoint detected an error with protocol compliance that was not covered by more specific error codes";
}
