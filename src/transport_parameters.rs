use std::{
    mem,
    net::{IpAddr, SocketAddr},
};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt},
    config::TransportConfig,
    shared::{ConnectionId, ResetToken},
    Side, TransportError, MAX_CID_SIZE, MIN_CID_SIZE, RESET_TOKEN_SIZE, VERSION,
};

// Apply a given macro to the list of all transport parameters having simple
// integer types, with their codes, widths, and defaults. Decoding, encoding,
// and the `Default` impl are each generated from this single table.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // name (id): type = default,
            initial_max_stream_data_bidi_local(0x0000): u32 = 0,
            initial_max_data(0x0001): u32 = 0,
            initial_max_bidi_streams(0x0002): u16 = 0,
            idle_timeout(0x0003): u16 = 0,
            max_packet_size(0x0005): u16 = 65527,
            ack_delay_exponent(0x0007): u8 = 3,
            initial_max_uni_streams(0x0008): u16 = 0,
            initial_max_stream_data_bidi_remote(0x000a): u32 = 0,
            initial_max_stream_data_uni(0x000b): u32 = 0,
            max_ack_delay(0x000c): u8 = 25,
        }
    };
}

macro_rules! make_struct {
    {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
        /// Parameters governing a connection's transport behavior, exchanged
        /// once during the handshake
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $(pub $name : $ty,)*

            /// The endpoint will not move between network paths
            pub disable_migration: bool,

            /// Sent only by servers that issued a Retry, echoing the client's first DCID
            pub original_connection_id: Option<ConnectionId>,
            /// Token used by the client to detect a stateless reset from the server
            pub stateless_reset_token: Option<ResetToken>,
            /// Alternative address offered by the server
            pub preferred_address: Option<PreferredAddress>,
        }

        impl Default for TransportParameters {
            /// Standard defaults, used if the peer does not supply a given parameter.
            fn default() -> Self {
                Self {
                    $($name: $default,)*

                    disable_migration: false,
                    original_connection_id: None,
                    stateless_reset_token: None,
                    preferred_address: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    pub(crate) fn new(config: &TransportConfig) -> Self {
        TransportParameters {
            initial_max_bidi_streams: config.stream_window_bidi as u16,
            initial_max_uni_streams: config.stream_window_uni as u16,
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            idle_timeout: config.idle_timeout,
            ..Self::default()
        }
    }
}

/// An alternative address offered by a server, with credentials to use it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PreferredAddress {
    pub(crate) address: SocketAddr,
    pub(crate) connection_id: ConnectionId,
    pub(crate) stateless_reset_token: [u8; RESET_TOKEN_SIZE],
}

impl PreferredAddress {
    fn wire_size(&self) -> u16 {
        let ip_len = match self.address {
            SocketAddr::V4(_) => 4,
            SocketAddr::V6(_) => 16,
        };
        2 + ip_len + 3 + self.connection_id.len() as u16 + RESET_TOKEN_SIZE as u16
    }

    fn write<W: BufMut>(&self, w: &mut W) {
        match self.address {
            SocketAddr::V4(ref x) => {
                w.write::<u8>(4);
                w.write::<u8>(4);
                w.put_slice(&x.ip().octets());
            }
            SocketAddr::V6(ref x) => {
                w.write::<u8>(6);
                w.write::<u8>(16);
                w.put_slice(&x.ip().octets());
            }
        }
        w.write::<u16>(self.address.port());
        w.write::<u8>(self.connection_id.len() as u8);
        w.put_slice(&self.connection_id);
        w.put_slice(&self.stateless_reset_token);
    }

    fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        let ip_ver = r.get::<u8>().map_err(|_| Error::Malformed)?;
        let ip_len = r.get::<u8>().map_err(|_| Error::Malformed)?;
        if r.remaining() < ip_len as usize {
            return Err(Error::Malformed);
        }
        let ip = match (ip_ver, ip_len) {
            (4, 4) => {
                let mut bytes = [0; 4];
                r.copy_to_slice(&mut bytes);
                IpAddr::V4(bytes.into())
            }
            (6, 16) => {
                let mut bytes = [0; 16];
                r.copy_to_slice(&mut bytes);
                IpAddr::V6(bytes.into())
            }
            _ => {
                return Err(Error::Malformed);
            }
        };
        if r.remaining() < 3 {
            return Err(Error::Malformed);
        }
        let port = r.get::<u16>().unwrap();
        let cid_len = r.get::<u8>().unwrap() as usize;
        if r.remaining() < cid_len
            || (cid_len != 0 && !(MIN_CID_SIZE..=MAX_CID_SIZE).contains(&cid_len))
        {
            return Err(Error::Malformed);
        }
        let mut stage = [0; MAX_CID_SIZE];
        r.copy_to_slice(&mut stage[..cid_len]);
        let cid = ConnectionId::new(&stage[..cid_len]);
        if r.remaining() < RESET_TOKEN_SIZE {
            return Err(Error::Malformed);
        }
        let mut token = [0; RESET_TOKEN_SIZE];
        r.copy_to_slice(&mut token);
        Ok(Self {
            address: SocketAddr::new(ip, port),
            connection_id: cid,
            stateless_reset_token: token,
        })
    }
}

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Version negotiation was tampered with
    #[error("version negotiation was tampered with")]
    VersionNegotiation,
    /// A parameter had an illegal value
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Parameters were malformed
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::VersionNegotiation => TransportError::VERSION_NEGOTIATION_ERROR(""),
            Error::IllegalValue | Error::Malformed => {
                TransportError::TRANSPORT_PARAMETER_ERROR("")
            }
        }
    }
}

// Reserved version advertised to exercise peers' version negotiation handling
const RESERVED_VERSION: u32 = 0x0a1a_2a3a;

macro_rules! param_state {
    {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
        #[derive(Default)]
        struct ParamState {
            $($name: bool,)*
        }
    }
}
apply_params!(param_state);

impl TransportParameters {
    /// Encode `self` as carried in the handshake extension written by `side`
    pub fn write<W: BufMut>(&self, side: Side, w: &mut W) {
        match side {
            Side::Client => {
                w.write::<u32>(VERSION); // Initially requested version
            }
            Side::Server => {
                w.write::<u32>(VERSION); // Negotiated version
                w.write::<u8>(8); // Bytes of supported versions
                w.write::<u32>(RESERVED_VERSION);
                w.write::<u32>(VERSION);
            }
        }

        let mut buf = Vec::new();

        macro_rules! write_params {
            {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
                $(
                    if self.$name != $default {
                        buf.write::<u16>($code);
                        buf.write::<u16>(mem::size_of::<$ty>() as u16);
                        buf.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if self.disable_migration {
            buf.write::<u16>(0x0009);
            buf.write::<u16>(0);
        }

        if side.is_server() {
            if let Some(ref x) = self.original_connection_id {
                buf.write::<u16>(0x000d);
                buf.write::<u16>(x.len() as u16);
                buf.put_slice(x);
            }
            if let Some(ref x) = self.stateless_reset_token {
                buf.write::<u16>(0x0006);
                buf.write::<u16>(RESET_TOKEN_SIZE as u16);
                buf.put_slice(x);
            }
            if let Some(ref x) = self.preferred_address {
                buf.write::<u16>(0x0004);
                buf.write::<u16>(x.wire_size());
                x.write(&mut buf);
            }
        }

        w.write::<u16>(buf.len() as u16);
        w.put_slice(&buf);
    }

    /// Decode parameters written by `side`
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        match side {
            Side::Client => {
                if r.remaining() < 6 {
                    return Err(Error::Malformed);
                }
                // We only support one version, so there is no validation to do here.
                r.get::<u32>().unwrap();
            }
            Side::Server => {
                if r.remaining() < 11 {
                    return Err(Error::Malformed);
                }
                let negotiated = r.get::<u32>().unwrap();
                if negotiated != VERSION {
                    return Err(Error::VersionNegotiation);
                }
                let supported_bytes = r.get::<u8>().unwrap();
                if supported_bytes < 4 || supported_bytes > 252 || supported_bytes % 4 != 0 {
                    return Err(Error::Malformed);
                }
                if r.remaining() < supported_bytes as usize {
                    return Err(Error::Malformed);
                }
                let mut found = false;
                for _ in 0..(supported_bytes / 4) {
                    found |= r.get::<u32>().unwrap() == negotiated;
                }
                if !found {
                    return Err(Error::VersionNegotiation);
                }
            }
        }

        let params_len = r.get::<u16>().map_err(|_| Error::Malformed)? as usize;
        if params_len != r.remaining() {
            return Err(Error::Malformed);
        }

        let mut params = TransportParameters::default();
        let mut got = ParamState::default();

        while r.has_remaining() {
            if r.remaining() < 4 {
                return Err(Error::Malformed);
            }
            let id = r.get::<u16>().unwrap();
            let len = r.get::<u16>().unwrap();
            if r.remaining() < len as usize {
                return Err(Error::Malformed);
            }

            match id {
                0x0004 => {
                    if side.is_client() || params.preferred_address.is_some() {
                        return Err(Error::Malformed);
                    }
                    let mut take = r.take(len as usize);
                    params.preferred_address = Some(PreferredAddress::read(&mut take)?);
                    if take.has_remaining() {
                        return Err(Error::Malformed);
                    }
                }
                0x0006 => {
                    if side.is_client()
                        || len != RESET_TOKEN_SIZE as u16
                        || params.stateless_reset_token.is_some()
                    {
                        return Err(Error::Malformed);
                    }
                    let mut tok = [0; RESET_TOKEN_SIZE];
                    r.copy_to_slice(&mut tok);
                    params.stateless_reset_token = Some(tok.into());
                }
                0x0009 => {
                    if len != 0 || params.disable_migration {
                        return Err(Error::Malformed);
                    }
                    params.disable_migration = true;
                }
                0x000d => {
                    if side.is_client()
                        || !(MIN_CID_SIZE as u16..=MAX_CID_SIZE as u16).contains(&len)
                        || params.original_connection_id.is_some()
                    {
                        return Err(Error::Malformed);
                    }
                    let mut staging = [0; MAX_CID_SIZE];
                    r.copy_to_slice(&mut staging[..len as usize]);
                    params.original_connection_id =
                        Some(ConnectionId::new(&staging[..len as usize]));
                }
                _ => {
                    macro_rules! parse {
                        {$($name:ident ($code:expr) : $ty:ty = $default:expr,)*} => {
                            match id {
                                $($code => {
                                    if len != mem::size_of::<$ty>() as u16 || got.$name {
                                        return Err(Error::Malformed);
                                    }
                                    params.$name = r.get().unwrap();
                                    got.$name = true;
                                })*
                                _ => r.advance(len as usize),
                            }
                        }
                    }
                    apply_params!(parse);
                }
            }
        }

        if params.ack_delay_exponent > 20 {
            return Err(Error::IllegalValue);
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn roundtrip(side: Side, params: TransportParameters) {
        let mut buf = Vec::new();
        params.write(side, &mut buf);
        assert_eq!(
            TransportParameters::read(side, &mut io::Cursor::new(&buf)).unwrap(),
            params
        );
    }

    #[test]
    fn coding() {
        let client = TransportParameters {
            initial_max_data: 42,
            initial_max_stream_data_bidi_local: 10,
            initial_max_bidi_streams: 16,
            idle_timeout: 30,
            ..TransportParameters::default()
        };
        roundtrip(Side::Client, client);

        let server = TransportParameters {
            initial_max_data: 420,
            initial_max_uni_streams: 8,
            disable_migration: true,
            stateless_reset_token: Some([0xab; RESET_TOKEN_SIZE].into()),
            original_connection_id: Some(ConnectionId::new(&[0x42; 8])),
            preferred_address: Some(PreferredAddress {
                address: SocketAddr::new(IpAddr::V4([127, 0, 0, 1].into()), 42),
                connection_id: ConnectionId::new(&[]),
                stateless_reset_token: [0xab; RESET_TOKEN_SIZE],
            }),
            ..TransportParameters::default()
        };
        roundtrip(Side::Server, server);
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let params = TransportParameters {
            initial_max_data: 42,
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(Side::Client, &mut buf);
        // Append a second copy of the INITIAL_MAX_DATA entry and fix up the
        // declared length
        let base = buf.len();
        buf.write::<u16>(0x0001);
        buf.write::<u16>(4);
        buf.write::<u32>(43);
        let added = (buf.len() - base) as u16;
        let len_pos = 4;
        let old = u16::from_be_bytes([buf[len_pos], buf[len_pos + 1]]);
        buf[len_pos..len_pos + 2].copy_from_slice(&(old + added).to_be_bytes());
        assert_eq!(
            TransportParameters::read(Side::Client, &mut io::Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_parameter_ignored() {
        let params = TransportParameters::default();
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        let mut body = Vec::new();
        body.write::<u16>(0x7fff);
        body.write::<u16>(3);
        body.put_slice(&[1, 2, 3]);
        buf.write::<u16>(body.len() as u16);
        buf.put_slice(&body);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut io::Cursor::new(&buf)).unwrap(),
            params
        );
    }

    #[test]
    fn server_only_parameter_rejected_from_client() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        let mut body = Vec::new();
        body.write::<u16>(0x0006);
        body.write::<u16>(RESET_TOKEN_SIZE as u16);
        body.put_slice(&[0; RESET_TOKEN_SIZE]);
        buf.write::<u16>(body.len() as u16);
        buf.put_slice(&body);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut io::Cursor::new(&buf)),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn bogus_version_list_rejected() {
        let mut buf = Vec::new();
        buf.write::<u32>(VERSION);
        buf.write::<u8>(4);
        buf.write::<u32>(RESERVED_VERSION); // negotiated version not in list
        buf.write::<u16>(0);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut io::Cursor::new(&buf)),
            Err(Error::VersionNegotiation)
        );
    }
}
