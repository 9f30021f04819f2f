pub mod auth;
pub mod encrypter;
pub mod field;
pub mod fingerprint;
pub mod known_hosts;
pub mod scanner;
pub mod ssh_stream;
pub mod wire;

use auth::ClientKey;
use encrypter::Encrypter;
use field::{Field, build_payload};
use known_hosts::KnownHosts;
use rand::Rng;
use rand_core::OsRng;
use ssh_stream::SshStream;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

// Packet Types
/// Indicates a packet intends to disconnect
pub const SSH_MSG_DISCONNECT: u8 = 1;
/// Carries data both sides must silently accept
pub const SSH_MSG_IGNORE: u8 = 2;
/// Reports a message the peer refused to process
pub const SSH_MSG_UNIMPLEMENTED: u8 = 3;
/// Indicates that a packet contains key exchange negotiation info
pub const SSH_MSG_KEXINIT: u8 = 20;

/// Largest packet accepted or produced, length field included
pub const SSH_MAX_PACKET_SIZE: usize = 35000;

/// Disconnect reason sent when the probe shuts a live transport down
pub const SSH_DISCONNECT_BY_APPLICATION: u32 = 11;

/// Identification presented when no override is configured
pub const DEFAULT_CLIENT_ID: &str = "SSH-2.0-enum";

/// Length of the random KEXINIT cookie
const COOKIE_LEN: usize = 16;

/// List of supported key exchange algorithms, most preferred first
const KEX_ALGS: [&str; 3] = [
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

/// List of supported host key verification algorithms
const HOST_KEY_ALGS: [&str; 1] = ["ssh-rsa"];

/// List of all supported encryption algorithms
/// (both server to client and client to server)
const ENCRYPT_ALGS: [&str; 2] = ["aes128-ctr", "aes128-cbc"];

/// List of all supported mac algorithms
/// (both server to client and client to server)
const MAC_ALGS: [&str; 2] = ["hmac-sha2-256", "hmac-sha1"];

/// List of all supported compression algorithms
/// (both server to client and client to server)
const COMPRESS_ALGS: [&str; 1] = ["none"];

/// Everything one username probe needs to know
pub struct ProbeConfig<'a> {
    /// Target hostname or address
    pub host: &'a str,
    /// Target port
    pub port: u16,
    /// Username whose existence is being tested
    pub user: &'a str,
    /// Identification string sent as our banner, without CR LF
    pub client_id: &'a str,
    /// Identity file prefix under the ssh directory
    pub identity_prefix: &'a str,
    /// Directory holding known_hosts and the identity file
    pub ssh_dir: &'a Path,
    /// Timeout applied to connect and every socket operation
    pub timeout: Duration,
}

/// The types of errors a probe or scan can produce
#[derive(Debug)]
pub enum Error {
    /// A socket operation ran out of time
    Timeout,
    /// The peer closed the connection
    Closed,
    /// Any other I/O failure
    Io(io::Error),
    /// The peer broke framing or sent something unparseable
    Protocol(&'static str),
    /// A received packet failed MAC verification
    MacMismatch,
    /// Client and server preference lists do not intersect
    KexNoCommonAlgorithm(&'static str),
    /// The host key modulus is below the minimum size, in bits
    WeakHostKey(usize),
    /// The host signature over the exchange hash did not verify
    HostSignatureInvalid,
    /// A packet type arrived that the current auth state does not allow
    Fsm(u8, u8),
    /// The configuration is unusable
    Config(String),
    /// The peer sent SSH_MSG_DISCONNECT with a reason code and description
    Disconnect(u32, String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Error::Closed,
            _ => Error::Io(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "socket operation timed out"),
            Error::Closed => write!(f, "connection closed by host"),
            Error::Io(err) => write!(f, "{err}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Error::MacMismatch => write!(f, "invalid mac on received packet"),
            Error::KexNoCommonAlgorithm(category) => {
                write!(f, "no common {category} algorithm with server")
            }
            Error::WeakHostKey(bits) => write!(f, "weak host key: {bits} bit modulus"),
            Error::HostSignatureInvalid => write!(f, "host signature did not verify"),
            Error::Fsm(current, received) => write!(
                f,
                "unexpected packet sequence: {current} followed by {received}"
            ),
            Error::Config(msg) => write!(f, "{msg}"),
            Error::Disconnect(reason, text) => {
                write!(f, "received disconnect, reason {reason}: {text}")
            }
        }
    }
}

/// The algorithm picked from each KEXINIT category
pub struct Negotiated {
    pub kex: &'static str,
    pub host_key: &'static str,
    pub enc_cts: &'static str,
    pub enc_stc: &'static str,
    pub mac_cts: &'static str,
    pub mac_stc: &'static str,
    pub comp_cts: &'static str,
    pub comp_stc: &'static str,
}

/// Probes one username on one host.
///
/// Runs the full transport handshake, switches to encrypted framing and
/// drives the userauth oracle. Returns whether an account with that name
/// exists on the target.
pub fn check_user(cfg: &ProbeConfig) -> Result<bool, Error> {
    let mut stream = SshStream::connect(cfg.host, cfg.port, cfg.timeout)?;
    let mut hash_prefix = exchange_versions(&mut stream, cfg.client_id)?;

    // Both KEXINIT payloads go into the exchange hash verbatim
    let client_kexinit = gen_kexinit_payload();
    wire::append_string(&mut hash_prefix, &client_kexinit);
    stream.send_packet(&client_kexinit, None)?;

    let mut server_kexinit = stream.read_until(SSH_MSG_KEXINIT, None)?;
    server_kexinit.insert(0, SSH_MSG_KEXINIT);
    wire::append_string(&mut hash_prefix, &server_kexinit);
    let algs = parse_server_kexinit(&server_kexinit)?;

    let known_hosts = KnownHosts::new(cfg.ssh_dir.join("known_hosts"));
    let (mut encrypter, mut decrypter) =
        encrypter::generate(&mut stream, &algs, hash_prefix, cfg.host, &known_hosts)?;

    let key = ClientKey::load(cfg.ssh_dir, cfg.identity_prefix);
    let result = auth::connection_loop(&mut stream, &mut encrypter, &mut decrypter, cfg.user, &key);

    // Keys are live from NEWKEYS on, so shutdown owes the server a
    // disconnect message; a torn-down socket just ignores it
    let _ = send_disconnect(&mut stream, &mut encrypter);
    tracing::debug!(
        sent = stream.packets_sent(),
        received = stream.packets_received(),
        "session closed"
    );
    result
}

/// Exchanges identification strings and returns the exchange-hash prefix
/// holding both of them, CR LF stripped
fn exchange_versions(stream: &mut SshStream, client_id: &str) -> Result<Vec<u8>, Error> {
    if !client_id.starts_with("SSH-2.0-") || client_id.len() + 2 > 255 {
        return Err(Error::Config(format!(
            "client identification '{client_id}' is not a valid SSH-2.0 banner"
        )));
    }
    stream.send_id_string(client_id)?;

    let server_id = stream.read_server_id()?;
    if !server_id.starts_with("SSH-2.") {
        return Err(Error::Protocol("host is not speaking SSH-2.0"));
    }
    tracing::debug!(server = %server_id, "identification exchanged");

    let mut hash_prefix = Vec::new();
    wire::append_string(&mut hash_prefix, client_id.as_bytes());
    wire::append_string(&mut hash_prefix, server_id.as_bytes());
    Ok(hash_prefix)
}

/// Generates the payload for the ssh key exchange init packet
fn gen_kexinit_payload() -> Vec<u8> {
    let mut payload = vec![SSH_MSG_KEXINIT];

    let mut cookie = [0u8; COOKIE_LEN];
    OsRng.fill(&mut cookie);
    payload.extend(cookie);

    wire::append_name_list(&mut payload, &KEX_ALGS);
    wire::append_name_list(&mut payload, &HOST_KEY_ALGS);
    wire::append_name_list(&mut payload, &ENCRYPT_ALGS);
    wire::append_name_list(&mut payload, &ENCRYPT_ALGS);
    wire::append_name_list(&mut payload, &MAC_ALGS);
    wire::append_name_list(&mut payload, &MAC_ALGS);
    wire::append_name_list(&mut payload, &COMPRESS_ALGS);
    wire::append_name_list(&mut payload, &COMPRESS_ALGS);

    // Two empty language lists, first_kex_packet_follows = 0 and the
    // reserved trailing u32
    payload.extend([0u8; 13]);

    payload
}

/// Parses a full KEXINIT payload (type byte included) and intersects the
/// server's preference lists with ours
fn parse_server_kexinit(payload: &[u8]) -> Result<Negotiated, Error> {
    if payload.len() < 1 + COOKIE_LEN + 11 * 4 + 1 {
        return Err(Error::Protocol("kexinit packet too short"));
    }
    let rest = &payload[1 + COOKIE_LEN..];

    let (kex, rest) = wire::extract_name_list(rest)?;
    let (host_key, rest) = wire::extract_name_list(rest)?;
    let (enc_cts, rest) = wire::extract_name_list(rest)?;
    let (enc_stc, rest) = wire::extract_name_list(rest)?;
    let (mac_cts, rest) = wire::extract_name_list(rest)?;
    let (mac_stc, rest) = wire::extract_name_list(rest)?;
    let (comp_cts, rest) = wire::extract_name_list(rest)?;
    let (comp_stc, rest) = wire::extract_name_list(rest)?;
    // Language lists are not supported
    let (_, rest) = wire::extract_name_list(rest)?;
    let (_, rest) = wire::extract_name_list(rest)?;

    // Only a valid guess would let the server move first, and none of our
    // algorithms allow that
    if rest.first().copied().unwrap_or(1) != 0 {
        return Err(Error::Protocol("unexpected guessed kex packet follows"));
    }

    Ok(Negotiated {
        kex: negotiate_alg(&KEX_ALGS, &kex, "kex")?,
        host_key: negotiate_alg(&HOST_KEY_ALGS, &host_key, "host key")?,
        enc_cts: negotiate_alg(&ENCRYPT_ALGS, &enc_cts, "cipher")?,
        enc_stc: negotiate_alg(&ENCRYPT_ALGS, &enc_stc, "cipher")?,
        mac_cts: negotiate_alg(&MAC_ALGS, &mac_cts, "mac")?,
        mac_stc: negotiate_alg(&MAC_ALGS, &mac_stc, "mac")?,
        comp_cts: negotiate_alg(&COMPRESS_ALGS, &comp_cts, "compression")?,
        comp_stc: negotiate_alg(&COMPRESS_ALGS, &comp_stc, "compression")?,
    })
}

/// Returns the first client-preferred algorithm present in the server list,
/// or fails when the lists do not intersect
fn negotiate_alg(
    client: &[&'static str],
    server: &[String],
    category: &'static str,
) -> Result<&'static str, Error> {
    client
        .iter()
        .find(|alg| server.iter().any(|s| s == *alg))
        .copied()
        .ok_or(Error::KexNoCommonAlgorithm(category))
}

/// Tells the server the application is done and the transport is going away
fn send_disconnect(stream: &mut SshStream, encrypter: &mut Encrypter) -> Result<(), Error> {
    stream.send_packet(
        &build_payload(
            SSH_MSG_DISCONNECT,
            &[
                Field::U32(SSH_DISCONNECT_BY_APPLICATION),
                Field::LenString(b"Closed by client".to_vec()),
                Field::LenString(Vec::new()),
            ],
        ),
        Some(encrypter),
    )
}
