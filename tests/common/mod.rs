//! Minimal scripted SSH server used to drive the client end to end.

use rand::Rng;
use rand_core::OsRng;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey};
use sha1::Sha1;
use sshenum::auth::{
    SSH_MSG_CHANNEL_OPEN, SSH_MSG_CHANNEL_OPEN_CONFIRMATION, SSH_MSG_CHANNEL_REQUEST,
    SSH_MSG_SERVICE_ACCEPT, SSH_MSG_SERVICE_REQUEST, SSH_MSG_USERAUTH_FAILURE,
    SSH_MSG_USERAUTH_INFO_REQUEST, SSH_MSG_USERAUTH_REQUEST, SSH_MSG_USERAUTH_SUCCESS,
};
use sshenum::encrypter::{
    Decrypter, Encrypter, SSH_MSG_KEXDH_INIT, SSH_MSG_KEXDH_REPLY, SSH_MSG_NEWKEYS, derive_key,
    dh_group,
};
use sshenum::field::{Field, build_payload};
use sshenum::ssh_stream::SshStream;
use sshenum::{Error, SSH_MSG_KEXINIT, wire};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const SERVER_ID: &str = "SSH-2.0-MockServer_1.0";

/// How the scripted server treats the authentication attempt
#[derive(Clone, Copy)]
pub enum Script {
    /// USERAUTH_FAILURE straight away: the user does not exist
    AbsentUser,
    /// USERAUTH_INFO_REQUEST, then hang up: the user exists
    PresentUser,
    /// Full success: info-request, success, channel open, shell request
    SuccessChannel,
    /// Corrupt the MAC key so the first encrypted reply fails verification
    TamperMac,
}

/// Algorithms the server offers, one per category to pin the negotiation
#[derive(Clone, Copy)]
pub struct Suite {
    pub kex: &'static str,
    pub enc: &'static str,
    pub mac: &'static str,
}

impl Default for Suite {
    fn default() -> Self {
        Suite {
            kex: "diffie-hellman-group14-sha1",
            enc: "aes128-ctr",
            mac: "hmac-sha2-256",
        }
    }
}

pub fn rsa_key(bits: usize) -> RsaPrivateKey {
    RsaPrivateKey::new(&mut OsRng, bits).expect("test host key generates")
}

/// Starts a one-connection server and returns its port and join handle
pub fn spawn_server(script: Script, suite: Suite, key: RsaPrivateKey) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        // The client tearing the connection down early is part of several
        // scripts, so transport errors end the session silently
        let _ = serve(socket, script, suite, key);
    });
    (port, handle)
}

fn mac_key_len(mac: &str) -> usize {
    match mac {
        "hmac-sha2-256" => 32,
        _ => 20,
    }
}

fn serve(socket: TcpStream, script: Script, suite: Suite, key: RsaPrivateKey) -> Result<(), Error> {
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    socket.set_write_timeout(Some(Duration::from_secs(5)))?;
    let mut stream = SshStream::new(socket);

    // Identification exchange, client first
    let client_id = stream.read_id_line()?;
    assert!(client_id.starts_with("SSH-2.0-"));
    stream.send_id_string(SERVER_ID)?;

    // KEXINIT both ways
    let (msg_type, client_kexinit) = stream.read_packet(None)?;
    assert_eq!(msg_type, SSH_MSG_KEXINIT);
    let mut client_kexinit_full = vec![SSH_MSG_KEXINIT];
    client_kexinit_full.extend(&client_kexinit);
    let server_kexinit = kexinit_payload(&suite);
    stream.send_packet(&server_kexinit, None)?;

    // Diffie-Hellman reply with our host key and signature over H
    let (msg_type, dh_init) = stream.read_packet(None)?;
    assert_eq!(msg_type, SSH_MSG_KEXDH_INIT);
    let (client_public, _) = wire::extract_mpint(&dh_init)?;

    let (prime, generator, hash) = dh_group(suite.kex)?;
    let mut secret_bytes = [0u8; 32];
    OsRng.fill(&mut secret_bytes);
    let secret = BigUint::from_bytes_be(&secret_bytes);
    let server_public = generator.modpow(&secret, &prime);
    let shared = client_public.modpow(&secret, &prime);

    let mut host_key_blob = Vec::new();
    wire::append_string(&mut host_key_blob, b"ssh-rsa");
    wire::append_mpint(&mut host_key_blob, key.e());
    wire::append_mpint(&mut host_key_blob, key.n());

    let mut hash_buffer = Vec::new();
    wire::append_string(&mut hash_buffer, client_id.as_bytes());
    wire::append_string(&mut hash_buffer, SERVER_ID.as_bytes());
    wire::append_string(&mut hash_buffer, &client_kexinit_full);
    wire::append_string(&mut hash_buffer, &server_kexinit);
    wire::append_string(&mut hash_buffer, &host_key_blob);
    wire::append_mpint(&mut hash_buffer, &client_public);
    wire::append_mpint(&mut hash_buffer, &server_public);
    wire::append_mpint(&mut hash_buffer, &shared);
    let exchange_hash = hash.digest(&hash_buffer);

    let signature = SigningKey::<Sha1>::new(key).sign(&exchange_hash).to_vec();
    stream.send_packet(
        &build_payload(
            SSH_MSG_KEXDH_REPLY,
            &[
                Field::LenString(host_key_blob),
                Field::Bignum(server_public),
                Field::Group(vec![
                    Field::LenString(b"ssh-rsa".to_vec()),
                    Field::LenString(signature),
                ]),
            ],
        ),
        None,
    )?;
    stream.send_packet(&[SSH_MSG_NEWKEYS], None)?;
    stream.read_until(SSH_MSG_NEWKEYS, None)?;

    // Server-side key derivation mirrors the client with letters swapped
    let mac_len = mac_key_len(suite.mac);
    let iv_stc = derive_key(&shared, &exchange_hash, b'B', &exchange_hash, &hash, 16);
    let iv_cts = derive_key(&shared, &exchange_hash, b'A', &exchange_hash, &hash, 16);
    let key_stc = derive_key(&shared, &exchange_hash, b'D', &exchange_hash, &hash, 16);
    let key_cts = derive_key(&shared, &exchange_hash, b'C', &exchange_hash, &hash, 16);
    let mut mac_stc = derive_key(&shared, &exchange_hash, b'F', &exchange_hash, &hash, mac_len);
    let mac_cts = derive_key(&shared, &exchange_hash, b'E', &exchange_hash, &hash, mac_len);

    if let Script::TamperMac = script {
        mac_stc[0] ^= 0xFF;
    }

    let mut encrypter = Encrypter::assemble(
        suite.enc,
        suite.mac,
        iv_stc,
        key_stc,
        mac_stc,
        exchange_hash.clone(),
    )?;
    let mut decrypter = Decrypter::assemble(suite.enc, suite.mac, iv_cts, key_cts, mac_cts)?;

    // Userauth service
    let (msg_type, service_request) = stream.read_packet(Some(&mut decrypter))?;
    assert_eq!(msg_type, SSH_MSG_SERVICE_REQUEST);
    let (service, _) = wire::extract_string(&service_request)?;
    assert_eq!(service, b"ssh-userauth");
    stream.send_packet(
        &build_payload(
            SSH_MSG_SERVICE_ACCEPT,
            &[Field::LenString(b"ssh-userauth".to_vec())],
        ),
        Some(&mut encrypter),
    )?;
    if let Script::TamperMac = script {
        // The client aborts on the corrupted tag; nothing more to serve
        return Ok(());
    }

    // The malformed publickey attempt the oracle rides on
    let (msg_type, auth_request) = stream.read_packet(Some(&mut decrypter))?;
    assert_eq!(msg_type, SSH_MSG_USERAUTH_REQUEST);
    let (_user, rest) = wire::extract_string(&auth_request)?;
    let (service, rest) = wire::extract_string(rest)?;
    let (method, rest) = wire::extract_string(rest)?;
    assert_eq!(service, b"ssh-connection");
    assert_eq!(method, b"publickey");
    assert_eq!(rest.first(), Some(&3u8));

    match script {
        Script::AbsentUser => {
            stream.send_packet(
                &build_payload(
                    SSH_MSG_USERAUTH_FAILURE,
                    &[Field::LenString(b"publickey".to_vec()), Field::U8(0)],
                ),
                Some(&mut encrypter),
            )?;
            // Give the client the chance to disconnect cleanly
            let _ = stream.read_packet(Some(&mut decrypter));
        }
        Script::PresentUser => {
            stream.send_packet(&info_request(), Some(&mut encrypter))?;
            // Hang up: the close after an info-request is the success signal
        }
        Script::SuccessChannel => {
            stream.send_packet(&info_request(), Some(&mut encrypter))?;
            stream.send_packet(
                &build_payload(SSH_MSG_USERAUTH_SUCCESS, &[]),
                Some(&mut encrypter),
            )?;

            let (msg_type, channel_open) = stream.read_packet(Some(&mut decrypter))?;
            assert_eq!(msg_type, SSH_MSG_CHANNEL_OPEN);
            let (channel_type, rest) = wire::extract_string(&channel_open)?;
            assert_eq!(channel_type, b"session");
            let (sender_channel, _) = wire::extract_u32(rest)?;

            stream.send_packet(
                &build_payload(
                    SSH_MSG_CHANNEL_OPEN_CONFIRMATION,
                    &[
                        Field::U32(sender_channel),
                        Field::U32(1),
                        Field::U32(0x8000),
                        Field::U32(0x4000),
                    ],
                ),
                Some(&mut encrypter),
            )?;

            let (msg_type, shell_request) = stream.read_packet(Some(&mut decrypter))?;
            assert_eq!(msg_type, SSH_MSG_CHANNEL_REQUEST);
            let (_, rest) = wire::extract_u32(&shell_request)?;
            let (request_type, _) = wire::extract_string(rest)?;
            assert_eq!(request_type, b"shell");
            let _ = stream.read_packet(Some(&mut decrypter));
        }
        Script::TamperMac => unreachable!(),
    }
    Ok(())
}

fn info_request() -> Vec<u8> {
    build_payload(
        SSH_MSG_USERAUTH_INFO_REQUEST,
        &[
            Field::LenString(Vec::new()),
            Field::LenString(Vec::new()),
            Field::LenString(Vec::new()),
            Field::U32(0),
        ],
    )
}

fn kexinit_payload(suite: &Suite) -> Vec<u8> {
    let mut payload = vec![SSH_MSG_KEXINIT];
    payload.extend([0u8; 16]);
    wire::append_name_list(&mut payload, &[suite.kex]);
    wire::append_name_list(&mut payload, &["ssh-rsa"]);
    wire::append_name_list(&mut payload, &[suite.enc]);
    wire::append_name_list(&mut payload, &[suite.enc]);
    wire::append_name_list(&mut payload, &[suite.mac]);
    wire::append_name_list(&mut payload, &[suite.mac]);
    wire::append_name_list(&mut payload, &["none"]);
    wire::append_name_list(&mut payload, &["none"]);
    payload.extend([0u8; 13]);
    payload
}
