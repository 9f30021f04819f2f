use crate::field::{Field, build_payload};
use crate::known_hosts::KnownHosts;
use crate::ssh_stream::SshStream;
use crate::{Error, Negotiated, wire};
use aes::{
    Aes128,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, consts::U16, generic_array::GenericArray},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand_core::OsRng;
use rsa::{
    BigUint, RsaPublicKey,
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Indicates successful key exchange
pub const SSH_MSG_NEWKEYS: u8 = 21;

/// Opens the Diffie-Hellman exchange, carrying the client's public value
pub const SSH_MSG_KEXDH_INIT: u8 = 30;

/// Closes the Diffie-Hellman exchange, carrying host key, f and signature
pub const SSH_MSG_KEXDH_REPLY: u8 = 31;

/// Host keys with a modulus below this many bits are refused
const SSH_RSA_MIN_MODULUS_BITS: usize = 1024;

/// Key derivation letters per RFC 4253 7.2
const INITIAL_IV_C_TO_S: u8 = b'A';
const INITIAL_IV_S_TO_C: u8 = b'B';
const ENCR_KEY_C_TO_S: u8 = b'C';
const ENCR_KEY_S_TO_C: u8 = b'D';
const INTEGRITY_KEY_C_TO_S: u8 = b'E';
const INTEGRITY_KEY_S_TO_C: u8 = b'F';

/// Oakley group 2 prime, used by diffie-hellman-group1-sha1
const GROUP1_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
);

/// RFC 3526 2048-bit modp prime, used by the group14 exchanges
const GROUP14_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Encrypts, MACs and owns the client-to-server half of the session keys
pub struct Encrypter {
    cipher: CipherAlg,
    mac: MacAlg,
    iv: Vec<u8>,
    key: Vec<u8>,
    mac_key: Vec<u8>,
    session_id: Vec<u8>,
}

/// Decrypts and verifies the server-to-client half of the session keys
pub struct Decrypter {
    cipher: CipherAlg,
    mac: MacAlg,
    iv: Vec<u8>,
    key: Vec<u8>,
    mac_key: Vec<u8>,
}

/// Enum representing all supported encryption algorithm types
#[derive(Clone, Copy)]
enum CipherAlg {
    Aes128Ctr,
    Aes128Cbc,
}

/// Enum representing all supported mac algorithm types
#[derive(Clone, Copy)]
enum MacAlg {
    HmacSha1,
    HmacSha256,
}

/// Digest negotiated by the key exchange algorithm
pub enum KexHash {
    Sha1,
    Sha256,
}

impl KexHash {
    /// Hashes a buffer with the negotiated exchange digest
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            KexHash::Sha1 => Sha1::digest(data).to_vec(),
            KexHash::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Resolves a cipher name to its iv length, key length and algorithm tag
fn cipher_spec(name: &str) -> Result<(usize, usize, CipherAlg), Error> {
    match name {
        "aes128-ctr" => Ok((16, 16, CipherAlg::Aes128Ctr)),
        "aes128-cbc" => Ok((16, 16, CipherAlg::Aes128Cbc)),
        _ => Err(Error::Protocol("negotiated cipher is not supported")),
    }
}

/// Resolves a mac name to its key length and algorithm tag
fn mac_spec(name: &str) -> Result<(usize, MacAlg), Error> {
    match name {
        "hmac-sha2-256" => Ok((32, MacAlg::HmacSha256)),
        "hmac-sha1" => Ok((20, MacAlg::HmacSha1)),
        _ => Err(Error::Protocol("negotiated mac is not supported")),
    }
}

/// Returns the modp group (prime, generator) and exchange digest for a key
/// exchange algorithm name
pub fn dh_group(kex_name: &str) -> Result<(BigUint, BigUint, KexHash), Error> {
    let generator = BigUint::from_bytes_be(&[2]);
    match kex_name {
        "diffie-hellman-group1-sha1" => Ok((
            BigUint::parse_bytes(GROUP1_PRIME_HEX.as_bytes(), 16)
                .expect("group1 prime constant parses"),
            generator,
            KexHash::Sha1,
        )),
        "diffie-hellman-group14-sha1" => Ok((
            BigUint::parse_bytes(GROUP14_PRIME_HEX.as_bytes(), 16)
                .expect("group14 prime constant parses"),
            generator,
            KexHash::Sha1,
        )),
        "diffie-hellman-group14-sha256" => Ok((
            BigUint::parse_bytes(GROUP14_PRIME_HEX.as_bytes(), 16)
                .expect("group14 prime constant parses"),
            generator,
            KexHash::Sha256,
        )),
        _ => Err(Error::Protocol("negotiated kex is not supported")),
    }
}

/// Runs the key exchange over the given stream and derives the six session
/// keys. Returns the directional halves ready for framed traffic.
///
/// The host key is checked against the minimum modulus size, its signature
/// over the exchange hash is verified, and the (host, key type, base64 key)
/// triple is recorded in the known-hosts store on first sight.
pub fn generate(
    stream: &mut SshStream,
    algs: &Negotiated,
    hash_prefix: Vec<u8>,
    hostname: &str,
    known_hosts: &KnownHosts,
) -> Result<(Encrypter, Decrypter), Error> {
    let (iv_enc_len, key_enc_len, _) = cipher_spec(algs.enc_cts)?;
    let (iv_dec_len, key_dec_len, _) = cipher_spec(algs.enc_stc)?;
    let (mac_enc_len, _) = mac_spec(algs.mac_cts)?;
    let (mac_dec_len, _) = mac_spec(algs.mac_stc)?;
    if algs.comp_cts != "none" || algs.comp_stc != "none" {
        return Err(Error::Protocol("negotiated compression is not supported"));
    }

    let (shared, exchange_hash, hash) =
        dh_exchange(stream, algs, hash_prefix, hostname, known_hosts)?;

    // The server's SSH_MSG_NEWKEYS may ride in the same segment as the DH
    // reply; the packet reader consumes exactly one packet per call so it is
    // picked up here either way
    stream.read_until(SSH_MSG_NEWKEYS, None)?;
    stream.send_packet(&[SSH_MSG_NEWKEYS], None)?;

    // First exchange hash of the session doubles as the session id; the
    // probe never rekeys so it is fixed for the connection lifetime
    let session_id = exchange_hash.clone();

    let iv_enc = derive_key(
        &shared,
        &exchange_hash,
        INITIAL_IV_C_TO_S,
        &session_id,
        &hash,
        iv_enc_len,
    );
    let iv_dec = derive_key(
        &shared,
        &exchange_hash,
        INITIAL_IV_S_TO_C,
        &session_id,
        &hash,
        iv_dec_len,
    );
    let key_enc = derive_key(
        &shared,
        &exchange_hash,
        ENCR_KEY_C_TO_S,
        &session_id,
        &hash,
        key_enc_len,
    );
    let key_dec = derive_key(
        &shared,
        &exchange_hash,
        ENCR_KEY_S_TO_C,
        &session_id,
        &hash,
        key_dec_len,
    );
    let mac_enc = derive_key(
        &shared,
        &exchange_hash,
        INTEGRITY_KEY_C_TO_S,
        &session_id,
        &hash,
        mac_enc_len,
    );
    let mac_dec = derive_key(
        &shared,
        &exchange_hash,
        INTEGRITY_KEY_S_TO_C,
        &session_id,
        &hash,
        mac_dec_len,
    );

    tracing::debug!(
        kex = algs.kex,
        cipher = algs.enc_cts,
        mac = algs.mac_cts,
        "session keys derived"
    );

    Ok((
        Encrypter::assemble(algs.enc_cts, algs.mac_cts, iv_enc, key_enc, mac_enc, session_id)?,
        Decrypter::assemble(algs.enc_stc, algs.mac_stc, iv_dec, key_dec, mac_dec)?,
    ))
}

/// Performs the modp Diffie-Hellman exchange: sends e, parses the reply's
/// host key, f and signature, computes the shared secret and exchange hash,
/// and verifies the host signature.
///
/// Results in the shared secret, the exchange hash and the exchange digest.
fn dh_exchange(
    stream: &mut SshStream,
    algs: &Negotiated,
    mut hash_prefix: Vec<u8>,
    hostname: &str,
    known_hosts: &KnownHosts,
) -> Result<(BigUint, Vec<u8>, KexHash), Error> {
    let (prime, generator, hash) = dh_group(algs.kex)?;
    let one = BigUint::from_bytes_be(&[1]);

    // 256 bits of private exponent from the OS generator
    let mut exponent_bytes = [0u8; 32];
    let secret = loop {
        OsRng.fill(&mut exponent_bytes);
        let candidate = BigUint::from_bytes_be(&exponent_bytes);
        if candidate > one {
            break candidate;
        }
    };
    let public = generator.modpow(&secret, &prime);

    stream.send_packet(
        &build_payload(SSH_MSG_KEXDH_INIT, &[Field::Bignum(public.clone())]),
        None,
    )?;

    let reply = stream.read_until(SSH_MSG_KEXDH_REPLY, None)?;
    let (host_key_blob, rest) = wire::extract_string(&reply)?;
    let (server_public, rest) = wire::extract_mpint(rest)?;
    let (signature_blob, _) = wire::extract_string(rest)?;

    // K_S carries the key type name and the raw RSA public parameters
    let (key_type_bytes, key_rest) = wire::extract_string(&host_key_blob)?;
    let key_type = String::from_utf8_lossy(&key_type_bytes).to_string();
    if key_type != algs.host_key {
        return Err(Error::Protocol("host key type does not match negotiation"));
    }
    let (rsa_exponent, key_rest) = wire::extract_mpint(key_rest)?;
    let (rsa_modulus, _) = wire::extract_mpint(key_rest)?;

    let modulus_bits = rsa_modulus.bits();
    if modulus_bits < SSH_RSA_MIN_MODULUS_BITS {
        return Err(Error::WeakHostKey(modulus_bits));
    }

    if server_public <= one || server_public >= &prime - &one {
        return Err(Error::Protocol("server DH value out of range"));
    }
    let shared = server_public.modpow(&secret, &prime);

    wire::append_string(&mut hash_prefix, &host_key_blob);
    wire::append_mpint(&mut hash_prefix, &public);
    wire::append_mpint(&mut hash_prefix, &server_public);
    wire::append_mpint(&mut hash_prefix, &shared);
    let exchange_hash = hash.digest(&hash_prefix);

    verify_host_signature(
        algs.host_key,
        &signature_blob,
        &rsa_exponent,
        &rsa_modulus,
        &exchange_hash,
    )?;

    tracing::debug!(host = hostname, bits = modulus_bits, "host signature verified");

    record_host_key(known_hosts, hostname, &key_type, &host_key_blob);

    Ok((shared, exchange_hash, hash))
}

/// Verifies the server's PKCS#1 v1.5 SHA-1 signature over the exchange hash
fn verify_host_signature(
    host_key_alg: &str,
    signature_blob: &[u8],
    exponent: &BigUint,
    modulus: &BigUint,
    exchange_hash: &[u8],
) -> Result<(), Error> {
    let (sig_type_bytes, rest) = wire::extract_string(signature_blob)?;
    if sig_type_bytes != host_key_alg.as_bytes() {
        return Err(Error::Protocol("signature type does not match negotiation"));
    }
    let (sig_bytes, _) = wire::extract_string(rest)?;

    let public = RsaPublicKey::new(modulus.clone(), exponent.clone())
        .map_err(|_| Error::Protocol("invalid rsa host key"))?;
    let verifying_key = VerifyingKey::<Sha1>::new(public);
    let signature =
        Signature::try_from(sig_bytes.as_slice()).map_err(|_| Error::HostSignatureInvalid)?;
    verifying_key
        .verify(exchange_hash, &signature)
        .map_err(|_| Error::HostSignatureInvalid)
}

/// Records the host key triple on first sight, trust-on-first-use style.
/// Store failures are logged and never abort the probe.
fn record_host_key(known_hosts: &KnownHosts, hostname: &str, key_type: &str, blob: &[u8]) {
    let encoded = BASE64.encode(blob);
    match known_hosts.contains(hostname, key_type, &encoded) {
        Ok(true) => {}
        Ok(false) => match known_hosts.record(hostname, key_type, &encoded) {
            Ok(()) => eprintln!(
                "Warning: Permanently added '{hostname}' ({key_type}) to the list of known hosts."
            ),
            Err(err) => tracing::warn!("could not update known hosts: {err}"),
        },
        Err(err) => tracing::warn!("could not read known hosts: {err}"),
    }
}

/// Derives one session key per RFC 4253 7.2: hash of
/// mpint(K) || H || letter || session_id, extended with hashes of
/// mpint(K) || H || output-so-far until the requested length is covered
pub fn derive_key(
    shared: &BigUint,
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    hash: &KexHash,
    output_len: usize,
) -> Vec<u8> {
    let mut shared_enc = Vec::new();
    wire::append_mpint(&mut shared_enc, shared);

    let mut data = shared_enc.clone();
    data.extend(exchange_hash);
    data.push(letter);
    data.extend(session_id);
    let mut out = hash.digest(&data);

    while out.len() < output_len {
        let mut data = shared_enc.clone();
        data.extend(exchange_hash);
        data.extend(&out);
        out.extend(hash.digest(&data));
    }
    out.truncate(output_len);
    out
}

/// Increments a big-endian counter block in place
fn increment_counter(counter: &mut [u8]) {
    for digit in counter.iter_mut().rev() {
        if *digit == 0xFF {
            *digit = 0;
        } else {
            *digit += 1;
            return;
        }
    }
}

/// AES-128-CTR keystream application; identical for both directions
fn aes128_ctr(key: &[u8], iv: &mut [u8], data: &mut [u8]) {
    let key: GenericArray<u8, U16> = GenericArray::clone_from_slice(key);
    let cipher = Aes128::new(&key);
    for chunk in data.chunks_mut(16) {
        let mut block: GenericArray<u8, U16> = GenericArray::clone_from_slice(iv);
        cipher.encrypt_block(&mut block);
        for (byte, keystream) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= keystream;
        }
        increment_counter(iv);
    }
}

/// Validates buffer and key geometry shared by every AES path
fn check_aes_geometry(data: &[u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
    if data.len() % 16 != 0 {
        return Err(Error::Protocol("cipher input is not block aligned"));
    }
    if key.len() != 16 || iv.len() != 16 {
        return Err(Error::Protocol("cipher key material has wrong length"));
    }
    Ok(())
}

impl Encrypter {
    /// Builds the sending half from already derived key material
    pub fn assemble(
        cipher_name: &str,
        mac_name: &str,
        iv: Vec<u8>,
        key: Vec<u8>,
        mac_key: Vec<u8>,
        session_id: Vec<u8>,
    ) -> Result<Self, Error> {
        let (_, _, cipher) = cipher_spec(cipher_name)?;
        let (_, mac) = mac_spec(mac_name)?;
        Ok(Encrypter {
            cipher,
            mac,
            iv,
            key,
            mac_key,
            session_id,
        })
    }

    /// The cipher block size packets must align to
    pub fn block_size(&self) -> usize {
        16
    }

    /// Identifier fixed at the first exchange hash of the session
    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// Encrypts one block-aligned plaintext packet
    pub fn encrypt(&mut self, mut plaintext: Vec<u8>) -> Result<Vec<u8>, Error> {
        check_aes_geometry(&plaintext, &self.key, &self.iv)?;
        match self.cipher {
            CipherAlg::Aes128Ctr => aes128_ctr(&self.key, &mut self.iv, &mut plaintext),
            CipherAlg::Aes128Cbc => {
                let key: GenericArray<u8, U16> = GenericArray::clone_from_slice(&self.key);
                let cipher = Aes128::new(&key);
                for chunk in plaintext.chunks_mut(16) {
                    for (byte, prev) in chunk.iter_mut().zip(self.iv.iter()) {
                        *byte ^= prev;
                    }
                    let mut block: GenericArray<u8, U16> = GenericArray::clone_from_slice(chunk);
                    cipher.encrypt_block(&mut block);
                    chunk.copy_from_slice(&block);
                    self.iv.copy_from_slice(chunk);
                }
            }
        }
        Ok(plaintext)
    }

    /// Computes the packet MAC over the sequence number and plaintext
    pub fn mac(&mut self, sequence: u32, message: &[u8]) -> Vec<u8> {
        let mut tagged = Vec::from(sequence.to_be_bytes());
        tagged.extend(message);
        match self.mac {
            MacAlg::HmacSha1 => {
                let mut mac = <Hmac<Sha1> as hmac::digest::KeyInit>::new_from_slice(&self.mac_key)
                    .expect("HMAC can take key of any size");
                mac.update(&tagged);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlg::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(&self.mac_key)
                    .expect("HMAC can take key of any size");
                mac.update(&tagged);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

impl Decrypter {
    /// Builds the receiving half from already derived key material
    pub fn assemble(
        cipher_name: &str,
        mac_name: &str,
        iv: Vec<u8>,
        key: Vec<u8>,
        mac_key: Vec<u8>,
    ) -> Result<Self, Error> {
        let (_, _, cipher) = cipher_spec(cipher_name)?;
        let (_, mac) = mac_spec(mac_name)?;
        Ok(Decrypter {
            cipher,
            mac,
            iv,
            key,
            mac_key,
        })
    }

    /// The cipher block size packets must align to
    pub fn block_size(&self) -> usize {
        16
    }

    /// Length of the MAC tag trailing every framed packet
    pub fn mac_length(&self) -> usize {
        match self.mac {
            MacAlg::HmacSha1 => 20,
            MacAlg::HmacSha256 => 32,
        }
    }

    /// Decrypts one block-aligned ciphertext fragment
    pub fn decrypt(&mut self, mut ciphertext: Vec<u8>) -> Result<Vec<u8>, Error> {
        check_aes_geometry(&ciphertext, &self.key, &self.iv)?;
        match self.cipher {
            CipherAlg::Aes128Ctr => aes128_ctr(&self.key, &mut self.iv, &mut ciphertext),
            CipherAlg::Aes128Cbc => {
                let key: GenericArray<u8, U16> = GenericArray::clone_from_slice(&self.key);
                let cipher = Aes128::new(&key);
                for chunk in ciphertext.chunks_mut(16) {
                    let saved: Vec<u8> = chunk.to_vec();
                    let mut block: GenericArray<u8, U16> = GenericArray::clone_from_slice(chunk);
                    cipher.decrypt_block(&mut block);
                    for (byte, prev) in block.iter_mut().zip(self.iv.iter()) {
                        *byte ^= prev;
                    }
                    chunk.copy_from_slice(&block);
                    self.iv.copy_from_slice(&saved);
                }
            }
        }
        Ok(ciphertext)
    }

    /// Verifies a packet MAC over the sequence number and plaintext
    pub fn verify(&mut self, sequence: u32, message: &[u8], tag: &[u8]) -> bool {
        let mut tagged = Vec::from(sequence.to_be_bytes());
        tagged.extend(message);
        match self.mac {
            MacAlg::HmacSha1 => {
                let mut mac = <Hmac<Sha1> as hmac::digest::KeyInit>::new_from_slice(&self.mac_key)
                    .expect("HMAC can take key of any size");
                mac.update(&tagged);
                mac.verify_slice(tag).is_ok()
            }
            MacAlg::HmacSha256 => {
                let mut mac = <Hmac<Sha256> as hmac::digest::KeyInit>::new_from_slice(&self.mac_key)
                    .expect("HMAC can take key of any size");
                mac.update(&tagged);
                mac.verify_slice(tag).is_ok()
            }
        }
    }
}
