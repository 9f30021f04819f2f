use crate::encrypter::{Decrypter, Encrypter};
use crate::{Error, SSH_MAX_PACKET_SIZE, SSH_MSG_DISCONNECT, wire};
use rand::Rng;
use rand_core::OsRng;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Maximum length of an identification line, CR LF included
const MAX_ID_LINE: usize = 255;

/// A blocking stream of ssh packets over TCP.
///
/// Every read and write carries the socket timeout configured at connect
/// time. The stream owns one 32-bit sequence counter per direction; both
/// start at `u32::MAX` and are wrapping pre-incremented so the first packet
/// of the connection is sequence 0, plaintext handshake packets included.
pub struct SshStream {
    stream: TcpStream,
    seq_send: u32,
    seq_recv: u32,
}

impl SshStream {
    /// Opens a TCP connection to the given host and port, applying the
    /// timeout to the connect itself and to every later socket operation
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        let mut addrs = (host, port).to_socket_addrs()?;
        let addr = addrs
            .next()
            .ok_or(Error::Protocol("hostname did not resolve"))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(SshStream {
            stream,
            seq_send: u32::MAX,
            seq_recv: u32::MAX,
        })
    }

    /// Wraps an already connected socket. Used by tests standing up mock
    /// servers; the caller is responsible for timeouts.
    pub fn new(stream: TcpStream) -> Self {
        SshStream {
            stream,
            seq_send: u32::MAX,
            seq_recv: u32::MAX,
        }
    }

    /// Number of ssh packets sent over this stream so far
    pub fn packets_sent(&self) -> u32 {
        self.seq_send.wrapping_add(1)
    }

    /// Number of ssh packets received over this stream so far
    pub fn packets_received(&self) -> u32 {
        self.seq_recv.wrapping_add(1)
    }

    /// Sends an identification string, appending the mandatory CR LF
    pub fn send_id_string(&mut self, id: &str) -> Result<(), Error> {
        self.stream.write_all(id.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        Ok(())
    }

    /// Reads one identification line, byte at a time so no packet data past
    /// the line terminator is consumed. Returns the line without its CR LF.
    pub fn read_id_line(&mut self) -> Result<String, Error> {
        let mut line: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte)?;
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_ID_LINE {
                return Err(Error::Protocol("identification line too long"));
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        } else if line.starts_with(b"SSH-") {
            return Err(Error::Protocol("identification line not CR LF terminated"));
        }
        Ok(String::from_utf8_lossy(&line).to_string())
    }

    /// Reads identification lines until the server's `SSH-` line appears,
    /// ignoring any preamble lines as RFC 4253 permits
    pub fn read_server_id(&mut self) -> Result<String, Error> {
        loop {
            let line = self.read_id_line()?;
            if line.starts_with("SSH-") {
                return Ok(line);
            }
        }
    }

    /// Sends a single ssh packet with the given payload, framing it with the
    /// packet length, padding length and random padding, then encrypting and
    /// MAC-tagging when keys are live
    pub fn send_packet(
        &mut self,
        payload: &[u8],
        encrypter: Option<&mut Encrypter>,
    ) -> Result<(), Error> {
        let block_size = match &encrypter {
            Some(enc) => enc.block_size(),
            None => 8,
        };

        // Padding brings length + padding_length + payload to a block
        // multiple and must itself be at least 4 bytes
        let mut padding = block_size - ((payload.len() + 5) % block_size);
        if padding < 4 {
            padding += block_size;
        }
        let packet_length = (payload.len() + padding + 1) as u32;

        let mut packet = Vec::with_capacity(packet_length as usize + 4);
        wire::append_u32(&mut packet, packet_length);
        packet.push(padding as u8);
        packet.extend(payload);
        let mut pad = vec![0u8; padding];
        OsRng.fill(pad.as_mut_slice());
        packet.extend(pad);

        self.seq_send = self.seq_send.wrapping_add(1);

        match encrypter {
            Some(enc) => {
                let mac = enc.mac(self.seq_send, &packet);
                let ciphertext = enc.encrypt(packet)?;
                self.stream.write_all(&ciphertext)?;
                self.stream.write_all(&mac)?;
            }
            None => self.stream.write_all(&packet)?,
        }
        Ok(())
    }

    /// Reads one ssh packet and returns its message type together with the
    /// payload bytes that follow the type byte.
    ///
    /// The MAC is verified over the recovered plaintext before any payload
    /// byte is handed to the caller.
    pub fn read_packet(
        &mut self,
        mut decrypter: Option<&mut Decrypter>,
    ) -> Result<(u8, Vec<u8>), Error> {
        let block_size = match &decrypter {
            Some(dec) => dec.block_size(),
            None => 8,
        };

        self.seq_recv = self.seq_recv.wrapping_add(1);

        let mut packet = vec![0u8; block_size];
        self.stream.read_exact(&mut packet)?;
        if let Some(dec) = &mut decrypter {
            packet = dec.decrypt(packet)?;
        }

        let packet_length =
            u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        if packet_length < 12 {
            return Err(Error::Protocol("packet length below minimum"));
        }
        if packet_length + 4 > SSH_MAX_PACKET_SIZE {
            return Err(Error::Protocol("oversize packet"));
        }
        if (packet_length + 4) % block_size != 0 {
            return Err(Error::Protocol("packet length not block aligned"));
        }

        let mut rest = vec![0u8; packet_length + 4 - block_size];
        self.stream.read_exact(&mut rest)?;
        if let Some(dec) = &mut decrypter {
            rest = dec.decrypt(rest)?;
        }
        packet.extend(rest);

        let padding_length = packet[4] as usize;
        if padding_length < 4 {
            return Err(Error::Protocol("padding below minimum"));
        }
        if padding_length + 1 >= packet_length {
            return Err(Error::Protocol("padding swallows payload"));
        }

        if let Some(dec) = &mut decrypter {
            let mut mac = vec![0u8; dec.mac_length()];
            self.stream.read_exact(&mut mac)?;
            if !dec.verify(self.seq_recv, &packet, &mac) {
                return Err(Error::MacMismatch);
            }
        }

        let payload_end = 4 + packet_length - padding_length;
        let msg_type = packet[5];
        Ok((msg_type, packet[6..payload_end].to_vec()))
    }

    /// Reads packets until one matches the awaited message type, failing on
    /// an interleaved disconnect. Other packet types are skipped.
    pub fn read_until(
        &mut self,
        wait_type: u8,
        mut decrypter: Option<&mut Decrypter>,
    ) -> Result<Vec<u8>, Error> {
        loop {
            let (msg_type, payload) = self.read_packet(decrypter.as_deref_mut())?;
            if msg_type == wait_type {
                return Ok(payload);
            }
            if msg_type == SSH_MSG_DISCONNECT {
                return Err(parse_disconnect(&payload));
            }
        }
    }
}

/// Decodes an SSH_MSG_DISCONNECT payload into its error form
pub fn parse_disconnect(payload: &[u8]) -> Error {
    match wire::extract_u32(payload) {
        Ok((reason, rest)) => {
            let text = match wire::extract_string(rest) {
                Ok((bytes, _)) => String::from_utf8_lossy(&bytes).to_string(),
                Err(_) => String::new(),
            };
            Error::Disconnect(reason, text)
        }
        Err(_) => Error::Protocol("malformed disconnect packet"),
    }
}
