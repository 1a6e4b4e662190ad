use std::cmp;

use crate::error::{AdbError, Result};
use crate::keys::AdbKey;
use crate::packet::{Command, Header, Packet, HEADER_LEN};
use crate::transport::Transport;

pub const PROTOCOL_VERSION: u32 = 0x0100_0000;
/// What we advertise in our CNXN; the device answers with its own limit.
pub const LOCAL_MAX_DATA: u32 = 4096;
const MIN_MAX_DATA: u32 = 256;

const AUTH_TOKEN: u32 = 1;
const AUTH_SIGNATURE: u32 = 2;
const AUTH_RSAPUBLICKEY: u32 = 3;

/// One authenticated ADB session over one TCP connection.
///
/// Streams borrow the session mutably, so only one can be live at a time;
/// packets for anything else are background chatter and get dropped.
pub struct AdbSession {
    transport: Transport,
    max_data: u32,
    next_local_id: u32,
}

impl AdbSession {
    /// Drives the CNXN/AUTH handshake to completion.
    ///
    /// The first AUTH token is answered with a signature, a second one with
    /// our public key. The public-key path pops an authorization prompt on
    /// the device, so this can block until a human accepts it.
    pub fn connect(mut transport: Transport, key: &AdbKey) -> Result<Self> {
        send_on(&mut transport, &Packet::cnxn(PROTOCOL_VERSION, LOCAL_MAX_DATA, "host::"))?;

        let mut signature_sent = false;
        let mut pubkey_sent = false;
        loop {
            let packet = recv_on(&mut transport)?;
            match (packet.command(), packet.arg0()) {
                (Command::Cnxn, _) => {
                    let max_data = cmp::max(MIN_MAX_DATA, packet.arg1());
                    let banner = String::from_utf8_lossy(packet.payload()).into_owned();
                    log::info!(
                        "connected: {} (max_data={})",
                        banner.trim_end_matches('\0'),
                        max_data
                    );
                    return Ok(Self { transport, max_data, next_local_id: 1 });
                }
                (Command::Auth, AUTH_TOKEN) if !signature_sent => {
                    log::debug!("auth challenge, signing token");
                    let signature = key.sign_token(packet.payload())?;
                    send_on(
                        &mut transport,
                        &Packet::new(Command::Auth, AUTH_SIGNATURE, 0, signature),
                    )?;
                    signature_sent = true;
                }
                (Command::Auth, AUTH_TOKEN) if !pubkey_sent => {
                    log::info!("device does not know this key; accept the prompt on screen");
                    let mut line = key.public_key_line().into_bytes();
                    line.push(0);
                    send_on(&mut transport, &Packet::new(Command::Auth, AUTH_RSAPUBLICKEY, 0, line))?;
                    pubkey_sent = true;
                }
                (Command::Auth, AUTH_TOKEN) => return Err(AdbError::AuthenticationFailed),
                (other, _) => log::debug!("ignoring {other:?} during handshake"),
            }
        }
    }

    /// The payload ceiling the device negotiated for this session.
    pub fn max_data(&self) -> u32 {
        self.max_data
    }

    /// Opens a stream to a named service (`shell:…`, `sync:`, `reboot:`, …).
    pub fn open(&mut self, service: &str) -> Result<AdbStream<'_>> {
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        log::debug!("open {service:?} as stream {local_id}");
        self.send_packet(&Packet::open(local_id, service))?;
        loop {
            let packet = self.recv_packet()?;
            match packet.command() {
                Command::Okay if packet.arg1() == local_id => {
                    return Ok(AdbStream {
                        session: self,
                        local_id,
                        remote_id: packet.arg0(),
                        read_buffer: Vec::new(),
                        read_offset: 0,
                        closed: false,
                    });
                }
                Command::Clse if packet.arg1() == local_id => {
                    log::debug!("device rejected service {service:?}");
                    return Err(AdbError::StreamClosed);
                }
                other => log::debug!("ignoring {other:?} while opening {service:?}"),
            }
        }
    }

    /// Runs one shell command and returns everything it printed.
    pub fn run_shell(&mut self, command: &str) -> Result<String> {
        let mut stream = self.open(&format!("shell:{command}"))?;
        let output = stream.read_to_end()?;
        stream.close()?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Fire-and-drain for services with no useful output (`reboot:`).
    pub fn simple_command(&mut self, service: &str) -> Result<()> {
        let mut stream = self.open(service)?;
        let _ = stream.read_to_end()?;
        stream.close()
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        if packet.command() != Command::Cnxn && packet.payload().len() as u32 > self.max_data {
            return Err(AdbError::Protocol(format!(
                "payload of {} bytes exceeds negotiated max_data {}",
                packet.payload().len(),
                self.max_data
            )));
        }
        send_on(&mut self.transport, packet)
    }

    fn recv_packet(&mut self) -> Result<Packet> {
        recv_on(&mut self.transport)
    }
}

fn send_on(transport: &mut Transport, packet: &Packet) -> Result<()> {
    log::trace!("send {packet:?}");
    transport.send(&packet.encode())
}

fn recv_on(transport: &mut Transport) -> Result<Packet> {
    let bytes = transport.receive_exact(HEADER_LEN)?;
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes);
    let header = Header::decode(&header)?;
    let payload = if header.data_len > 0 {
        transport.receive_exact(header.data_len as usize)?
    } else {
        Vec::new()
    };
    // modern peers send checksum 0; never reject on it
    if header.checksum != 0 && header.checksum != crate::packet::checksum(&payload) {
        log::debug!("peer checksum mismatch on {:?}, ignoring", header.command);
    }
    let packet = Packet::new(header.command, header.arg0, header.arg1, payload);
    log::trace!("recv {packet:?}");
    Ok(packet)
}

/// One logical stream inside a session.
pub struct AdbStream<'a> {
    session: &'a mut AdbSession,
    local_id: u32,
    remote_id: u32,
    read_buffer: Vec<u8>,
    read_offset: usize,
    closed: bool,
}

impl AdbStream<'_> {
    pub fn max_data(&self) -> u32 {
        self.session.max_data
    }

    fn matches(&self, packet: &Packet) -> bool {
        packet.arg0() == self.remote_id && packet.arg1() == self.local_id
    }

    /// Buffers a peer WRTE and sends the mandatory flow-control OKAY.
    fn accept_write(&mut self, payload: Vec<u8>) -> Result<()> {
        self.read_buffer.drain(..self.read_offset);
        self.read_offset = 0;
        self.read_buffer.extend_from_slice(&payload);
        self.session.send_packet(&Packet::okay(self.local_id, self.remote_id))
    }

    /// Pulls packets until the read buffer has data. Returns false at
    /// end-of-stream.
    fn fill_buffer(&mut self) -> Result<bool> {
        while !self.closed {
            let packet = self.session.recv_packet()?;
            match packet.command() {
                Command::Wrte if self.matches(&packet) => {
                    self.accept_write(packet.into_payload())?;
                    if self.read_offset < self.read_buffer.len() {
                        return Ok(true);
                    }
                }
                Command::Clse if self.matches(&packet) => {
                    self.session.send_packet(&Packet::close(self.local_id, self.remote_id))?;
                    self.closed = true;
                }
                other => log::debug!(
                    "dropping {other:?} for ({}, {})",
                    packet.arg0(),
                    packet.arg1()
                ),
            }
        }
        Ok(false)
    }

    /// Reads into `buf`; returns 0 at end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.read_offset >= self.read_buffer.len() {
            if !self.fill_buffer()? {
                return Ok(0);
            }
        }
        let n = cmp::min(buf.len(), self.read_buffer.len() - self.read_offset);
        buf[..n].copy_from_slice(&self.read_buffer[self.read_offset..self.read_offset + n]);
        self.read_offset += n;
        Ok(n)
    }

    /// Exactly `buf.len()` bytes, or `StreamClosed` if the stream ends first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(AdbError::StreamClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Drains the stream until the peer closes it.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends one WRTE and waits for its OKAY. Peer WRTEs that arrive in the
    /// meantime are buffered and acked; a peer CLSE is fatal.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(AdbError::StreamClosed);
        }
        self.session.send_packet(&Packet::write(self.local_id, self.remote_id, data.to_vec()))?;
        loop {
            let packet = self.session.recv_packet()?;
            match packet.command() {
                Command::Okay if self.matches(&packet) => return Ok(()),
                Command::Wrte if self.matches(&packet) => {
                    self.accept_write(packet.into_payload())?;
                }
                Command::Clse if self.matches(&packet) => {
                    self.session.send_packet(&Packet::close(self.local_id, self.remote_id))?;
                    self.closed = true;
                    return Err(AdbError::StreamClosed);
                }
                other => log::debug!(
                    "dropping {other:?} for ({}, {})",
                    packet.arg0(),
                    packet.arg1()
                ),
            }
        }
    }

    /// Idempotent; reads after this return end-of-stream.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.send_packet(&Packet::close(self.local_id, self.remote_id))
    }
}
