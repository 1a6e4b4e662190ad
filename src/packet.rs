use byteorder::{ByteOrder, LittleEndian};

use crate::error::{AdbError, Result};

pub const HEADER_LEN: usize = 24;

const fn adb_cmd(b: [u8; 4]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16) | ((b[3] as u32) << 24)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    Cnxn = adb_cmd(*b"CNXN"),
    Auth = adb_cmd(*b"AUTH"),
    Open = adb_cmd(*b"OPEN"),
    Okay = adb_cmd(*b"OKAY"),
    Clse = adb_cmd(*b"CLSE"),
    Wrte = adb_cmd(*b"WRTE"),
}

impl Command {
    pub fn from_u32(cmd: u32) -> Option<Self> {
        Some(match cmd {
            c if c == Self::Cnxn as u32 => Self::Cnxn,
            c if c == Self::Auth as u32 => Self::Auth,
            c if c == Self::Open as u32 => Self::Open,
            c if c == Self::Okay as u32 => Self::Okay,
            c if c == Self::Clse as u32 => Self::Clse,
            c if c == Self::Wrte as u32 => Self::Wrte,
            _ => return None,
        })
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Decoded 24-byte packet header. The payload follows on the wire.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_len: u32,
    pub checksum: u32,
}

impl Header {
    /// Checks the XOR magic and the command set. The checksum is carried but
    /// not verified here; modern peers send zero.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let cmd = LittleEndian::read_u32(&buf[0..4]);
        let arg0 = LittleEndian::read_u32(&buf[4..8]);
        let arg1 = LittleEndian::read_u32(&buf[8..12]);
        let data_len = LittleEndian::read_u32(&buf[12..16]);
        let checksum = LittleEndian::read_u32(&buf[16..20]);
        let magic = LittleEndian::read_u32(&buf[20..24]);
        if magic != cmd ^ 0xFFFF_FFFF {
            return Err(AdbError::Protocol(format!(
                "invalid magic: {:#010x} for command {:#010x}",
                magic, cmd
            )));
        }
        let command = Command::from_u32(cmd)
            .ok_or_else(|| AdbError::Protocol(format!("unknown command {:#010x}", cmd)))?;
        Ok(Header { command, arg0, arg1, data_len, checksum })
    }
}

#[derive(Clone, Debug)]
pub struct Packet {
    command: Command,
    arg0: u32,
    arg1: u32,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self { command, arg0, arg1, payload }
    }

    pub fn cnxn(version: u32, max_data: u32, banner: &str) -> Self {
        let mut payload = Vec::with_capacity(banner.len() + 1);
        payload.extend_from_slice(banner.as_bytes());
        payload.push(0);
        Self::new(Command::Cnxn, version, max_data, payload)
    }

    pub fn open(local_id: u32, service: &str) -> Self {
        let mut payload = Vec::with_capacity(service.len() + 1);
        payload.extend_from_slice(service.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Vec::new())
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Vec::new())
    }

    pub fn write(local_id: u32, remote_id: u32, payload: Vec<u8>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, payload)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn arg0(&self) -> u32 {
        self.arg0
    }

    pub fn arg1(&self) -> u32 {
        self.arg1
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Header plus payload, ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        LittleEndian::write_u32(&mut buf[0..4], self.command as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.arg0);
        LittleEndian::write_u32(&mut buf[8..12], self.arg1);
        LittleEndian::write_u32(&mut buf[12..16], self.payload.len() as u32);
        LittleEndian::write_u32(&mut buf[16..20], checksum(&self.payload));
        LittleEndian::write_u32(&mut buf[20..24], self.command as u32 ^ 0xFFFF_FFFF);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Decodes a whole encoded packet from one buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(AdbError::Protocol("short packet".into()));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = Header::decode(&header)?;
        let payload = bytes[HEADER_LEN..].to_vec();
        if payload.len() != header.data_len as usize {
            return Err(AdbError::Protocol(format!(
                "payload length {} does not match header ({})",
                payload.len(),
                header.data_len
            )));
        }
        Ok(Self::new(header.command, header.arg0, header.arg1, payload))
    }
}
