use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::SystemTime;

use byteorder::{ByteOrder, LittleEndian};

use crate::adb::AdbStream;
use crate::error::{AdbError, Result};

/// Every SYNC frame is a 4-ASCII-byte ident plus a little-endian length.
const FRAME_HEADER_LEN: u32 = 8;

const ID_SEND: &[u8; 4] = b"SEND";
const ID_DATA: &[u8; 4] = b"DATA";
const ID_DONE: &[u8; 4] = b"DONE";
const ID_OKAY: &[u8; 4] = b"OKAY";
const ID_FAIL: &[u8; 4] = b"FAIL";

/// Progress is reported at least this often, by bytes sent.
const PROGRESS_MIN_STEP: u64 = 512 * 1024;

fn frame(ident: &[u8; 4], length: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN as usize);
    buf.extend_from_slice(ident);
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, length);
    buf.extend_from_slice(&len);
    buf
}

/// Uploads a local file over an already-open `sync:` stream.
pub fn push_file(
    stream: &mut AdbStream<'_>,
    local: &Path,
    remote_path: &str,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let file = File::open(local)?;
    let meta = file.metadata()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    push(stream, BufReader::new(file), meta.len(), remote_path, 0o644, mtime, progress)
}

/// SEND, then DATA chunks of `max_data - 8` bytes, then DONE, then the
/// terminal OKAY/FAIL. Each frame rides in one stream write, which already
/// waits for the stream-level OKAY ack.
pub fn push<R: Read>(
    stream: &mut AdbStream<'_>,
    mut reader: R,
    size: u64,
    remote_path: &str,
    mode: u32,
    mtime: u32,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let chunk_size = (stream.max_data() - FRAME_HEADER_LEN) as usize;
    log::debug!("sync push {remote_path} ({size} bytes, {chunk_size}-byte chunks)");

    let spec = format!("{remote_path},{mode:04o}");
    let mut send = frame(ID_SEND, spec.len() as u32);
    send.extend_from_slice(spec.as_bytes());
    stream.write(&send)?;

    let step = std::cmp::max(PROGRESS_MIN_STEP, size / 20);
    let mut sent: u64 = 0;
    let mut last_report: u64 = 0;
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let n = read_up_to(&mut reader, &mut chunk)?;
        if n == 0 {
            break;
        }
        let mut data = frame(ID_DATA, n as u32);
        data.extend_from_slice(&chunk[..n]);
        stream.write(&data)?;
        sent += n as u64;
        if sent - last_report >= step {
            progress(sent, size);
            last_report = sent;
        }
    }
    progress(sent, size);

    stream.write(&frame(ID_DONE, mtime))?;

    // the terminal reply is SYNC-level, not a stream ack
    let mut reply = [0u8; FRAME_HEADER_LEN as usize];
    stream.read_exact(&mut reply)?;
    let length = LittleEndian::read_u32(&reply[4..8]);
    match &reply[..4] {
        id if id == ID_OKAY => Ok(()),
        id if id == ID_FAIL => {
            let mut message = vec![0u8; length as usize];
            stream.read_exact(&mut message)?;
            Err(AdbError::SyncFailed(String::from_utf8_lossy(&message).into_owned()))
        }
        _ => Err(AdbError::InvalidResponse),
    }
}

/// Fills as much of `buf` as the reader can give without treating a short
/// read as the end.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::tests::{connect_client, peer_accept_plain, peer_recv, peer_send, spawn_peer};
    use crate::packet::{Command, Packet};
    use std::io::Cursor;
    use std::net::TcpStream;

    /// Peer half of a sync upload: accepts the stream, acks every WRTE and
    /// reassembles the frames, then answers with the given terminal frame.
    fn peer_sync_server(
        stream: &mut TcpStream,
        terminal: Vec<u8>,
    ) -> (String, Vec<u8>, usize, Vec<usize>) {
        let open = peer_recv(stream);
        assert_eq!(open.command(), Command::Open);
        assert_eq!(open.payload(), b"sync:\0");
        let local = open.arg0();
        let remote = 99;
        peer_send(stream, &Packet::okay(remote, local));

        let mut spec = String::new();
        let mut content = Vec::new();
        let mut data_frames = 0usize;
        let mut frame_sizes = Vec::new();
        loop {
            let packet = peer_recv(stream);
            assert_eq!(packet.command(), Command::Wrte);
            assert_eq!((packet.arg0(), packet.arg1()), (local, remote));
            peer_send(stream, &Packet::okay(remote, local));

            let payload = packet.payload();
            let ident: [u8; 4] = payload[..4].try_into().unwrap();
            let length = u32::from_le_bytes(payload[4..8].try_into().unwrap());
            match &ident {
                b"SEND" => spec = String::from_utf8(payload[8..].to_vec()).unwrap(),
                b"DATA" => {
                    assert_eq!(payload.len(), 8 + length as usize);
                    data_frames += 1;
                    frame_sizes.push(length as usize);
                    content.extend_from_slice(&payload[8..]);
                }
                b"DONE" => break,
                other => panic!("unexpected sync frame {:?}", other),
            }
        }

        peer_send(stream, &Packet::write(remote, local, terminal));
        let ack = peer_recv(stream);
        assert_eq!(ack.command(), Command::Okay);
        let close = peer_recv(stream);
        assert_eq!(close.command(), Command::Clse);
        (spec, content, data_frames, frame_sizes)
    }

    #[test]
    fn test_push_three_mib() {
        let source: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
        let expected = source.clone();

        let (addr, peer) = spawn_peer(move |stream| {
            peer_accept_plain(stream, 4096);
            let (spec, content, data_frames, frame_sizes) =
                peer_sync_server(stream, b"OKAY\0\0\0\0".to_vec());
            assert_eq!(spec, "/data/local/tmp/payload.bin,0644");
            assert_eq!(content, expected);
            // ceil(3 MiB / 4088)
            assert_eq!(data_frames, (3usize * 1024 * 1024 + 4087) / 4088);
            assert!(frame_sizes.iter().all(|&n| n <= 4096 - 8));
        });

        let mut session = connect_client(addr);
        let mut reports = 0usize;
        let mut last = (0u64, 0u64);
        {
            let mut stream = session.open("sync:").unwrap();
            push(
                &mut stream,
                Cursor::new(source.clone()),
                source.len() as u64,
                "/data/local/tmp/payload.bin",
                0o644,
                1_700_000_000,
                &mut |sent, total| {
                    reports += 1;
                    last = (sent, total);
                },
            )
            .unwrap();
            stream.close().unwrap();
        }
        // at least one report per 512 KiB, plus the final one
        assert!(reports >= 6, "only {reports} progress reports");
        assert_eq!(last, (source.len() as u64, source.len() as u64));
        peer.join().unwrap();
    }

    #[test]
    fn test_push_fail_reply() {
        let (addr, peer) = spawn_peer(move |stream| {
            peer_accept_plain(stream, 4096);
            let open = peer_recv(stream);
            let local = open.arg0();
            peer_send(stream, &Packet::okay(5, local));

            // SEND, one DATA, DONE, each acked
            for _ in 0..3 {
                let packet = peer_recv(stream);
                assert_eq!(packet.command(), Command::Wrte);
                peer_send(stream, &Packet::okay(5, local));
            }
            let mut terminal = b"FAIL".to_vec();
            terminal.extend_from_slice(&13u32.to_le_bytes());
            terminal.extend_from_slice(b"no such dir\r\n");
            peer_send(stream, &Packet::write(5, local, terminal));
            let _ack = peer_recv(stream);
            let _close = peer_recv(stream);
        });

        let mut session = connect_client(addr);
        let mut stream = session.open("sync:").unwrap();
        let result = push(
            &mut stream,
            Cursor::new(b"data".to_vec()),
            4,
            "/nope/file",
            0o644,
            0,
            &mut |_, _| {},
        );
        match result {
            Err(AdbError::SyncFailed(msg)) => assert_eq!(msg, "no such dir\r\n"),
            other => panic!("expected SyncFailed, got {:?}", other),
        }
        stream.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_push_garbage_terminal() {
        let (addr, peer) = spawn_peer(move |stream| {
            peer_accept_plain(stream, 4096);
            let open = peer_recv(stream);
            let local = open.arg0();
            peer_send(stream, &Packet::okay(5, local));
            for _ in 0..3 {
                let _ = peer_recv(stream);
                peer_send(stream, &Packet::okay(5, local));
            }
            peer_send(stream, &Packet::write(5, local, b"WHAT\0\0\0\0".to_vec()));
            let _ack = peer_recv(stream);
            let _close = peer_recv(stream);
        });

        let mut session = connect_client(addr);
        let mut stream = session.open("sync:").unwrap();
        let result =
            push(&mut stream, Cursor::new(b"x".to_vec()), 1, "/f", 0o644, 0, &mut |_, _| {});
        assert!(matches!(result, Err(AdbError::InvalidResponse)));
        stream.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_push_stream_closed_before_terminal() {
        let (addr, peer) = spawn_peer(move |stream| {
            peer_accept_plain(stream, 4096);
            let open = peer_recv(stream);
            let local = open.arg0();
            peer_send(stream, &Packet::okay(5, local));
            for _ in 0..3 {
                let _ = peer_recv(stream);
                peer_send(stream, &Packet::okay(5, local));
            }
            // device dies instead of answering
            peer_send(stream, &Packet::close(5, local));
            let _close = peer_recv(stream);
        });

        let mut session = connect_client(addr);
        let mut stream = session.open("sync:").unwrap();
        let result =
            push(&mut stream, Cursor::new(b"x".to_vec()), 1, "/f", 0o644, 0, &mut |_, _| {});
        assert!(matches!(result, Err(AdbError::StreamClosed)));
        peer.join().unwrap();
    }
}
