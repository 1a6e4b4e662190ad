use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;

use crate::error::Result;

const EOCD_SIG: u32 = 0x0605_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

const EOCD_MIN_LEN: usize = 22;
/// EOCD plus the largest possible archive comment.
const EOCD_SCAN_LEN: usize = EOCD_MIN_LEN + 65_535;

const CENTRAL_HEADER_LEN: usize = 46;
const LOCAL_HEADER_LEN: usize = 30;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Clone)]
struct ZipEntry {
    name: String,
    compression: u16,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

/// Pulls the best launcher-icon candidate out of an APK.
///
/// A missing file is an error; an archive we cannot make sense of just
/// yields no icon.
pub fn extract_icon(apk: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = File::open(apk)?;
    Ok(extract_from(&mut file))
}

fn extract_from<R: Read + Seek>(archive: &mut R) -> Option<Vec<u8>> {
    let entries = match read_central_directory(archive) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("unreadable archive: {e}");
            return None;
        }
    };
    let entry = pick_icon_entry(&entries)?;
    log::debug!("icon candidate: {} ({} bytes)", entry.name, entry.uncompressed_size);
    match read_entry(archive, entry) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::debug!("cannot extract {}: {e}", entry.name);
            None
        }
    }
}

fn bad_zip(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Finds the EOCD in the file tail and walks the central directory.
fn read_central_directory<R: Read + Seek>(archive: &mut R) -> io::Result<Vec<ZipEntry>> {
    let file_len = archive.seek(SeekFrom::End(0))?;
    let tail_len = file_len.min(EOCD_SCAN_LEN as u64) as usize;
    archive.seek(SeekFrom::End(-(tail_len as i64)))?;
    let mut tail = vec![0u8; tail_len];
    archive.read_exact(&mut tail)?;

    let eocd = if tail_len >= EOCD_MIN_LEN {
        (0..=tail_len - EOCD_MIN_LEN)
            .rev()
            .find(|&i| LittleEndian::read_u32(&tail[i..]) == EOCD_SIG)
    } else {
        None
    };
    let eocd = eocd.ok_or_else(|| bad_zip("no end-of-central-directory record"))?;
    let total_entries = LittleEndian::read_u16(&tail[eocd + 10..]) as usize;
    let central_size = LittleEndian::read_u32(&tail[eocd + 12..]) as usize;
    let central_offset = LittleEndian::read_u32(&tail[eocd + 16..]) as u64;

    archive.seek(SeekFrom::Start(central_offset))?;
    let mut directory = vec![0u8; central_size];
    archive.read_exact(&mut directory)?;

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + CENTRAL_HEADER_LEN <= directory.len() {
        if LittleEndian::read_u32(&directory[pos..]) != CENTRAL_SIG {
            break;
        }
        let compression = LittleEndian::read_u16(&directory[pos + 10..]);
        let compressed_size = LittleEndian::read_u32(&directory[pos + 20..]);
        let uncompressed_size = LittleEndian::read_u32(&directory[pos + 24..]);
        let name_len = LittleEndian::read_u16(&directory[pos + 28..]) as usize;
        let extra_len = LittleEndian::read_u16(&directory[pos + 30..]) as usize;
        let comment_len = LittleEndian::read_u16(&directory[pos + 32..]) as usize;
        let local_header_offset = LittleEndian::read_u32(&directory[pos + 42..]);

        let name_start = pos + CENTRAL_HEADER_LEN;
        let name_end = name_start + name_len;
        if name_end > directory.len() {
            break;
        }
        let name = String::from_utf8_lossy(&directory[name_start..name_end]).into_owned();
        entries.push(ZipEntry {
            name,
            compression,
            compressed_size,
            uncompressed_size,
            local_header_offset,
        });
        pos = name_end + extra_len + comment_len;
    }
    if total_entries > 0 && entries.len() > total_entries {
        entries.truncate(total_entries);
    }
    Ok(entries)
}

/// Resolves the entry's local header and returns its uncompressed bytes.
fn read_entry<R: Read + Seek>(archive: &mut R, entry: &ZipEntry) -> io::Result<Vec<u8>> {
    archive.seek(SeekFrom::Start(entry.local_header_offset as u64))?;
    let mut header = [0u8; LOCAL_HEADER_LEN];
    archive.read_exact(&mut header)?;
    if LittleEndian::read_u32(&header) != LOCAL_SIG {
        return Err(bad_zip(format!("bad local header for {}", entry.name)));
    }
    let name_len = LittleEndian::read_u16(&header[26..]) as i64;
    let extra_len = LittleEndian::read_u16(&header[28..]) as i64;
    archive.seek(SeekFrom::Current(name_len + extra_len))?;

    let mut compressed = vec![0u8; entry.compressed_size as usize];
    archive.read_exact(&mut compressed)?;

    match entry.compression {
        METHOD_STORED => Ok(compressed),
        METHOD_DEFLATE => {
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut out)?;
            if out.len() != entry.uncompressed_size as usize {
                return Err(bad_zip(format!(
                    "{} inflated to {} bytes, expected {}",
                    entry.name,
                    out.len(),
                    entry.uncompressed_size
                )));
            }
            Ok(out)
        }
        other => Err(bad_zip(format!("unsupported compression method {other}"))),
    }
}

/// Narrows by extension (png, then webp, then jpeg), prefers res directories
/// that hold launcher art, then takes the highest-scoring name. Ties keep
/// the first entry in directory order.
fn pick_icon_entry(entries: &[ZipEntry]) -> Option<&ZipEntry> {
    let with_ext = |exts: &[&str]| -> Vec<&ZipEntry> {
        entries
            .iter()
            .filter(|e| {
                let name = e.name.to_ascii_lowercase();
                exts.iter().any(|ext| name.ends_with(ext))
            })
            .collect()
    };

    let mut pool = with_ext(&[".png"]);
    if pool.is_empty() {
        pool = with_ext(&[".webp"]);
    }
    if pool.is_empty() {
        pool = with_ext(&[".jpg", ".jpeg"]);
    }

    let resourceful: Vec<&ZipEntry> = pool
        .iter()
        .copied()
        .filter(|e| {
            let name = e.name.to_ascii_lowercase();
            name.contains("mipmap") || name.contains("drawable")
        })
        .collect();
    if !resourceful.is_empty() {
        pool = resourceful;
    }

    let mut best: Option<(&ZipEntry, u32)> = None;
    for entry in pool {
        let score = score_entry(entry);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((entry, score)),
        }
    }
    best.map(|(entry, _)| entry)
}

fn score_entry(entry: &ZipEntry) -> u32 {
    let name = entry.name.to_ascii_lowercase();
    let mut score = 0u32;
    if name.contains("ic_launcher") {
        score += 1000;
    }
    if name.contains("ic_launcher_foreground") {
        score += 200;
    }
    if name.contains("app_icon") || name.contains("appicon") {
        score += 400;
    }
    if name.contains("icon") || name.contains("logo") {
        score += 150;
    }
    // longest density name first so xxxhdpi never counts twice
    score += if name.contains("xxxhdpi") {
        500
    } else if name.contains("xxhdpi") {
        400
    } else if name.contains("xhdpi") {
        300
    } else if name.contains("hdpi") {
        200
    } else if name.contains("mdpi") {
        100
    } else {
        0
    };
    score += 200.min(entry.uncompressed_size / 1024);
    score
}
