use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::signature::hazmat::PrehashSigner;
use rsa::signature::SignatureEncoding;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha1::Sha1;

use crate::error::{AdbError, Result};

const KEY_BITS: usize = 2048;
const KEY_FILE_NAME: &str = "adbkey";

/// The device-facing RSA identity: a 2048-bit keypair persisted next to the
/// place adb itself keeps one.
pub struct AdbKey {
    private: RsaPrivateKey,
}

impl AdbKey {
    /// Loads the key at `path`, or generates and persists a fresh one.
    ///
    /// A directory or extensionless `path` gets `adbkey` appended; anything
    /// else is used verbatim. A file that does not parse (or holds a key of
    /// the wrong size) is regenerated in place.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let key_file = resolve_key_file(path);

        if key_file.exists() {
            match fs::read_to_string(&key_file) {
                Ok(text) => match parse_private_key(&text) {
                    Some(private) if private.size() == KEY_BITS / 8 => {
                        log::debug!("loaded key from {}", key_file.display());
                        return Ok(Self { private });
                    }
                    Some(_) => {
                        log::warn!(
                            "{} holds a key of the wrong size, regenerating",
                            key_file.display()
                        )
                    }
                    None => {
                        log::warn!("{} is not a usable RSA key, regenerating", key_file.display())
                    }
                },
                Err(e) => log::warn!("cannot read {}: {e}", key_file.display()),
            }
        }

        log::info!("generating a new {KEY_BITS}-bit RSA key at {}", key_file.display());
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AdbError::KeyGeneration(e.to_string()))?;
        let key = Self { private };
        key.persist(&key_file)?;
        Ok(key)
    }

    /// Signs the 20-byte token from an AUTH challenge. The token is already a
    /// digest, so it goes into the PKCS#1 v1.5 DigestInfo as a SHA-1 prehash;
    /// that is the byte-exact signature adbd verifies.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>> {
        let signer = SigningKey::<Sha1>::new(self.private.clone());
        let signature = signer
            .sign_prehash(token)
            .map_err(|e| AdbError::Protocol(format!("rsa signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    /// The `ssh-rsa <base64> <comment>` line adbd shows in its authorization
    /// prompt. The base64 blob is three length-prefixed fields: the literal
    /// `ssh-rsa`, the exponent mpint, the modulus mpint.
    pub fn public_key_line(&self) -> String {
        let mut blob = Vec::new();
        write_ssh_string(&mut blob, b"ssh-rsa");
        write_mpint(&mut blob, &self.private.e().to_bytes_be());
        write_mpint(&mut blob, &self.private.n().to_bytes_be());
        format!("ssh-rsa {} {}", general_purpose::STANDARD.encode(&blob), key_comment())
    }

    fn persist(&self, key_file: &Path) -> Result<()> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = key_file.parent() {
                fs::create_dir_all(parent)?;
            }
            let pem = self
                .private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            write_atomic(key_file, pem.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(key_file, fs::Permissions::from_mode(0o600))?;
            }
            let pub_file = key_file.with_extension("pub");
            write_atomic(&pub_file, format!("{}\n", self.public_key_line()).as_bytes())
        };
        write().map_err(|e| AdbError::KeyGeneration(format!("persisting key: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn generate_for_tests() -> Self {
        let mut rng = rand::thread_rng();
        Self { private: RsaPrivateKey::new(&mut rng, KEY_BITS).unwrap() }
    }

    #[cfg(test)]
    pub(crate) fn rsa(&self) -> &RsaPrivateKey {
        &self.private
    }
}

fn resolve_key_file(path: &Path) -> PathBuf {
    if path.is_dir() || path.extension().is_none() {
        path.join(KEY_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

fn parse_private_key(text: &str) -> Option<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(text)
        .ok()
        .or_else(|| RsaPrivateKey::from_pkcs1_pem(text).ok())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn key_comment() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    format!("{user}@apkbeam")
}

fn write_ssh_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// SSH mpint: big-endian, leading zeros trimmed, a 0x00 prepended when the
/// high bit is set.
fn write_mpint(out: &mut Vec<u8>, bytes_be: &[u8]) {
    let first = bytes_be.iter().position(|&b| b != 0).unwrap_or(bytes_be.len());
    let trimmed = &bytes_be[first..];
    let pad = trimmed.first().is_some_and(|&b| b & 0x80 != 0);
    out.extend_from_slice(&((trimmed.len() + pad as usize) as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
}

#[cfg(test)]
fn read_ssh_string<'a>(blob: &mut &'a [u8]) -> Option<&'a [u8]> {
    if blob.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes(blob[..4].try_into().unwrap()) as usize;
    if blob.len() < 4 + len {
        return None;
    }
    let field = &blob[4..4 + len];
    *blob = &blob[4 + len..];
    Some(field)
}

/// Parses a public-key line back into (exponent, modulus) mpint bytes.
#[cfg(test)]
pub(crate) fn decode_public_key_line(line: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let b64 = line.strip_prefix("ssh-rsa ")?.split_whitespace().next()?;
    let blob = general_purpose::STANDARD.decode(b64).ok()?;
    let mut rest = blob.as_slice();
    let kind = read_ssh_string(&mut rest)?;
    if kind != b"ssh-rsa" {
        return None;
    }
    let e = read_ssh_string(&mut rest)?.to_vec();
    let n = read_ssh_string(&mut rest)?.to_vec();
    rest.is_empty().then_some((e, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::hazmat::PrehashVerifier;
    use rsa::RsaPublicKey;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_key_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_key_file(dir.path()), dir.path().join("adbkey"));
        assert_eq!(
            resolve_key_file(&dir.path().join("keys")),
            dir.path().join("keys").join("adbkey")
        );
        let explicit = dir.path().join("my.key");
        assert_eq!(resolve_key_file(&explicit), explicit);
    }

    #[test]
    fn test_create_persist_reload_and_sign() {
        let dir = TempDir::new().unwrap();
        let key = AdbKey::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join("adbkey").exists());
        assert!(dir.path().join("adbkey.pub").exists());

        // reload picks up the same key instead of regenerating
        let reloaded = AdbKey::load_or_create(dir.path()).unwrap();
        assert_eq!(key.public_key_line(), reloaded.public_key_line());

        // the persisted public line matches the private key
        let on_disk = fs::read_to_string(dir.path().join("adbkey.pub")).unwrap();
        assert_eq!(on_disk.trim_end(), key.public_key_line());

        // a token signed by the reloaded key verifies against the original
        // key under PKCS#1 v1.5 / SHA-1
        let token = [0x5au8; 20];
        let signature = reloaded.sign_token(&token).unwrap();
        let verifier = VerifyingKey::<Sha1>::new(RsaPublicKey::from(key.rsa()));
        let signature = Signature::try_from(signature.as_slice()).unwrap();
        verifier.verify_prehash(&token, &signature).unwrap();
    }

    #[test]
    fn test_public_key_line_roundtrip() {
        let key = AdbKey::generate_for_tests();
        let line = key.public_key_line();
        let (e, n) = decode_public_key_line(&line).unwrap();
        assert_eq!(e, key.rsa().e().to_bytes_be());
        // a 2048-bit modulus always has its high bit set, so the mpint
        // carries a leading zero byte
        assert_eq!(n.len(), 257);
        assert_eq!(n[0], 0);
        assert_eq!(&n[1..], key.rsa().n().to_bytes_be().as_slice());
    }

    #[test]
    fn test_garbage_key_file_is_regenerated() {
        let dir = TempDir::new().unwrap();
        let key_file = dir.path().join("adbkey");
        fs::write(&key_file, "not a key").unwrap();
        let key = AdbKey::load_or_create(dir.path()).unwrap();
        let reloaded = AdbKey::load_or_create(dir.path()).unwrap();
        assert_eq!(key.public_key_line(), reloaded.public_key_line());
    }
}
