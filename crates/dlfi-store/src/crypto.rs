//! Blob encryption: per-blob data keys under a master key
//!
//! Each encrypted blob starts with a fixed-size header holding the stream
//! nonce, the DEK-wrap nonce, and the wrapped DEK. The body is the
//! XChaCha20-Poly1305 STREAM encryption of the plaintext in 64 KiB frames,
//! each frame carrying its own tag, so reads and writes never buffer a
//! whole file. The blob address stays the SHA-256 of the plaintext.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use dlfi_core::{DlfiError, Result, IO_CHUNK_SIZE};
use rand::RngCore;
use std::io::{Read, Write};

const MAGIC: [u8; 4] = *b"DLFB";
const VERSION: u8 = 1;

/// STREAM nonce: XChaCha nonce size (24) minus the 5-byte BE32 postfix.
const STREAM_NONCE_LEN: usize = 19;
const DEK_NONCE_LEN: usize = 24;
const WRAPPED_DEK_LEN: usize = 32 + TAG_LEN;

pub const TAG_LEN: usize = 16;
/// magic + version + stream nonce + dek nonce + wrapped dek
pub const HEADER_LEN: usize = 4 + 1 + STREAM_NONCE_LEN + DEK_NONCE_LEN + WRAPPED_DEK_LEN;

/// Ciphertext body length for a given plaintext length: one tag per frame,
/// and a zero-length plaintext still carries a single tag-only frame.
pub fn ciphertext_body_len(plaintext_len: u64) -> u64 {
    let chunk = IO_CHUNK_SIZE as u64;
    let frames = ((plaintext_len + chunk - 1) / chunk).max(1);
    plaintext_len + frames * TAG_LEN as u64
}

/// Parsed blob header
struct BlobHeader {
    stream_nonce: [u8; STREAM_NONCE_LEN],
    dek_nonce: [u8; DEK_NONCE_LEN],
    wrapped_dek: [u8; WRAPPED_DEK_LEN],
}

impl BlobHeader {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN || raw[..4] != MAGIC {
            return Err(DlfiError::Crypto("bad blob header".into()));
        }
        if raw[4] != VERSION {
            return Err(DlfiError::Crypto(format!(
                "unsupported blob header version {}",
                raw[4]
            )));
        }
        let mut stream_nonce = [0u8; STREAM_NONCE_LEN];
        let mut dek_nonce = [0u8; DEK_NONCE_LEN];
        let mut wrapped_dek = [0u8; WRAPPED_DEK_LEN];
        let mut at = 5;
        stream_nonce.copy_from_slice(&raw[at..at + STREAM_NONCE_LEN]);
        at += STREAM_NONCE_LEN;
        dek_nonce.copy_from_slice(&raw[at..at + DEK_NONCE_LEN]);
        at += DEK_NONCE_LEN;
        wrapped_dek.copy_from_slice(&raw[at..at + WRAPPED_DEK_LEN]);
        Ok(Self {
            stream_nonce,
            dek_nonce,
            wrapped_dek,
        })
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&MAGIC);
        out[4] = VERSION;
        let mut at = 5;
        out[at..at + STREAM_NONCE_LEN].copy_from_slice(&self.stream_nonce);
        at += STREAM_NONCE_LEN;
        out[at..at + DEK_NONCE_LEN].copy_from_slice(&self.dek_nonce);
        at += DEK_NONCE_LEN;
        out[at..at + WRAPPED_DEK_LEN].copy_from_slice(&self.wrapped_dek);
        out
    }
}

/// Master-keyed cipher handling all per-blob encryption
#[derive(Clone)]
pub struct BlobCipher {
    master_key: [u8; 32],
}

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCipher").finish_non_exhaustive()
    }
}

impl BlobCipher {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    fn master(&self) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(&self.master_key)
            .map_err(|e| DlfiError::Crypto(e.to_string()))
    }

    fn wrap_dek(&self, dek: &[u8; 32], nonce: &[u8; DEK_NONCE_LEN]) -> Result<[u8; WRAPPED_DEK_LEN]> {
        let wrapped = self
            .master()?
            .encrypt(XNonce::from_slice(nonce), dek.as_slice())
            .map_err(|e| DlfiError::Crypto(e.to_string()))?;
        let mut out = [0u8; WRAPPED_DEK_LEN];
        out.copy_from_slice(&wrapped);
        Ok(out)
    }

    fn unwrap_dek(&self, header: &BlobHeader) -> Result<[u8; 32]> {
        let dek = self
            .master()?
            .decrypt(
                XNonce::from_slice(&header.dek_nonce),
                header.wrapped_dek.as_slice(),
            )
            .map_err(|_| DlfiError::DecryptionFailed)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&dek);
        Ok(out)
    }

    /// Encrypt `reader` into `writer` as header + framed body.
    /// Returns the total bytes written (header included).
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let mut rng = rand::thread_rng();
        let mut dek = [0u8; 32];
        rng.fill_bytes(&mut dek);
        let mut stream_nonce = [0u8; STREAM_NONCE_LEN];
        rng.fill_bytes(&mut stream_nonce);
        let mut dek_nonce = [0u8; DEK_NONCE_LEN];
        rng.fill_bytes(&mut dek_nonce);

        let header = BlobHeader {
            stream_nonce,
            dek_nonce,
            wrapped_dek: self.wrap_dek(&dek, &dek_nonce)?,
        };
        writer.write_all(&header.encode())?;
        let mut written = HEADER_LEN as u64;

        let cipher = XChaCha20Poly1305::new_from_slice(&dek)
            .map_err(|e| DlfiError::Crypto(e.to_string()))?;
        let mut enc = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&stream_nonce));

        // One-chunk lookahead so the final frame is sealed with the
        // last-frame flag.
        let mut cur = vec![0u8; IO_CHUNK_SIZE];
        let mut next = vec![0u8; IO_CHUNK_SIZE];
        let mut cur_len = read_chunk(&mut reader, &mut cur)?;
        loop {
            let next_len = read_chunk(&mut reader, &mut next)?;
            if next_len == 0 {
                let frame = enc
                    .encrypt_last(&cur[..cur_len])
                    .map_err(|e| DlfiError::Crypto(e.to_string()))?;
                writer.write_all(&frame)?;
                written += frame.len() as u64;
                break;
            }
            let frame = enc
                .encrypt_next(&cur[..cur_len])
                .map_err(|e| DlfiError::Crypto(e.to_string()))?;
            writer.write_all(&frame)?;
            written += frame.len() as u64;
            std::mem::swap(&mut cur, &mut next);
            cur_len = next_len;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Open a plaintext reader over an encrypted blob of `total_len` bytes
    /// on disk (header included). Fails `DecryptionFailed` for a wrong key.
    pub fn decrypt_reader<R: Read>(&self, mut reader: R, total_len: u64) -> Result<DecryptReader<R>> {
        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw)?;
        let header = BlobHeader::parse(&raw)?;
        let dek = self.unwrap_dek(&header)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&dek)
            .map_err(|e| DlfiError::Crypto(e.to_string()))?;
        let dec = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&header.stream_nonce));
        Ok(DecryptReader {
            inner: reader,
            dec: Some(dec),
            remaining: total_len.saturating_sub(HEADER_LEN as u64),
            buf: Vec::new(),
            pos: 0,
        })
    }

    /// Rotation: unwrap the DEK in a stored header under `self` and rewrap
    /// it under `new`, in place. The ciphertext body is untouched.
    pub fn rewrap_header(&self, new: &BlobCipher, raw: &mut [u8]) -> Result<()> {
        let mut header = BlobHeader::parse(raw)?;
        let dek = self.unwrap_dek(&header)?;
        let mut dek_nonce = [0u8; DEK_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut dek_nonce);
        header.dek_nonce = dek_nonce;
        header.wrapped_dek = new.wrap_dek(&dek, &dek_nonce)?;
        raw[..HEADER_LEN].copy_from_slice(&header.encode());
        Ok(())
    }
}

/// Streaming plaintext view of an encrypted blob
pub struct DecryptReader<R> {
    inner: R,
    dec: Option<DecryptorBE32<XChaCha20Poly1305>>,
    /// Ciphertext body bytes not yet consumed
    remaining: u64,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> DecryptReader<R> {
    fn fill(&mut self) -> Result<()> {
        let frame_cap = (IO_CHUNK_SIZE + TAG_LEN) as u64;
        let frame_len = self.remaining.min(frame_cap) as usize;
        let mut frame = vec![0u8; frame_len];
        self.inner.read_exact(&mut frame)?;
        self.remaining -= frame_len as u64;
        let last = self.remaining == 0;
        let plain = if last {
            match self.dec.take() {
                Some(dec) => dec
                    .decrypt_last(frame.as_slice())
                    .map_err(|_| DlfiError::DecryptionFailed)?,
                None => return Err(DlfiError::Crypto("read past end of stream".into())),
            }
        } else {
            match self.dec.as_mut() {
                Some(dec) => dec
                    .decrypt_next(frame.as_slice())
                    .map_err(|_| DlfiError::DecryptionFailed)?,
                None => return Err(DlfiError::Crypto("read past end of stream".into())),
            }
        };
        self.buf = plain;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.fill()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Read until `buf` is full or EOF; returns the bytes read.
pub fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
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

    fn cipher(byte: u8) -> BlobCipher {
        BlobCipher::new([byte; 32])
    }

    #[test]
    fn roundtrip_small() {
        let c = cipher(1);
        let plaintext = b"hello world, jojo".to_vec();
        let mut ct = Vec::new();
        let written = c.encrypt_stream(plaintext.as_slice(), &mut ct).unwrap();
        assert_eq!(written as usize, ct.len());
        assert_eq!(ct.len() as u64, HEADER_LEN as u64 + ciphertext_body_len(17));

        let mut out = Vec::new();
        c.decrypt_reader(ct.as_slice(), ct.len() as u64)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn roundtrip_empty() {
        let c = cipher(2);
        let mut ct = Vec::new();
        c.encrypt_stream(&[] as &[u8], &mut ct).unwrap();
        assert_eq!(ct.len(), HEADER_LEN + TAG_LEN);

        let mut out = Vec::new();
        c.decrypt_reader(ct.as_slice(), ct.len() as u64)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn roundtrip_multi_frame() {
        let c = cipher(3);
        let plaintext: Vec<u8> = (0..IO_CHUNK_SIZE * 2 + 123).map(|i| (i % 251) as u8).collect();
        let mut ct = Vec::new();
        c.encrypt_stream(plaintext.as_slice(), &mut ct).unwrap();
        assert_eq!(
            ct.len() as u64,
            HEADER_LEN as u64 + ciphertext_body_len(plaintext.len() as u64)
        );

        let mut out = Vec::new();
        c.decrypt_reader(ct.as_slice(), ct.len() as u64)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let c = cipher(4);
        let mut ct = Vec::new();
        c.encrypt_stream(&b"secret"[..], &mut ct).unwrap();

        let err = cipher(5)
            .decrypt_reader(ct.as_slice(), ct.len() as u64)
            .err()
            .expect("wrong key must fail");
        assert!(matches!(err, DlfiError::DecryptionFailed));
    }

    #[test]
    fn tampered_body_fails() {
        let c = cipher(6);
        let mut ct = Vec::new();
        c.encrypt_stream(&b"secret payload"[..], &mut ct).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;

        let mut reader = c.decrypt_reader(ct.as_slice(), ct.len() as u64).unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn rewrap_preserves_body() {
        let old = cipher(7);
        let new = cipher(8);
        let plaintext = b"rotate me".to_vec();
        let mut ct = Vec::new();
        old.encrypt_stream(plaintext.as_slice(), &mut ct).unwrap();

        let body_before = ct[HEADER_LEN..].to_vec();
        old.rewrap_header(&new, &mut ct).unwrap();
        assert_eq!(&ct[HEADER_LEN..], body_before.as_slice());

        let mut out = Vec::new();
        new.decrypt_reader(ct.as_slice(), ct.len() as u64)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, plaintext);

        // The old master key no longer opens it.
        assert!(old.decrypt_reader(ct.as_slice(), ct.len() as u64).is_err());
    }
}
