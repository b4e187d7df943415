use std::io::Write;

use crate::cert;
use crate::{align_up, Error, Result};

use log::error;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const RSA4096_SHA1: u32 = 0x10000;
pub const RSA2048_SHA1: u32 = 0x10001;
pub const ELLIPTIC_SHA1: u32 = 0x10002;
pub const RSA4096_SHA256: u32 = 0x10003;
pub const RSA2048_SHA256: u32 = 0x10004;
pub const ECDSA_SHA256: u32 = 0x10005;

fn signature_size(sig_type: u32) -> Option<usize> {
    match sig_type {
        RSA4096_SHA1 | RSA4096_SHA256 => Some(0x200),
        RSA2048_SHA1 | RSA2048_SHA256 => Some(0x100),
        ELLIPTIC_SHA1 | ECDSA_SHA256 => Some(0x3C),
        _ => {
            error!("Invalid signature type {sig_type:#x}");
            None
        }
    }
}

/// Signature envelope prefixed to tickets, TMDs and certificates. The type
/// word and total on-disk footprint are aligned up to 0x40.
#[derive(Clone, Debug, Default)]
pub struct Signature {
    pub sig_type: u32,
    pub data: Vec<u8>,
}

impl Signature {
    pub fn load(file_data: &[u8], offset: usize) -> Result<Self> {
        let type_bytes: [u8; 4] = file_data
            .get(offset..offset + 4)
            .ok_or(Error::OutOfRange)?
            .try_into()
            .unwrap();
        let sig_type = u32::from_be_bytes(type_bytes);

        let data_size = signature_size(sig_type).ok_or(Error::Unsupported("signature type"))?;
        let data = file_data
            .get(offset + 4..offset + 4 + data_size)
            .ok_or(Error::OutOfRange)?
            .to_vec();
        Ok(Self { sig_type, data })
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.sig_type.to_be_bytes())?;
        writer.write_all(&self.data)?;
        let padding = self.size() - self.data.len() - 4;
        writer.write_all(&vec![0u8; padding])?;
        Ok(())
    }

    /// On-disk size including the trailing alignment padding.
    #[must_use]
    pub fn size(&self) -> usize {
        align_up(self.data.len() + 4, 0x40)
    }

    /// Verifies an RSA-2048/SHA-256 signature against the named issuer
    /// certificate. The caller feeds the signed message into the hasher.
    pub fn verify(&self, issuer: &str, update: impl FnOnce(&mut Sha256)) -> Result<()> {
        let cert = cert::get(issuer).ok_or_else(|| {
            error!("Certificate {issuer} not loaded");
            Error::SignatureCorrupted
        })?;
        if self.sig_type != RSA2048_SHA256 || cert.body.key_type() != cert::PublicKeyType::Rsa2048 {
            error!("Unsupported signature type or cert public key type");
            return Err(Error::Unsupported("signature type"));
        }

        let (modulus, exponent) = cert.rsa_public_key()?;
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from_bytes_be(exponent),
        )
        .map_err(|_| Error::SignatureCorrupted)?;

        let mut hasher = Sha256::new();
        update(&mut hasher);
        let digest = hasher.finalize();

        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &self.data)
            .map_err(|_| Error::SignatureCorrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_type_and_data() {
        let mut blob = vec![0u8; 0x200];
        blob[..4].copy_from_slice(&RSA2048_SHA256.to_be_bytes());
        blob[4..0x104].fill(0xEE);
        let sig = Signature::load(&blob, 0).unwrap();
        assert_eq!(sig.sig_type, RSA2048_SHA256);
        assert_eq!(sig.data, vec![0xEE; 0x100]);
        // 4 + 0x100 aligned up to 0x40
        assert_eq!(sig.size(), 0x140);
    }

    #[test]
    fn save_pads_to_aligned_size() {
        let sig = Signature {
            sig_type: ECDSA_SHA256,
            data: vec![0xAB; 0x3C],
        };
        let mut out = Vec::new();
        sig.save(&mut out).unwrap();
        assert_eq!(out.len(), sig.size());
        assert_eq!(out.len(), 0x80);
        assert_eq!(&out[..4], &ECDSA_SHA256.to_be_bytes());
        assert_eq!(&out[4..0x40], &[0xAB; 0x3C]);
        assert!(out[0x40..].iter().all(|b| *b == 0));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let blob = [0xFFu8; 0x40];
        assert!(Signature::load(&blob, 0).is_err());
    }
}
