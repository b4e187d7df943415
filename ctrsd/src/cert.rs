use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::container::DataContainer;
use crate::signature::Signature;
use crate::string::SizedCString;
use crate::{Error, Layout, Result};

use log::error;
use static_assertions::assert_eq_size;

/// Full names of the certificates contained in a CIA.
pub const CIA_CERT_NAMES: [&str; 3] = [
    "Root-CA00000003",
    "Root-CA00000003-XS0000000c",
    "Root-CA00000003-CP0000000b",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublicKeyType {
    Rsa4096,
    Rsa2048,
    Ecc,
}

impl PublicKeyType {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rsa4096),
            1 => Some(Self::Rsa2048),
            2 => Some(Self::Ecc),
            _ => None,
        }
    }

    /// Public key byte count, paddings included (0x34 for RSA, 0x3C for ECC).
    fn public_key_size(self) -> usize {
        match self {
            Self::Rsa4096 => 0x238,
            Self::Rsa2048 => 0x138,
            Self::Ecc => 0x78,
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CertificateBody {
    pub issuer: SizedCString<0x40>,
    key_type: [u8; 4],
    pub name: SizedCString<0x40>,
    expiration: [u8; 4],
}
assert_eq_size!([u8; 0x88], CertificateBody);
unsafe impl Layout for CertificateBody {}

impl CertificateBody {
    #[must_use]
    pub fn key_type(&self) -> PublicKeyType {
        PublicKeyType::from_raw(u32::from_be_bytes(self.key_type)).unwrap_or(PublicKeyType::Ecc)
    }
}

#[derive(Clone)]
pub struct Certificate {
    pub signature: Signature,
    pub body: CertificateBody,
    pub public_key: Vec<u8>,
}

impl Certificate {
    pub fn load(file_data: &[u8], offset: usize) -> Result<Self> {
        let signature = Signature::load(file_data, offset)?;
        let signature_size = signature.size();
        let body = CertificateBody::read_from(file_data, offset + signature_size)?;

        // Public key lengths are variable
        let raw_key_type = u32::from_be_bytes(body.key_type);
        let key_type = PublicKeyType::from_raw(raw_key_type).ok_or_else(|| {
            error!("Tried to read cert with bad public key {raw_key_type}");
            Error::Unsupported("public key type")
        })?;

        let public_key_offset = offset + signature_size + core::mem::size_of::<CertificateBody>();
        let public_key = file_data
            .get(public_key_offset..public_key_offset + key_type.public_key_size())
            .ok_or(Error::OutOfRange)?
            .to_vec();

        Ok(Self {
            signature,
            body,
            public_key,
        })
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.signature.save(writer)?;
        writer.write_all(self.body.as_bytes())?;
        writer.write_all(&self.public_key)?;
        Ok(())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.signature.size() + core::mem::size_of::<CertificateBody>() + self.public_key.len()
    }

    /// Raw (modulus, exponent) byte views for the RSA key types.
    pub fn rsa_public_key(&self) -> Result<(&[u8], &[u8])> {
        match self.body.key_type() {
            PublicKeyType::Rsa2048 => Ok((&self.public_key[..0x100], &self.public_key[0x100..0x104])),
            PublicKeyType::Rsa4096 => Ok((&self.public_key[..0x200], &self.public_key[0x200..0x204])),
            PublicKeyType::Ecc => Err(Error::Unsupported("public key type")),
        }
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CertsDbHeader {
    magic: [u8; 4],
    size: u32,
}
assert_eq_size!([u8; 8], CertsDbHeader);
unsafe impl Layout for CertsDbHeader {}

struct CertStore {
    certs: HashMap<String, Certificate>,
    is_loaded: bool,
}

static CERT_STORE: OnceLock<Mutex<CertStore>> = OnceLock::new();

fn store() -> MutexGuard<'static, CertStore> {
    CERT_STORE
        .get_or_init(|| {
            Mutex::new(CertStore {
                certs: HashMap::new(),
                is_loaded: false,
            })
        })
        .lock()
        .unwrap()
}

/// Loads the process-wide certificate store from a certs.db image
/// (a DIFF container whose payload is a CERT record list).
pub fn load(path: &Path) -> Result<()> {
    let container = DataContainer::new(fs::read(path)?)?;
    let data = container.ivfc_level4_data()?;
    load_from_bytes(&data[0])
}

pub(crate) fn load_from_bytes(data: &[u8]) -> Result<()> {
    let mut certs = HashMap::new();

    let header = CertsDbHeader::read_from(data, 0)?;
    if &header.magic != b"CERT" {
        error!("Certificate database is invalid");
        return Err(Error::InvalidMagic);
    }

    let total_size = header.size as usize + core::mem::size_of::<CertsDbHeader>();
    if data.len() < total_size {
        error!("Certificate database reports invalid size, may be corrupted");
        return Err(Error::OutOfRange);
    }

    let mut pos = core::mem::size_of::<CertsDbHeader>();
    while pos < total_size {
        let cert = Certificate::load(data, pos)?;
        pos += cert.size();

        let full_name = format!(
            "{}-{}",
            cert.body.issuer.zero_terminated(),
            cert.body.name.zero_terminated()
        );
        certs.insert(full_name, cert);
    }

    for name in CIA_CERT_NAMES {
        if !certs.contains_key(name) {
            error!("Cert {name} required for CIA building but does not exist");
            return Err(Error::MissingRegion);
        }
    }

    let mut store = store();
    store.certs = certs;
    store.is_loaded = true;
    Ok(())
}

#[must_use]
pub fn is_loaded() -> bool {
    store().is_loaded
}

#[must_use]
pub fn get(name: &str) -> Option<Certificate> {
    store().certs.get(name).cloned()
}

#[must_use]
pub fn exists(name: &str) -> bool {
    store().certs.contains_key(name)
}

pub fn clear() {
    let mut store = store();
    store.certs.clear();
    store.is_loaded = false;
}
