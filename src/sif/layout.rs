//! Bit-exact on-disk layout of a SIF image
//!
//! Everything here is little-endian and fixed-size: a 128-byte global
//! header at offset zero, a table of 588-byte descriptor records at the
//! header-declared offset, and page-aligned data objects after the table.

use crate::errors::SifError;

pub const LAUNCH_LEN: usize = 32;
pub const MAGIC_LEN: usize = 10;
pub const VERSION_LEN: usize = 3;
pub const ARCH_LEN: usize = 3;
pub const ID_LEN: usize = 16;
pub const NAME_LEN: usize = 128;
pub const EXTRA_LEN: usize = 384;

pub const HEADER_LEN: usize = 128;
pub const DESCRIPTOR_LEN: usize = 588;

/// Interpreter line written at offset zero so the image is runnable
pub const DEFAULT_LAUNCH: &[u8] = b"#!/usr/bin/env sifbox run\n";

pub const SIF_MAGIC: &[u8; MAGIC_LEN] = b"SIF_MAGIC\0";
pub const SIF_VERSION: &[u8; VERSION_LEN] = b"01\0";

/// Fixed capacity of the descriptor table
pub const DESCRIPTOR_CAPACITY: usize = 48;

/// High nibble marks a group id, so `link` can reference either a
/// descriptor id or a whole group
pub const GROUP_MASK: u32 = 0xf000_0000;
pub const UNUSED_GROUP: u32 = GROUP_MASK;
pub const UNUSED_LINK: u32 = 0;

pub const ARCH_UNKNOWN: &[u8; ARCH_LEN] = b"00\0";

const ARCH_TABLE: &[(&str, &[u8; ARCH_LEN])] = &[
    ("386", b"01\0"),
    ("amd64", b"02\0"),
    ("arm", b"03\0"),
    ("arm64", b"04\0"),
    ("ppc64", b"05\0"),
    ("ppc64le", b"06\0"),
    ("mips", b"07\0"),
    ("mipsle", b"08\0"),
    ("mips64", b"09\0"),
    ("mips64le", b"0a\0"),
    ("s390x", b"0b\0"),
];

/// Map a toolchain architecture name to its on-disk code
pub fn arch_code(name: &str) -> Result<&'static [u8; ARCH_LEN], SifError> {
    ARCH_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
        .ok_or_else(|| SifError::UnknownArchitecture(name.to_string()))
}

/// Map an on-disk architecture code back to its name
pub fn arch_name(code: &[u8; ARCH_LEN]) -> &'static str {
    ARCH_TABLE
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(n, _)| *n)
        .unwrap_or("unknown")
}

/// What kind of object a descriptor points at
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Datatype {
    Deffile = 0x4001,
    EnvVar = 0x4002,
    Labels = 0x4003,
    Partition = 0x4004,
    Signature = 0x4005,
    GenericJson = 0x4006,
    Generic = 0x4007,
    CryptoMessage = 0x4008,
}

impl Datatype {
    pub fn from_raw(raw: i32) -> Option<Datatype> {
        match raw {
            0x4001 => Some(Datatype::Deffile),
            0x4002 => Some(Datatype::EnvVar),
            0x4003 => Some(Datatype::Labels),
            0x4004 => Some(Datatype::Partition),
            0x4005 => Some(Datatype::Signature),
            0x4006 => Some(Datatype::GenericJson),
            0x4007 => Some(Datatype::Generic),
            0x4008 => Some(Datatype::CryptoMessage),
            _ => None,
        }
    }
}

/// Filesystem stored in a partition object
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Fstype {
    Squash = 1,
    Ext3 = 2,
    ImmuObj = 3,
    Raw = 4,
    EncryptedSquash = 5,
}

impl Fstype {
    pub fn from_raw(raw: i32) -> Option<Fstype> {
        match raw {
            1 => Some(Fstype::Squash),
            2 => Some(Fstype::Ext3),
            3 => Some(Fstype::ImmuObj),
            4 => Some(Fstype::Raw),
            5 => Some(Fstype::EncryptedSquash),
            _ => None,
        }
    }

    /// Name understood by mount(2) for this filesystem, where one exists
    pub fn mount_name(&self) -> Option<&'static str> {
        match self {
            Fstype::Squash | Fstype::EncryptedSquash => Some("squashfs"),
            Fstype::Ext3 => Some("ext3"),
            Fstype::ImmuObj | Fstype::Raw => None,
        }
    }
}

/// Role of a partition object within the image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Parttype {
    System = 1,
    PrimSys = 2,
    Data = 3,
    Overlay = 4,
}

impl Parttype {
    pub fn from_raw(raw: i32) -> Option<Parttype> {
        match raw {
            1 => Some(Parttype::System),
            2 => Some(Parttype::PrimSys),
            3 => Some(Parttype::Data),
            4 => Some(Parttype::Overlay),
            _ => None,
        }
    }
}

/// Hash function recorded with a signature object
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Hashtype {
    Sha256 = 1,
    Sha384 = 2,
    Sha512 = 3,
    Blake2s = 4,
    Blake2b = 5,
}

impl Hashtype {
    pub fn from_raw(raw: i32) -> Option<Hashtype> {
        match raw {
            1 => Some(Hashtype::Sha256),
            2 => Some(Hashtype::Sha384),
            3 => Some(Hashtype::Sha512),
            4 => Some(Hashtype::Blake2s),
            5 => Some(Hashtype::Blake2b),
            _ => None,
        }
    }
}

/// Encoding of a crypto message object
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Formattype {
    Pem = 1,
}

/// Content of a crypto message object
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum Messagetype {
    RsaOaep = 1,
}

/// Global file header, serialized at offset zero, written last so a
/// reader never observes a header pointing at a partially written table
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub launch: [u8; LAUNCH_LEN],
    pub magic: [u8; MAGIC_LEN],
    pub version: [u8; VERSION_LEN],
    pub arch: [u8; ARCH_LEN],
    pub id: [u8; ID_LEN],
    pub ctime: i64,
    pub mtime: i64,
    pub dfree: i64,
    pub dtotal: i64,
    pub descroff: i64,
    pub descrlen: i64,
    pub dataoff: i64,
    pub datalen: i64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut w = Writer::new(&mut buf);
        w.bytes(&self.launch);
        w.bytes(&self.magic);
        w.bytes(&self.version);
        w.bytes(&self.arch);
        w.bytes(&self.id);
        w.i64(self.ctime);
        w.i64(self.mtime);
        w.i64(self.dfree);
        w.i64(self.dtotal);
        w.i64(self.descroff);
        w.i64(self.descrlen);
        w.i64(self.dataoff);
        w.i64(self.datalen);
        w.finish(HEADER_LEN);
        buf
    }

    /// Decode and validate a header, distinguishing a bad magic from an
    /// on-disk version newer than this build supports
    pub fn decode(buf: &[u8]) -> Result<Header, SifError> {
        if buf.len() < HEADER_LEN {
            return Err(SifError::Truncated);
        }
        let mut r = Reader::new(buf);
        let header = Header {
            launch: r.array(),
            magic: r.array(),
            version: r.array(),
            arch: r.array(),
            id: r.array(),
            ctime: r.i64(),
            mtime: r.i64(),
            dfree: r.i64(),
            dtotal: r.i64(),
            descroff: r.i64(),
            descrlen: r.i64(),
            dataoff: r.i64(),
            datalen: r.i64(),
        };
        if &header.magic != SIF_MAGIC {
            return Err(SifError::BadMagic);
        }
        if &header.version > SIF_VERSION {
            return Err(SifError::UnsupportedVersion {
                found: String::from_utf8_lossy(&header.version[..VERSION_LEN - 1]).into_owned(),
            });
        }
        Ok(header)
    }

    pub fn arch_name(&self) -> &'static str {
        arch_name(&self.arch)
    }
}

/// One metadata record describing a single data object
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub dtype: i32,
    pub used: bool,
    pub id: u32,
    pub group: u32,
    pub link: u32,
    pub fileoff: i64,
    pub filelen: i64,
    pub storelen: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub uid: i64,
    pub gid: i64,
    pub name: [u8; NAME_LEN],
    pub extra: [u8; EXTRA_LEN],
}

impl Descriptor {
    /// An unused, zero-filled table slot
    pub fn empty() -> Descriptor {
        Descriptor {
            dtype: 0,
            used: false,
            id: 0,
            group: UNUSED_GROUP,
            link: UNUSED_LINK,
            fileoff: 0,
            filelen: 0,
            storelen: 0,
            ctime: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            name: [0; NAME_LEN],
            extra: [0; EXTRA_LEN],
        }
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        let mut w = Writer::new(&mut buf);
        w.i32(self.dtype);
        w.u32(self.used as u32);
        w.u32(self.id);
        w.u32(self.group);
        w.u32(self.link);
        w.i64(self.fileoff);
        w.i64(self.filelen);
        w.i64(self.storelen);
        w.i64(self.ctime);
        w.i64(self.mtime);
        w.i64(self.uid);
        w.i64(self.gid);
        w.bytes(&self.name);
        w.bytes(&self.extra);
        w.finish(DESCRIPTOR_LEN);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Descriptor, SifError> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(SifError::Truncated);
        }
        let mut r = Reader::new(buf);
        Ok(Descriptor {
            dtype: r.i32(),
            used: r.u32() != 0,
            id: r.u32(),
            group: r.u32(),
            link: r.u32(),
            fileoff: r.i64(),
            filelen: r.i64(),
            storelen: r.i64(),
            ctime: r.i64(),
            mtime: r.i64(),
            uid: r.i64(),
            gid: r.i64(),
            name: r.array(),
            extra: r.array(),
        })
    }

    pub fn datatype(&self) -> Option<Datatype> {
        Datatype::from_raw(self.dtype)
    }

    /// Descriptor name with the zero padding stripped
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), SifError> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_LEN {
            return Err(SifError::NameTooLong(NAME_LEN - 1));
        }
        self.name = [0; NAME_LEN];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn partition(&self) -> Result<PartitionExtra, SifError> {
        if self.datatype() != Some(Datatype::Partition) {
            return Err(SifError::InvalidField {
                field: "datatype",
                value: self.dtype as i64,
            });
        }
        PartitionExtra::decode(&self.extra)
    }

    pub fn set_partition(&mut self, part: &PartitionExtra) {
        self.extra = [0; EXTRA_LEN];
        part.encode(&mut self.extra);
    }

    pub fn signature(&self) -> Result<SignatureExtra, SifError> {
        if self.datatype() != Some(Datatype::Signature) {
            return Err(SifError::InvalidField {
                field: "datatype",
                value: self.dtype as i64,
            });
        }
        SignatureExtra::decode(&self.extra)
    }

    pub fn set_signature(&mut self, sig: &SignatureExtra) -> Result<(), SifError> {
        self.extra = [0; EXTRA_LEN];
        sig.encode(&mut self.extra)
    }

    pub fn crypto(&self) -> Result<CryptoExtra, SifError> {
        if self.datatype() != Some(Datatype::CryptoMessage) {
            return Err(SifError::InvalidField {
                field: "datatype",
                value: self.dtype as i64,
            });
        }
        CryptoExtra::decode(&self.extra)
    }

    pub fn set_crypto(&mut self, msg: &CryptoExtra) {
        self.extra = [0; EXTRA_LEN];
        msg.encode(&mut self.extra);
    }

    /// True for the one partition designated as the default root filesystem
    pub fn is_primary(&self) -> bool {
        self.used
            && match self.partition() {
                Ok(part) => part.parttype == Parttype::PrimSys,
                Err(_) => false,
            }
    }
}

/// Type-specific payload of a partition descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionExtra {
    pub fstype: Fstype,
    pub parttype: Parttype,
    pub arch: [u8; ARCH_LEN],
}

impl PartitionExtra {
    fn encode(&self, out: &mut [u8; EXTRA_LEN]) {
        out[0..4].copy_from_slice(&(self.fstype as i32).to_le_bytes());
        out[4..8].copy_from_slice(&(self.parttype as i32).to_le_bytes());
        out[8..8 + ARCH_LEN].copy_from_slice(&self.arch);
    }

    fn decode(extra: &[u8; EXTRA_LEN]) -> Result<PartitionExtra, SifError> {
        let fstype_raw = i32::from_le_bytes([extra[0], extra[1], extra[2], extra[3]]);
        let parttype_raw = i32::from_le_bytes([extra[4], extra[5], extra[6], extra[7]]);
        let mut arch = [0u8; ARCH_LEN];
        arch.copy_from_slice(&extra[8..8 + ARCH_LEN]);
        Ok(PartitionExtra {
            fstype: Fstype::from_raw(fstype_raw).ok_or(SifError::InvalidField {
                field: "fstype",
                value: fstype_raw as i64,
            })?,
            parttype: Parttype::from_raw(parttype_raw).ok_or(SifError::InvalidField {
                field: "parttype",
                value: parttype_raw as i64,
            })?,
            arch,
        })
    }
}

/// Type-specific payload of a signature descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureExtra {
    pub hashtype: Hashtype,
    pub entity: Vec<u8>,
}

impl SignatureExtra {
    fn encode(&self, out: &mut [u8; EXTRA_LEN]) -> Result<(), SifError> {
        if self.entity.len() > EXTRA_LEN - 4 {
            return Err(SifError::ExtraTooLong(EXTRA_LEN - 4));
        }
        out[0..4].copy_from_slice(&(self.hashtype as i32).to_le_bytes());
        out[4..4 + self.entity.len()].copy_from_slice(&self.entity);
        Ok(())
    }

    fn decode(extra: &[u8; EXTRA_LEN]) -> Result<SignatureExtra, SifError> {
        let hashtype_raw = i32::from_le_bytes([extra[0], extra[1], extra[2], extra[3]]);
        let entity = &extra[4..];
        let end = entity.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        Ok(SignatureExtra {
            hashtype: Hashtype::from_raw(hashtype_raw).ok_or(SifError::InvalidField {
                field: "hashtype",
                value: hashtype_raw as i64,
            })?,
            entity: entity[..end].to_vec(),
        })
    }
}

/// Type-specific payload of a crypto message descriptor; the symmetric
/// key material itself is the object data, linked via `link`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoExtra {
    pub format: Formattype,
    pub message: Messagetype,
}

impl CryptoExtra {
    fn encode(&self, out: &mut [u8; EXTRA_LEN]) {
        out[0..4].copy_from_slice(&(self.format as i32).to_le_bytes());
        out[4..8].copy_from_slice(&(self.message as i32).to_le_bytes());
    }

    fn decode(extra: &[u8; EXTRA_LEN]) -> Result<CryptoExtra, SifError> {
        let format_raw = i32::from_le_bytes([extra[0], extra[1], extra[2], extra[3]]);
        let message_raw = i32::from_le_bytes([extra[4], extra[5], extra[6], extra[7]]);
        match (format_raw, message_raw) {
            (1, 1) => Ok(CryptoExtra {
                format: Formattype::Pem,
                message: Messagetype::RsaOaep,
            }),
            _ => Err(SifError::InvalidField {
                field: "formattype",
                value: format_raw as i64,
            }),
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, off: 0 }
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf[self.off..self.off + v.len()].copy_from_slice(v);
        self.off += v.len();
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.bytes(&v.to_le_bytes());
    }

    fn finish(self, expected: usize) {
        assert_eq!(self.off, expected);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, off: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let slice = &self.buf[self.off..self.off + len];
        self.off += len;
        slice
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N));
        out
    }

    fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4));
        u32::from_le_bytes(b)
    }

    fn i32(&mut self) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4));
        i32::from_le_bytes(b)
    }

    fn i64(&mut self) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8));
        i64::from_le_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        let mut launch = [0u8; LAUNCH_LEN];
        launch[..DEFAULT_LAUNCH.len()].copy_from_slice(DEFAULT_LAUNCH);
        Header {
            launch,
            magic: *SIF_MAGIC,
            version: *SIF_VERSION,
            arch: *arch_code("amd64").unwrap(),
            id: [7; ID_LEN],
            ctime: 1600000000,
            mtime: 1600000001,
            dfree: 46,
            dtotal: 48,
            descroff: HEADER_LEN as i64,
            descrlen: (DESCRIPTOR_CAPACITY * DESCRIPTOR_LEN) as i64,
            dataoff: 0x8000,
            datalen: 12345,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(Header::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_bad_magic() {
        let mut encoded = sample_header().encode();
        encoded[LAUNCH_LEN] ^= 0xff;
        match Header::decode(&encoded) {
            Err(SifError::BadMagic) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_newer_version() {
        let mut header = sample_header();
        header.version = *b"99\0";
        match Header::decode(&header.encode()) {
            Err(SifError::UnsupportedVersion { found }) => assert_eq!(found, "99"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn descriptor_round_trip() {
        let mut d = Descriptor::empty();
        d.dtype = Datatype::Partition as i32;
        d.used = true;
        d.id = 2;
        d.group = GROUP_MASK | 1;
        d.fileoff = 0x9000;
        d.filelen = 100;
        d.storelen = 4096;
        d.set_name("squashfs.img").unwrap();
        d.set_partition(&PartitionExtra {
            fstype: Fstype::Squash,
            parttype: Parttype::PrimSys,
            arch: *arch_code("amd64").unwrap(),
        });
        let decoded = Descriptor::decode(&d.encode()).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.name(), "squashfs.img");
        let part = decoded.partition().unwrap();
        assert_eq!(part.fstype, Fstype::Squash);
        assert_eq!(part.parttype, Parttype::PrimSys);
        assert!(decoded.is_primary());
    }

    #[test]
    fn signature_entity_round_trip() {
        let mut d = Descriptor::empty();
        d.dtype = Datatype::Signature as i32;
        d.used = true;
        d.id = 1;
        d.set_signature(&SignatureExtra {
            hashtype: Hashtype::Sha256,
            entity: b"fingerprint".to_vec(),
        })
        .unwrap();
        let sig = Descriptor::decode(&d.encode()).unwrap().signature().unwrap();
        assert_eq!(sig.hashtype, Hashtype::Sha256);
        assert_eq!(sig.entity, b"fingerprint");
    }

    #[test]
    fn arch_codes() {
        assert_eq!(arch_name(arch_code("amd64").unwrap()), "amd64");
        assert_eq!(arch_name(ARCH_UNKNOWN), "unknown");
        assert!(matches!(
            arch_code("vax"),
            Err(SifError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn record_sizes() {
        assert_eq!(sample_header().encode().len(), HEADER_LEN);
        assert_eq!(Descriptor::empty().encode().len(), DESCRIPTOR_LEN);
    }
}
