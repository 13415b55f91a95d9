use byteorder::{ByteOrder, LE};
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;

use crate::crc::DfuCrc;

/// Size of the trailer appended to every DFU firmware image.
pub const SUFFIX_LEN: u64 = 16;

/// DFU specification release written into new suffixes.
pub const BCD_DFU_1_0: u16 = 0x0100;

// "DFU" in ASCII, stored reversed per the suffix layout.
const SIGNATURE: &[u8; 3] = b"UFD";

/// USB ids stamped into a freshly written suffix. All-zero ids mean "not
/// targeted at a particular device".
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SuffixIds {
    pub bcd_device: u16,
    pub id_product: u16,
    pub id_vendor: u16,
}

/// Decoded suffix of a firmware file, along with the checksum actually
/// computed over its contents.
#[derive(Debug)]
pub struct SuffixInfo {
    pub bcd_device: u16,
    pub id_product: u16,
    pub id_vendor: u16,
    pub bcd_dfu: u16,
    pub expected_crc: u32,
    pub actual_crc: u32,
    pub payload_length: u64,
}

impl SuffixInfo {
    pub fn has_valid_crc(&self) -> bool {
        self.actual_crc == self.expected_crc
    }

    pub fn ensure_valid_crc(&self) -> Result<(), SuffixError> {
        match self.has_valid_crc() {
            true => Ok(()),
            false => Err(SuffixError::BadCrc {
                expected: self.expected_crc,
                actual: self.actual_crc,
            }),
        }
    }
}

/// Parse errors for a DFU suffix.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SuffixError {
    #[error("DFU signature is not present; are you sure this is a DFU file?")]
    BadSignature,

    #[error("file is too small to carry a DFU suffix: need more than {SUFFIX_LEN} bytes")]
    FileTooShort,

    #[error("DFU suffix length field is {actual}, expected {SUFFIX_LEN}")]
    BadLength { actual: u8 },

    #[error("bad CRC32 checksum: expected {expected:#010x}, got {actual:#010x}")]
    BadCrc { expected: u32, actual: u32 },
}

/// All errors (parse and I/O) that can happen while handling a DFU file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid firmware file")]
    Suffix(#[from] SuffixError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Compute the DFU checksum over all bytes readable from `file`.
fn compute_crc(file: &mut impl Read) -> std::io::Result<u32> {
    let mut crc = DfuCrc::new();
    let mut buf = [0u8; 4096];
    loop {
        let len = file.read(&mut buf)?;
        if len == 0 {
            break;
        }
        crc.update(&buf[0..len]);
    }
    Ok(crc.value())
}

/// Parse the suffix of a DFU file and calculate the data's real checksum,
/// storing the results in a [SuffixInfo] struct. A checksum mismatch is
/// reported through the returned info rather than as an error, so a corrupt
/// image can still be inspected. When this returns, `file`'s cursor is at the
/// beginning of the payload.
pub fn parse(file: &mut (impl Read + Seek)) -> Result<SuffixInfo, Error> {
    let file_len = file.seek(SeekFrom::End(0))?;
    if file_len <= SUFFIX_LEN {
        return Err(SuffixError::FileTooShort.into());
    }

    let mut suffix = [0u8; SUFFIX_LEN as usize];
    file.seek(SeekFrom::End(-(SUFFIX_LEN as i64)))?;
    file.read_exact(&mut suffix)?;

    if &suffix[8..11] != SIGNATURE {
        return Err(SuffixError::BadSignature.into());
    }
    if suffix[11] != SUFFIX_LEN as u8 {
        return Err(SuffixError::BadLength { actual: suffix[11] }.into());
    }

    // CRC is over all but the last 4 bytes, which hold the expected CRC.
    file.seek(SeekFrom::Start(0))?;
    let actual_crc = compute_crc(&mut file.take(file_len - 4))?;
    let expected_crc = LE::read_u32(&suffix[12..16]);

    // Reset cursor so caller can read the file's data.
    file.seek(SeekFrom::Start(0))?;

    Ok(SuffixInfo {
        bcd_device: LE::read_u16(&suffix[0..2]),
        id_product: LE::read_u16(&suffix[2..4]),
        id_vendor: LE::read_u16(&suffix[4..6]),
        bcd_dfu: LE::read_u16(&suffix[6..8]),
        expected_crc,
        actual_crc,
        payload_length: file_len - SUFFIX_LEN,
    })
}

/// Append a 16-byte suffix to `file`. `payload_crc` must have consumed exactly
/// the payload bytes written so far; the checksum additionally covers the
/// first 12 bytes of the suffix itself. Returns the stored checksum.
pub fn append_suffix(
    file: &mut impl Write,
    ids: SuffixIds,
    mut payload_crc: DfuCrc,
) -> Result<u32, Error> {
    let mut suffix = [0u8; SUFFIX_LEN as usize];
    LE::write_u16(&mut suffix[0..2], ids.bcd_device);
    LE::write_u16(&mut suffix[2..4], ids.id_product);
    LE::write_u16(&mut suffix[4..6], ids.id_vendor);
    LE::write_u16(&mut suffix[6..8], BCD_DFU_1_0);
    suffix[8..11].copy_from_slice(SIGNATURE);
    suffix[11] = SUFFIX_LEN as u8;

    payload_crc.update(&suffix[..12]);
    let crc = payload_crc.value();
    LE::write_u32(&mut suffix[12..16], crc);

    file.write_all(&suffix)?;
    Ok(crc)
}

/// Checksum the payload already present in `file` and append a suffix to it.
pub fn add_suffix(file: &mut (impl Read + Write + Seek), ids: SuffixIds) -> Result<u32, Error> {
    file.seek(SeekFrom::Start(0))?;
    let mut crc = DfuCrc::new();
    let mut buf = [0u8; 4096];
    loop {
        let len = file.read(&mut buf)?;
        if len == 0 {
            break;
        }
        crc.update(&buf[0..len]);
    }

    file.seek(SeekFrom::End(0))?;
    append_suffix(file, ids, crc)
}
