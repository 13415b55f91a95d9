/// Streaming CRC-32 accumulator using the DFU file-format convention: ANSI
/// X3.66, polynomial 0xEDB88320, register initialized to 0xFFFFFFFF, and no
/// final inversion. The suffix stores the raw shift register, which is the
/// bitwise NOT of the usual IEEE checksum.
#[derive(Clone, Default)]
pub struct DfuCrc {
    hasher: crc32fast::Hasher,
}

impl DfuCrc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more input. Feeding byte-by-byte or in chunks of any size
    /// produces the same final value.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Current register value. The accumulator stays usable afterwards.
    pub fn value(&self) -> u32 {
        !self.hasher.clone().finalize() // DFU's CRC is a bitwise NOT of IEEE's.
    }
}

/// One-shot convenience for in-memory buffers.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = DfuCrc::new();
    crc.update(bytes);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // "123456789" under CRC-32/JAMCRC (IEEE without the final inversion).
        assert_eq!(crc32(b"123456789"), 0x340b_c6d9);
    }

    #[test]
    fn empty_input_is_initial_register() {
        assert_eq!(crc32(&[]), 0xffff_ffff);
    }

    #[test]
    fn chunking_does_not_change_the_value() {
        let data: Vec<u8> = (0u32..4096).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();

        let mut bytewise = DfuCrc::new();
        for b in &data {
            bytewise.update(std::slice::from_ref(b));
        }

        for chunk_size in [1, 2, 3, 7, 64, 1000, 4096] {
            let mut chunked = DfuCrc::new();
            for chunk in data.chunks(chunk_size) {
                chunked.update(chunk);
            }
            assert_eq!(chunked.value(), bytewise.value(), "chunk size {chunk_size}");
        }

        assert_eq!(bytewise.value(), crc32(&data));
    }

    #[test]
    fn value_is_observable_mid_stream() {
        let mut crc = DfuCrc::new();
        crc.update(b"12345");
        let _ = crc.value();
        crc.update(b"6789");
        assert_eq!(crc.value(), 0x340b_c6d9);
    }
}
