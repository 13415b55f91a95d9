use std::fmt;

/// Matches any value of a descriptor field in the detection table.
pub const ANY_ID: u16 = 0xffff;

/// Documented deviations from the DFU specification, applied per device.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Quirk {
    OpenmokoDnloadStatusPollTimeout = 0,
    OpenmokoManifestStatusPollTimeout,
    OpenmokoDetachBeforeFinalReset,
    IgnoreInvalidFunctionalDescriptor,
    ForceDfuVersion10,
    ForceDfuVersion11,
}

impl Quirk {
    pub const ALL: [Quirk; 6] = [
        Quirk::OpenmokoDnloadStatusPollTimeout,
        Quirk::OpenmokoManifestStatusPollTimeout,
        Quirk::OpenmokoDetachBeforeFinalReset,
        Quirk::IgnoreInvalidFunctionalDescriptor,
        Quirk::ForceDfuVersion10,
        Quirk::ForceDfuVersion11,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quirk::OpenmokoDnloadStatusPollTimeout => "OPENMOKO_DNLOAD_STATUS_POLL_TIMEOUT",
            Quirk::OpenmokoManifestStatusPollTimeout => "OPENMOKO_MANIFEST_STATUS_POLL_TIMEOUT",
            Quirk::OpenmokoDetachBeforeFinalReset => "OPENMOKO_DETACH_BEFORE_FINAL_RESET",
            Quirk::IgnoreInvalidFunctionalDescriptor => "IGNORE_INVALID_FUNCTIONAL_DESCRIPTOR",
            Quirk::ForceDfuVersion10 => "FORCE_DFU_VERSION_1_0",
            Quirk::ForceDfuVersion11 => "FORCE_DFU_VERSION_1_1",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Quirk::OpenmokoDnloadStatusPollTimeout => {
                "openmoko: u-boot cannot provide bwPollTimeout and expects it to be 5 msec during download"
            }
            Quirk::OpenmokoManifestStatusPollTimeout => {
                "openmoko: some devices (e.g. TAS1020b) need some time before the status can be obtained during manifestation (overwrite bwPollTimeout with 1 sec)"
            }
            Quirk::OpenmokoDetachBeforeFinalReset => {
                "openmoko: before issuing the final reset, a non-standard DFU_DETACH is needed"
            }
            Quirk::IgnoreInvalidFunctionalDescriptor => {
                "if the DFU functional descriptor cannot be read, continue with permissive DFU flags and manual settings such as --transfer-size"
            }
            Quirk::ForceDfuVersion10 => "ignore the device's DFU version, and assume DFU 1.0",
            Quirk::ForceDfuVersion11 => "ignore the device's DFU version, and assume DFU 1.1",
        }
    }
}

impl fmt::Display for Quirk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of [Quirk]s, stored as a bitmask.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct QuirkSet(u32);

impl QuirkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, quirk: Quirk) {
        self.0 |= 1 << quirk as u32;
    }

    pub fn clear(&mut self, quirk: Quirk) {
        self.0 &= !(1 << quirk as u32);
    }

    pub fn is_set(&self, quirk: Quirk) -> bool {
        self.0 & (1 << quirk as u32) != 0
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Set-union `other` into `self`.
    pub fn merge(&mut self, other: QuirkSet) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Quirk> + '_ {
        Quirk::ALL.into_iter().filter(|q| self.is_set(*q))
    }
}

impl fmt::Display for QuirkSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, quirk) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(quirk.name())?;
        }
        Ok(())
    }
}

/// Print the catalogue of known quirks to stdout.
pub fn print_all() {
    for (i, quirk) in Quirk::ALL.into_iter().enumerate() {
        println!("{:02}: {}\n    {}", i + 1, quirk.name(), quirk.description());
    }
}

/// Print the names of the quirks in `set` to stdout, pipe-separated.
/// Prints nothing for an empty set.
pub fn print_set(set: &QuirkSet) {
    for (i, quirk) in set.iter().enumerate() {
        if i > 0 {
            print!("|");
        }
        print!("{}", quirk.name());
    }
}

/// One row of the detection table. A field holding [ANY_ID] matches any value
/// reported by the device; products match against an inclusive range so a
/// family of ids needs only one row.
struct QuirkEntry {
    quirk: Quirk,
    bcd_dfu: u16,
    id_vendor: u16,
    id_product_first: u16,
    id_product_last: u16,
    bcd_device: u16,
}

impl QuirkEntry {
    fn matches(&self, bcd_dfu: u16, id_vendor: u16, id_product: u16, bcd_device: u16) -> bool {
        (self.bcd_dfu == ANY_ID || self.bcd_dfu == bcd_dfu)
            && (self.id_vendor == ANY_ID || self.id_vendor == id_vendor)
            && (self.id_product_first == ANY_ID
                || (self.id_product_first..=self.id_product_last).contains(&id_product))
            && (self.bcd_device == ANY_ID || self.bcd_device == bcd_device)
    }
}

// http://wiki.openmoko.org/wiki/USB_Product_IDs
//
// 0x5117..=0x5126 covers the Neo1973/FreeRunner u-boot, kernel gadget and
// debug-board personalities, under both the FIC (0x1457) and Openmoko
// (0x5117) vendor ids.
const QUIRK_TABLE: &[QuirkEntry] = &[
    QuirkEntry {
        quirk: Quirk::OpenmokoDnloadStatusPollTimeout,
        bcd_dfu: ANY_ID,
        id_vendor: 0x1457,
        id_product_first: 0x5117,
        id_product_last: 0x5126,
        bcd_device: ANY_ID,
    },
    QuirkEntry {
        quirk: Quirk::OpenmokoDnloadStatusPollTimeout,
        bcd_dfu: ANY_ID,
        id_vendor: 0x5117,
        id_product_first: 0x5117,
        id_product_last: 0x5126,
        bcd_device: ANY_ID,
    },
];

/// Look up the quirks that apply to a device, identified by its DFU version
/// and USB descriptor fields.
pub fn detect(bcd_dfu: u16, id_vendor: u16, id_product: u16, bcd_device: u16) -> QuirkSet {
    let mut set = QuirkSet::new();
    for entry in QUIRK_TABLE {
        if entry.matches(bcd_dfu, id_vendor, id_product, bcd_device) {
            set.set(entry.quirk);
        }
    }
    set
}
