/// Streaming CRC-32 with the convention used by the DFU file format.
pub mod crc;

/// Load, validate and produce firmware files carrying the 16-byte DFU suffix.
pub mod dfu_file;

/// Documented deviations from the DFU spec, detected per vendor/product.
pub mod quirks;

/// Issue individual DFU class requests over the USB control endpoint.
pub mod requests;

/// Drive one attached DFU peripheral through checked state transitions.
pub mod session;

/// The DFU 1.0/1.1 state automaton: states, events, guards and transitions.
pub mod state_machine;

/// Whole-firmware upload and download orchestration, including the
/// manifestation phase.
pub mod transfer;

/// The slice of USB the protocol needs, as a seam for testing.
pub mod transport;
