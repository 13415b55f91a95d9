use byteorder::{LE, ReadBytesExt};
use num_enum::TryFromPrimitive;
use rusb::{Direction, Recipient, RequestType};
use std::convert::TryFrom;
use std::thread::sleep;
use std::time::Duration;

use crate::session::Error;
use crate::state_machine::DfuState;
use crate::transport::UsbTransport;

/// DFU class-specific request codes (DFU 1.1, section 3).
#[repr(u8)]
#[allow(non_camel_case_types)] // Names from DFU spec
#[derive(Copy, Clone, Debug)]
pub enum DfuRequest {
    DFU_DETACH = 0,
    DFU_DNLOAD = 1,
    DFU_UPLOAD = 2,
    DFU_GETSTATUS = 3,
    DFU_CLRSTATUS = 4,
    DFU_GETSTATE = 5,
    DFU_ABORT = 6,
}

/// Status codes a DFU device can return, taken from the USB DFU spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuStatus {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

impl DfuStatus {
    pub fn error_str(&self) -> &'static str {
        use DfuStatus::*;
        match self {
            OK => "No error condition is present.",
            errTARGET => "File is not targeted for use by this device.",
            errFILE => "File is for this device but fails some vendor-specific verification test.",
            errWRITE => "Device is unable to write memory.",
            errERASE => "Memory erase function failed.",
            errCHECK_ERASED => "Memory erase check failed.",
            errPROG => "Program memory function failed.",
            errVERIFY => "Programmed memory failed verification.",
            errADDRESS => "Cannot program memory due to received address that is out of range.",
            errNOTDONE => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            errFIRMWARE => {
                "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations."
            }
            errVENDOR => "iString indicates a vendor-specific error.",
            errUSBR => "Device detected unexpected USB reset signaling.",
            errPOR => "Device detected unexpected power on reset.",
            errUNKNOWN => "Something went wrong, but the device does not know what it was.",
            errSTALLEDPKT => "Device stalled an unexpected request.",
        }
    }
}

/// A DFU_GETSTATUS response, with `bwPollTimeout` already converted from its
/// 24-bit little-endian wire form to a host integer.
#[derive(Copy, Clone, Debug)]
pub struct StatusRecord {
    pub status: DfuStatus,
    /// Milliseconds the host must wait before the next DFU_GETSTATUS.
    pub poll_timeout: u32,
    pub state: DfuState,
    /// Index of a vendor string describing the status.
    pub i_string: u8,
}

impl StatusRecord {
    pub fn ensure_ok(&self) -> Result<(), Error> {
        if self.status != DfuStatus::OK {
            Err(Error::StatusError { status: self.status })
        } else {
            Ok(())
        }
    }
}

/// DFU specification revision spoken by a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DfuVersion {
    V1_0,
    V1_1,
}

impl DfuVersion {
    /// Map a bcdDFUVersion descriptor field to the revision we will speak.
    pub fn from_bcd(bcd: u16) -> Self {
        if bcd >= 0x0110 {
            DfuVersion::V1_1
        } else {
            DfuVersion::V1_0
        }
    }
}

impl std::fmt::Display for DfuVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            DfuVersion::V1_0 => "1.0",
            DfuVersion::V1_1 => "1.1",
        })
    }
}

/// Per-request context: which interface to address, how long to wait for the
/// transfer, and the state the session believes the device is in (attached to
/// errors for diagnostics).
pub(crate) struct RequestContext {
    pub interface: u16,
    pub timeout: Duration,
    pub state: DfuState,
}

/// The request operations backing one DFU revision. Each corresponds to a
/// single class request on the control endpoint, or to one of the two
/// non-request actions the protocol needs (bus reset and the poll wait).
pub(crate) trait RequestHandlers<T: UsbTransport + 'static> {
    fn detach(&self, dev: &mut T, ctx: &RequestContext, timeout_ms: u16) -> Result<(), Error>;
    fn download(
        &self,
        dev: &mut T,
        ctx: &RequestContext,
        transaction: u16,
        data: &[u8],
    ) -> Result<usize, Error>;
    fn upload(
        &self,
        dev: &mut T,
        ctx: &RequestContext,
        transaction: u16,
        buf: &mut [u8],
    ) -> Result<usize, Error>;
    fn get_status(&self, dev: &mut T, ctx: &RequestContext) -> Result<StatusRecord, Error>;
    fn clear_status(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error>;
    fn get_state(&self, dev: &mut T, ctx: &RequestContext) -> Result<DfuState, Error>;
    fn abort(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error>;
    fn device_reset(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error>;
    fn status_poll_timeout(&self, ctx: &RequestContext, poll_timeout_ms: u32) -> Result<(), Error>;
}

/// Handlers for the revision `version` speaks. DFU 1.0 and 1.1 currently
/// share one handler set.
pub(crate) fn handlers<T: UsbTransport + 'static>(version: DfuVersion) -> &'static dyn RequestHandlers<T> {
    match version {
        DfuVersion::V1_0 | DfuVersion::V1_1 => &Dfu10Handlers,
    }
}

fn out_request() -> u8 {
    rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface)
}

fn in_request() -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface)
}

fn transport_err(source: rusb::Error, action: &'static str, ctx: &RequestContext) -> Error {
    Error::UsbTransport {
        source,
        action,
        state: ctx.state,
    }
}

/// DFU 1.0 request handlers.
struct Dfu10Handlers;

impl<T: UsbTransport + 'static> RequestHandlers<T> for Dfu10Handlers {
    /// DFU_DETACH (DFU 1.0, section 5.1). `timeout_ms` is how long the device
    /// should wait for the subsequent USB reset before giving up.
    fn detach(&self, dev: &mut T, ctx: &RequestContext, timeout_ms: u16) -> Result<(), Error> {
        dev.control_write(
            out_request(),
            DfuRequest::DFU_DETACH as u8,
            timeout_ms,
            ctx.interface,
            &[],
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "sending DFU_DETACH", ctx))?;
        Ok(())
    }

    /// DFU_DNLOAD (DFU 1.0, section 6.1.1). `data` must be at most
    /// wTransferSize bytes; an empty block signals the end of the transfer.
    fn download(
        &self,
        dev: &mut T,
        ctx: &RequestContext,
        transaction: u16,
        data: &[u8],
    ) -> Result<usize, Error> {
        dev.control_write(
            out_request(),
            DfuRequest::DFU_DNLOAD as u8,
            transaction,
            ctx.interface,
            data,
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "sending firmware block", ctx))
    }

    /// DFU_UPLOAD (DFU 1.0, section 6.2). A short read means the device has
    /// no more data to send.
    fn upload(
        &self,
        dev: &mut T,
        ctx: &RequestContext,
        transaction: u16,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        dev.control_read(
            in_request(),
            DfuRequest::DFU_UPLOAD as u8,
            transaction,
            ctx.interface,
            buf,
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "reading firmware block", ctx))
    }

    /// DFU_GETSTATUS (DFU 1.0, section 6.1.2).
    fn get_status(&self, dev: &mut T, ctx: &RequestContext) -> Result<StatusRecord, Error> {
        let mut buf = [0u8; 6];
        let len = dev
            .control_read(
                in_request(),
                DfuRequest::DFU_GETSTATUS as u8,
                0,
                ctx.interface,
                &mut buf,
                ctx.timeout,
            )
            .map_err(|e| transport_err(e, "querying status", ctx))?;
        if len != buf.len() {
            return Err(transport_err(rusb::Error::Io, "querying status", ctx));
        }

        let mut cursor = std::io::Cursor::new(buf);
        let status = DfuStatus::try_from(cursor.read_u8().unwrap())
            .map_err(|e| Error::UnknownStatus(e.number))?;
        let poll_timeout = cursor.read_u24::<LE>().unwrap();
        let state = DfuState::try_from(cursor.read_u8().unwrap())
            .map_err(|e| Error::UnknownState(e.number))?;
        let i_string = cursor.read_u8().unwrap();

        Ok(StatusRecord {
            status,
            poll_timeout,
            state,
            i_string,
        })
    }

    /// DFU_CLRSTATUS (DFU 1.0, section 6.1.3).
    fn clear_status(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error> {
        dev.control_write(
            out_request(),
            DfuRequest::DFU_CLRSTATUS as u8,
            0,
            ctx.interface,
            &[],
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "sending DFU_CLRSTATUS", ctx))?;
        Ok(())
    }

    /// DFU_GETSTATE (DFU 1.0, section 6.1.5).
    fn get_state(&self, dev: &mut T, ctx: &RequestContext) -> Result<DfuState, Error> {
        let mut buf = [0u8; 1];
        dev.control_read(
            in_request(),
            DfuRequest::DFU_GETSTATE as u8,
            0,
            ctx.interface,
            &mut buf,
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "querying state", ctx))?;

        DfuState::try_from(buf[0]).map_err(|e| Error::UnknownState(e.number))
    }

    /// DFU_ABORT (DFU 1.0, section 6.1.4).
    fn abort(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error> {
        dev.control_write(
            out_request(),
            DfuRequest::DFU_ABORT as u8,
            0,
            ctx.interface,
            &[],
            ctx.timeout,
        )
        .map_err(|e| transport_err(e, "sending DFU_ABORT", ctx))?;
        Ok(())
    }

    /// USB bus reset. A device that drops off the bus while resetting has
    /// done exactly what was asked of it, so that is not an error.
    fn device_reset(&self, dev: &mut T, ctx: &RequestContext) -> Result<(), Error> {
        match dev.reset() {
            Ok(()) | Err(rusb::Error::NoDevice) => Ok(()),
            Err(e) => Err(transport_err(e, "resetting the device", ctx)),
        }
    }

    /// Wait out the bwPollTimeout the device asked for.
    fn status_poll_timeout(&self, _ctx: &RequestContext, poll_timeout_ms: u32) -> Result<(), Error> {
        sleep(Duration::from_millis(u64::from(poll_timeout_ms)));
        Ok(())
    }
}
