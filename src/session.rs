use byteorder::{ByteOrder, LE};
use log::warn;
use std::time::Duration;
use thiserror::Error;

use crate::quirks::QuirkSet;
use crate::requests::{self, DfuStatus, DfuVersion, RequestContext, StatusRecord};
use crate::state_machine::{DfuState, Event, Guards, StateMachine, TransitionError};
use crate::transport::UsbTransport;

/// All errors that can happen while driving a DFU device.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("DFU session is not initialized (USB timeout unset)")]
    Uninitialized,

    #[error("USB transaction failed while {action} (current state: {state})")]
    UsbTransport {
        source: rusb::Error,
        action: &'static str,
        state: DfuState,
    },

    #[error("DFU state machine rejected the operation")]
    Transition(#[from] TransitionError),

    #[error("device reported state ({0}) that is not in the DFU spec")]
    UnknownState(u8),

    #[error("device reported status ({0}) that is not in the DFU spec")]
    UnknownStatus(u8),

    #[error("device is in state {actual}, but we expected it to be in {expected}")]
    DeviceStateMismatch {
        expected: DfuState,
        actual: DfuState,
    },

    #[error("device reported an error: {status:?} ({msg})", msg = .status.error_str())]
    StatusError { status: DfuStatus },

    #[error("DFU functional descriptor is truncated or malformed")]
    BadFunctionalDescriptor,

    #[error("file I/O error")]
    FileIo(#[from] std::io::Error),

    #[error("invalid firmware file")]
    File(#[from] crate::dfu_file::Error),
}

/// Snapshot of the DFU functional descriptor (USB descriptor type 0x21,
/// 9 bytes), which carries the device's transfer configuration.
#[derive(Copy, Clone, Debug)]
pub struct FunctionalDescriptor {
    pub can_download: bool,
    pub can_upload: bool,
    pub manifestation_tolerant: bool,
    pub will_detach: bool,
    /// Milliseconds the device waits for a USB reset after DFU_DETACH.
    pub detach_timeout: u16,
    /// Largest block the device accepts per DNLOAD/UPLOAD request.
    pub transfer_size: u16,
    pub bcd_dfu_version: u16,
}

impl FunctionalDescriptor {
    pub const DESCRIPTOR_TYPE: u8 = 0x21;
    pub const SIZE: usize = 9;

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE || data[1] != Self::DESCRIPTOR_TYPE {
            return Err(Error::BadFunctionalDescriptor);
        }

        let attributes = data[2];
        Ok(Self {
            can_download: attributes & 0x01 != 0,
            can_upload: attributes & 0x02 != 0,
            manifestation_tolerant: attributes & 0x04 != 0,
            will_detach: attributes & 0x08 != 0,
            detach_timeout: LE::read_u16(&data[3..5]),
            transfer_size: LE::read_u16(&data[5..7]),
            bcd_dfu_version: LE::read_u16(&data[7..9]),
        })
    }

    /// Stand-in for devices whose functional descriptor cannot be read: every
    /// capability enabled, transfer size supplied by the caller.
    pub fn permissive(transfer_size: u16) -> Self {
        Self {
            can_download: true,
            can_upload: true,
            manifestation_tolerant: true,
            will_detach: false,
            detach_timeout: 1000,
            transfer_size,
            bcd_dfu_version: 0x0100,
        }
    }
}

impl std::fmt::Display for FunctionalDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "wTransferSize = {}, bcdDFUVersion = {:#06x}, bmAttributes =",
            self.transfer_size, self.bcd_dfu_version
        )?;
        if self.can_download {
            write!(f, " bitCanDownload")?;
        }
        if self.can_upload {
            write!(f, " bitCanUpload")?;
        }
        if self.manifestation_tolerant {
            write!(f, " bitManifestationTolerant")?;
        }
        if self.will_detach {
            write!(f, " bitWillDetach")?;
        }
        Ok(())
    }
}

/// One attachment to a DFU peripheral. Owns the transport, the device's
/// functional-descriptor snapshot and the protocol state machine; every
/// public operation runs the same sequence of checks around its class
/// request, so the machine tracks the device step for step.
pub struct DfuSession<T: UsbTransport + 'static> {
    transport: T,
    interface: u16,
    usb_timeout: Duration,
    version: DfuVersion,
    func_desc: FunctionalDescriptor,
    sm: StateMachine,
    /// DFU_DNLOAD/DFU_UPLOAD request count, passed as wValue to order blocks.
    transaction: u16,
    quirks: QuirkSet,
    verify_device_state: bool,
}

impl<T: UsbTransport + 'static> DfuSession<T> {
    /// Attach to a device. `usb_timeout` bounds every control transfer and
    /// must be non-zero; a zero value leaves the session unusable and every
    /// operation returns [Error::Uninitialized].
    pub fn new(
        transport: T,
        interface: u16,
        usb_timeout: Duration,
        version: DfuVersion,
        func_desc: FunctionalDescriptor,
    ) -> Self {
        if usb_timeout.is_zero() {
            warn!("invalid zero USB timeout; the session will refuse every operation");
        }

        Self {
            transport,
            interface,
            usb_timeout,
            version,
            func_desc,
            sm: StateMachine::new(DfuState::appIDLE),
            transaction: 0,
            quirks: QuirkSet::new(),
            verify_device_state: true,
        }
    }

    pub fn state(&self) -> DfuState {
        self.sm.state()
    }

    pub fn version(&self) -> DfuVersion {
        self.version
    }

    pub fn functional_descriptor(&self) -> &FunctionalDescriptor {
        &self.func_desc
    }

    pub fn transfer_size(&self) -> u16 {
        self.func_desc.transfer_size
    }

    pub fn quirks(&self) -> &QuirkSet {
        &self.quirks
    }

    /// Access the underlying transport, e.g. for transfers outside the DFU
    /// protocol proper.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn set_quirks(&mut self, quirks: QuirkSet) {
        self.quirks = quirks;
    }

    /// Disable or re-enable the post-transition DFU_GETSTATE verification.
    /// Verification is skipped for the block-transfer requests regardless, to
    /// keep per-block latency down.
    pub fn set_verify_device_state(&mut self, verify: bool) {
        self.verify_device_state = verify;
    }

    fn verify_init(&self) -> Result<(), Error> {
        if self.usb_timeout.is_zero() {
            return Err(Error::Uninitialized);
        }
        Ok(())
    }

    fn ctx(&self) -> RequestContext {
        RequestContext {
            interface: self.interface,
            timeout: self.usb_timeout,
            state: self.sm.state(),
        }
    }

    /// Ensure the device's self-reported state matches what the transition
    /// function predicted. Only done in states where DFU_GETSTATE is allowed;
    /// elsewhere we silently trust the prediction.
    fn check_device_state(&mut self, expected: DfuState) -> Result<(), Error> {
        if !self.verify_device_state {
            return Ok(());
        }
        if self.sm.next_state(Event::GetState, Guards::NONE).is_err() {
            return Ok(());
        }

        let ctx = self.ctx();
        let actual = requests::handlers::<T>(self.version).get_state(&mut self.transport, &ctx)?;
        if actual != expected {
            return Err(Error::DeviceStateMismatch { expected, actual });
        }
        Ok(())
    }

    /// Ask the device for its status and adopt the reported state without a
    /// transition check. This is the explicit reset point used right after
    /// attaching or re-enumerating, when the machine has no history to check
    /// against.
    pub fn probe_status(&mut self) -> Result<StatusRecord, Error> {
        self.verify_init()?;
        let ctx = self.ctx();
        let status = requests::handlers::<T>(self.version).get_status(&mut self.transport, &ctx)?;
        self.sm.set_state_unchecked(status.state);
        Ok(status)
    }

    /// DFU_DETACH: ask a run-time device to enter DFU mode. `timeout_ms` is
    /// how long the device will wait for the bus reset that follows.
    pub fn detach(&mut self, timeout_ms: u16) -> Result<(), Error> {
        self.verify_init()?;
        let next = self.sm.next_state(Event::Detach, Guards::NONE)?;

        let ctx = self.ctx();
        requests::handlers::<T>(self.version).detach(&mut self.transport, &ctx, timeout_ms)?;

        self.check_device_state(next)?;
        self.sm.set_state_checked(next)?;
        Ok(())
    }

    /// Issue a USB bus reset. A device vanishing from the bus during the
    /// reset counts as success.
    pub fn usb_reset(&mut self) -> Result<(), Error> {
        self.verify_init()?;
        let next = self.sm.next_state(Event::UsbReset, Guards::NONE)?;

        let ctx = self.ctx();
        requests::handlers::<T>(self.version).device_reset(&mut self.transport, &ctx)?;

        self.sm.set_state_checked(next)?;
        Ok(())
    }

    /// Wait out a bwPollTimeout interval. This is what moves the machine off
    /// `dfuDNBUSY` and out of `dfuMANIFEST`.
    pub fn status_poll_timeout(&mut self, poll_timeout_ms: u32) -> Result<(), Error> {
        self.verify_init()?;

        let mut guards = Guards::NONE;
        if self.func_desc.manifestation_tolerant {
            guards |= Guards::BIT_MANIFESTATION_TOLERANT;
        }
        let next = self.sm.next_state(Event::StatusPollTimeout, guards)?;

        let ctx = self.ctx();
        requests::handlers::<T>(self.version).status_poll_timeout(&ctx, poll_timeout_ms)?;

        self.sm.set_state_checked(next)?;
        Ok(())
    }

    /// DFU_DNLOAD: send one firmware block. An empty block tells the device
    /// the download is complete. Returns the number of bytes transferred.
    pub fn download(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.verify_init()?;

        let mut guards = Guards::NONE;
        if !data.is_empty() {
            guards |= Guards::WLENGTH_GT_ZERO;
        }
        if self.func_desc.can_download {
            guards |= Guards::BIT_CAN_DNLOAD;
        }
        let next = self.sm.next_state(Event::Dnload, guards)?;

        let transaction = self.transaction;
        self.transaction = self.transaction.wrapping_add(1);

        let ctx = self.ctx();
        let sent = requests::handlers::<T>(self.version).download(
            &mut self.transport,
            &ctx,
            transaction,
            data,
        )?;

        // No device-state verification here: it would double the request
        // count of every block transfer.
        self.sm.set_state_checked(next)?;
        Ok(sent)
    }

    /// DFU_UPLOAD: read one firmware block into `buf`. A short read marks the
    /// last block. Returns the number of bytes received.
    pub fn upload(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.verify_init()?;

        if !self.sm.has_event(Event::Upload) {
            return Err(TransitionError::NoSuchEvent {
                state: self.sm.state(),
                event: Event::Upload,
            }
            .into());
        }

        let transaction = self.transaction;
        self.transaction = self.transaction.wrapping_add(1);

        let ctx = self.ctx();
        let received = requests::handlers::<T>(self.version).upload(
            &mut self.transport,
            &ctx,
            transaction,
            buf,
        )?;

        // The guards depend on how much the device actually sent, so the
        // next state is only known after the request.
        let mut guards = Guards::NONE;
        if self.func_desc.can_upload {
            guards |= Guards::BIT_CAN_UPLOAD;
        }
        if !buf.is_empty() {
            guards |= Guards::WLENGTH_GT_ZERO;
        }
        if received < buf.len() {
            guards |= Guards::UPLOAD_SHORT_FRAME;
        }
        let next = self.sm.next_state(Event::Upload, guards)?;

        self.check_device_state(next)?;
        self.sm.set_state_checked(next)?;
        Ok(received)
    }

    /// DFU_GETSTATUS. The state the device reports becomes the session's new
    /// state; the device is authoritative here.
    pub fn get_status(&mut self) -> Result<StatusRecord, Error> {
        self.verify_init()?;

        if !self.sm.has_event(Event::GetStatus) {
            return Err(TransitionError::NoSuchEvent {
                state: self.sm.state(),
                event: Event::GetStatus,
            }
            .into());
        }

        let ctx = self.ctx();
        let status = requests::handlers::<T>(self.version).get_status(&mut self.transport, &ctx)?;

        self.sm.set_state_checked(status.state)?;
        Ok(status)
    }

    /// DFU_CLRSTATUS: leave `dfuERROR`, clearing the device's status to OK.
    pub fn clear_status(&mut self) -> Result<(), Error> {
        self.verify_init()?;
        let next = self.sm.next_state(Event::ClrStatus, Guards::NONE)?;

        let ctx = self.ctx();
        requests::handlers::<T>(self.version).clear_status(&mut self.transport, &ctx)?;

        self.check_device_state(next)?;
        self.sm.set_state_checked(next)?;
        Ok(())
    }

    /// DFU_GETSTATE: read the device's current state without side effects.
    pub fn get_state(&mut self) -> Result<DfuState, Error> {
        self.verify_init()?;
        let next = self.sm.next_state(Event::GetState, Guards::NONE)?;

        let ctx = self.ctx();
        let state = requests::handlers::<T>(self.version).get_state(&mut self.transport, &ctx)?;

        self.sm.set_state_checked(next)?;
        Ok(state)
    }

    /// DFU_ABORT: return an interrupted transfer to `dfuIDLE`.
    pub fn abort(&mut self) -> Result<(), Error> {
        self.verify_init()?;
        let next = self.sm.next_state(Event::Abort, Guards::NONE)?;

        let ctx = self.ctx();
        requests::handlers::<T>(self.version).abort(&mut self.transport, &ctx)?;

        self.check_device_state(next)?;
        self.sm.set_state_checked(next)?;
        Ok(())
    }
}
