use std::time::Duration;

/// The slice of USB the protocol layer needs: class requests on the default
/// control endpoint, plus bus reset. Implemented for an open rusb handle;
/// tests drive the protocol against a scripted device model instead.
pub trait UsbTransport {
    /// Issue an IN control transfer, returning the number of bytes received.
    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Issue an OUT control transfer, returning the number of bytes sent.
    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Perform a USB bus reset and re-enumerate the device.
    fn reset(&mut self) -> rusb::Result<()>;
}

impl UsbTransport for rusb::DeviceHandle<rusb::Context> {
    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.read_control(request_type, request, value, index, buf, timeout)
    }

    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.write_control(request_type, request, value, index, data, timeout)
    }

    fn reset(&mut self) -> rusb::Result<()> {
        rusb::DeviceHandle::reset(self)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted DFU peripheral. It keeps its own device-side state and
    //! answers class requests the way a well-behaved DFU 1.0 device would,
    //! with knobs for capability bits and busy-poll counts.

    use super::UsbTransport;
    use crate::requests::{DfuRequest, DfuStatus};
    use crate::state_machine::DfuState;
    use byteorder::{ByteOrder, LE};
    use std::time::Duration;

    pub struct MockDevice {
        pub state: DfuState,
        pub status: DfuStatus,
        /// bwPollTimeout reported in every status response.
        pub poll_timeout: u32,
        pub manifestation_tolerant: bool,
        /// How many DFU_GETSTATUS polls report dfuDNBUSY after each block.
        pub busy_polls_per_block: u32,
        /// How many DFU_GETSTATUS polls report dfuMANIFEST after the final
        /// zero-length block.
        pub manifest_polls: u32,
        /// Content served to DFU_UPLOAD.
        pub firmware: Vec<u8>,

        busy_left: u32,
        manifest_left: u32,
        upload_offset: usize,

        /// Payload accumulated from DFU_DNLOAD blocks.
        pub downloaded: Vec<u8>,
        /// (wValue, wLength) of every DFU_DNLOAD received, in order.
        pub dnload_log: Vec<(u16, usize)>,
        /// Other OUT requests received, by request code.
        pub out_log: Vec<u8>,
        pub resets: u32,

        /// Makes DFU_GETSTATE lie, for exercising mismatch handling.
        pub getstate_override: Option<DfuState>,
        /// Error returned by the next bus reset.
        pub fail_reset_with: Option<rusb::Error>,
    }

    impl MockDevice {
        pub fn new(state: DfuState) -> Self {
            Self {
                state,
                status: DfuStatus::OK,
                poll_timeout: 1,
                manifestation_tolerant: true,
                busy_polls_per_block: 0,
                manifest_polls: 0,
                firmware: Vec::new(),
                busy_left: 0,
                manifest_left: 0,
                upload_offset: 0,
                downloaded: Vec::new(),
                dnload_log: Vec::new(),
                out_log: Vec::new(),
                resets: 0,
                getstate_override: None,
                fail_reset_with: None,
            }
        }

        fn status_state(&mut self) -> DfuState {
            match self.state {
                DfuState::dfuDNLOAD_SYNC | DfuState::dfuDNBUSY => {
                    if self.busy_left > 0 {
                        self.busy_left -= 1;
                        self.state = DfuState::dfuDNBUSY;
                    } else {
                        self.state = DfuState::dfuDNLOAD_IDLE;
                    }
                }
                DfuState::dfuMANIFEST_SYNC | DfuState::dfuMANIFEST => {
                    if self.manifest_left > 0 {
                        self.manifest_left -= 1;
                        self.state = DfuState::dfuMANIFEST;
                    } else if self.manifestation_tolerant {
                        self.state = DfuState::dfuIDLE;
                    } else {
                        self.state = DfuState::dfuMANIFEST_WAIT_RESET;
                    }
                }
                _ => {}
            }
            self.state
        }
    }

    impl UsbTransport for MockDevice {
        fn control_read(
            &mut self,
            _request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            match request {
                r if r == DfuRequest::DFU_GETSTATUS as u8 => {
                    let state = self.status_state();
                    buf[0] = self.status as u8;
                    LE::write_u24(&mut buf[1..4], self.poll_timeout);
                    buf[4] = state as u8;
                    buf[5] = 0;
                    Ok(6)
                }
                r if r == DfuRequest::DFU_GETSTATE as u8 => {
                    buf[0] = self.getstate_override.unwrap_or(self.state) as u8;
                    Ok(1)
                }
                r if r == DfuRequest::DFU_UPLOAD as u8 => {
                    let remaining = self.firmware.len() - self.upload_offset;
                    let chunk = remaining.min(buf.len());
                    buf[..chunk]
                        .copy_from_slice(&self.firmware[self.upload_offset..self.upload_offset + chunk]);
                    self.upload_offset += chunk;
                    self.state = if chunk < buf.len() {
                        DfuState::dfuIDLE
                    } else {
                        DfuState::dfuUPLOAD_IDLE
                    };
                    Ok(chunk)
                }
                _ => Err(rusb::Error::Pipe),
            }
        }

        fn control_write(
            &mut self,
            _request_type: u8,
            request: u8,
            value: u16,
            _index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            match request {
                r if r == DfuRequest::DFU_DNLOAD as u8 => {
                    self.dnload_log.push((value, data.len()));
                    if data.is_empty() {
                        self.state = DfuState::dfuMANIFEST_SYNC;
                        self.manifest_left = self.manifest_polls;
                    } else {
                        self.downloaded.extend_from_slice(data);
                        self.state = DfuState::dfuDNLOAD_SYNC;
                        self.busy_left = self.busy_polls_per_block;
                    }
                    Ok(data.len())
                }
                r if r == DfuRequest::DFU_DETACH as u8 => {
                    self.out_log.push(request);
                    self.state = DfuState::appDETACH;
                    Ok(0)
                }
                r if r == DfuRequest::DFU_CLRSTATUS as u8 => {
                    self.out_log.push(request);
                    self.state = DfuState::dfuIDLE;
                    self.status = DfuStatus::OK;
                    Ok(0)
                }
                r if r == DfuRequest::DFU_ABORT as u8 => {
                    self.out_log.push(request);
                    self.state = DfuState::dfuIDLE;
                    Ok(0)
                }
                _ => Err(rusb::Error::Pipe),
            }
        }

        fn reset(&mut self) -> rusb::Result<()> {
            self.resets += 1;
            if let Some(err) = self.fail_reset_with.take() {
                return Err(err);
            }
            self.state = DfuState::dfuIDLE;
            Ok(())
        }
    }
}
