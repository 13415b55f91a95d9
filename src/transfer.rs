use log::{info, warn};
use std::io::{Read, Seek, Write};

use crate::crc::DfuCrc;
use crate::dfu_file::{self, SUFFIX_LEN, SuffixIds};
use crate::quirks::Quirk;
use crate::requests::DfuStatus;
use crate::session::{DfuSession, Error};
use crate::state_machine::DfuState;
use crate::transport::UsbTransport;

const PROGRESS_BAR_WIDTH: u64 = 50;

// Poll-timeout overrides for devices that misreport bwPollTimeout.
const OPENMOKO_DNLOAD_POLL_MS: u32 = 5;
const OPENMOKO_MANIFEST_POLL_MS: u32 = 1000;

fn progress(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

/// Read the device's entire firmware into `file` and append a DFU suffix.
/// The device must be in `dfuIDLE`. Returns the number of payload bytes
/// written (excluding the suffix).
///
/// The suffix is stamped with all-zero ids, marking the image as not
/// targeted at a particular device.
pub fn upload<T: UsbTransport + 'static>(
    session: &mut DfuSession<T>,
    file: &mut impl Write,
) -> Result<u64, Error> {
    let xfer_size = usize::from(session.transfer_size());
    let mut buf = vec![0u8; xfer_size];
    let mut crc = DfuCrc::new();
    let mut total = 0u64;

    progress("Starting upload: [");

    loop {
        let status = session.get_status()?;
        status.ensure_ok()?;

        let received = session.upload(&mut buf)?;
        file.write_all(&buf[..received])?;
        crc.update(&buf[..received]);
        total += received as u64;

        if received < xfer_size {
            // Short frame: last block.
            break;
        }
        progress("#");
    }

    println!("] finished! read {total} bytes.");

    let checksum = dfu_file::append_suffix(file, SuffixIds::default(), crc)?;
    info!("appended suffix block to image (firmware checksum: {checksum:08x})");

    Ok(total)
}

/// Write the firmware image in `file` to the device. The image must end in a
/// valid DFU suffix, which is checked first and not sent to the device. The
/// device must be in `dfuIDLE`; after the last block the manifestation phase
/// is driven to completion, including the final bus reset for devices that
/// need one. Returns the number of payload bytes sent.
pub fn download<T: UsbTransport + 'static>(
    session: &mut DfuSession<T>,
    file: &mut (impl Read + Seek),
) -> Result<u64, Error> {
    let suffix = dfu_file::parse(file)?;
    if suffix.has_valid_crc() {
        info!("firmware checksum {:08x} (valid)", suffix.actual_crc);
    } else {
        warn!(
            "firmware checksum {:08x} (corrupt, expected {:08x})",
            suffix.actual_crc, suffix.expected_crc
        );
    }
    suffix.ensure_valid_crc().map_err(dfu_file::Error::from)?;

    let payload_len = suffix.payload_length;
    let bytes_per_hash = ((payload_len + SUFFIX_LEN) / PROGRESS_BAR_WIDTH).max(1);

    let xfer_size = usize::from(session.transfer_size());
    let mut buf = vec![0u8; xfer_size];

    progress("Starting download: [");

    let mut bytes_sent = 0u64;
    let mut hashes = 0u64;
    while bytes_sent < payload_len {
        let want = xfer_size.min((payload_len - bytes_sent) as usize);
        file.read_exact(&mut buf[..want])?;

        let sent = session.download(&buf[..want])?;
        bytes_sent += sent as u64;

        // Poll until the device has consumed the block, waiting out
        // bwPollTimeout while it reports dfuDNBUSY.
        let status = loop {
            let status = session.get_status()?;
            if status.status != DfuStatus::OK {
                break status;
            }

            if session.state() == DfuState::dfuDNBUSY {
                let mut timeout = status.poll_timeout;
                if session.quirks().is_set(Quirk::OpenmokoDnloadStatusPollTimeout) {
                    timeout = OPENMOKO_DNLOAD_POLL_MS;
                }
                session.status_poll_timeout(timeout)?;
            }

            if status.state == DfuState::dfuDNLOAD_IDLE {
                break status;
            }
        };
        status.ensure_ok()?;

        let hashes_todo = bytes_sent / bytes_per_hash - hashes;
        for _ in 0..hashes_todo {
            progress("#");
        }
        hashes += hashes_todo;
    }

    // One zero-length download request signals the end of the transfer.
    session.download(&[])?;
    println!("] finished!");

    manifest(session)?;

    Ok(bytes_sent)
}

/// Drive the manifestation phase after a completed download. Entered from
/// `dfuMANIFEST_SYNC`; ends with the device back in `dfuIDLE`
/// (manifestation-tolerant) or reset off the bus.
pub fn manifest<T: UsbTransport + 'static>(session: &mut DfuSession<T>) -> Result<(), Error> {
    loop {
        let status = session.get_status()?;
        info!(
            "manifestation status: state = {}, status = {:?} ({})",
            status.state,
            status.status,
            status.status.error_str()
        );

        if session.state() == DfuState::dfuMANIFEST {
            let mut timeout = status.poll_timeout;
            if session.quirks().is_set(Quirk::OpenmokoManifestStatusPollTimeout) {
                info!("overriding manifestation status poll timeout to 1 second");
                timeout = OPENMOKO_MANIFEST_POLL_MS;
            }

            // The wait itself transitions the machine, based on
            // bitManifestationTolerant.
            session.status_poll_timeout(timeout)?;

            if session.state() == DfuState::dfuMANIFEST_SYNC {
                continue;
            }
        }
        break;
    }

    let tolerant = session.functional_descriptor().manifestation_tolerant;
    match session.state() {
        DfuState::dfuIDLE => {
            if tolerant {
                info!("manifestation complete, device is back in dfuIDLE");
            } else {
                warn!(
                    "expected dfuMANIFEST-WAIT-RESET but device reached dfuIDLE (bitManifestationTolerant=0)"
                );
            }
        }
        DfuState::dfuMANIFEST_WAIT_RESET => {
            if tolerant {
                warn!(
                    "expected dfuIDLE but device reached dfuMANIFEST-WAIT-RESET (bitManifestationTolerant=1); still resetting it"
                );
            } else {
                info!("resetting USB device (bitManifestationTolerant=0)");
            }
            session.usb_reset()?;
        }
        other => warn!("unexpected device state {other} during manifestation"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::DfuVersion;
    use crate::session::FunctionalDescriptor;
    use crate::transport::mock::MockDevice;
    use std::io::Cursor;
    use std::time::Duration;

    const XFER_SIZE: u16 = 64;

    fn attach(device: MockDevice, desc: FunctionalDescriptor) -> DfuSession<MockDevice> {
        let mut session = DfuSession::new(
            device,
            0,
            Duration::from_millis(5000),
            DfuVersion::V1_0,
            desc,
        );
        session.probe_status().unwrap();
        session
    }

    fn suffixed_image(payload: &[u8]) -> Cursor<Vec<u8>> {
        let mut image = Cursor::new(payload.to_vec());
        dfu_file::add_suffix(&mut image, SuffixIds::default()).unwrap();
        image.set_position(0);
        image
    }

    #[test]
    fn download_sends_every_block_then_the_end_signal() {
        let payload: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let mut image = suffixed_image(&payload);

        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.busy_polls_per_block = 1;
        let mut session = attach(device, FunctionalDescriptor::permissive(XFER_SIZE));

        let sent = download(&mut session, &mut image).unwrap();
        assert_eq!(sent, 150);
        assert_eq!(session.transport().downloaded, payload);

        // The suffix never goes over the wire, and the transfer always ends
        // with a zero-length block.
        assert_eq!(
            session.transport().dnload_log,
            vec![(0, 64), (1, 64), (2, 22), (3, 0)]
        );

        // Manifestation-tolerant device: back to dfuIDLE, no reset needed.
        assert_eq!(session.state(), DfuState::dfuIDLE);
        assert_eq!(session.transport().resets, 0);
    }

    #[test]
    fn download_refuses_a_corrupt_image() {
        let payload = [1u8, 2, 3, 4];
        let mut image = suffixed_image(&payload);
        image.get_mut()[2] ^= 0xff;

        let mut session = attach(
            MockDevice::new(DfuState::dfuIDLE),
            FunctionalDescriptor::permissive(XFER_SIZE),
        );

        let result = download(&mut session, &mut image);
        assert!(matches!(
            result,
            Err(Error::File(dfu_file::Error::Suffix(
                dfu_file::SuffixError::BadCrc { .. }
            )))
        ));

        // Nothing must have been sent to the device.
        assert!(session.transport().dnload_log.is_empty());
    }

    #[test]
    fn download_aborts_on_error_status() {
        let payload = [0u8; 32];
        let mut image = suffixed_image(&payload);

        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.status = DfuStatus::errWRITE;
        let mut session = attach(device, FunctionalDescriptor::permissive(XFER_SIZE));

        // The attach probe ignores status; the transfer must not.
        let result = download(&mut session, &mut image);
        assert!(matches!(
            result,
            Err(Error::StatusError {
                status: DfuStatus::errWRITE
            })
        ));
    }

    #[test]
    fn download_drives_an_intolerant_device_to_reset() {
        let payload = [7u8; 40];
        let mut image = suffixed_image(&payload);

        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.manifestation_tolerant = false;
        device.manifest_polls = 1;

        let mut desc = FunctionalDescriptor::permissive(XFER_SIZE);
        desc.manifestation_tolerant = false;
        let mut session = attach(device, desc);

        download(&mut session, &mut image).unwrap();
        assert_eq!(session.transport().resets, 1);
    }

    #[test]
    fn download_honors_the_openmoko_poll_quirk() {
        let payload = [3u8; 16];
        let mut image = suffixed_image(&payload);

        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.busy_polls_per_block = 1;
        // An honest device would make the host sleep for 10 seconds here;
        // the quirk caps the wait at 5 ms, keeping this test fast.
        device.poll_timeout = 10_000;

        let mut session = attach(device, FunctionalDescriptor::permissive(XFER_SIZE));
        let mut quirks = *session.quirks();
        quirks.set(Quirk::OpenmokoDnloadStatusPollTimeout);
        session.set_quirks(quirks);

        let start = std::time::Instant::now();
        download(&mut session, &mut image).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn upload_round_trips_the_device_firmware() {
        let firmware: Vec<u8> = (0..150).map(|i| (i * 3) as u8).collect();

        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.firmware = firmware.clone();
        let mut session = attach(device, FunctionalDescriptor::permissive(XFER_SIZE));

        let mut out = Cursor::new(Vec::new());
        let total = upload(&mut session, &mut out).unwrap();
        assert_eq!(total, 150);

        let image = out.into_inner();
        assert_eq!(&image[..150], &firmware[..]);

        // The appended suffix is valid and carries no target ids.
        let mut parsed = Cursor::new(image);
        let info = dfu_file::parse(&mut parsed).unwrap();
        assert!(info.has_valid_crc());
        assert_eq!(info.payload_length, 150);
        assert_eq!(info.id_vendor, 0);
        assert_eq!(info.id_product, 0);
        assert_eq!(info.bcd_device, 0);
    }

    #[test]
    fn upload_aborts_on_error_status() {
        let mut device = MockDevice::new(DfuState::dfuIDLE);
        device.firmware = vec![0u8; 100];
        device.status = DfuStatus::errVERIFY;
        let mut session = attach(device, FunctionalDescriptor::permissive(XFER_SIZE));

        let mut out = Cursor::new(Vec::new());
        let result = upload(&mut session, &mut out);
        assert!(matches!(
            result,
            Err(Error::StatusError {
                status: DfuStatus::errVERIFY
            })
        ));
        assert!(out.into_inner().is_empty());
    }
}
