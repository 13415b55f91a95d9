use anyhow::{Context as _, Result, bail};
use clap::Parser;
use log::{info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use dfu_tool::quirks::{self, Quirk, QuirkSet};
use dfu_tool::requests::{DfuStatus, DfuVersion};
use dfu_tool::session::{DfuSession, FunctionalDescriptor};
use dfu_tool::state_machine::DfuState;
use dfu_tool::transfer;

const DFU_INTERFACE_CLASS: u8 = 0xfe;
const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
const DFU_MODE_PROTOCOL: u8 = 0x02;

const GET_DESCRIPTOR_REQUEST: u8 = 0x06;

/// Timeout for every USB control transfer.
const USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long a detached device may wait for the bus reset.
const DETACH_TIMEOUT_MS: u16 = 1000;

/// Largest block we will ever send per request, whatever the device claims.
const MAX_TRANSFER_SIZE: u16 = 4096;

#[derive(Parser, Debug)]
#[command(
    name = "dfu-tool",
    version,
    about = "Upload or download firmware on USB DFU 1.0/1.1 devices",
    group = clap::ArgGroup::new("action").required(true).args(["list", "upload", "download"])
)]
struct Opt {
    /// List the currently attached DFU capable USB devices
    #[arg(short, long)]
    list: bool,

    /// Vendor/product ID of the DFU device, as four hex digits each
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<UsbId>,

    /// Physical location of the DFU device on the bus
    #[arg(short, long, value_name = "BUS-PORT.PORT")]
    path: Option<DevicePath>,

    /// Configuration of the DFU device
    #[arg(short, long, value_name = "NR")]
    cfg: Option<u8>,

    /// DFU interface number
    #[arg(short, long, value_name = "NR")]
    intf: Option<u8>,

    /// Altsetting of the DFU interface, by number or by name
    #[arg(short, long, value_name = "ALT")]
    alt: Option<String>,

    /// Number of bytes per USB transfer
    #[arg(short, long, value_name = "BYTES")]
    transfer_size: Option<u16>,

    /// Read firmware from the device into FILE
    #[arg(short = 'U', long, value_name = "FILE")]
    upload: Option<std::path::PathBuf>,

    /// Write firmware from FILE into the device
    #[arg(short = 'D', long, value_name = "FILE")]
    download: Option<std::path::PathBuf>,

    /// Issue USB reset signalling once we're finished
    #[arg(short = 'R', long)]
    reset: bool,

    /// More verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Error, Debug, PartialEq)]
enum MatchError {
    #[error("no DFU capable USB device matches the specification")]
    NoDevices,

    #[error(
        "more than one DFU capable USB device matches; disconnect all but one, or narrow the match with --device / --path"
    )]
    MultipleDevices,
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
struct UsbId {
    vid: u16,
    pid: u16,
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got `{s}`"))?;
        let parse = |part: &str| {
            u16::from_str_radix(part, 16).map_err(|_| format!("`{part}` is not a hex USB id"))
        };
        Ok(UsbId {
            vid: parse(vid)?,
            pid: parse(pid)?,
        })
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// A bus number plus the chain of hub ports leading to the device.
#[derive(Clone, Debug, PartialEq)]
struct DevicePath {
    bus: u8,
    ports: Vec<u8>,
}

impl FromStr for DevicePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, ports) = s
            .split_once('-')
            .ok_or_else(|| format!("expected BUS-PORT[.PORT...], got `{s}`"))?;
        let bus = bus.parse().map_err(|_| format!("`{bus}` is not a bus number"))?;
        let ports = ports
            .split('.')
            .map(|p| p.parse().map_err(|_| format!("`{p}` is not a port number")))
            .collect::<Result<Vec<u8>, _>>()?;
        if ports.is_empty() {
            return Err(format!("no ports in `{s}`"));
        }
        Ok(DevicePath { bus, ports })
    }
}

/// One DFU interface altsetting found while walking a device's configuration
/// descriptors.
#[derive(Copy, Clone, Debug)]
struct DfuInterface {
    configuration: u8,
    interface: u8,
    alt: u8,
    /// DFU-mode protocol, as opposed to the run-time personality.
    dfu_mode: bool,
    name_index: Option<u8>,
}

/// Walk all configurations of `device` and collect its DFU interfaces
/// (class 0xfe, subclass 0x01), one entry per altsetting.
fn find_dfu_interfaces(device: &Device<Context>) -> rusb::Result<Vec<DfuInterface>> {
    let desc = device.device_descriptor()?;
    let mut found = Vec::new();

    for cfg_idx in 0..desc.num_configurations() {
        // Configuration descriptors can be unreadable without privileges on
        // some systems; skip what we cannot see.
        let Ok(config) = device.config_descriptor(cfg_idx) else {
            continue;
        };
        for interface in config.interfaces() {
            for intf_desc in interface.descriptors() {
                if intf_desc.class_code() == DFU_INTERFACE_CLASS
                    && intf_desc.sub_class_code() == DFU_INTERFACE_SUBCLASS
                {
                    found.push(DfuInterface {
                        configuration: config.number(),
                        interface: intf_desc.interface_number(),
                        alt: intf_desc.setting_number(),
                        dfu_mode: intf_desc.protocol_code() == DFU_MODE_PROTOCOL,
                        name_index: intf_desc.description_string_index(),
                    });
                }
            }
        }
    }

    Ok(found)
}

#[derive(Clone, Debug, Default)]
struct DeviceSpec {
    id: Option<UsbId>,
    path: Option<DevicePath>,
}

impl DeviceSpec {
    fn matches(&self, device: &Device<Context>, desc: &DeviceDescriptor) -> bool {
        if let Some(id) = self.id {
            if desc.vendor_id() != id.vid || desc.product_id() != id.pid {
                return false;
            }
        }

        if let Some(ref path) = self.path {
            if device.bus_number() != path.bus {
                return false;
            }
            match device.port_numbers() {
                Ok(ports) if ports == path.ports => {}
                _ => return false,
            }
        }

        true
    }

    /// Find the single matching DFU capable device. More than one match is an
    /// error: a transfer involves a bus reset, after which we could not tell
    /// the devices apart anymore.
    fn get_device(&self, context: &Context) -> Result<Device<Context>> {
        let devices = context.devices().context("cannot enumerate USB devices")?;
        let mut candidates = devices.iter().filter(|dev| {
            let Ok(desc) = dev.device_descriptor() else {
                return false;
            };
            self.matches(dev, &desc)
                && find_dfu_interfaces(dev).is_ok_and(|interfaces| !interfaces.is_empty())
        });

        match candidates.next() {
            None => Err(MatchError::NoDevices.into()),
            Some(dev) => {
                if candidates.next().is_some() {
                    Err(MatchError::MultipleDevices.into())
                } else {
                    Ok(dev)
                }
            }
        }
    }
}

fn interface_name(handle: Option<&DeviceHandle<Context>>, index: Option<u8>) -> String {
    index
        .and_then(|idx| handle.and_then(|h| h.read_string_descriptor_ascii(idx).ok()))
        .unwrap_or_else(|| "UNDEFINED".to_string())
}

fn list(context: &Context, spec: &DeviceSpec) -> Result<()> {
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if !spec.matches(&device, &desc) {
            continue;
        }
        let Ok(interfaces) = find_dfu_interfaces(&device) else {
            continue;
        };

        let handle = device.open().ok();
        for intf in interfaces {
            println!(
                "Found {}: [{:04x}:{:04x}] devnum={}, cfg={}, intf={}, alt={}, name=\"{}\"",
                if intf.dfu_mode { "DFU" } else { "Runtime" },
                desc.vendor_id(),
                desc.product_id(),
                device.address(),
                intf.configuration,
                intf.interface,
                intf.alt,
                interface_name(handle.as_ref(), intf.name_index),
            );
        }
    }

    Ok(())
}

/// Narrow the discovered DFU interfaces down to the one the user wants,
/// honoring --cfg, --intf and --alt (the latter by number or by name).
fn select_interface(
    interfaces: &[DfuInterface],
    opt: &Opt,
    handle: &DeviceHandle<Context>,
) -> Result<DfuInterface> {
    let mut candidates: Vec<DfuInterface> = interfaces
        .iter()
        .filter(|i| opt.cfg.is_none_or(|c| i.configuration == c))
        .filter(|i| opt.intf.is_none_or(|n| i.interface == n))
        .copied()
        .collect();

    if let Some(ref alt) = opt.alt {
        if let Ok(number) = alt.parse::<u8>() {
            candidates.retain(|i| i.alt == number);
        } else {
            candidates.retain(|i| {
                i.name_index.is_some_and(|idx| {
                    handle
                        .read_string_descriptor_ascii(idx)
                        .is_ok_and(|name| name == *alt)
                })
            });
            if candidates.is_empty() {
                bail!("no such alternate setting: \"{alt}\"");
            }
        }
    }

    match candidates.len() {
        0 => bail!("no DFU interface matches the --cfg/--intf/--alt selection"),
        1 => Ok(candidates[0]),
        n => bail!("{n} DFU interfaces/altsettings match; specify one via --intf / --alt"),
    }
}

/// Fetch the DFU functional descriptor (type 0x21) from the interface.
fn read_functional_descriptor(
    handle: &DeviceHandle<Context>,
    interface: u8,
) -> Result<FunctionalDescriptor> {
    let mut buf = [0u8; FunctionalDescriptor::SIZE];
    let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface);
    let len = handle.read_control(
        request_type,
        GET_DESCRIPTOR_REQUEST,
        u16::from(FunctionalDescriptor::DESCRIPTOR_TYPE) << 8,
        u16::from(interface),
        &mut buf,
        USB_TIMEOUT,
    )?;

    FunctionalDescriptor::from_bytes(&buf[..len]).map_err(Into::into)
}

fn bcd_version(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8) | (u16::from(version.minor()) << 4) | u16::from(version.sub_minor())
}

/// Get the device out of run-time mode: detach, reset, and wait for it to
/// come back as a DFU-mode device.
fn leave_runtime_mode(
    handle: DeviceHandle<Context>,
    interface: u8,
) -> Result<()> {
    let mut session = DfuSession::new(
        handle,
        u16::from(interface),
        USB_TIMEOUT,
        DfuVersion::V1_0,
        FunctionalDescriptor::permissive(0),
    );

    let status = session.probe_status().context("cannot determine device status")?;
    info!(
        "run-time device state = {}, status = {:?}",
        status.state, status.status
    );

    match session.state() {
        DfuState::appIDLE => {
            info!("device in run-time mode, sending DFU detach request");
            session.detach(DETACH_TIMEOUT_MS)?;
            info!("resetting USB");
            session.usb_reset()?;
            std::thread::sleep(Duration::from_secs(2));
        }
        DfuState::appDETACH => {
            // Detach timer already running, only the reset is missing.
            info!("resetting USB");
            session.usb_reset()?;
            std::thread::sleep(Duration::from_secs(2));
        }
        DfuState::dfuERROR => {
            info!("dfuERROR, clearing status");
            session.clear_status()?;
        }
        other => warn!("run-time device already in DFU state {other}?!"),
    }

    Ok(())
}

fn run(opt: &Opt) -> Result<()> {
    let context = Context::new().context("cannot initialize libusb")?;
    let spec = DeviceSpec {
        id: opt.device,
        path: opt.path.clone(),
    };

    if opt.list {
        return list(&context, &spec);
    }

    let mut device = spec.get_device(&context)?;
    let desc = device.device_descriptor()?;
    info!(
        "opening USB device {:04x}:{:04x}",
        desc.vendor_id(),
        desc.product_id()
    );
    let mut handle = device.open().context("cannot open device")?;

    // During the first round a run-time device exposes exactly one DFU
    // interface; detach it and re-enumerate.
    let interfaces = find_dfu_interfaces(&device)?;
    let first = *interfaces
        .first()
        .context("selected device has no DFU interface")?;
    if !first.dfu_mode {
        info!("claiming USB DFU run-time interface");
        handle
            .claim_interface(first.interface)
            .context("cannot claim interface")?;
        leave_runtime_mode(handle, first.interface)?;

        device = spec.get_device(&context).context("lost device after reset")?;
        handle = device.open().context("cannot open device after reset")?;
    }

    let interfaces = find_dfu_interfaces(&device)?;
    let selected = select_interface(&interfaces, opt, &handle)?;

    let desc = device.device_descriptor()?;
    println!(
        "Found {}: [{:04x}:{:04x}] devnum={}, cfg={}, intf={}, alt={}, name=\"{}\"",
        if selected.dfu_mode { "DFU" } else { "Runtime" },
        desc.vendor_id(),
        desc.product_id(),
        device.address(),
        selected.configuration,
        selected.interface,
        selected.alt,
        interface_name(Some(&handle), selected.name_index),
    );
    if !selected.dfu_mode {
        bail!("device is still in run-time mode after detach");
    }

    info!("claiming USB DFU interface");
    handle
        .claim_interface(selected.interface)
        .context("cannot claim interface")?;
    handle
        .set_alternate_setting(selected.interface, selected.alt)
        .context("cannot set alternate setting")?;

    let mut func_desc = match read_functional_descriptor(&handle, selected.interface) {
        Ok(func_desc) => func_desc,
        Err(e) => {
            // Detection without the descriptor's DFU version.
            let preliminary = quirks::detect(
                quirks::ANY_ID,
                desc.vendor_id(),
                desc.product_id(),
                bcd_version(desc.device_version()),
            );
            let manual_settings = opt.transfer_size.is_some();
            if preliminary.is_set(Quirk::IgnoreInvalidFunctionalDescriptor) || manual_settings {
                warn!("cannot read DFU functional descriptor ({e:#}); assuming permissive defaults");
                FunctionalDescriptor::permissive(opt.transfer_size.unwrap_or(MAX_TRANSFER_SIZE))
            } else {
                return Err(e.context("cannot read DFU functional descriptor"));
            }
        }
    };

    func_desc.transfer_size = opt
        .transfer_size
        .unwrap_or(func_desc.transfer_size)
        .min(MAX_TRANSFER_SIZE);
    info!("transfer size = {:#06x}", func_desc.transfer_size);

    let quirks = quirks::detect(
        func_desc.bcd_dfu_version,
        desc.vendor_id(),
        desc.product_id(),
        bcd_version(desc.device_version()),
    );
    if !quirks.is_empty() {
        info!("detected device quirks: {quirks}");
    }

    let version = forced_version(&quirks)
        .unwrap_or_else(|| DfuVersion::from_bcd(func_desc.bcd_dfu_version));
    info!("DFU {version}, {func_desc}");

    let mut session = DfuSession::new(
        handle,
        u16::from(selected.interface),
        USB_TIMEOUT,
        version,
        func_desc,
    );
    session.set_quirks(quirks);

    ensure_idle(&mut session)?;

    if let Some(ref path) = opt.upload {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        transfer::upload(&mut session, &mut file)?;
    } else if let Some(ref path) = opt.download {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        transfer::download(&mut session, &mut file)?;
    }

    if opt.reset {
        if session.quirks().is_set(Quirk::OpenmokoDetachBeforeFinalReset) {
            // Non-standard, but these devices will not come back without it.
            if let Err(e) = session.detach(DETACH_TIMEOUT_MS) {
                warn!("detach before final reset failed: {e:#}");
            }
        }
        info!("resetting USB to switch back to run-time mode");
        session.usb_reset()?;
    }

    Ok(())
}

fn forced_version(quirks: &QuirkSet) -> Option<DfuVersion> {
    if quirks.is_set(Quirk::ForceDfuVersion10) {
        Some(DfuVersion::V1_0)
    } else if quirks.is_set(Quirk::ForceDfuVersion11) {
        Some(DfuVersion::V1_1)
    } else {
        None
    }
}

/// Walk the device into `dfuIDLE`, clearing errors and aborting stale
/// transfers left over from a previous run.
fn ensure_idle(session: &mut DfuSession<DeviceHandle<Context>>) -> Result<()> {
    let mut status = session.probe_status().context("cannot determine device status")?;

    loop {
        info!(
            "device state = {}, status = {:?}",
            status.state, status.status
        );
        match session.state() {
            DfuState::appIDLE | DfuState::appDETACH => {
                bail!("device is still in run-time mode; cannot start a transfer")
            }
            DfuState::dfuERROR => {
                info!("dfuERROR, clearing status");
                session.clear_status()?;
                status = session.probe_status()?;
            }
            DfuState::dfuDNLOAD_IDLE | DfuState::dfuUPLOAD_IDLE => {
                info!("aborting previous incomplete transfer");
                session.abort()?;
                status = session.probe_status()?;
            }
            DfuState::dfuIDLE => break,
            other => bail!("cannot start a transfer from device state {other}"),
        }
    }

    if status.status != DfuStatus::OK {
        bail!(
            "device is idle but reports status {:?} ({})",
            status.status,
            status.status.error_str()
        );
    }

    Ok(())
}

fn main() {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or(
                "DFU_TOOL_LOG",
                if opt.verbose { "debug" } else { "info" },
            )
            .write_style("DFU_TOOL_LOG_STYLE"),
    )
    .init();

    if let Err(e) = run(&opt) {
        eprintln!("Error: {e:#}");
        let code = match e.downcast_ref::<MatchError>() {
            Some(MatchError::MultipleDevices) => 3,
            _ => 1,
        };
        std::process::exit(code);
    }
}
