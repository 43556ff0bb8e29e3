use anyhow::Result;
use log::{debug, info};
use sketchforge_core::{
    BoardFamily, DevicePort, IdentifiedDevice, IdentifyMethod, ResetMethod, ResetResult,
    ToolConfig, ToolError, ToolResult,
};
use sketchforge_safety::check_upload_target;
use std::time::Duration;

pub mod hotplug;
pub mod reset;
pub mod signatures;

pub use hotplug::{diff_ports, HotplugEvent, HotplugMonitor};
pub use reset::{BootloaderOutcome, LineControl, PortOpener, ResetTiming, SystemPortOpener};
pub use signatures::{BoardSignature, SignatureTable};
pub use sketchforge_safety::{SafetyDecision, SafetyReport};

const BOOTLOADER_POLL: Duration = Duration::from_millis(250);

pub trait PortEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DevicePort>>;
}

pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn enumerate(&self) -> Result<Vec<DevicePort>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => DevicePort {
                    path: info.port_name,
                    manufacturer: usb.manufacturer,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    serial_number: usb.serial_number,
                    friendly_name: usb.product,
                },
                _ => DevicePort::bare(info.port_name),
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbedBoard {
    pub fqbn: String,
    pub name: String,
}

/// Asks something outside the registry (usually the build tool) what board
/// sits behind a port.
pub trait BoardProbe: Send + Sync {
    fn probe(&self, port: &DevicePort) -> Option<ProbedBoard>;
}

/// The registry surface the recovery engine drives.
pub trait DeviceControl {
    fn list_ports(&self) -> Result<Vec<DevicePort>>;
    fn identify(&self, port: &DevicePort) -> Option<IdentifiedDevice>;
    fn reset(&self, port: &str, method: ResetMethod) -> ResetResult;
    fn bootloader_mode(&self, port: &str, family: BoardFamily) -> BootloaderOutcome;
    fn safe_guard(&self, port: &str, fqbn: &str) -> SafetyReport;
}

pub struct DeviceRegistry {
    enumerator: Box<dyn PortEnumerator>,
    opener: Box<dyn PortOpener>,
    table: SignatureTable,
    tool_probe: Option<Box<dyn BoardProbe>>,
    bootloader_probe: Option<Box<dyn BoardProbe>>,
    timing: ResetTiming,
    bootloader_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(config: &ToolConfig) -> Result<Self> {
        let table = match &config.signature_table {
            Some(path) => SignatureTable::load(path)?,
            None => SignatureTable::builtin(),
        };
        let mut registry =
            Self::with_parts(Box::new(SystemPorts), Box::new(SystemPortOpener), table);
        registry.bootloader_timeout = config.bootloader_timeout();
        Ok(registry)
    }

    pub fn with_parts(
        enumerator: Box<dyn PortEnumerator>,
        opener: Box<dyn PortOpener>,
        table: SignatureTable,
    ) -> Self {
        Self {
            enumerator,
            opener,
            table,
            tool_probe: None,
            bootloader_probe: None,
            timing: ResetTiming::default(),
            bootloader_timeout: Duration::from_secs(10),
        }
    }

    pub fn set_tool_probe(&mut self, probe: Box<dyn BoardProbe>) {
        self.tool_probe = Some(probe);
    }

    pub fn set_bootloader_probe(&mut self, probe: Box<dyn BoardProbe>) {
        self.bootloader_probe = Some(probe);
    }

    pub fn set_timing(&mut self, timing: ResetTiming) {
        self.timing = timing;
    }

    pub fn set_bootloader_timeout(&mut self, timeout: Duration) {
        self.bootloader_timeout = timeout;
    }

    pub fn table(&self) -> &SignatureTable {
        &self.table
    }

    pub fn list_ports(&self) -> Result<Vec<DevicePort>> {
        self.enumerator.enumerate()
    }

    /// First stage that recognises the port wins; stages are never combined.
    pub fn identify(&self, port: &DevicePort) -> Option<IdentifiedDevice> {
        let found = self
            .by_signature(port)
            .or_else(|| self.by_manufacturer(port))
            .or_else(|| self.by_probe(port, self.tool_probe.as_deref(), IdentifyMethod::ToolProbe))
            .or_else(|| {
                self.by_probe(
                    port,
                    self.bootloader_probe.as_deref(),
                    IdentifyMethod::BootloaderProbe,
                )
            });
        match &found {
            Some(device) => debug!(
                "{} identified as {} via {:?} ({:.1})",
                port.path, device.fqbn, device.method, device.confidence
            ),
            None => debug!("{} not identified", port.path),
        }
        found
    }

    pub fn identify_path(&self, path: &str) -> Result<Option<IdentifiedDevice>> {
        let port = self
            .list_ports()?
            .into_iter()
            .find(|port| port.path == path)
            .unwrap_or_else(|| DevicePort::bare(path));
        Ok(self.identify(&port))
    }

    /// Picks the upload target: the most confident identified port, preferring
    /// ports whose board matches `fqbn`.
    pub fn resolve_port(&self, fqbn: Option<&str>) -> ToolResult<IdentifiedDevice> {
        let ports = self
            .list_ports()
            .map_err(|err| ToolError::PortNotFound(format!("port scan failed: {:#}", err)))?;
        let mut candidates: Vec<IdentifiedDevice> =
            ports.iter().filter_map(|port| self.identify(port)).collect();
        candidates.sort_by(|a, b| {
            let a_match = fqbn.map(|f| fqbn_matches(f, &a.fqbn)).unwrap_or(false);
            let b_match = fqbn.map(|f| fqbn_matches(f, &b.fqbn)).unwrap_or(false);
            b_match
                .cmp(&a_match)
                .then(b.confidence.total_cmp(&a.confidence))
        });
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::PortNotFound("no recognised board connected".to_string()))
    }

    pub fn reset(&self, port: &str, method: ResetMethod) -> ResetResult {
        info!("reset {} via {:?}", port, method);
        reset::reset_port(self.opener.as_ref(), port, method, &self.timing)
    }

    pub fn bootloader_mode(&self, port: &str, family: BoardFamily) -> BootloaderOutcome {
        match family {
            BoardFamily::NativeUsb => {
                let before = self.list_ports().unwrap_or_default();
                let touch = reset::touch_1200(self.opener.as_ref(), port, &self.timing);
                if !touch.success {
                    return BootloaderOutcome {
                        success: false,
                        port: None,
                        message: touch.message,
                        manual_steps: vec![
                            "Double-tap the reset button to enter the bootloader".to_string(),
                        ],
                    };
                }
                match reset::wait_for_bootloader_port(
                    &before,
                    port,
                    || self.list_ports(),
                    self.bootloader_timeout,
                    BOOTLOADER_POLL,
                ) {
                    Some(found) => BootloaderOutcome {
                        success: true,
                        message: format!("Bootloader port {} is up", found),
                        port: Some(found),
                        manual_steps: Vec::new(),
                    },
                    None => BootloaderOutcome {
                        success: false,
                        port: None,
                        message: format!(
                            "No bootloader port appeared within {}ms",
                            self.bootloader_timeout.as_millis()
                        ),
                        manual_steps: vec![
                            "Double-tap the reset button, then retry the upload".to_string(),
                        ],
                    },
                }
            }
            BoardFamily::WifiSoc => BootloaderOutcome {
                success: false,
                port: Some(port.to_string()),
                message: "Board needs manual download mode".to_string(),
                manual_steps: vec![
                    "Hold the BOOT button".to_string(),
                    "Press and release EN/RESET".to_string(),
                    "Release BOOT once the upload starts".to_string(),
                ],
            },
            BoardFamily::Classic | BoardFamily::Unknown => BootloaderOutcome {
                success: false,
                port: Some(port.to_string()),
                message: "Bootloader runs briefly after reset; the uploader handles entry"
                    .to_string(),
                manual_steps: vec![
                    "Press reset just as the upload begins".to_string(),
                    "Or burn the bootloader with an ISP programmer".to_string(),
                ],
            },
        }
    }

    pub fn safe_guard(&self, port: &str, fqbn: &str) -> SafetyReport {
        let ports = self.list_ports().unwrap_or_default();
        let mut report = check_upload_target(&ports, port, fqbn);
        if let Some(found) = ports.iter().find(|candidate| candidate.path == port) {
            if let Some(device) = self.identify(found) {
                if !fqbn_matches(fqbn, &device.fqbn) && device.method == IdentifyMethod::VidPid {
                    report.warnings.push(format!(
                        "{} looks like {} ({}), not {}",
                        port, device.board_name, device.fqbn, fqbn
                    ));
                }
            }
        }
        report
    }

    fn by_signature(&self, port: &DevicePort) -> Option<IdentifiedDevice> {
        let signature = port.signature()?;
        let board = self.table.lookup(&signature)?;
        Some(identified(port, &board.fqbn, &board.name, IdentifyMethod::VidPid))
    }

    fn by_manufacturer(&self, port: &DevicePort) -> Option<IdentifiedDevice> {
        let manufacturer = port.manufacturer.as_deref()?;
        let hint = self.table.match_manufacturer(manufacturer)?;
        Some(identified(port, &hint.fqbn, &hint.name, IdentifyMethod::Manufacturer))
    }

    fn by_probe(
        &self,
        port: &DevicePort,
        probe: Option<&dyn BoardProbe>,
        method: IdentifyMethod,
    ) -> Option<IdentifiedDevice> {
        let board = probe?.probe(port)?;
        Some(identified(port, &board.fqbn, &board.name, method))
    }
}

impl DeviceControl for DeviceRegistry {
    fn list_ports(&self) -> Result<Vec<DevicePort>> {
        DeviceRegistry::list_ports(self)
    }

    fn identify(&self, port: &DevicePort) -> Option<IdentifiedDevice> {
        DeviceRegistry::identify(self, port)
    }

    fn reset(&self, port: &str, method: ResetMethod) -> ResetResult {
        DeviceRegistry::reset(self, port, method)
    }

    fn bootloader_mode(&self, port: &str, family: BoardFamily) -> BootloaderOutcome {
        DeviceRegistry::bootloader_mode(self, port, family)
    }

    fn safe_guard(&self, port: &str, fqbn: &str) -> SafetyReport {
        DeviceRegistry::safe_guard(self, port, fqbn)
    }
}

fn identified(port: &DevicePort, fqbn: &str, name: &str, method: IdentifyMethod) -> IdentifiedDevice {
    IdentifiedDevice {
        port: port.clone(),
        fqbn: fqbn.to_string(),
        board_name: name.to_string(),
        confidence: method.confidence(),
        method,
    }
}

/// Compares the `vendor:arch:board` part only; board options are ignored.
pub fn fqbn_matches(requested: &str, detected: &str) -> bool {
    let base = |fqbn: &str| {
        fqbn.split(':')
            .take(3)
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
    };
    base(requested) == base(detected)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct StaticPorts {
        ports: Arc<Mutex<Vec<DevicePort>>>,
    }

    impl StaticPorts {
        pub fn new(ports: Vec<DevicePort>) -> Self {
            Self {
                ports: Arc::new(Mutex::new(ports)),
            }
        }

        pub fn set(&self, ports: Vec<DevicePort>) {
            *self.ports.lock().unwrap() = ports;
        }
    }

    impl PortEnumerator for StaticPorts {
        fn enumerate(&self) -> Result<Vec<DevicePort>> {
            Ok(self.ports.lock().unwrap().clone())
        }
    }
}
