//! Hardware reset and bootloader entry over serial control lines.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use sketchforge_core::{DevicePort, ResetMethod, ResetResult};
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub trait LineControl: Send {
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
}

/// Opens a port for control-line access. Dropping the returned value closes it.
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn LineControl>>;
}

pub struct SystemPortOpener;

struct SystemLine(Box<dyn serialport::SerialPort>);

impl LineControl for SystemLine {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.0.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.0.write_request_to_send(level)?;
        Ok(())
    }
}

impl PortOpener for SystemPortOpener {
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn LineControl>> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("open {} @ {}", path, baud))?;
        Ok(Box::new(SystemLine(port)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResetTiming {
    pub settle: Duration,
    pub touch_hold: Duration,
    /// Upper bound between opening and closing the port for a 1200bps touch.
    pub touch_window: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            touch_hold: Duration::from_millis(50),
            touch_window: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootloaderOutcome {
    pub success: bool,
    pub port: Option<String>,
    pub message: String,
    pub manual_steps: Vec<String>,
}

/// Clear both lines, wait for the board to settle, raise them again.
pub fn dtr_rts_toggle(opener: &dyn PortOpener, port: &str, timing: &ResetTiming) -> ResetResult {
    let outcome = (|| -> Result<()> {
        let mut line = opener.open(port, 9600)?;
        line.set_dtr(false)?;
        line.set_rts(false)?;
        std::thread::sleep(timing.settle);
        line.set_dtr(true)?;
        line.set_rts(true)?;
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            debug!("dtr/rts reset on {}", port);
            ResetResult {
                method: ResetMethod::DtrRts,
                success: true,
                message: format!("Toggled DTR/RTS on {}", port),
            }
        }
        Err(err) => ResetResult {
            method: ResetMethod::DtrRts,
            success: false,
            message: format!("DTR/RTS reset failed on {}: {:#}", port, err),
        },
    }
}

/// Open at 1200 baud and close again; native USB boards reboot into their
/// bootloader when they see this.
pub fn touch_1200(opener: &dyn PortOpener, port: &str, timing: &ResetTiming) -> ResetResult {
    let mut line = match opener.open(port, 1200) {
        Ok(line) => line,
        Err(err) => {
            return ResetResult {
                method: ResetMethod::Touch1200,
                success: false,
                message: format!("1200bps touch failed on {}: {:#}", port, err),
            }
        }
    };
    let started = Instant::now();
    let _ = line.set_dtr(false);
    std::thread::sleep(timing.touch_hold.min(timing.touch_window));
    drop(line);

    let elapsed = started.elapsed();
    if elapsed > timing.touch_window {
        warn!(
            "1200bps touch on {} held the port {}ms (window {}ms)",
            port,
            elapsed.as_millis(),
            timing.touch_window.as_millis()
        );
        return ResetResult {
            method: ResetMethod::Touch1200,
            success: false,
            message: format!(
                "1200bps touch on {} took {}ms, outside the {}ms window",
                port,
                elapsed.as_millis(),
                timing.touch_window.as_millis()
            ),
        };
    }
    ResetResult {
        method: ResetMethod::Touch1200,
        success: true,
        message: format!("1200bps touch on {} ({}ms)", port, elapsed.as_millis()),
    }
}

pub fn reset_port(
    opener: &dyn PortOpener,
    port: &str,
    method: ResetMethod,
    timing: &ResetTiming,
) -> ResetResult {
    match method {
        ResetMethod::DtrRts => dtr_rts_toggle(opener, port, timing),
        ResetMethod::Touch1200 => touch_1200(opener, port, timing),
        ResetMethod::Auto => {
            let first = dtr_rts_toggle(opener, port, timing);
            if first.success {
                return first;
            }
            info!("{}; falling back to 1200bps touch", first.message);
            touch_1200(opener, port, timing)
        }
    }
}

/// Polls until a bootloader port shows up: either a path that was not present
/// before, or the original path coming back after it disappeared.
pub fn wait_for_bootloader_port(
    before: &[DevicePort],
    original: &str,
    mut list: impl FnMut() -> Result<Vec<DevicePort>>,
    timeout: Duration,
    poll: Duration,
) -> Option<String> {
    let before: HashSet<&str> = before.iter().map(|port| port.path.as_str()).collect();
    let started = Instant::now();
    let mut original_gone = false;

    while started.elapsed() < timeout {
        std::thread::sleep(poll);
        let now = match list() {
            Ok(ports) => ports,
            Err(err) => {
                debug!("port scan failed while waiting for bootloader: {:#}", err);
                continue;
            }
        };
        if let Some(new_port) = now.iter().find(|port| !before.contains(port.path.as_str())) {
            return Some(new_port.path.clone());
        }
        let present = now.iter().any(|port| port.path == original);
        if !present {
            original_gone = true;
        } else if original_gone {
            return Some(original.to_string());
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::testing::{LineOp, MockOpener};
    use super::*;

    fn fast() -> ResetTiming {
        ResetTiming {
            settle: Duration::from_millis(5),
            touch_hold: Duration::from_millis(5),
            touch_window: Duration::from_millis(200),
        }
    }

    #[test]
    fn dtr_rts_clears_then_sets_both_lines() {
        let opener = MockOpener::default();
        let result = dtr_rts_toggle(&opener, "/dev/ttyUSB0", &fast());
        assert!(result.success);
        let ops = opener.recorded();
        assert_eq!(ops[0], LineOp::Open("/dev/ttyUSB0".to_string(), 9600));
        assert_eq!(&ops[1..5], &[LineOp::Dtr(false), LineOp::Rts(false), LineOp::Dtr(true), LineOp::Rts(true)]);
        assert!(matches!(ops[5], LineOp::Close(_)));
    }

    #[test]
    fn touch_closes_inside_window() {
        let opener = MockOpener::default();
        let timing = ResetTiming {
            touch_hold: Duration::from_secs(5),
            ..fast()
        };
        let started = Instant::now();
        let result = touch_1200(&opener, "/dev/ttyACM0", &timing);
        assert!(result.success);
        assert_eq!(result.method, ResetMethod::Touch1200);

        let ops = opener.ops.lock().unwrap().clone();
        let (opened_at, open) = &ops[0];
        assert_eq!(*open, LineOp::Open("/dev/ttyACM0".to_string(), 1200));
        let (closed_at, _) = ops.last().unwrap();
        assert!(closed_at.duration_since(*opened_at) <= timing.touch_window + Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn slow_close_fails_the_touch() {
        let opener = MockOpener {
            close_delay: Some(Duration::from_millis(300)),
            ..MockOpener::default()
        };
        let result = touch_1200(&opener, "/dev/ttyACM0", &fast());
        assert!(!result.success);
        assert_eq!(result.method, ResetMethod::Touch1200);
        assert!(result.message.contains("outside the 200ms window"));

        let auto = reset_port(
            &MockOpener {
                fail_baud: Some(9600),
                close_delay: Some(Duration::from_millis(300)),
                ..MockOpener::default()
            },
            "/dev/ttyACM0",
            ResetMethod::Auto,
            &fast(),
        );
        assert!(!auto.success);
    }

    #[test]
    fn auto_falls_back_to_touch() {
        let opener = MockOpener {
            fail_baud: Some(9600),
            ..MockOpener::default()
        };
        let result = reset_port(&opener, "/dev/ttyACM0", ResetMethod::Auto, &fast());
        assert!(result.success);
        assert_eq!(result.method, ResetMethod::Touch1200);
    }

    #[test]
    fn failed_open_reports_failure() {
        let opener = MockOpener {
            fail_baud: Some(1200),
            ..MockOpener::default()
        };
        let result = touch_1200(&opener, "/dev/ttyACM0", &fast());
        assert!(!result.success);
        assert!(result.message.contains("device busy"));
    }

    #[test]
    fn bootloader_port_detected_as_new_path() {
        let before = vec![DevicePort::bare("/dev/ttyACM0")];
        let mut scans = vec![
            vec![],
            vec![DevicePort::bare("/dev/ttyACM1")],
        ]
        .into_iter();
        let found = wait_for_bootloader_port(
            &before,
            "/dev/ttyACM0",
            || Ok(scans.next().unwrap_or_default()),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        assert_eq!(found.as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn bootloader_port_detected_as_reappearing_path() {
        let before = vec![DevicePort::bare("/dev/ttyACM0")];
        let mut scans = vec![
            vec![DevicePort::bare("/dev/ttyACM0")],
            vec![],
            vec![DevicePort::bare("/dev/ttyACM0")],
        ]
        .into_iter();
        let found = wait_for_bootloader_port(
            &before,
            "/dev/ttyACM0",
            || Ok(scans.next().unwrap_or_default()),
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        assert_eq!(found.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn bootloader_wait_is_bounded() {
        let before = vec![DevicePort::bare("/dev/ttyACM0")];
        let started = Instant::now();
        let found = wait_for_bootloader_port(
            &before,
            "/dev/ttyACM0",
            || Ok(vec![DevicePort::bare("/dev/ttyACM0")]),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        assert!(found.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
