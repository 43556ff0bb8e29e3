use crate::DeviceRegistry;
use log::{debug, info};
use serde::Serialize;
use sketchforge_core::{DevicePort, IdentifiedDevice};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HotplugEvent {
    Added {
        port: DevicePort,
        device: Option<IdentifiedDevice>,
    },
    Removed {
        port: DevicePort,
    },
}

/// Ports present in `current` but not `previous`, and the reverse.
pub fn diff_ports(
    previous: &[DevicePort],
    current: &[DevicePort],
) -> (Vec<DevicePort>, Vec<DevicePort>) {
    let added = current
        .iter()
        .filter(|port| !previous.iter().any(|old| old.path == port.path))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|port| !current.iter().any(|new| new.path == port.path))
        .cloned()
        .collect();
    (added, removed)
}

/// Fixed-interval port poller on its own thread. The first poll reports every
/// port already connected as `Added`.
pub struct HotplugMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    pub fn start(
        registry: Arc<DeviceRegistry>,
        interval: Duration,
        events: Sender<HotplugEvent>,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let mut known: Vec<DevicePort> = Vec::new();
            loop {
                match registry.list_ports() {
                    Ok(current) => {
                        let (added, removed) = diff_ports(&known, &current);
                        for port in removed {
                            info!("port removed: {}", port.path);
                            if events.send(HotplugEvent::Removed { port }).is_err() {
                                return;
                            }
                        }
                        for port in added {
                            let device = registry.identify(&port);
                            info!(
                                "port added: {} ({})",
                                port.path,
                                device
                                    .as_ref()
                                    .map(|d| d.board_name.as_str())
                                    .unwrap_or("unidentified")
                            );
                            if events.send(HotplugEvent::Added { port, device }).is_err() {
                                return;
                            }
                        }
                        known = current;
                    }
                    Err(err) => debug!("hotplug scan failed: {:#}", err),
                }

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
