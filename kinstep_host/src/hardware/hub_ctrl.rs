// src/hardware/hub_ctrl.rs - USB hub port power control
//! Switch power on a single port of a USB hub that supports per-port power
//! switching. Hubs are enumerated fresh on every call and numbered in
//! enumeration order.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub const USB_CLASS_HUB: u8 = 0x09;
/// Device-to-host, class request, device recipient
pub const USB_RT_HUB_IN: u8 = 0xA0;
/// Host-to-device, class request, other (port) recipient
pub const USB_RT_PORT: u8 = 0x23;
pub const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQ_SET_FEATURE: u8 = 0x03;
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_DT_HUB: u16 = 0x29;
pub const USB_PORT_FEAT_POWER: u16 = 8;

const HUB_CHAR_LPSM: u8 = 0x03;
const HUB_CHAR_PORTIND: u8 = 0x80;
/// bLength, bDescriptorType, bNbrPorts, wHubCharacteristics, bPwrOn2PwrGood, bHubContrCurrent
const HUB_DESCRIPTOR_HEADER: usize = 7;
const CTRL_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct UsbError(pub String);

impl From<std::io::Error> for UsbError {
    fn from(e: std::io::Error) -> Self {
        UsbError(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubCtrlError {
    #[error("Failed to access USB: {0}")]
    Enumeration(UsbError),
    #[error("Hub {hub} not found ({found} hubs with port power control)")]
    HubNotFound { hub: usize, found: usize },
    #[error("Hub {hub} has no port {port} ({nport} ports)")]
    InvalidPort { hub: usize, port: u16, nport: u8 },
    #[error("Failed to open device: {0}")]
    FailedToOpenDevice(UsbError),
    #[error("Failed to control usb hub: {0}")]
    FailedToControl(UsbError),
}

impl HubCtrlError {
    /// Numeric status reported to callers that only understand codes.
    pub fn code(&self) -> i32 {
        match self {
            HubCtrlError::Enumeration(_) | HubCtrlError::HubNotFound { .. } | HubCtrlError::InvalidPort { .. } => 1,
            HubCtrlError::FailedToOpenDevice(_) => 2,
            HubCtrlError::FailedToControl(_) => 3,
        }
    }
}

/// A device as seen during bus enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    pub bus: u16,
    pub address: u16,
    pub device_class: u8,
}

pub trait UsbHandle {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;
}

/// Access to the host's USB stack. Handles close when dropped.
pub trait UsbBackend {
    type Handle: UsbHandle;

    fn devices(&mut self) -> Result<Vec<UsbDevice>, UsbError>;
    fn open(&mut self, device: &UsbDevice) -> Result<Self::Handle, UsbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubInfo {
    pub device: UsbDevice,
    pub nport: u8,
    pub indicator_support: bool,
}

/// Hubs that can switch port power (or drive port indicators).
pub fn find_hubs<B: UsbBackend>(backend: &mut B) -> Result<Vec<HubInfo>, HubCtrlError> {
    let devices = backend.devices().map_err(HubCtrlError::Enumeration)?;
    let mut hubs = Vec::new();
    for device in devices.iter().filter(|d| d.device_class == USB_CLASS_HUB) {
        let mut handle = match backend.open(device) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(bus = device.bus, address = device.address, "skipping hub: {}", e);
                continue;
            }
        };
        let mut buf = [0u8; 1024];
        let len = handle.read_control(
            USB_RT_HUB_IN,
            USB_REQ_GET_DESCRIPTOR,
            USB_DT_HUB << 8,
            0,
            &mut buf,
            CTRL_TIMEOUT,
        );
        match len {
            Ok(n) if n > HUB_DESCRIPTOR_HEADER => {}
            _ => {
                tracing::warn!(bus = device.bus, address = device.address, "Can't get hub descriptor");
                continue;
            }
        }
        let characteristics = buf[3];
        if characteristics & HUB_CHAR_PORTIND == 0 && characteristics & HUB_CHAR_LPSM >= 2 {
            continue;
        }
        hubs.push(HubInfo {
            device: *device,
            nport: buf[2],
            indicator_support: characteristics & HUB_CHAR_PORTIND != 0,
        });
    }
    Ok(hubs)
}

/// Turn power on or off for `port` (1-based) of the `hub`-th controllable hub.
pub fn set_power<B: UsbBackend>(backend: &mut B, hub: usize, port: u16, on: bool) -> Result<(), HubCtrlError> {
    let hubs = find_hubs(backend)?;
    let info = hubs.get(hub).ok_or(HubCtrlError::HubNotFound {
        hub,
        found: hubs.len(),
    })?;
    if port == 0 || port > u16::from(info.nport) {
        return Err(HubCtrlError::InvalidPort {
            hub,
            port,
            nport: info.nport,
        });
    }
    let mut handle = backend
        .open(&info.device)
        .map_err(HubCtrlError::FailedToOpenDevice)?;
    let request = if on { USB_REQ_SET_FEATURE } else { USB_REQ_CLEAR_FEATURE };
    handle
        .write_control(USB_RT_PORT, request, USB_PORT_FEAT_POWER, port, &[], CTRL_TIMEOUT)
        .map_err(HubCtrlError::FailedToControl)?;
    tracing::info!(hub, port, on, "hub port power set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Writes = Rc<RefCell<Vec<(u8, u8, u16, u16)>>>;

    struct MockHub {
        device: UsbDevice,
        descriptor: Option<Vec<u8>>,
        openable: bool,
        control_ok: bool,
    }

    #[derive(Default)]
    struct MockBackend {
        hubs: Vec<MockHub>,
        writes: Writes,
        opens: usize,
        fail_open_after: Option<usize>,
    }

    struct MockHandle {
        descriptor: Option<Vec<u8>>,
        control_ok: bool,
        writes: Writes,
    }

    impl UsbHandle for MockHandle {
        fn read_control(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            _index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, UsbError> {
            assert_eq!((request_type, request, value), (0xA0, 6, 0x2900));
            let d = self.descriptor.as_ref().ok_or(UsbError("pipe".to_string()))?;
            buf[..d.len()].copy_from_slice(d);
            Ok(d.len())
        }

        fn write_control(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            _data: &[u8],
            timeout: Duration,
        ) -> Result<usize, UsbError> {
            assert_eq!(timeout, Duration::from_millis(1000));
            if !self.control_ok {
                return Err(UsbError("stall".to_string()));
            }
            self.writes.borrow_mut().push((request_type, request, value, index));
            Ok(0)
        }
    }

    impl UsbBackend for MockBackend {
        type Handle = MockHandle;

        fn devices(&mut self) -> Result<Vec<UsbDevice>, UsbError> {
            let mut devices: Vec<UsbDevice> = self.hubs.iter().map(|h| h.device).collect();
            devices.push(UsbDevice {
                bus: 1,
                address: 99,
                device_class: 0xFF,
            });
            Ok(devices)
        }

        fn open(&mut self, device: &UsbDevice) -> Result<MockHandle, UsbError> {
            self.opens += 1;
            if self.fail_open_after.is_some_and(|n| self.opens > n) {
                return Err(UsbError("busy".to_string()));
            }
            let hub = self
                .hubs
                .iter()
                .find(|h| h.device == *device)
                .ok_or(UsbError("no device".to_string()))?;
            if !hub.openable {
                return Err(UsbError("access denied".to_string()));
            }
            Ok(MockHandle {
                descriptor: hub.descriptor.clone(),
                control_ok: hub.control_ok,
                writes: self.writes.clone(),
            })
        }
    }

    fn hub(address: u16, characteristics: u8, nport: u8) -> MockHub {
        MockHub {
            device: UsbDevice {
                bus: 1,
                address,
                device_class: USB_CLASS_HUB,
            },
            descriptor: Some(vec![9, 0x29, nport, characteristics, 0, 50, 0, 0, 0xFF]),
            openable: true,
            control_ok: true,
        }
    }

    #[test]
    fn lists_only_hubs_with_power_switching() {
        let mut backend = MockBackend {
            hubs: vec![
                hub(2, 0x01, 4),
                hub(3, 0x02, 4),
                hub(4, 0x82, 7),
                MockHub {
                    descriptor: None,
                    ..hub(5, 0x01, 4)
                },
            ],
            ..MockBackend::default()
        };
        let hubs = find_hubs(&mut backend).unwrap();
        assert_eq!(hubs.len(), 2);
        assert_eq!(hubs[0].device.address, 2);
        assert!(!hubs[0].indicator_support);
        assert_eq!(hubs[1].nport, 7);
        assert!(hubs[1].indicator_support);
    }

    #[test]
    fn set_power_sends_port_feature_request() {
        let mut backend = MockBackend {
            hubs: vec![hub(2, 0x01, 4)],
            ..MockBackend::default()
        };
        set_power(&mut backend, 0, 3, true).unwrap();
        set_power(&mut backend, 0, 3, false).unwrap();
        assert_eq!(*backend.writes.borrow(), vec![(0x23, 3, 8, 3), (0x23, 1, 8, 3)]);
    }

    #[test]
    fn reports_distinct_codes() {
        let mut backend = MockBackend {
            hubs: vec![hub(2, 0x01, 4)],
            ..MockBackend::default()
        };
        let err = set_power(&mut backend, 1, 1, true).unwrap_err();
        assert_eq!(err, HubCtrlError::HubNotFound { hub: 1, found: 1 });
        assert_eq!(err.code(), 1);
        assert_eq!(set_power(&mut backend, 0, 5, true).unwrap_err().code(), 1);

        backend.fail_open_after = Some(backend.opens + 1);
        let err = set_power(&mut backend, 0, 1, true).unwrap_err();
        assert!(matches!(err, HubCtrlError::FailedToOpenDevice(_)));
        assert_eq!(err.code(), 2);

        let mut backend = MockBackend {
            hubs: vec![MockHub {
                control_ok: false,
                ..hub(2, 0x01, 4)
            }],
            ..MockBackend::default()
        };
        assert_eq!(set_power(&mut backend, 0, 1, true).unwrap_err().code(), 3);
    }
}
