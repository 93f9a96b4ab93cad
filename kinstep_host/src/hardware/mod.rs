// src/hardware/mod.rs
pub mod hub_ctrl;
#[cfg(all(target_os = "linux", feature = "usbfs"))]
pub mod usbfs;

pub use hub_ctrl::{find_hubs, set_power, HubCtrlError, HubInfo, UsbBackend, UsbDevice, UsbError, UsbHandle};
