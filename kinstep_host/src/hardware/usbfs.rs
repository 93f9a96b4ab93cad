// src/hardware/usbfs.rs - Linux usbfs backend for hub control
//! Enumerates devices through sysfs and issues control transfers with the
//! `USBDEVFS_CONTROL` ioctl on `/dev/bus/usb/BBB/DDD`.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::hub_ctrl::{UsbBackend, UsbDevice, UsbError, UsbHandle};

#[repr(C)]
struct UsbdevfsCtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut libc::c_void,
}

const IOC_READ_WRITE: libc::c_ulong = 3;
/// `_IOWR('U', 0, struct usbdevfs_ctrltransfer)`
const USBDEVFS_CONTROL: libc::c_ulong = (IOC_READ_WRITE << 30)
    | ((std::mem::size_of::<UsbdevfsCtrlTransfer>() as libc::c_ulong) << 16)
    | ((b'U' as libc::c_ulong) << 8);

#[derive(Debug, Clone)]
pub struct UsbfsBackend {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
}

impl Default for UsbfsBackend {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
            devfs_root: PathBuf::from("/dev/bus/usb"),
        }
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name)).ok().map(|s| s.trim().to_string())
}

impl UsbBackend for UsbfsBackend {
    type Handle = UsbfsHandle;

    fn devices(&mut self) -> Result<Vec<UsbDevice>, UsbError> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.sysfs_root)? {
            let entry = entry?;
            // Interfaces are listed as "1-1:1.0"
            if entry.file_name().to_string_lossy().contains(':') {
                continue;
            }
            let dir = entry.path();
            let (Some(class), Some(bus), Some(address)) = (
                read_attr(&dir, "bDeviceClass"),
                read_attr(&dir, "busnum"),
                read_attr(&dir, "devnum"),
            ) else {
                continue;
            };
            let (Ok(device_class), Ok(bus), Ok(address)) =
                (u8::from_str_radix(&class, 16), bus.parse(), address.parse())
            else {
                tracing::debug!(path = %dir.display(), "unparseable usb device attributes");
                continue;
            };
            devices.push(UsbDevice {
                bus,
                address,
                device_class,
            });
        }
        devices.sort_by_key(|d| (d.bus, d.address));
        Ok(devices)
    }

    fn open(&mut self, device: &UsbDevice) -> Result<UsbfsHandle, UsbError> {
        let path = self
            .devfs_root
            .join(format!("{:03}", device.bus))
            .join(format!("{:03}", device.address));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(UsbfsHandle { file })
    }
}

#[derive(Debug)]
pub struct UsbfsHandle {
    file: File,
}

impl UsbfsHandle {
    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: *mut libc::c_void,
        length: usize,
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let length = u16::try_from(length).map_err(|_| UsbError(format!("transfer of {} bytes too long", length)))?;
        let mut ctrl = UsbdevfsCtrlTransfer {
            request_type,
            request,
            value,
            index,
            length,
            timeout: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            data,
        };
        // SAFETY: `ctrl` describes a buffer of `length` bytes that outlives the call
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), USBDEVFS_CONTROL as _, &mut ctrl as *mut UsbdevfsCtrlTransfer) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(rc as usize)
    }
}

impl UsbHandle for UsbfsHandle {
    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let len = buf.len();
        self.control(request_type, request, value, index, buf.as_mut_ptr().cast(), len, timeout)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        // usbfs copies out of the buffer for host-to-device transfers
        self.control(
            request_type,
            request,
            value,
            index,
            data.as_ptr().cast_mut().cast(),
            data.len(),
            timeout,
        )
    }
}
