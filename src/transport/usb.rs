//! USB transport.
//!
//! Each [`UsbDevice`] owns its libusb context, so several programmers can
//! be driven from one process.
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use super::{BulkPipe, Error, Result, VendorControl};

const CONTROL_TIMEOUT_MS: u64 = 5000;
const BULK_TIMEOUT_MS: u64 = 15000;

pub struct UsbDevice {
    handle: DeviceHandle<Context>,
    endpoint_out: u8,
    endpoint_in: u8,
}

impl UsbDevice {
    /// Open a device by VID/PID. When `vendor` or `product` is given, the
    /// device's string descriptors must match as well, so several vendors
    /// can legitimately share one VID/PID pair.
    pub fn open(
        vid: u16,
        pid: u16,
        vendor: Option<&str>,
        product: Option<&str>,
    ) -> Result<UsbDevice> {
        let context = Context::new()?;

        for device in context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != vid || desc.product_id() != pid {
                continue;
            }
            let mut handle = match device.open() {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("cannot open USB device {:?}: {}", device, e);
                    continue;
                }
            };
            if let Some(want) = vendor {
                match handle.read_manufacturer_string_ascii(&desc) {
                    Ok(s) if s == want => log::debug!("seen device from vendor >{}<", s),
                    Ok(s) => {
                        log::debug!("skipping device from vendor >{}<", s);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("cannot query manufacturer for device: {}", e);
                        continue;
                    }
                }
            }
            if let Some(want) = product {
                match handle.read_product_string_ascii(&desc) {
                    Ok(s) if s == want => log::debug!("seen product >{}<", s),
                    Ok(s) => {
                        log::debug!("skipping product >{}<", s);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("cannot query product for device: {}", e);
                        continue;
                    }
                }
            }

            handle.claim_interface(0)?;
            return Ok(UsbDevice {
                handle,
                endpoint_out: 0,
                endpoint_in: 0,
            });
        }

        Err(Error::UsbNotFound { vid, pid })
    }

    /// Open a device and select a bulk endpoint pair, verifying that the
    /// device actually exposes both.
    pub fn open_bulk(vid: u16, pid: u16, endpoint_out: u8, endpoint_in: u8) -> Result<UsbDevice> {
        let mut dev = Self::open(vid, pid, None, None)?;

        let device = dev.handle.device();
        let config = device.config_descriptor(0)?;
        let mut out_found = false;
        let mut in_found = false;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.address() == endpoint_out {
                        out_found = true;
                    }
                    if endpoint.address() == endpoint_in {
                        in_found = true;
                    }
                }
            }
        }
        if !(out_found && in_found) {
            return Err(Error::Open {
                port: format!("usb {:04x}:{:04x}", vid, pid),
                reason: "bulk endpoints not found".to_string(),
            });
        }

        dev.endpoint_out = endpoint_out;
        dev.endpoint_in = endpoint_in;
        Ok(dev)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

impl VendorControl for UsbDevice {
    fn control_in(&mut self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let n = self.handle.read_control(
            request_type,
            request,
            value,
            index,
            buf,
            Duration::from_millis(CONTROL_TIMEOUT_MS),
        )?;
        Ok(n)
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, buf: &[u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let n = self.handle.write_control(
            request_type,
            request,
            value,
            index,
            buf,
            Duration::from_millis(CONTROL_TIMEOUT_MS),
        )?;
        Ok(n)
    }
}

impl BulkPipe for UsbDevice {
    fn write_bulk(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.handle.write_bulk(
            self.endpoint_out,
            buf,
            Duration::from_millis(BULK_TIMEOUT_MS),
        )?;
        Ok(n)
    }

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.handle.read_bulk(
            self.endpoint_in,
            buf,
            Duration::from_millis(BULK_TIMEOUT_MS),
        )?;
        Ok(n)
    }
}
