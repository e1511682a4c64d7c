//! USB transport boundary.
//!
//! The camera needs two things from the host USB stack: vendor control
//! transfers for the command protocol, and batched isochronous IN transfers
//! for the two frame endpoints. Both are traits so the pipeline can run
//! against any stack (and against mocks in tests).
//!
//! [`NusbControl`] implements the control half over `nusb`. `nusb` does not
//! expose isochronous transfers, so [`IsochronousTransport`] is supplied by
//! the host integration.

use crate::constants::{CAMERA_CONTROL_REQUEST, CAMERA_INTERFACE, CONTROL_TRANSFER_TIMEOUT, PID_CAMERA, VID};
use crate::error::CamError;
use bytes::{Bytes, BytesMut};
use nusb::Interface;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use std::future::Future;
use tokio::time::timeout;
use tracing::{info, trace, warn};

/// Setup fields of a vendor, device-recipient control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// The request every camera command and reply travels on
    pub const CAMERA: ControlRequest = ControlRequest {
        request: CAMERA_CONTROL_REQUEST,
        value: 0,
        index: 0,
    };
}

/// Request/response control-transfer primitive.
pub trait ControlTransport: Send + Sync + 'static {
    /// Host-to-device transfer, returning the number of bytes written.
    fn write_control(
        &self,
        request: ControlRequest,
        data: Bytes,
    ) -> impl Future<Output = Result<usize, CamError>> + Send;

    /// Device-to-host transfer of at most `length` bytes.
    fn read_control(
        &self,
        request: ControlRequest,
        length: u16,
    ) -> impl Future<Output = Result<Vec<u8>, CamError>> + Send;
}

/// Completion status of one packet within an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoStatus {
    Ok,
    Stall,
    Babble,
    Error,
}

/// Where one packet's data sits inside the transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub status: IsoStatus,
    pub offset: usize,
    pub length: usize,
}

/// Shape of an isochronous request: packet count and per-packet byte budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoBatch {
    pub packets: usize,
    pub packet_size: usize,
}

/// A completed isochronous IN transfer. Every packet carries its own status;
/// a failed packet does not fail the transfer.
#[derive(Debug, Clone, Default)]
pub struct IsoTransfer {
    data: Bytes,
    packets: Vec<IsoPacketDescriptor>,
}

impl IsoTransfer {
    pub fn new(data: Bytes, packets: Vec<IsoPacketDescriptor>) -> Self {
        Self { data, packets }
    }

    /// Build a transfer from individual packets, laid out back to back.
    pub fn from_packets<I>(packets: I) -> Self
    where
        I: IntoIterator<Item = (IsoStatus, Vec<u8>)>,
    {
        let mut data = BytesMut::new();
        let mut descriptors = Vec::new();
        for (status, bytes) in packets {
            descriptors.push(IsoPacketDescriptor {
                status,
                offset: data.len(),
                length: bytes.len(),
            });
            data.extend_from_slice(&bytes);
        }
        Self {
            data: data.freeze(),
            packets: descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Status and data of every packet. A descriptor pointing outside the
    /// buffer is reported as an errored, empty packet.
    pub fn packets(&self) -> impl Iterator<Item = (IsoStatus, &[u8])> + '_ {
        self.packets.iter().map(|d| match self.data.get(d.offset..d.offset + d.length) {
            Some(slice) => (d.status, slice),
            None => (IsoStatus::Error, &[][..]),
        })
    }
}

/// Batched isochronous IN primitive plus the interface management it needs.
pub trait IsochronousTransport: Send + Sync + 'static {
    fn claim_interface(&self, interface: u8) -> impl Future<Output = Result<(), CamError>> + Send;

    fn release_interface(&self, interface: u8) -> impl Future<Output = Result<(), CamError>> + Send;

    fn set_alt_setting(&self, interface: u8, alt_setting: u8) -> impl Future<Output = Result<(), CamError>> + Send;

    fn read_isochronous(
        &self,
        endpoint: u8,
        batch: IsoBatch,
    ) -> impl Future<Output = Result<IsoTransfer, CamError>> + Send;
}

/// Camera control transfers over a claimed `nusb` interface.
#[derive(Clone)]
pub struct NusbControl {
    interface: Interface,
}

impl NusbControl {
    /// Find the camera, reset it and claim the camera interface
    pub async fn open() -> Result<Self, CamError> {
        info!("Searching for Kinect camera...");
        let device_info = nusb::list_devices()?
            .find(|d| d.vendor_id() == VID && d.product_id() == PID_CAMERA)
            .ok_or(CamError::DeviceNotFound)?;

        info!(
            bus = device_info.bus_number(),
            addr = device_info.device_address(),
            serial = device_info.serial_number().unwrap_or("<none>"),
            "Found camera"
        );

        let device = device_info.open()?;
        info!("Performing USB device reset...");
        if let Err(e) = device.reset() {
            // Some hosts refuse the reset right after enumeration; the camera still works
            warn!("USB reset failed: {}", e);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let interface = device.detach_and_claim_interface(CAMERA_INTERFACE)?;
        info!("Interface claimed successfully.");

        Ok(Self { interface })
    }

    pub fn from_interface(interface: Interface) -> Self {
        Self { interface }
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }
}

impl ControlTransport for NusbControl {
    async fn write_control(&self, request: ControlRequest, data: Bytes) -> Result<usize, CamError> {
        trace!(bytes = hex::encode(&data), "Control write");
        let transfer = self.interface.control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: request.request,
            value: request.value,
            index: request.index,
            data: &data,
        });
        let completion = timeout(CONTROL_TRANSFER_TIMEOUT, transfer).await?;
        let written = completion.into_result()?;
        Ok(written.actual_length())
    }

    async fn read_control(&self, request: ControlRequest, length: u16) -> Result<Vec<u8>, CamError> {
        let transfer = self.interface.control_in(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: request.request,
            value: request.value,
            index: request.index,
            length,
        });
        let completion = timeout(CONTROL_TRANSFER_TIMEOUT, transfer).await?;
        let data = completion.into_result()?;
        trace!(bytes = hex::encode(&data), "Control read");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_from_packets_keeps_order_and_status() {
        let transfer = IsoTransfer::from_packets([
            (IsoStatus::Ok, vec![1, 2, 3]),
            (IsoStatus::Babble, vec![]),
            (IsoStatus::Ok, vec![4]),
        ]);
        let packets: Vec<_> = transfer.packets().collect();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0], (IsoStatus::Ok, &[1u8, 2, 3][..]));
        assert_eq!(packets[1], (IsoStatus::Babble, &[][..]));
        assert_eq!(packets[2], (IsoStatus::Ok, &[4u8][..]));
    }

    #[test]
    fn test_out_of_range_descriptor_is_an_error_packet() {
        let transfer = IsoTransfer::new(
            Bytes::from_static(&[0u8; 4]),
            vec![IsoPacketDescriptor {
                status: IsoStatus::Ok,
                offset: 2,
                length: 10,
            }],
        );
        let packets: Vec<_> = transfer.packets().collect();
        assert_eq!(packets, vec![(IsoStatus::Error, &[][..])]);
    }
}
