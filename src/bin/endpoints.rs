use nusb::list_devices;
use nusb::transfer::EndpointType;
use tracing::{error, info, warn};

use nuicam_lib::constants::{CAMERA_INTERFACE, DEPTH_ENDPOINT, PID_CAMERA, VID, VIDEO_ENDPOINT};

/// Dump the camera's configuration, alternate settings and endpoints. The
/// isochronous endpoints only report a non-zero packet size on the
/// alternate setting that streams, which is what `alt_setting` in the
/// config file has to name.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    info!("Searching for Kinect camera (VID: {:#06x}, PID: {:#06x})...", VID, PID_CAMERA);

    let devices = match list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            error!("Error listing USB devices: {:?}", e);
            return;
        }
    };
    let Some(device_info) = devices
        .into_iter()
        .find(|d| d.vendor_id() == VID && d.product_id() == PID_CAMERA)
    else {
        warn!("Kinect camera not found.");
        return;
    };

    info!(
        "Camera found on Bus: {:03}, Address: {:03}, Speed: {:?}",
        device_info.bus_number(),
        device_info.device_address(),
        device_info.speed()
    );
    if let Some(serial) = device_info.serial_number() {
        info!("  Serial: {}", serial);
    }

    let device = match device_info.open() {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to open camera: {:?}. Check permissions (udev rules on Linux).", e);
            return;
        }
    };
    let config = match device.active_configuration() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to get active configuration: {:?}", e);
            return;
        }
    };
    info!("Active configuration: {}", config.configuration_value());

    for group in config.interfaces() {
        for setting in group.alt_settings() {
            let marker = if setting.interface_number() == CAMERA_INTERFACE {
                " (camera)"
            } else {
                ""
            };
            info!(
                "Interface {}{} alt {}: class {:#04x}, {} endpoints",
                setting.interface_number(),
                marker,
                setting.alternate_setting(),
                setting.class(),
                setting.endpoints().count()
            );
            for endpoint in setting.endpoints() {
                let address = endpoint.address();
                let transfer_type = match endpoint.transfer_type() {
                    EndpointType::Control => "Control",
                    EndpointType::Isochronous => "Isochronous",
                    EndpointType::Bulk => "Bulk",
                    EndpointType::Interrupt => "Interrupt",
                };
                let role = match address {
                    DEPTH_ENDPOINT => "depth",
                    VIDEO_ENDPOINT => "video",
                    _ => "-",
                };
                info!(
                    "  Endpoint {:#04x} [{}] {}, max packet {}, interval {}",
                    address,
                    role,
                    transfer_type,
                    endpoint.max_packet_size(),
                    endpoint.interval()
                );
            }
        }
    }
}
