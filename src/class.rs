//! The interface between the engine and a USB class

use crate::{
    descriptor::{self, DeviceDescriptor},
    driver::Bus,
    setup::SetupPacket,
};
use usb_device::endpoint::EndpointType;

/// A class's answer to a control request
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Response {
    /// The request was handled
    ///
    /// For a device-to-host request, the class should have answered with
    /// [`Bus::reply`] or [`Bus::transmit`] on endpoint 0. If it didn't, the host
    /// receives an empty data stage.
    Accept,
    /// Not now; the host is told to retry
    Busy,
    /// The request is unsupported, or its data is invalid; the host sees a STALL
    Reject,
}

/// Declares one endpoint's buffers and transfer type
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointConfig {
    /// Endpoint number, 1 through 7
    pub number: u8,
    /// Receive (OUT) buffer size; 0 if the endpoint doesn't receive
    pub rx_capacity: u16,
    /// Transmit (IN) buffer size and packet size; 0 if the endpoint doesn't
    /// transmit
    pub tx_capacity: u16,
    pub kind: EndpointType,
}

/// A USB device class
///
/// The class supplies descriptors and handles class-specific traffic. It never
/// deals with packets or endpoint registers; it moves data through the [`Bus`]
/// handed to its callbacks. All callbacks run in interrupt context, and must
/// not block.
///
/// `'a` is the lifetime of memory that the class lends to the engine:
/// descriptors, and the data of [`Bus::transmit`].
pub trait Class<'a> {
    fn device_descriptor(&self) -> DeviceDescriptor;

    /// The complete configuration descriptor, with all interface, endpoint, and
    /// class-specific descriptors
    ///
    /// See [`compose`](crate::compose) for a way to build one.
    fn configuration_descriptor(&self) -> &'a [u8];

    /// Returns the string for a string descriptor index
    ///
    /// Index 0 never reaches the class; the engine answers with its supported
    /// languages.
    fn string(&self, index: u8, language: u16) -> Option<&str> {
        let _ = (index, language);
        None
    }

    /// The OS descriptor, served for `GET_DESCRIPTOR(BOS)` requests
    fn os_descriptor(&self) -> Option<&'a [u8]> {
        None
    }

    /// Endpoints used by this class
    ///
    /// The engine declares them after every bus reset. Endpoint 0 is managed by
    /// the engine, and must not be included.
    fn endpoints(&self) -> &[EndpointConfig] {
        &[]
    }

    /// The number of interfaces in the configuration
    fn interface_count(&self) -> u8 {
        self.configuration_descriptor()
            .get(descriptor::NUM_INTERFACES)
            .copied()
            .unwrap_or(0)
    }

    /// Handles a class or vendor request, or a standard interface request that
    /// the engine doesn't know
    ///
    /// `data` holds the host's data stage for host-to-device requests.
    fn control_request(
        &mut self,
        bus: &mut Bus<'a>,
        setup: &SetupPacket,
        data: &[u8],
    ) -> Response {
        let _ = (bus, setup, data);
        Response::Reject
    }

    /// Called after `SET_INTERFACE` selects `alternate` for `interface`
    fn alternate_setting_changed(&mut self, bus: &mut Bus<'a>, interface: u8, alternate: u8) {
        let _ = (bus, interface, alternate);
    }

    /// Called when `endpoint` received `len` bytes
    ///
    /// Use [`Bus::fetch`] to read the data. The endpoint accepts its next
    /// packet once this call returns.
    fn endpoint_received(&mut self, bus: &mut Bus<'a>, endpoint: u8, len: usize) {
        let _ = (bus, endpoint, len);
    }

    /// Called once the host acknowledged the last packet of a `len` byte
    /// transfer on `endpoint`
    fn endpoint_transmitted(&mut self, bus: &mut Bus<'a>, endpoint: u8, len: usize) {
        let _ = (bus, endpoint, len);
    }

    /// Called when the bus goes idle
    fn suspend(&mut self) {}

    /// Called when the bus resumes from suspend
    fn resume(&mut self) {}
}

/// Whether the configuration descriptor reports a self-powered device
pub(crate) fn self_powered(configuration: &[u8]) -> bool {
    configuration
        .get(descriptor::ATTRIBUTES)
        .map_or(false, |attributes| attributes & descriptor::SELF_POWERED != 0)
}

/// The `bConfigurationValue` of the configuration descriptor
pub(crate) fn configuration_value(configuration: &[u8]) -> u8 {
    configuration
        .get(descriptor::CONFIGURATION_VALUE)
        .copied()
        .unwrap_or(1)
}
