//! Port dispatch for the emulated machine.

/// A peripheral answering a range of I/O ports.
pub trait PortDevice {
    /// Whether `port` belongs to this device.
    fn handles(&self, port: u8) -> bool;

    /// `OUT port, value`.
    fn output(&mut self, port: u8, value: u8);

    /// `IN port`.
    fn input(&mut self, port: u8) -> u8;
}

/// Routes port accesses to the first device claiming the port.
///
/// Unclaimed writes are dropped and unclaimed reads return 0, as on the
/// real bus.
#[derive(Default)]
pub struct PortBus {
    devices: Vec<Box<dyn PortDevice + Send>>,
}

impl PortBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach<D>(&mut self, device: D)
    where
        D: PortDevice + Send + 'static,
    {
        self.devices.push(Box::new(device));
    }

    pub fn output(&mut self, port: u8, value: u8) {
        match self.device(port) {
            Some(d) => d.output(port, value),
            None => trace!("OUT {} unclaimed", port),
        }
    }

    pub fn input(&mut self, port: u8) -> u8 {
        match self.device(port) {
            Some(d) => d.input(port),
            None => {
                trace!("IN {} unclaimed", port);
                0
            }
        }
    }

    fn device(&mut self, port: u8) -> Option<&mut (dyn PortDevice + Send + 'static)> {
        self.devices
            .iter_mut()
            .find(|d| d.handles(port))
            .map(|d| d.as_mut())
    }
}
