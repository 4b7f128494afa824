use crate::config::settings::ChannelConfig;
use crate::drivers::inkjet::{InkjetDriver, InkjetSettings};
use crate::drivers::modbus::{ModbusDriver, ModbusSettings};
use crate::drivers::s7::{S7Driver, S7Settings};
use crate::drivers::simulation::{SimulationDriver, SimulationSettings};
use crate::drivers::traits::DeviceDriver;
use crate::error::GatewayResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Protocol selected by a channel's `driver_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverType {
    Simulation,
    ModbusTcp,
    SiemensS7,
    WsdomInkjet,
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverType::Simulation => "simulation",
            DriverType::ModbusTcp => "modbus_tcp",
            DriverType::SiemensS7 => "siemens_s7",
            DriverType::WsdomInkjet => "wsdom_inkjet",
        };
        f.write_str(s)
    }
}

/// Build the driver for a channel from its settings blob. Nothing is
/// connected here; the channel connects on its first tick.
pub fn create_driver(config: &ChannelConfig) -> GatewayResult<Arc<dyn DeviceDriver>> {
    let driver: Arc<dyn DeviceDriver> = match config.driver_type {
        DriverType::Simulation => {
            Arc::new(SimulationDriver::new(config.driver_settings::<SimulationSettings>()?))
        }
        DriverType::ModbusTcp => Arc::new(ModbusDriver::new(config.driver_settings::<ModbusSettings>()?)),
        DriverType::SiemensS7 => Arc::new(S7Driver::new(config.driver_settings::<S7Settings>()?)),
        DriverType::WsdomInkjet => {
            Arc::new(InkjetDriver::new(config.driver_settings::<InkjetSettings>()?))
        }
    };
    Ok(driver)
}
