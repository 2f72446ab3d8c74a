pub mod battery;
pub mod saving_sessions;
pub mod solar;
pub mod tariff;

pub use battery::BatteryClient;
pub use saving_sessions::SavingSessionClient;
pub use solar::{PanelArray, SolarClient};
pub use tariff::TariffClient;
