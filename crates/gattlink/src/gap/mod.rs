//! GAP: addressing, advertising data and device discovery

pub mod advertising;
pub mod constants;
pub mod scanner;
pub mod types;


pub use advertising::parse_advertising_data;
pub use constants::*;
pub use scanner::{ScanConfig, Scanner};
pub use types::*;
