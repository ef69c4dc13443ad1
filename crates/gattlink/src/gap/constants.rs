// Advertising event types reported alongside each sighting
pub const ADV_IND: u8 = 0x00;
pub const ADV_DIRECT_IND: u8 = 0x01;
pub const ADV_SCAN_IND: u8 = 0x02;
pub const ADV_NONCONN_IND: u8 = 0x03;
pub const SCAN_RSP: u8 = 0x04;

// Advertising Data Types
pub const ADV_TYPE_FLAGS: u8 = 0x01;
pub const ADV_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
pub const ADV_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const ADV_TYPE_TX_POWER_LEVEL: u8 = 0x0A;
pub const ADV_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;
