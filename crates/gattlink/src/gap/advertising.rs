//! Advertising data parsing
//!
//! This module splits raw advertising payloads into their AD structures and
//! pulls out the fields the scanner reports.

use super::constants::*;

/// Parse advertising data into its AD structures
///
/// # Arguments
///
/// * `data` - The advertisement data
///
/// # Returns
///
/// A vector of (type, data) tuples. Parsing stops at the first zero-length
/// or truncated structure.
pub fn parse_advertising_data(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut result = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let length = data[i] as usize;
        if length == 0 || i + 1 + length > data.len() {
            break;
        }

        let ad_type = data[i + 1];
        let ad_data = data[i + 2..i + 1 + length].to_vec();

        result.push((ad_type, ad_data));

        i += 1 + length;
    }

    result
}

/// Local name, preferring the complete name over the shortened one
pub fn local_name(structures: &[(u8, Vec<u8>)]) -> Option<String> {
    let find = |wanted: u8| {
        structures
            .iter()
            .find(|(ad_type, value)| *ad_type == wanted && !value.is_empty())
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
    };
    find(ADV_TYPE_COMPLETE_LOCAL_NAME).or_else(|| find(ADV_TYPE_SHORT_LOCAL_NAME))
}

pub fn manufacturer_data(structures: &[(u8, Vec<u8>)]) -> Option<Vec<u8>> {
    structures
        .iter()
        .find(|(ad_type, _)| *ad_type == ADV_TYPE_MANUFACTURER_SPECIFIC)
        .map(|(_, value)| value.clone())
}
