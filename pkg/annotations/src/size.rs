//! Byte-size grammars accepted by the proxy.

/// `^[0-9]+[kKmM]?$`, used for buffer sizes.
pub fn is_valid_size(value: &str) -> bool {
    matches_size(value, &['k', 'K', 'm', 'M'])
}

/// `^[0-9]+[kKmMgG]?$`, used for offsets and body sizes.
pub fn is_valid_offset(value: &str) -> bool {
    matches_size(value, &['k', 'K', 'm', 'M', 'g', 'G'])
}

fn matches_size(value: &str, units: &[char]) -> bool {
    let digits = match value.char_indices().last() {
        Some((i, c)) if units.contains(&c) => &value[..i],
        Some(_) => value,
        None => return false,
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
