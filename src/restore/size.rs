/// Converts a guest disk size such as `8G` or `2T` to whole GiB.
/// Only integral values with a `G`, `T`, `P` or `E` suffix convert;
/// anything else yields `None`.
pub fn convert_to_gib(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    if digits_end == 0 {
        return None;
    }
    let amount: u64 = value[..digits_end].parse().ok()?;
    let factor: u64 = match value[digits_end..].trim() {
        "G" => 1,
        "T" => 1024,
        "P" => 1024 * 1024,
        "E" => 1024 * 1024 * 1024,
        _ => return None,
    };
    amount.checked_mul(factor)
}

/// Value of the `size=` option among disk options.
pub fn size_option(options: &[String]) -> Option<&str> {
    options
        .iter()
        .find_map(|option| option.trim().strip_prefix("size="))
}
