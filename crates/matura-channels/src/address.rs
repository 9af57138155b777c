use anyhow::Result;

/// Suffix the channel expects on direct-message addresses.
pub const ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Normalize a phone-style address to the channel's JID format.
///
/// Accepts `+55 (11) 98765-4321`, `whatsapp:5511987654321`,
/// `5511987654321@s.whatsapp.net` and similar; produces
/// `5511987654321@s.whatsapp.net`.
pub fn normalize_address(raw: &str) -> Result<String> {
    let value = raw.trim().trim_start_matches("whatsapp:");
    let local = value.split_once('@').map_or(value, |(local, _)| local);

    let mut digits = String::with_capacity(local.len());
    for c in local.chars() {
        match c {
            '0'..='9' => digits.push(c),
            '+' | ' ' | '-' | '(' | ')' | '.' => {}
            other => anyhow::bail!("invalid character '{other}' in address: {raw}"),
        }
    }

    anyhow::ensure!(!digits.is_empty(), "address cannot be empty");
    anyhow::ensure!(
        (MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()),
        "address must have {MIN_DIGITS}-{MAX_DIGITS} digits, got {}: {raw}",
        digits.len()
    );

    Ok(format!("{digits}{ADDRESS_SUFFIX}"))
}
