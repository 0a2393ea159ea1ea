pub fn is_truthy(value: impl AsRef<str>) -> bool {
    matches!(
        value.as_ref().trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn is_falsy(value: impl AsRef<str>) -> bool {
    matches!(
        value.as_ref().trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// First readable value among `keys`, trimmed; empty values count as unset.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

pub fn env_flag(keys: &[&str]) -> Option<bool> {
    let raw = env_first(keys)?;
    if is_truthy(&raw) {
        Some(true)
    } else if is_falsy(&raw) {
        Some(false)
    } else {
        None
    }
}

pub fn env_parse<T: std::str::FromStr>(keys: &[&str]) -> Option<T> {
    env_first(keys).and_then(|v| v.parse::<T>().ok())
}
