//! Log formatting utilities

/// Format bytes in human-readable format (KB, MB, GB)
#[inline]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// First 8 hex digits of a UUID, enough to tell connections apart in logs
#[inline]
pub fn short_id(uuid: &uuid::Uuid) -> String {
    let mut buf = uuid::Uuid::encode_buffer();
    uuid.simple().encode_lower(&mut buf)[..8].to_owned()
}

/// Quote a value for use in a SET statement
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}
