use chrono::{DateTime, Utc};

/// Human-readable age of a timestamp, used in logs (e.g. "3h", "42s").
pub fn format_duration(datetime: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(datetime);

    match duration.num_seconds() {
        s if s >= 86400 => format!("{}d", s / 86400),
        s if s >= 3600 => format!("{}h", s / 3600),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Human-readable byte count, used when logging metrics (e.g. "128.4mb").
pub fn format_memory(bytes: f64) -> String {
    const UNIT: f64 = 1024.0;
    const SUFFIX: [&str; 4] = ["b", "kb", "mb", "gb"];

    if bytes <= 0.0 {
        return "0b".to_string();
    }

    let base = (bytes.log10() / UNIT.log10()).floor().min((SUFFIX.len() - 1) as f64);
    let scaled = (bytes / UNIT.powf(base) * 10.0).round() / 10.0;

    format!("{scaled}{}", SUFFIX[base as usize])
}
