use regex::Regex;
use std::sync::LazyLock;

// "1.5 MB", "2kb", "1,25 GB", "512"
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([0-9]+(?:[.,][0-9]+)?)\s*([KMGT]?B)?\s*$").expect("valid size regex")
});

static SIZE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9]+(?:[.,][0-9]+)?)\s*([KMGT]?B)?").expect("valid size token regex")
});

// "Original size: 10.50 MB"
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(original|compressed|deduplicated) size:\s*(.+?)\s*$")
        .expect("valid label regex")
});

// "This archive:   10.50 MB   4.20 MB   1.10 MB"
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*this archive:\s*(.+?)\s*$").expect("valid table regex")
});

/// Sizes reported by `create --stats`. Each field is `None` when the tool's
/// output did not contain a parseable value for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub original_size: Option<u64>,
    pub compressed_size: Option<u64>,
    pub deduplicated_size: Option<u64>,
}

/// Converts a human-readable size to bytes. Units are case-insensitive powers
/// of 1024; a bare number is bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text)?;
    to_bytes(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
}

fn to_bytes(number: &str, unit: Option<&str>) -> Option<u64> {
    let value: f64 = number.replace(',', ".").parse().ok()?;
    let exponent = match unit.map(|u| u.to_ascii_uppercase()).as_deref() {
        None | Some("B") => 0,
        Some("KB") => 1,
        Some("MB") => 2,
        Some("GB") => 3,
        Some("TB") => 4,
        Some(_) => return None,
    };
    let bytes = (value * 1024f64.powi(exponent)).round();
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

/// Extracts archive sizes from the tool's diagnostic stream. Understands both
/// `<Label> size: <value>` lines and the `This archive:` summary row.
pub fn parse_stats(output: &str) -> BackupStats {
    let mut stats = BackupStats::default();

    for caps in LABEL_RE.captures_iter(output) {
        let size = parse_size(&caps[2]);
        match caps[1].to_ascii_lowercase().as_str() {
            "original" => stats.original_size = stats.original_size.or(size),
            "compressed" => stats.compressed_size = stats.compressed_size.or(size),
            "deduplicated" => stats.deduplicated_size = stats.deduplicated_size.or(size),
            _ => {}
        }
    }

    if let Some(row) = TABLE_RE.captures(output) {
        let sizes: Vec<Option<u64>> = SIZE_TOKEN_RE
            .captures_iter(&row[1])
            .map(|c| to_bytes(&c[1], c.get(2).map(|m| m.as_str())))
            .collect();
        if let [original, compressed, deduplicated] = sizes[..] {
            stats.original_size = stats.original_size.or(original);
            stats.compressed_size = stats.compressed_size.or(compressed);
            stats.deduplicated_size = stats.deduplicated_size.or(deduplicated);
        }
    }

    stats
}
