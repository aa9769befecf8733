//! Kubernetes resource quantity strings

use recommender_lib::{ResourceAmount, ResourceName};

const SUFFIXES: [(&str, f64); 14] = [
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
];

/// Value of a quantity in base units: cores for CPU, bytes for memory.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return parse_number(number).map(|n| n * factor);
        }
    }
    if let Some(number) = s.strip_suffix('E') {
        return parse_number(number).map(|n| n * 1e18);
    }
    parse_number(s)
}

fn parse_number(s: &str) -> Option<f64> {
    let value: f64 = s.parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Parse a quantity of `resource` into millicores or bytes.
pub fn parse_amount(resource: ResourceName, s: &str) -> Option<ResourceAmount> {
    let value = parse_quantity(s)?;
    let scaled = match resource {
        ResourceName::Cpu => value * 1000.0,
        ResourceName::Memory => value,
    };
    Some(ResourceAmount(scaled.round() as i64))
}

/// Canonical quantity string: `250m` for CPU, plain bytes for memory.
pub fn format_amount(resource: ResourceName, amount: ResourceAmount) -> String {
    match resource {
        ResourceName::Cpu => format!("{}m", amount.0),
        ResourceName::Memory => amount.0.to_string(),
    }
}
