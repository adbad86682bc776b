/// Folds a product name into its aggregation key: trimmed, internal
/// whitespace collapsed to single spaces, lowercased.
pub fn normalize_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strips formatting from a fiscal transaction code so that "5.102" and
/// " 5102 " compare equal.
pub fn normalize_transaction_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '.' && !c.is_whitespace())
        .collect()
}

/// Replaces punctuation in an extracted product name with spaces and
/// collapses the result. Letters (accented included), digits, `-`, `.` and
/// `_` survive.
pub fn clean_product_name(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                ' '
            }
        })
        .collect();

    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses a quantity or monetary cell.
///
/// Accepts plain decimals (`1234.5`), thousands-separated values
/// (`1,234.5`) and the comma-decimal notation used in Brazilian fiscal
/// exports (`1.234,5`, `12,5`). Returns `None` for empty or non-numeric
/// cells and for non-finite results.
pub fn parse_number(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    let normalized = match (compact.rfind(','), compact.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(_), None) => compact.replace(',', "."),
        _ => compact,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Renders a quantity for observations: whole numbers without decimals,
/// everything else with up to three.
pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        let s = format!("{:.3}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
