//! Brazilian-real formatting for amounts kept as integer cents.

use chrono::NaiveDate;

/// Renders cents as `1.234,56` (pt-BR separators, always two decimals).
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let whole = group_thousands(abs / 100);
    let frac = abs % 100;
    format!("{sign}{whole},{frac:02}")
}

pub fn format_brl(cents: i64) -> String {
    format!("R$ {}", format_cents(cents))
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    out
}

/// Live formatting of the amount field: every digit typed so far is read as
/// a number of cents. Non-digits are dropped, so feeding an already formatted
/// value back in returns it unchanged.
pub fn format_currency_input(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return String::new();
    }
    match digits.parse::<i64>() {
        Ok(cents) => format_cents(cents),
        Err(_) => String::new(),
    }
}

/// Inverse of [`format_cents`]. Dots are thousands separators and the comma
/// is the decimal mark; a leading `R$` is ignored. Returns `None` for empty,
/// negative or malformed input.
pub fn parse_currency(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("R$").unwrap_or(trimmed).trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
        return None;
    }

    let cleaned = trimmed.replace('.', "");
    let mut parts = cleaned.split(',');
    let whole_str = parts.next()?;
    let frac_str = parts.next();
    if parts.next().is_some() {
        return None;
    }
    if whole_str.is_empty() && frac_str.is_none() {
        return None;
    }
    let whole: i64 = if whole_str.is_empty() {
        0
    } else {
        if !whole_str.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        whole_str.parse().ok()?
    };
    let frac = match frac_str {
        None => 0,
        Some(frac) => {
            if frac.is_empty() || frac.len() > 2 || !frac.chars().all(|ch| ch.is_ascii_digit()) {
                return None;
            }
            let mut padded = frac.to_string();
            while padded.len() < 2 {
                padded.push('0');
            }
            padded.parse::<i64>().ok()?
        }
    };
    whole.checked_mul(100)?.checked_add(frac)
}

/// `dd/mm/yyyy`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

pub fn format_installments(current: i64, total: i64) -> String {
    if current <= 0 || total <= 0 {
        return "-".to_string();
    }
    format!("{current}/{total}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn formats_with_brazilian_separators() {
        assert_eq!(format_cents(0), "0,00");
        assert_eq!(format_cents(5), "0,05");
        assert_eq!(format_cents(3550), "35,50");
        assert_eq!(format_cents(123_456), "1.234,56");
        assert_eq!(format_cents(100_000_000), "1.000.000,00");
        assert_eq!(format_cents(-1999), "-19,99");
        assert_eq!(format_brl(3550), "R$ 35,50");
    }

    #[test]
    fn live_input_reads_digits_as_cents() {
        assert_eq!(format_currency_input(""), "");
        assert_eq!(format_currency_input("abc"), "");
        assert_eq!(format_currency_input("3"), "0,03");
        assert_eq!(format_currency_input("3550"), "35,50");
        assert_eq!(format_currency_input("35,50"), "35,50");
        assert_eq!(format_currency_input("1.234,567"), "12.345,67");
    }

    #[test]
    fn parses_rendered_amounts() {
        assert_eq!(parse_currency("35,50"), Some(3550));
        assert_eq!(parse_currency("R$ 1.234,56"), Some(123_456));
        assert_eq!(parse_currency("10"), Some(1000));
        assert_eq!(parse_currency("0,5"), Some(50));
        assert_eq!(parse_currency(",99"), Some(99));
        assert_eq!(parse_currency(""), None);
        assert_eq!(parse_currency("-3,00"), None);
        assert_eq!(parse_currency("1,2,3"), None);
        assert_eq!(parse_currency("12,345"), None);
        assert_eq!(parse_currency("dez"), None);
    }

    #[test]
    fn formats_dates_and_installments() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 12).unwrap();
        assert_eq!(format_date(date), "12/06/2025");
        assert_eq!(format_installments(2, 5), "2/5");
        assert_eq!(format_installments(0, 5), "-");
    }

    proptest! {
        #[test]
        fn parse_inverts_format(cents in 0i64..1_000_000_000_000) {
            prop_assert_eq!(parse_currency(&format_cents(cents)), Some(cents));
        }

        #[test]
        fn live_formatting_is_idempotent(cents in 0i64..1_000_000_000_000) {
            let once = format_currency_input(&cents.to_string());
            let twice = format_currency_input(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(parse_currency(&twice), Some(cents));
        }
    }
}
