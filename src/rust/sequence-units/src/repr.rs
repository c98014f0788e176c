// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

/// Format a float the way Python's `repr` does.
///
/// Uses the shortest digit string that round-trips, positional notation for
/// decimal exponents in `[-4, 16)` and scientific notation with an at least
/// two-digit exponent otherwise. Integral values keep a trailing `.0`.
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let sign = if value.is_sign_negative() { "-" } else { "" };
    if value == 0.0 {
        return format!("{sign}0.0");
    }
    // `{:e}` yields the shortest round-trip mantissa, e.g. "1.25e-5".
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        let body = if exponent < 0 {
            format!("0.{}{}", "0".repeat((-exponent - 1) as usize), digits)
        } else {
            let integer_len = exponent as usize + 1;
            if digits.len() > integer_len {
                format!("{}.{}", &digits[..integer_len], &digits[integer_len..])
            } else {
                format!("{}{}.0", digits, "0".repeat(integer_len - digits.len()))
            }
        };
        format!("{sign}{body}")
    } else {
        let mantissa = if digits.len() > 1 {
            format!("{}.{}", &digits[..1], &digits[1..])
        } else {
            digits
        };
        let exponent_sign = if exponent < 0 { "-" } else { "+" };
        format!("{sign}{mantissa}e{exponent_sign}{:02}", exponent.abs())
    }
}
