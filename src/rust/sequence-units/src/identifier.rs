// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

/// Turn an arbitrary name into a valid Python identifier.
///
/// Every character that cannot appear in an identifier becomes `_`, and a
/// leading digit is prefixed with `_`.
pub fn text_to_identifier(text: &str) -> String {
    let mut identifier: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if identifier.is_empty() || identifier.starts_with(|c: char| c.is_ascii_digit()) {
        identifier.insert(0, '_');
    }
    identifier
}
