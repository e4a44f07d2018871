//! Text encoding of embeddings as used by pgvector and OceanBase (`[0.1,0.2,...]`).

use crate::error::{Error, Result};

/// Formats a vector as a bracketed, comma-separated literal.
///
/// Rust prints the shortest representation that parses back to the same
/// `f32`, so `parse_vector(&format_vector(v)) == v` for finite input.
#[must_use]
pub fn format_vector(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

/// Parses a bracketed vector literal.
///
/// Any malformed element is an error; nothing is skipped.
pub fn parse_vector(text: &str) -> Result<Vec<f32>> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| {
            Error::DataCorruption(format!("vector literal not bracketed: {}", preview(trimmed)))
        })?;

    if inner.trim().is_empty() {
        return Err(Error::DataCorruption("empty vector literal".to_string()));
    }

    inner
        .split(',')
        .enumerate()
        .map(|(i, part)| {
            let value: f32 = part.trim().parse().map_err(|_| {
                Error::DataCorruption(format!("invalid vector element {i}: '{}'", part.trim()))
            })?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(Error::DataCorruption(format!("non-finite vector element {i}")))
            }
        })
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(32).collect()
}
