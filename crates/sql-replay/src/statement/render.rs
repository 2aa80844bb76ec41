//! Inline captured bind values into statement text.
//!
//! Targets are driven through their simple-query paths, so captured bind
//! values are rendered as SQL literals in place of their markers. Markers
//! with an explicit position (`$2`, `:1`, `@P3`) use it; the rest consume
//! values in order of appearance. Markers without a matching value are left
//! untouched.

use super::lexer::{tokenize_with, Token};
use super::{BindValue, LiteralStyle};

/// Render `sql` with `binds` substituted for its bind markers, writing
/// literals the way a target with `style` reads them.
pub fn render_with_binds(sql: &str, binds: &[BindValue], style: LiteralStyle) -> String {
    if binds.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + binds.len() * 8);
    let mut next_sequential = 0usize;

    for token in tokenize_with(sql, style == LiteralStyle::BackslashEscapes) {
        match token {
            Token::Bind(marker) => {
                let index = match marker.position {
                    Some(pos) => pos.checked_sub(1),
                    None => {
                        let idx = next_sequential;
                        next_sequential += 1;
                        Some(idx)
                    }
                };
                match index.and_then(|i| binds.get(i)) {
                    Some(value) => out.push_str(&value.to_sql_literal_in(style)),
                    None => out.push_str(marker.text),
                }
            }
            other => out.push_str(other.text()),
        }
    }

    out
}
