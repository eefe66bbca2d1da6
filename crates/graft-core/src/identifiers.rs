//! SQL identifier quoting utilities.

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use graft_core::quote_ident;
///
/// assert_eq!(quote_ident("orders"), "\"orders\"");
/// assert_eq!(quote_ident("order\"line"), "\"order\"\"line\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Strip one layer of backtick or double-quote delimiters.
///
/// Returns the inner text and whether the input was quoted. Doubled
/// delimiters inside a quoted name collapse to a single character.
pub fn unquote_ident(name: &str) -> (String, bool) {
    let name = name.trim();
    for delim in ['`', '"'] {
        if name.len() >= 2 && name.starts_with(delim) && name.ends_with(delim) {
            let inner = &name[1..name.len() - 1];
            let doubled: String = [delim, delim].iter().collect();
            return (inner.replace(&doubled, &delim.to_string()), true);
        }
    }
    (name.to_string(), false)
}
