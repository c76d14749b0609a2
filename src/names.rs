//! Conversion between the two names every method carries.
//!
//! A method is addressed by its PascalCase protocol name in the URL and
//! descriptor (`SayHello`) and by its snake_case handler key in the
//! service implementation (`say_hello`). Both keys are kept throughout
//! request processing; these conversions bridge them.

/// Convert a snake_case handler key to its PascalCase protocol name.
///
/// Splits on `_`, capitalizes each word, and concatenates.
pub fn snake_to_pascal(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Convert a PascalCase protocol name to its snake_case handler key.
///
/// Inserts `_` before each uppercase letter except the first and
/// lowercases the result. The conversion is lossy for names with
/// consecutive uppercase letters: `GetHTTP` becomes `get_h_t_t_p`, which
/// converts back to `GetHTTP` but is not the key most implementations
/// would choose. `pascal(snake(p)) == p` therefore holds only for names
/// without consecutive uppercase letters.
pub fn pascal_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);

    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}
