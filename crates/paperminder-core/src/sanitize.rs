//! Text sanitisation for thermal printers.
//!
//! Printers only render printable ASCII plus newline, carriage return and tab.
//! Accented Latin letters are folded to their ASCII equivalents; everything
//! else is dropped (messages) or replaced with a space (names).

fn ascii_fold(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'ý' | 'ÿ' => "y",
        'ñ' => "n",
        'ç' => "c",
        'æ' => "ae",
        'ß' => "ss",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
        'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
        'Ý' => "Y",
        'Ñ' => "N",
        'Ç' => "C",
        'Æ' => "AE",
        _ => return None,
    };
    Some(folded)
}

const fn is_printable(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\t' | ' '..='~')
}

fn sanitize_with(text: &str, replacement: Option<char>) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\0' {
            continue;
        }
        if is_printable(c) {
            out.push(c);
        } else if let Some(folded) = ascii_fold(c) {
            out.push_str(folded);
        } else if let Some(r) = replacement {
            out.push(r);
        }
    }
    out
}

/// Sanitise a message body, keeping line breaks.
pub fn sanitize_message(message: &str) -> String {
    sanitize_with(message, None)
}

/// Sanitise a display name: unprintable characters become spaces and runs of
/// whitespace collapse to one space.
pub fn sanitize_name(name: &str) -> String {
    sanitize_with(name, Some(' '))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
