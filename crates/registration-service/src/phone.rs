//! Phone number handling.

/// Normalize a user-entered number to E.164: `+` followed by 7 to 15 digits.
///
/// Spaces, dots, dashes and parentheses are ignored. Without a leading `+`
/// the number must already carry its country code.
pub fn normalize_phone_number(number: &str) -> Result<String, String> {
    let number = number.trim();
    let (international, rest) = match number.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, number),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            other => return Err(format!("Unexpected character {:?} in phone number", other)),
        }
    }

    match digits.len() {
        0 => Err("Phone number must contain at least one digit".into()),
        1..=6 => Err("Phone number too short".into()),
        16.. => Err("Phone number too long".into()),
        n if !international && n < 10 => Err("Phone number must include country code".into()),
        _ => Ok(format!("+{}", digits)),
    }
}

/// Strip separators from a verification code such as `123-456`.
pub fn normalize_challenge(code: &str) -> Result<String, String> {
    let code: String = code.trim().chars().filter(|c| *c != '-').collect();

    if code.is_empty() {
        return Err("Verification code is empty".into());
    }
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return Err("Verification code must be numeric".into());
    }
    Ok(code)
}
