pub mod http;

/// Generate a fresh request correlation id.
pub fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// Mask all but the last four characters of a secret.
pub fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("***{}", suffix)
}
