//! Proxy credential checks (`Proxy-Authorization: Basic ...`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Authentication scheme prefix, matched case-sensitively.
const BASIC_PREFIX: &str = "Basic ";

/// Challenge sent with every 407 response.
pub const PROXY_AUTHENTICATE: &str = "Basic realm=\"Proxy\"";

/// Configured proxy credentials.
///
/// Only exists when both username and password are non-empty; without it the
/// proxy is open.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Build credentials, or `None` when either part is empty.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check a raw `Proxy-Authorization` header value.
    pub fn verify(&self, header: Option<&str>) -> bool {
        check(&self.username, &self.password, header)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validate a raw `Proxy-Authorization` value against the expected pair.
///
/// True only when the header is `Basic <base64(user:pass)>` and both halves
/// (split on the first `:`) match exactly.
pub fn check(expected_user: &str, expected_pass: &str, header: Option<&str>) -> bool {
    let Some(header) = header else {
        return false;
    };
    let Some(encoded) = header.strip_prefix(BASIC_PREFIX) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded) else {
        return false;
    };
    let Some(colon) = decoded.iter().position(|&b| b == b':') else {
        return false;
    };

    let (user, pass) = (&decoded[..colon], &decoded[colon + 1..]);

    // Both halves are always compared.
    let user_ok = constant_time_eq(user, expected_user.as_bytes());
    let pass_ok = constant_time_eq(pass, expected_pass.as_bytes());
    user_ok & pass_ok
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
