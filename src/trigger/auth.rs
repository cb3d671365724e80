/// Webhook request authentication
///
/// `token` mode compares a bearer token, `hmac` mode checks an HMAC-SHA256 of the
/// raw body. Both comparisons are constant-time; the HMAC one is `Mac::verify_slice`.

use crate::error::WebhookRejection;
use crate::trigger::config::AuthMode;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Check a request against the route's auth mode
pub fn authenticate(mode: AuthMode, secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookRejection> {
    match mode {
        AuthMode::None => Ok(()),
        AuthMode::Token => {
            let header = header_str(headers, axum::http::header::AUTHORIZATION.as_str())
                .ok_or_else(|| WebhookRejection::Unauthorized("Missing Authorization header".into()))?;
            let token = match header.get(..7) {
                Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => &header[7..],
                _ => header,
            }
            .trim();
            if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
                Ok(())
            } else {
                Err(WebhookRejection::Unauthorized("Invalid token".into()))
            }
        }
        AuthMode::Hmac => {
            let raw = header_str(headers, SIGNATURE_HEADER)
                .ok_or_else(|| WebhookRejection::Unauthorized("Missing X-Signature header".into()))?;
            let provided = raw
                .strip_prefix("sha256=")
                .or_else(|| raw.strip_prefix("SHA256="))
                .unwrap_or(raw)
                .trim();
            let invalid = || WebhookRejection::Unauthorized("Invalid HMAC signature".into());
            let signature = hex::decode(provided).map_err(|_| invalid())?;
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| invalid())?;
            mac.update(body);
            mac.verify_slice(&signature).map_err(|_| invalid())
        }
    }
}

/// Lower-case hex HMAC-SHA256 of `body`
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
