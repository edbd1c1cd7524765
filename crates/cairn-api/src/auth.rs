use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::error::AppError;

pub const SESSION_COOKIE: &str = "token";

/// Session token handed out for a password: hex SHA-256 of it
pub fn session_token(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// `Set-Cookie` value establishing a session
pub fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict")
}

pub fn extract_session_token(headers: &HeaderMap) -> Result<&str, AppError> {
    for header in headers.get_all(COOKIE) {
        let header = header
            .to_str()
            .map_err(|_| AppError::forbidden("Cookie header is not valid UTF-8"))?;
        let token = header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.trim())
        });
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            return Ok(token);
        }
    }
    Err(AppError::forbidden("Missing session cookie"))
}

/// Check a presented session token against the expected one
pub fn verify_session(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let token = extract_session_token(headers)?;
    if token.len() != expected.len()
        || token
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            != 0
    {
        return Err(AppError::forbidden("Session is not valid"));
    }
    Ok(())
}
