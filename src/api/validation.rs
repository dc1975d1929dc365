use axum::{Json, extract::rejection::JsonRejection};

use super::ApiError;

pub const DEFAULT_LIMIT: u64 = 50;

/// Unwrap a JSON body, reporting malformed input in the response envelope.
pub fn payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::validation(rejection.body_text()))
}

pub fn validate_limit(limit: Option<u64>) -> Result<u64, ApiError> {
    const MAX_LIMIT: u64 = 1000;
    const MIN_LIMIT: u64 = 1;

    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!(
            "Invalid limit: {limit}. Limit must be between {MIN_LIMIT} and {MAX_LIMIT}"
        )));
    }
    Ok(limit)
}

pub fn validate_ip(ip: &str) -> Result<String, ApiError> {
    let trimmed = ip.trim();
    trimmed
        .parse::<std::net::IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| ApiError::validation(format!("Invalid IP address: {trimmed}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_limit() {
        assert_eq!(validate_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(validate_limit(Some(1)).unwrap(), 1);
        assert_eq!(validate_limit(Some(1000)).unwrap(), 1000);
        assert!(validate_limit(Some(0)).is_err());
        assert!(validate_limit(Some(1001)).is_err());
    }

    #[test]
    fn test_validate_ip() {
        assert_eq!(validate_ip(" 10.0.0.1 ").unwrap(), "10.0.0.1");
        assert_eq!(validate_ip("::1").unwrap(), "::1");
        assert!(validate_ip("10.0.0").is_err());
        assert!(validate_ip("example.com").is_err());
    }
}
