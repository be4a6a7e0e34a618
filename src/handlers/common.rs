use crate::errors::{ApiError, ServiceError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub const DEFAULT_PER_PAGE: u64 = 20;
pub const MAX_PER_PAGE: u64 = 100;

/// 200 with a JSON body
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// 201 with a JSON body
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Runs `validator` rules on a request body, reporting failures as 400.
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::ValidationError(format!("Validation failed: {}", e)))
}

pub fn map_service_error(err: ServiceError) -> ApiError {
    ApiError::ServiceError(err)
}

/// Raw `page`/`per_page` query values. Both are optional on the wire and
/// resolved against the defaults before use.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

impl PageQuery {
    /// Fills in defaults and enforces `page >= 1`, `1 <= per_page <= 100`.
    pub fn resolve(&self) -> Result<PaginationParams, ApiError> {
        let params = PaginationParams {
            page: self.page.unwrap_or(1),
            per_page: self.per_page.unwrap_or(DEFAULT_PER_PAGE),
        };
        validate_input(&params)?;
        Ok(params)
    }
}

/// Resolved one-based page window
#[derive(Debug, Clone, Copy, Serialize, Validate)]
pub struct PaginationParams {
    #[validate(range(min = 1))]
    pub page: u64,
    #[validate(range(min = 1, max = 100))]
    pub per_page: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PaginationMeta {
    pub fn new(params: PaginationParams, total: u64) -> Self {
        Self {
            page: params.page,
            per_page: params.per_page,
            total,
            total_pages: total.div_ceil(params.per_page.max(1)),
        }
    }
}

/// A page of results plus where it sits in the full set
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: PaginationParams, total: u64) -> Self {
        Self {
            data,
            pagination: PaginationMeta::new(params, total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn missing_values_fall_back_to_defaults() {
        let params = PageQuery::default().resolve().unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.per_page, DEFAULT_PER_PAGE);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let too_big = PageQuery {
            page: Some(1),
            per_page: Some(MAX_PER_PAGE + 1),
        };
        assert_matches!(too_big.resolve(), Err(ApiError::ValidationError(_)));

        let page_zero = PageQuery {
            page: Some(0),
            per_page: None,
        };
        assert_matches!(page_zero.resolve(), Err(ApiError::ValidationError(_)));
    }

    #[test]
    fn total_pages_round_up() {
        let params = PaginationParams { page: 2, per_page: 20 };
        assert_eq!(PaginationMeta::new(params, 41).total_pages, 3);
        assert_eq!(PaginationMeta::new(params, 40).total_pages, 2);
        assert_eq!(PaginationMeta::new(params, 0).total_pages, 0);
    }
}
