//! Endpoint paths, paging limits, and JSON bodies shared by both ends.

use serde::{Deserialize, Serialize};

/// Liveness endpoint; no authentication.
pub const STATUS_PATH: &str = "/status";
/// Code-for-token exchange.
pub const PAIR_PATH: &str = "/api/v1/pair";
/// Category listing; bearer token required.
pub const TYPES_PATH: &str = "/health/types";
/// Paged records for one category; bearer token required.
pub const DATA_PATH: &str = "/health/data";

/// Page size used when `limit` is absent.
pub const DEFAULT_PAGE_LIMIT: usize = 500;
/// Largest page served; larger requests are clamped to this.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Body of `POST /api/v1/pair`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    pub code: String,
    /// Consumer-chosen identifier; the holder assigns one when absent.
    #[serde(rename = "deviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(rename = "deviceName", default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Successful pairing response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub token: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub name: String,
    /// Number of data categories available.
    pub categories: usize,
    pub version: String,
}

/// A data category and how many records it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub id: String,
    pub count: usize,
}

/// Body of `GET /health/types`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypesResponse {
    pub types: Vec<CategoryCount>,
}

/// Body of `GET /health/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPage {
    #[serde(rename = "type")]
    pub data_type: String,
    pub offset: usize,
    /// The effective (possibly clamped) page size.  Clients advance `offset`
    /// by this value.
    pub limit: usize,
    pub total: usize,
    pub records: Vec<serde_json::Value>,
    pub has_more: bool,
}

/// Page-size policy applied by the holder to `GET /health/data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Used when the request carries no `limit`.
    pub default: usize,
    /// Upper bound; larger requests are clamped down to it.
    pub max: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default: DEFAULT_PAGE_LIMIT,
            max: MAX_PAGE_LIMIT,
        }
    }
}

impl PageLimits {
    /// Resolves the effective page size for a request.  The result is always
    /// in `1..=max`, so a client advancing by it always makes progress.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        let max = self.max.max(1);
        requested.unwrap_or(self.default).clamp(1, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_limits_defaults_and_caps() {
        let limits = PageLimits::default();
        assert_eq!(limits.clamp(None), DEFAULT_PAGE_LIMIT);
        assert_eq!(limits.clamp(Some(2000)), MAX_PAGE_LIMIT);
        assert_eq!(limits.clamp(Some(0)), 1);
        assert_eq!(limits.clamp(Some(25)), 25);
    }

    #[test]
    fn test_page_limits_custom_policy() {
        let limits = PageLimits { default: 50, max: 100 };
        assert_eq!(limits.clamp(None), 50);
        assert_eq!(limits.clamp(Some(101)), 100);
    }

    #[test]
    fn test_pair_response_uses_device_id_key() {
        let resp = PairResponse {
            token: "t".to_string(),
            device_id: "d".to_string(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["deviceID"], "d");
    }

    #[test]
    fn test_pair_request_accepts_code_only() {
        let req: PairRequest = serde_json::from_str(r#"{"code":"482913"}"#).unwrap();
        assert_eq!(req.code, "482913");
        assert!(req.device_id.is_none());
    }

    #[test]
    fn test_data_page_uses_camel_case_has_more() {
        let page = DataPage {
            data_type: "steps".to_string(),
            offset: 0,
            limit: 2,
            total: 3,
            records: vec![],
            has_more: true,
        };
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["hasMore"], true);
        assert_eq!(json["type"], "steps");
    }
}
