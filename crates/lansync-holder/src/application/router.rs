//! Request routing: turns one [`WireRequest`] into one [`WireResponse`].
//!
//! The router is pure application logic.  It never touches a socket, so the
//! full endpoint table can be exercised in tests by handing it requests
//! directly.
//!
//! | Method | Path            | Auth              | Notes                                   |
//! |--------|-----------------|-------------------|-----------------------------------------|
//! | GET    | `/status`       | none              | liveness plus category count            |
//! | POST   | `/api/v1/pair`  | pairing code      | exchanges the code for a bearer token   |
//! | GET    | `/health/types` | bearer + unlocked | categories with record counts           |
//! | GET    | `/health/data`  | bearer + unlocked | one page of one category                |
//!
//! Anything else, including a known path with the wrong method, is 404.
//! Checks run in a fixed order: token (401), then lock (423), then request
//! validation (400).

use std::sync::Arc;

use lansync_core::api::{
    DataPage, PageLimits, PairRequest, PairResponse, StatusResponse, TypesResponse, DATA_PATH,
    PAIR_PATH, STATUS_PATH, TYPES_PATH,
};
use lansync_core::{Method, StatusCode, WireRequest, WireResponse};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::audit::{AuditEvent, AuditSink};
use crate::application::credentials::{CredentialIssuer, IssuerError};
use crate::application::data_source::HealthDataSource;
use crate::application::lock::DeviceLock;

/// Static router settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSettings {
    /// Holder name reported by `/status`.
    pub name: String,
    /// Refuse data requests with 423 while the device is locked.
    pub require_unlock: bool,
    pub page_limits: PageLimits,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            name: "LanSync Holder".to_string(),
            require_unlock: true,
            page_limits: PageLimits::default(),
        }
    }
}

/// Dispatches requests to the endpoint handlers.
pub struct Router {
    issuer: Arc<CredentialIssuer>,
    data: Arc<dyn HealthDataSource>,
    lock: Arc<dyn DeviceLock>,
    audit: Arc<dyn AuditSink>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        issuer: Arc<CredentialIssuer>,
        data: Arc<dyn HealthDataSource>,
        lock: Arc<dyn DeviceLock>,
        audit: Arc<dyn AuditSink>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            issuer,
            data,
            lock,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Handles one request.  Always produces a response.
    pub fn handle(&self, req: &WireRequest) -> WireResponse {
        self.audit.record(AuditEvent::Request {
            method: req.method.to_string(),
            path: req.path.clone(),
        });

        let resp = match (&req.method, req.path.as_str()) {
            (Method::Get, STATUS_PATH) => self.status(),
            (Method::Post, PAIR_PATH) => self.pair(req),
            (Method::Get, TYPES_PATH) => self.types(req),
            (Method::Get, DATA_PATH) => self.data(req),
            _ => WireResponse::error(StatusCode::NOT_FOUND, "not found"),
        };
        debug!("{} {} -> {}", req.method, req.path, resp.status);
        resp
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn status(&self) -> WireResponse {
        let categories = match self.data.categories() {
            Ok(c) => c.len(),
            Err(e) => {
                warn!("status: could not count categories: {e}");
                0
            }
        };
        WireResponse::json(
            StatusCode::OK,
            &StatusResponse {
                status: "ok".to_string(),
                name: self.settings.name.clone(),
                categories,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
    }

    fn pair(&self, req: &WireRequest) -> WireResponse {
        let Some(body) = req.body.as_deref() else {
            return WireResponse::error(StatusCode::BAD_REQUEST, "missing request body");
        };
        let pair: PairRequest = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(e) => {
                return WireResponse::error(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid pairing request: {e}"),
                )
            }
        };

        let Some(token) = self.issuer.validate_code(pair.code.trim()) else {
            self.audit.record(AuditEvent::PairingRejected);
            return WireResponse::error(StatusCode::UNAUTHORIZED, "invalid pairing code");
        };

        let device_id = match pair.device_id.filter(|id| !id.trim().is_empty()) {
            Some(id) if !self.issuer.is_registered(&id) => id,
            _ => Uuid::new_v4().to_string(),
        };

        match self
            .issuer
            .register_device(&device_id, pair.device_name, &token)
        {
            Ok(_) => {
                self.audit.record(AuditEvent::Paired {
                    device_id: device_id.clone(),
                });
                WireResponse::json(
                    StatusCode::OK,
                    &PairResponse {
                        token: token.into_string(),
                        device_id,
                    },
                )
            }
            Err(IssuerError::DeviceExists(id)) => {
                warn!("pairing raced on device id {id}");
                WireResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "device registration failed")
            }
            Err(e) => {
                error!("failed to register device {device_id}: {e}");
                WireResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "device registration failed")
            }
        }
    }

    fn types(&self, req: &WireRequest) -> WireResponse {
        if let Some(rejection) = self.authorize(req) {
            return rejection;
        }
        match self.data.categories() {
            Ok(types) => {
                self.audit.record(AuditEvent::DataServed {
                    data_type: "types".to_string(),
                    count: types.len(),
                });
                WireResponse::json(StatusCode::OK, &TypesResponse { types })
            }
            Err(e) => {
                error!("failed to list categories: {e}");
                WireResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "data source unavailable")
            }
        }
    }

    fn data(&self, req: &WireRequest) -> WireResponse {
        if let Some(rejection) = self.authorize(req) {
            return rejection;
        }

        let Some(data_type) = req.query_param("type").filter(|t| !t.is_empty()) else {
            return WireResponse::error(StatusCode::BAD_REQUEST, "missing type parameter");
        };
        let offset = match parse_count(req.query_param("offset")) {
            Ok(o) => o.unwrap_or(0),
            Err(msg) => return WireResponse::error(StatusCode::BAD_REQUEST, &msg),
        };
        let limit = match parse_count(req.query_param("limit")) {
            Ok(l) => self.settings.page_limits.clamp(l),
            Err(msg) => return WireResponse::error(StatusCode::BAD_REQUEST, &msg),
        };
        if !self.data.contains(data_type) {
            return WireResponse::error(
                StatusCode::BAD_REQUEST,
                &format!("unknown type {data_type}"),
            );
        }

        let page = self.data.total(data_type).and_then(|total| {
            self.data
                .page(data_type, offset, limit)
                .map(|records| (total, records))
        });
        match page {
            Ok((total, records)) => {
                let count = records.len();
                self.audit.record(AuditEvent::DataServed {
                    data_type: data_type.to_string(),
                    count,
                });
                WireResponse::json(
                    StatusCode::OK,
                    &DataPage {
                        data_type: data_type.to_string(),
                        offset,
                        limit,
                        total,
                        has_more: offset.saturating_add(count) < total,
                        records,
                    },
                )
            }
            Err(e) => {
                error!("failed to read {data_type} page at {offset}: {e}");
                WireResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "data source unavailable")
            }
        }
    }

    /// Returns the rejection for an unauthenticated or locked request.
    fn authorize(&self, req: &WireRequest) -> Option<WireResponse> {
        let authorized = req
            .headers
            .bearer_token()
            .is_some_and(|t| self.issuer.validate_token(t));
        if !authorized {
            return Some(WireResponse::error(
                StatusCode::UNAUTHORIZED,
                "missing or invalid token",
            ));
        }
        if self.settings.require_unlock && self.lock.is_locked() {
            return Some(WireResponse::error(StatusCode::LOCKED, "device is locked"));
        }
        None
    }
}

/// Parses an optional non-negative integer query parameter.
fn parse_count(raw: Option<&str>) -> Result<Option<usize>, String> {
    raw.map(|v| {
        v.trim()
            .parse::<usize>()
            .map_err(|_| format!("expected a non-negative integer, got {v:?}"))
    })
    .transpose()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
