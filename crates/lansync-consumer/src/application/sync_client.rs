//! SyncClient: pairs with a holder and pulls its records.
//!
//! # Flow (for beginners)
//!
//! ```text
//! CredentialBundle ──► SyncClient::new
//!                         │
//!                         ├─ pair()          POST /api/v1/pair   code ──► token
//!                         ├─ fetch_types()   GET  /health/types
//!                         └─ fetch_all(t)    GET  /health/data?type=t&offset=..   (until hasMore = false)
//! ```
//!
//! Every request goes out on a fresh connection through a [`Transport`].  The
//! production transport is the pinned TLS one, which refuses to talk to any
//! certificate other than the one named in the bundle.
//!
//! Once paired, [`SyncClient::pairing_record`] returns everything needed to
//! reconnect later with [`SyncClient::resume`], without a new code.
//!
//! # Error mapping
//!
//! | Holder answer          | `SyncError`                         |
//! |------------------------|-------------------------------------|
//! | 401 on pair            | `PairingRejected`                   |
//! | 401 on data endpoints  | `Unauthorized` (token revoked)      |
//! | 423                    | `Locked`                            |
//! | 400                    | `BadRequest(message)`               |
//! | anything else non-200  | `UnexpectedStatus { status, .. }`   |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lansync_core::api::{
    CategoryCount, DataPage, PairRequest, PairResponse, TypesResponse, DATA_PATH,
    MAX_PAGE_LIMIT, PAIR_PATH, TYPES_PATH,
};
use lansync_core::{
    Clock, CredentialBundle, Fingerprint, StatusCode, SystemClock, WireError, WireRequest,
    WireResponse,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::network::tls::{TlsTransport, DEFAULT_CONNECT_TIMEOUT};
use crate::infrastructure::storage::pairing_record::PairingRecord;

/// Default bound on writing a request and reading its response.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

// ── Transport seam ────────────────────────────────────────────────────────────

/// Error type for a single request/response exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The holder presented a certificate other than the pinned one.
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Reading or writing failed mid-exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The exchange did not finish in time.
    #[error("timed out waiting for the holder")]
    TimedOut,

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Wire(#[from] WireError),
}

/// Sends one request to a holder and returns its response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError`] if no response could be obtained.
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        request: &WireRequest,
    ) -> Result<WireResponse, TransportError>;
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The bundle's code expired before pairing was attempted.
    #[error("credential bundle expired at {0}")]
    BundleExpired(DateTime<Utc>),

    /// The holder presented a certificate other than the pinned one.
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    /// The holder refused the pairing code.
    #[error("pairing code rejected")]
    PairingRejected,

    /// `pair()` was called without a code (a resumed client).
    #[error("no pairing code available")]
    NoPairingCode,

    /// A data request was made before pairing.
    #[error("not paired")]
    NotPaired,

    /// The token is unknown or revoked.
    #[error("token rejected by the holder")]
    Unauthorized,

    /// The holder device is locked.
    #[error("holder is locked")]
    Locked,

    /// The holder refused the request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Any other non-success status.
    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// The holder answered with something that breaks the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The exchange failed below the HTTP layer.
    #[error(transparent)]
    Transport(TransportError),

    /// The TLS client could not be configured.
    #[error("TLS setup failed: {0}")]
    Setup(String),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::FingerprintMismatch { expected, actual } => {
                SyncError::FingerprintMismatch { expected, actual }
            }
            other => SyncError::Transport(other),
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Requested device id; the holder assigns one when absent or taken.
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Page size to request; the holder's default applies when `None`.
    pub page_limit: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            page_limit: None,
        }
    }
}

/// Outcome of [`SyncClient::sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Records by category id.
    pub records: BTreeMap<String, Vec<serde_json::Value>>,
    /// Number of data pages fetched.
    pub pages: usize,
}

impl SyncReport {
    pub fn total_records(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Talks to one holder.
pub struct SyncClient {
    host: String,
    port: u16,
    fingerprint: Fingerprint,
    code: Option<String>,
    code_expires_at: Option<DateTime<Utc>>,
    device_id: Option<String>,
    token: Option<String>,
    transport: Arc<dyn Transport>,
    options: SyncOptions,
    clock: Arc<dyn Clock>,
}

impl SyncClient {
    /// Client for a freshly scanned or pasted bundle.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Setup`] if the TLS client cannot be configured.
    pub fn new(bundle: CredentialBundle, options: SyncOptions) -> Result<Self, SyncError> {
        let transport = TlsTransport::new(
            bundle.fingerprint,
            options.connect_timeout,
            options.io_timeout,
        )
        .map_err(|e| SyncError::Setup(e.to_string()))?;
        Ok(Self::with_transport(bundle, Arc::new(transport), options))
    }

    /// Client for a bundle using a caller-supplied transport.
    pub fn with_transport(
        bundle: CredentialBundle,
        transport: Arc<dyn Transport>,
        options: SyncOptions,
    ) -> Self {
        Self {
            host: bundle.host.clone(),
            port: bundle.port,
            fingerprint: bundle.fingerprint,
            code_expires_at: Some(bundle.expires_at()),
            code: Some(bundle.code),
            device_id: None,
            token: None,
            transport,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Client for an earlier pairing.  Already paired; `pair()` is not
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Setup`] if the TLS client cannot be configured.
    pub fn resume(record: PairingRecord, options: SyncOptions) -> Result<Self, SyncError> {
        let transport = TlsTransport::new(
            record.fingerprint,
            options.connect_timeout,
            options.io_timeout,
        )
        .map_err(|e| SyncError::Setup(e.to_string()))?;
        Ok(Self::resume_with_transport(record, Arc::new(transport), options))
    }

    pub fn resume_with_transport(
        record: PairingRecord,
        transport: Arc<dyn Transport>,
        options: SyncOptions,
    ) -> Self {
        Self {
            host: record.host,
            port: record.port,
            fingerprint: record.fingerprint,
            code: None,
            code_expires_at: None,
            device_id: Some(record.device_id),
            token: Some(record.token),
            transport,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Overrides the bundle address, e.g. with one found by discovery.  The
    /// certificate pin is unchanged.
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_paired(&self) -> bool {
        self.token.is_some()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// What to persist to reconnect later.  `None` until paired.
    pub fn pairing_record(&self) -> Option<PairingRecord> {
        Some(PairingRecord {
            host: self.host.clone(),
            port: self.port,
            fingerprint: self.fingerprint,
            device_id: self.device_id.clone()?,
            token: self.token.clone()?,
        })
    }

    /// Exchanges the bundle's code for a token.
    ///
    /// An expired bundle fails without any network traffic.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BundleExpired`], [`SyncError::PairingRejected`],
    /// [`SyncError::FingerprintMismatch`], or a transport error.
    pub async fn pair(&mut self) -> Result<PairingRecord, SyncError> {
        let code = self.code.clone().ok_or(SyncError::NoPairingCode)?;
        if let Some(expires_at) = self.code_expires_at {
            if self.clock.now() >= expires_at {
                return Err(SyncError::BundleExpired(expires_at));
            }
        }

        let body = PairRequest {
            code,
            device_id: self.options.device_id.clone(),
            device_name: self.options.device_name.clone(),
        };
        let request = WireRequest::post(PAIR_PATH)
            .with_json(&body)
            .map_err(|e| SyncError::Protocol(format!("failed to encode pair request: {e}")))?;
        let response = self.exchange(&request).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            warn!("holder rejected the pairing code");
            return Err(SyncError::PairingRejected);
        }
        let paired: PairResponse = decode_success(&response)?;

        // Codes are single-use; keep it from being replayed.
        self.code = None;
        self.device_id = Some(paired.device_id);
        self.token = Some(paired.token);
        info!("paired with {}:{}", self.host, self.port);
        self.pairing_record()
            .ok_or_else(|| SyncError::Protocol("pairing left no record".to_string()))
    }

    /// Lists the holder's categories.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotPaired`] before pairing, or the mapped holder
    /// status / transport error.
    pub async fn fetch_types(&self) -> Result<Vec<CategoryCount>, SyncError> {
        let token = self.token()?;
        let request = WireRequest::get(TYPES_PATH).with_bearer(token);
        let response = self.exchange(&request).await?;
        let types: TypesResponse = decode_success(&response)?;
        Ok(types.types)
    }

    /// Fetches one page of `data_type` starting at `offset`.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::fetch_types`].
    pub async fn fetch_page(&self, data_type: &str, offset: usize) -> Result<DataPage, SyncError> {
        let token = self.token()?;
        let mut request = WireRequest::get(DATA_PATH)
            .with_query("type", data_type)
            .with_query("offset", offset)
            .with_bearer(token);
        if let Some(limit) = self.options.page_limit {
            request = request.with_query("limit", limit);
        }
        let response = self.exchange(&request).await?;
        decode_success(&response)
    }

    /// Fetches every page of `data_type`, handing each to `on_page` as it
    /// arrives.  Returns the number of pages.
    ///
    /// # Errors
    ///
    /// Stops at the first failing page.  Returns [`SyncError::Protocol`] if
    /// the holder claims more records but a page makes no progress.
    pub async fn for_each_page<F>(&self, data_type: &str, mut on_page: F) -> Result<usize, SyncError>
    where
        F: FnMut(DataPage) + Send,
    {
        let mut offset = 0;
        let mut pages = 0;
        loop {
            let page = self.fetch_page(data_type, offset).await?;
            if page.offset != offset {
                return Err(SyncError::Protocol(format!(
                    "asked for offset {offset}, got {}",
                    page.offset
                )));
            }
            let has_more = page.has_more;
            let step = page.limit;
            if has_more && (step == 0 || page.records.is_empty()) {
                return Err(SyncError::Protocol(format!(
                    "page at offset {offset} of {data_type:?} made no progress"
                )));
            }
            debug!(
                "{data_type}: {} record(s) at offset {offset} of {}",
                page.records.len(),
                page.total
            );
            pages += 1;
            on_page(page);
            if !has_more {
                return Ok(pages);
            }
            offset += step;
        }
    }

    /// Fetches every record of `data_type`.
    ///
    /// # Errors
    ///
    /// See [`SyncClient::for_each_page`].
    pub async fn fetch_all(&self, data_type: &str) -> Result<Vec<serde_json::Value>, SyncError> {
        let mut records = Vec::new();
        self.for_each_page(data_type, |page| records.extend(page.records))
            .await?;
        Ok(records)
    }

    /// Fetches every record of every category.
    ///
    /// # Errors
    ///
    /// Stops at the first failure; nothing already fetched is returned.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        for category in self.fetch_types().await? {
            // The advertised count is the holder's claim; never reserve more than a page.
            let mut records = Vec::with_capacity(category.count.min(MAX_PAGE_LIMIT));
            let pages = self
                .for_each_page(&category.id, |page| records.extend(page.records))
                .await?;
            report.pages += pages;
            report.records.insert(category.id, records);
        }
        info!(
            "synced {} record(s) in {} page(s)",
            report.total_records(),
            report.pages
        );
        Ok(report)
    }

    fn token(&self) -> Result<&str, SyncError> {
        self.token.as_deref().ok_or(SyncError::NotPaired)
    }

    async fn exchange(&self, request: &WireRequest) -> Result<WireResponse, SyncError> {
        debug!("{} {}", request.method, request.path);
        Ok(self
            .transport
            .exchange(&self.host, self.port, request)
            .await?)
    }
}

/// Decodes a 200 body, or maps the status to its error.
fn decode_success<T: DeserializeOwned>(response: &WireResponse) -> Result<T, SyncError> {
    if response.status != StatusCode::OK {
        return Err(status_error(response));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| SyncError::Protocol(format!("invalid response body: {e}")))
}

fn status_error(response: &WireResponse) -> SyncError {
    let message = serde_json::from_slice::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|v| v.get("error").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_default();
    match response.status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized,
        StatusCode::LOCKED => SyncError::Locked,
        StatusCode::BAD_REQUEST => SyncError::BadRequest(message),
        status => SyncError::UnexpectedStatus {
            status: status.as_u16(),
            message,
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
