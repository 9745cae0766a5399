//! The JSON-RPC-facing error taxonomy of spec.md §7.
//!
//! Drivers and the registry stay on the teacher's plain `Result<T, String>`
//! convention throughout (`drivers/`, `pool_manager.rs`). `RpcError` is the
//! single place those free-form strings get promoted to a stable numeric
//! code, in the struct-plus-status-enum shape used by
//! `examples/alexandreyc-adbc-rs/src/error.rs` — a status field next to the
//! message rather than a `thiserror` derive, since nothing else in this
//! stack reaches for `thiserror`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// --- Protocol: -32700..=-32603 (standard JSON-RPC 2.0 meanings) ------------

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// --- Connection: -32001..=-32006 -------------------------------------------

pub const CONNECTION_REFUSED: i32 = -32001;
pub const AUTH_REQUIRED: i32 = -32002;
pub const AUTH_FAILED: i32 = -32003;
pub const CONNECTION_LOST: i32 = -32004;
pub const INVALID_CONN_ID: i32 = -32005;
pub const UNSUPPORTED_DRIVER: i32 = -32006;

// --- Query: -32010..=-32013 -------------------------------------------------

pub const QUERY_FAILED: i32 = -32010;
pub const QUERY_CANCELLED: i32 = -32011;
pub const QUERY_TIMEOUT: i32 = -32012;
pub const QUERY_SYNTAX_ERROR: i32 = -32013;

// --- Data: -32020..=-32024 --------------------------------------------------

pub const NO_SUCH_TABLE: i32 = -32020;
pub const NO_SUCH_COLUMN: i32 = -32021;
pub const NO_SUCH_ROW: i32 = -32022;
pub const CONSTRAINT_VIOLATION: i32 = -32023;
pub const TYPE_MISMATCH: i32 = -32024;

// --- Transaction: -32030..=-32031 ------------------------------------------

pub const TRANSACTION_FAILED: i32 = -32030;
pub const TRANSACTION_CONFLICT: i32 = -32031;

// --- Client/daemon: -32040..=-32043 (produced by the client, never here) --

pub const DAEMON_NOT_FOUND: i32 = -32040;
pub const DAEMON_CRASHED: i32 = -32041;
pub const DAEMON_TIMEOUT: i32 = -32042;
pub const DAEMON_PROTOCOL_ERROR: i32 = -32043;

// --- Resource: -32050..=-32052 ----------------------------------------------

pub const ALLOCATION_FAILED: i32 = -32050;
pub const TOO_MANY_CONNECTIONS: i32 = -32051;
pub const RESULT_TOO_LARGE: i32 = -32052;

/// True for codes that represent an authentication problem a client might
/// resolve by re-prompting for credentials.
pub fn is_auth_error(code: i32) -> bool {
    matches!(code, AUTH_REQUIRED | AUTH_FAILED)
}

/// True for codes in the connection family (-32001..=-32006).
pub fn is_connection_error(code: i32) -> bool {
    (-32006..=-32001).contains(&code)
}

/// True for codes a client may reasonably retry or recover from without
/// tearing down the connection: query-family failures and transaction
/// conflicts, but not protocol errors, data errors, or a lost connection.
pub fn is_recoverable(code: i32) -> bool {
    matches!(
        code,
        QUERY_FAILED | QUERY_CANCELLED | QUERY_TIMEOUT | QUERY_SYNTAX_ERROR | TRANSACTION_CONFLICT
    )
}

/// Classifies a driver-reported error string that carries no structured
/// code of its own. Unknown driver errors degrade to `QUERY_FAILED` with the
/// driver's message attached, per spec.md §7.
pub fn classify_driver_error(message: impl Into<String>) -> RpcError {
    let message = message.into();
    let lower = message.to_lowercase();

    if lower.contains("no such table") || lower.contains("doesn't exist") || lower.contains("unknown table") {
        return RpcError::new(NO_SUCH_TABLE, message);
    }
    if lower.contains("no such column") || lower.contains("unknown column") {
        return RpcError::new(NO_SUCH_COLUMN, message);
    }
    if lower.contains("constraint") || lower.contains("duplicate") || lower.contains("unique") {
        return RpcError::new(CONSTRAINT_VIOLATION, message);
    }
    if lower.contains("syntax") {
        return RpcError::new(QUERY_SYNTAX_ERROR, message);
    }
    if lower.contains("password") || lower.contains("authentication") {
        return RpcError::new(AUTH_FAILED, message);
    }
    if lower.contains("connection refused") || lower.contains("could not connect") {
        return RpcError::new(CONNECTION_REFUSED, message);
    }
    if lower.contains("connection") && (lower.contains("closed") || lower.contains("reset") || lower.contains("broken")) {
        return RpcError::new(CONNECTION_LOST, message);
    }

    RpcError::new(QUERY_FAILED, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_patterns() {
        assert_eq!(classify_driver_error("no such table: users").code, NO_SUCH_TABLE);
        assert_eq!(classify_driver_error("unknown column 'x' in field list").code, NO_SUCH_COLUMN);
        assert_eq!(classify_driver_error("UNIQUE constraint failed: t.id").code, CONSTRAINT_VIOLATION);
        assert_eq!(classify_driver_error("syntax error near SELEC").code, QUERY_SYNTAX_ERROR);
        assert_eq!(classify_driver_error("password authentication failed").code, AUTH_FAILED);
        assert_eq!(classify_driver_error("connection refused").code, CONNECTION_REFUSED);
    }

    #[test]
    fn unknown_errors_degrade_to_query_failed() {
        let e = classify_driver_error("the flux capacitor overheated");
        assert_eq!(e.code, QUERY_FAILED);
        assert_eq!(e.message, "the flux capacitor overheated");
    }

    #[test]
    fn predicate_helpers_are_stable_by_range() {
        assert!(is_connection_error(CONNECTION_REFUSED));
        assert!(is_connection_error(INVALID_CONN_ID));
        assert!(!is_connection_error(QUERY_FAILED));

        assert!(is_auth_error(AUTH_REQUIRED));
        assert!(is_auth_error(AUTH_FAILED));
        assert!(!is_auth_error(CONNECTION_LOST));

        assert!(is_recoverable(QUERY_CANCELLED));
        assert!(!is_recoverable(CONNECTION_LOST));
        assert!(!is_recoverable(NO_SUCH_TABLE));
    }
}
