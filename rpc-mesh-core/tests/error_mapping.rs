//! Integration coverage for the error-code table and standardized error
//! response (spec §6/§7) exercised across protocol boundaries together,
//! beyond the single-table unit tests embedded in `error.rs`.

use rpc_mesh_core::{ErrorKind, ErrorResponse, MeshError};

#[test]
fn every_kind_maps_to_a_distinct_framework_code() {
    let kinds = [
        ErrorKind::BadRequest,
        ErrorKind::Unauthorized,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::Timeout,
        ErrorKind::InternalError,
        ErrorKind::NotImplemented,
        ErrorKind::ServiceUnavailable,
        ErrorKind::ProtocolError,
        ErrorKind::SerializationError,
        ErrorKind::RoutingError,
        ErrorKind::ConnectionError,
    ];
    let codes: Vec<u32> = kinds.iter().map(|k| k.code()).collect();
    let mut sorted = codes.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), codes.len(), "framework codes must be distinct per kind");
}

#[test]
fn an_error_crossing_three_boundaries_keeps_a_stable_kind() {
    let original = MeshError::not_found("no such service 'calc'");
    let http = original.kind.to_http();
    let grpc = original.kind.to_grpc();
    let json_rpc = original.kind.to_json_rpc();

    assert_eq!(ErrorKind::from_http(http), ErrorKind::NotFound);
    assert_eq!(grpc, 5);
    assert_eq!(json_rpc, -32601);
}

#[test]
fn standardized_response_surfaces_the_full_causal_chain() {
    let dial_failure = MeshError::connection("dial refused");
    let acquire_failure = MeshError::wrap(ErrorKind::ServiceUnavailable, "pool exhausted", &dial_failure);
    let routed_failure = MeshError::wrap(ErrorKind::RoutingError, "no route to target", &acquire_failure);

    let response = ErrorResponse::from(&routed_failure);
    assert_eq!(response.code, ErrorKind::RoutingError.code());
    assert_eq!(response.error_chain.len(), 3);
    assert!(response.error_chain[0].contains("no route to target"));
    assert!(response.error_chain[2].contains("dial refused"));
}

#[test]
fn client_errors_are_never_classified_as_retryable() {
    for kind in [ErrorKind::BadRequest, ErrorKind::Unauthorized, ErrorKind::Forbidden, ErrorKind::NotFound] {
        assert!(!kind.is_retryable(), "{kind:?} must not be retryable");
        assert!(kind.is_client_error(), "{kind:?} must classify as a client error");
    }
}

#[test]
fn unrecognized_wire_codes_fall_back_to_internal_error() {
    assert_eq!(ErrorKind::from_http(599), ErrorKind::InternalError);
    assert_eq!(ErrorKind::from_grpc(999), ErrorKind::InternalError);
    assert_eq!(ErrorKind::from_json_rpc(-1), ErrorKind::InternalError);
}
