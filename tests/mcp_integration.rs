//! Integration tests for JSON-RPC message handling.
//!
//! These tests verify parsing, serialisation and parameter normalisation of
//! the message model as seen by code outside the crate.

use mcp_link::error::{McpError, ProtocolError};
use mcp_link::mcp::protocol::{
    methods, parse_message, ErrorCode, ErrorObject, Message, Request, RequestId,
};
use serde_json::json;

// =============================================================================
// Protocol Parsing Tests
// =============================================================================

#[test]
fn test_parse_initialize_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let Message::Request(req) = result.unwrap() {
        assert_eq!(req.method, "initialize");
        assert_eq!(req.id, RequestId::Number(1));
    } else {
        panic!("Expected Request");
    }
}

#[test]
fn test_parse_string_id() {
    let json = r#"{"jsonrpc": "2.0", "id": "abc-1", "method": "tools/list", "params": {}}"#;

    let message = parse_message(json).unwrap();
    assert_eq!(message.id(), Some(&RequestId::String("abc-1".to_string())));
    assert_eq!(message.method(), Some("tools/list"));
}

#[test]
fn test_parse_notification() {
    let json = r#"{
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let Message::Notification(notif) = result.unwrap() {
        assert_eq!(notif.method, "notifications/initialized");
    } else {
        panic!("Expected Notification");
    }
}

#[test]
fn test_parse_error_reply_without_id() {
    let json = r#"{"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}"#;

    match parse_message(json).unwrap() {
        Message::Error(err) => {
            assert!(err.id.is_none());
            assert_eq!(err.error.kind(), ErrorCode::ParseError);
        }
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[test]
fn test_parse_invalid_json() {
    let json = "not valid json";

    let result = parse_message(json);
    assert!(matches!(result, Err(ProtocolError::Json(_))));
}

#[test]
fn test_parse_wrong_version_keeps_id() {
    let json = r#"{"jsonrpc": "1.0", "id": 9, "method": "ping"}"#;

    match parse_message(json) {
        Err(ProtocolError::MalformedMessage { id, .. }) => {
            assert_eq!(id, Some(RequestId::Number(9)));
        }
        other => panic!("Expected MalformedMessage, got {other:?}"),
    }
}

#[test]
fn test_parse_rejects_ambiguous_reply() {
    let json = r#"{"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}}"#;

    assert!(matches!(
        parse_message(json),
        Err(ProtocolError::MalformedMessage { .. })
    ));
}

// =============================================================================
// Serialisation Tests
// =============================================================================

#[test]
fn test_error_reply_serialises_null_id() {
    let message = Message::error(None, ErrorObject::from_code(ErrorCode::ParseError));
    let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

    assert_eq!(value["jsonrpc"], "2.0");
    assert!(value["id"].is_null());
    assert_eq!(value["error"]["code"], -32700);
}

#[test]
fn test_serialised_message_is_single_line() {
    let message = Message::response(
        RequestId::Number(3),
        json!({"text": "line one\nline two"}),
    );
    let wire = message.to_json().unwrap();

    assert!(!wire.contains('\n'));
    assert_eq!(parse_message(&wire).unwrap(), message);
}

#[test]
fn test_error_reply_maps_to_rpc_error() {
    let message = Message::error(
        Some(RequestId::Number(5)),
        ErrorObject::with_message(ErrorCode::ToolNotFound, "Tool not found: x"),
    );

    match message.into_result() {
        Err(McpError::Rpc { code, message, .. }) => {
            assert_eq!(code, -32002);
            assert_eq!(message, "Tool not found: x");
        }
        other => panic!("Expected Rpc error, got {other:?}"),
    }
}

// =============================================================================
// Parameter Normalisation Tests
// =============================================================================

#[test]
fn test_tool_call_pair_is_normalised() {
    let request = Request::new(
        1,
        methods::TOOLS_CALL,
        Some(json!(["search", r#"{"q": "rust"}"#])),
    );
    let params = request.params.unwrap();

    assert_eq!(params["name"], "search");
    assert_eq!(params["arguments"], json!({"q": "rust"}));
}

#[test]
fn test_tool_call_without_arguments_gets_empty_object() {
    let request = Request::new(1, methods::TOOLS_CALL, Some(json!({"name": "noop"})));

    assert_eq!(request.params.unwrap()["arguments"], json!({}));
}

#[test]
fn test_resource_read_accepts_bare_uri() {
    let request = Request::new(1, methods::RESOURCES_READ, Some(json!("mem://a")));

    assert_eq!(request.param_str("uri"), Some("mem://a"));
}

#[test]
fn test_initialize_is_filled_in() {
    let request = Request::new(1, methods::INITIALIZE, None);
    let params = request.params.unwrap();

    assert_eq!(params["protocolVersion"], "2024-11-05");
    assert!(params["capabilities"].is_object());
    assert_eq!(params["clientInfo"]["name"], "mcp-link");
}
