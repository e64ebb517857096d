//! Tests for error types

use std::io;

use farm_dispatch::core::{DispatchError, FrameRangeError, PoolError, RemoteAgentError, StoreError};
use farm_dispatch::frames::FrameSet;

#[test]
fn test_store_error_messages() {
    let err = StoreError::FrameReservation("0001-render is running".to_string());
    assert_eq!(format!("{}", err), "frame reservation failed: 0001-render is running");

    let err = StoreError::Backend("connection failed".to_string());
    assert_eq!(format!("{}", err), "store backend error: connection failed");
}

#[test]
fn test_store_error_passes_through_dispatch_error() {
    let err = DispatchError::from(StoreError::NotFound("job 42".to_string()));
    assert_eq!(format!("{}", err), "not found: job 42");
    assert!(matches!(err, DispatchError::Store(StoreError::NotFound(_))));
}

#[test]
fn test_stopped_error() {
    let err = DispatchError::Stopped("host out of memory".to_string());
    assert_eq!(format!("{}", err), "dispatcher stopped: host out of memory");
}

#[test]
fn test_agent_error_chain() {
    let err = RemoteAgentError::with_source(
        "failed to kill frame on render-01",
        io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"),
    );
    let dispatch = DispatchError::from(err);
    let chained = anyhow::Error::new(dispatch).context("booking render-01");
    let rendered = format!("{chained:#}");
    assert!(rendered.starts_with("booking render-01: failed to kill frame on render-01"), "{rendered}");
    assert!(rendered.contains("deadline exceeded"), "{rendered}");
}

#[test]
fn test_frame_range_error_from_parse() {
    let err = FrameSet::parse("1-10-20").unwrap_err();
    assert!(matches!(err, FrameRangeError::InvalidRangeExpression { ref expr, .. } if expr == "1-10-20"));
    assert!(err.to_string().starts_with("invalid range expression `1-10-20`"));
}

#[test]
fn test_pool_errors() {
    assert_eq!(format!("{}", PoolError::PoolShutdown), "pool has been shut down");
    assert_eq!(
        format!("{}", PoolError::InvalidConfig("worker_count must be greater than 0".into())),
        "invalid configuration: worker_count must be greater than 0"
    );
}
