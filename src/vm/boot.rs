//! Boot synchronization
//!
//! A synchronous creation waits for exactly one event on the VM's status
//! feed. Only `StatusCode::Running` counts as a successful start; anything
//! else, a closed feed, or an expired watchdog is a startup failure.

use std::time::Duration;

use tracing::{debug, warn};

use super::driver::StatusCode;
use super::handle::{VmHandle, VmStatus};
use crate::error::{Result, VmError};

/// Wait for the first status event of `handle`
///
/// The feed is held only for the duration of this call and is released on
/// every exit path, including cancellation of the returned future.
pub async fn wait_start(handle: &VmHandle, timeout: Option<Duration>) -> Result<()> {
    let mut feed = handle
        .acquire_status_feed()
        .ok_or_else(|| VmError::StartFailed {
            vm_id: handle.id().to_string(),
            cause: "status feed is held by another waiter".to_string(),
        })?;

    let event = match timeout {
        Some(limit) => match tokio::time::timeout(limit, feed.recv()).await {
            Ok(event) => event,
            Err(_) => {
                feed.release();
                handle.set_status(VmStatus::Failed);
                warn!(vm_id = %handle.id(), timeout_ms = limit.as_millis() as u64, "VM start timed out");
                return Err(VmError::StartFailed {
                    vm_id: handle.id().to_string(),
                    cause: format!("timed out after {:?}", limit),
                });
            }
        },
        None => feed.recv().await,
    };
    feed.release();

    let Some(event) = event else {
        handle.set_status(VmStatus::Failed);
        return Err(VmError::StartFailed {
            vm_id: handle.id().to_string(),
            cause: "status feed closed before the VM reported".to_string(),
        });
    };

    debug!(vm_id = %event.vm_id, code = event.code.code(), "Got response from VM");

    if event.code != StatusCode::Running {
        handle.set_status(VmStatus::Failed);
        let cause = if event.cause.is_empty() {
            format!("{:?}", event.code)
        } else {
            event.cause
        };
        return Err(VmError::StartFailed {
            vm_id: handle.id().to_string(),
            cause,
        });
    }

    handle.set_status(VmStatus::Running);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::vm::driver::VmEvent;
    use crate::vm::testing::stub_handle_with_feed;

    #[tokio::test]
    async fn test_running_event_confirms_start() {
        let (handle, tx) = stub_handle_with_feed("vm-a");
        tx.send(VmEvent::running("vm-a")).await.unwrap();

        wait_start(&handle, None).await.unwrap();
        assert_eq!(handle.status(), VmStatus::Running);
        assert!(handle.acquire_status_feed().is_some());
    }

    #[tokio::test]
    async fn test_failed_event_carries_cause() {
        let (handle, tx) = stub_handle_with_feed("vm-a");
        tx.send(VmEvent::new("vm-a", StatusCode::Failed, "kernel panic"))
            .await
            .unwrap();

        let err = wait_start(&handle, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BootFailure);
        assert!(err.to_string().contains("kernel panic"));
        assert_eq!(handle.status(), VmStatus::Failed);
        assert!(handle.acquire_status_feed().is_some());
    }

    #[tokio::test]
    async fn test_closed_feed_is_terminal() {
        let (handle, tx) = stub_handle_with_feed("vm-a");
        drop(tx);

        let err = wait_start(&handle, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BootFailure);
    }

    #[tokio::test]
    async fn test_timeout_releases_feed() {
        let (handle, _tx) = stub_handle_with_feed("vm-a");

        let err = wait_start(&handle, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(handle.acquire_status_feed().is_some());
    }

    #[tokio::test]
    async fn test_busy_feed_is_refused() {
        let (handle, _tx) = stub_handle_with_feed("vm-a");
        let held = handle.acquire_status_feed().unwrap();

        let err = wait_start(&handle, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BootFailure);
        drop(held);
    }
}
