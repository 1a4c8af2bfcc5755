use std::{future::Future, time::Duration};

use crate::error::Error;

/// Await `op` under an optional deadline. When the deadline fires the
/// callee future is dropped (cancelling it) and the call fails with
/// [`Error::Timeout`]; `None` means no deadline. Guards nest naturally:
/// an inner, shorter deadline fires first.
pub(crate) async fn op_timeout<T, F>(deadline: Option<Duration>, op: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        },
        None => op.await,
    }
}
