//! Retry plumbing for calls that leave the process: the OCR and LLM
//! services and the database.
//!
//! Each client keeps its own error enum and decides per variant whether a
//! failure is worth another attempt. The helpers here adapt those plain
//! `Result`s to [`keen_retry`]'s attempt/outcome types and fold the final
//! verdict back, so the clients' code stays straight-line `?` style.

use core::fmt;

use keen_retry::{ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// Whether a failure may clear up on its own.
///
/// Implemented by each external-call error enum. Anything not positively
/// known to be transient is treated as final: optimistic retries against a
/// permanently broken dependency only add load and delay the run's
/// verdict.
pub(crate) trait Transience {
    fn is_transient(&self) -> bool;
}

/// Classify one attempt's outcome for the retry loop.
pub(crate) fn attempt<T, E>(result: Result<T, E>) -> RetryResult<(), (), T, E>
where
    E: Transience + fmt::Debug,
{
    match result {
        Ok(output) => RetryResult::Ok {
            reported_input: (),
            output,
        },
        Err(error) if error.is_transient() => {
            debug!("transient failure, eligible for retry: {:?}", error);
            RetryResult::Transient { input: (), error }
        }
        Err(error) => RetryResult::Fatal { input: (), error },
    }
}

/// Fold a finished retry loop back into an ordinary `Result`, keeping the
/// final cause and logging the attempts that led up to it.
pub(crate) fn settle<T, E>(resolved: ResolvedResult<(), (), T, E>) -> Result<T, E>
where
    E: fmt::Debug + fmt::Display,
{
    match resolved {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "call recovered after {} failed attempts: [{}]",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors),
            );
            Ok(output)
        }
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            error!(
                "call failed for good after {} attempts (earlier: [{}]): {}",
                retry_errors.len() + 1,
                keen_retry::loggable_retry_errors(&retry_errors),
                fatal_error,
            );
            Err(fatal_error)
        }
    }
}

/// Both external services signal overload the same way: 429 while rate
/// limiting, 5xx while degraded. Anything else in the 4xx range means the
/// request itself is wrong, and a retry would just repeat the mistake.
pub(crate) fn transient_http_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parse a `Retry-After` header value (in seconds) from a response.
pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
