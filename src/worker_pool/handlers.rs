//! Result routing: what happens to a [`LlmResult`] once a worker gets one
//! back from the streaming executor (§4.3 "Result routing").

use std::time::Duration;

use rand::Rng as _;

use crate::{error::ErrorKind, model::LlmResult, prelude::*};

/// What a worker should do next with a finished attempt.
pub enum Routing {
    /// Store the result and notify the host; the request is done.
    Terminal(LlmResult),
    /// Sleep `backoff`, then re-enqueue with `retry_count` incremented.
    Retry { backoff: Duration, retry_count: u32 },
}

/// Decide how to route one [`LlmResult`], given the retry budgets already
/// spent and configured.
///
/// `retry_count` is the number of retries already used (0 on a first
/// attempt's failure). `retry_jitter` bounds the uniform random backoff
/// applied before a retry.
pub fn route_result(
    mut result: LlmResult,
    retry_count: u32,
    max_retries: u32,
    max_retries_json_parse: u32,
    retry_jitter: (Duration, Duration),
) -> Routing {
    if result.success {
        return Routing::Terminal(result);
    }

    let Some(kind) = result.error_kind else {
        return Routing::Terminal(result);
    };

    if !kind.is_retryable() {
        return Routing::Terminal(result);
    }

    let budget = if kind == ErrorKind::JsonParse {
        max_retries_json_parse
    } else {
        max_retries
    };

    let next_retry_count = retry_count + 1;
    if next_retry_count > budget {
        let exhausted_kind = format!("{kind}_max_retries_exceeded");
        result.error_message = Some(
            result
                .error_message
                .map(|msg| format!("{exhausted_kind}: {msg}"))
                .unwrap_or(exhausted_kind),
        );
        return Routing::Terminal(result);
    }

    let backoff = jitter_duration(retry_jitter);
    Routing::Retry {
        backoff,
        retry_count: next_retry_count,
    }
}

fn jitter_duration((low, high): (Duration, Duration)) -> Duration {
    if high <= low {
        return low;
    }
    let mut rng = rand::thread_rng();
    let low_secs = low.as_secs_f64();
    let high_secs = high.as_secs_f64();
    Duration::from_secs_f64(rng.gen_range(low_secs..high_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_result(kind: ErrorKind) -> LlmResult {
        LlmResult::failure("req-1", kind, "boom")
    }

    #[test]
    fn success_is_always_terminal() {
        let mut result = failing_result(ErrorKind::Unknown);
        result.success = true;
        result.error_kind = None;
        match route_result(result, 0, 5, 5, (Duration::from_secs(1), Duration::from_secs(3))) {
            Routing::Terminal(r) => assert!(r.success),
            Routing::Retry { .. } => panic!("expected terminal"),
        }
    }

    #[test]
    fn client_4xx_never_retries() {
        let result = failing_result(ErrorKind::Client4xx);
        match route_result(result, 0, 5, 5, (Duration::from_secs(1), Duration::from_secs(3))) {
            Routing::Terminal(_) => {}
            Routing::Retry { .. } => panic!("4xx must not retry"),
        }
    }

    #[test]
    fn retryable_error_retries_until_budget_exhausted() {
        let jitter = (Duration::from_millis(1), Duration::from_millis(2));
        match route_result(failing_result(ErrorKind::Server5xx), 0, 1, 1, jitter) {
            Routing::Retry { retry_count, .. } => assert_eq!(retry_count, 1),
            Routing::Terminal(_) => panic!("expected a retry within budget"),
        }
        match route_result(failing_result(ErrorKind::Server5xx), 1, 1, 1, jitter) {
            Routing::Terminal(r) => {
                assert_eq!(r.error_message.unwrap(), "5xx_max_retries_exceeded: boom");
            }
            Routing::Retry { .. } => panic!("expected budget exhaustion"),
        }
    }

    #[test]
    fn json_parse_uses_its_own_budget() {
        let jitter = (Duration::from_millis(1), Duration::from_millis(2));
        // max_retries=0 would exhaust instantly, but max_retries_json_parse=2 should
        // still allow a retry for JsonParse errors specifically.
        match route_result(failing_result(ErrorKind::JsonParse), 0, 0, 2, jitter) {
            Routing::Retry { retry_count, .. } => assert_eq!(retry_count, 1),
            Routing::Terminal(_) => panic!("json_parse budget should be independent"),
        }
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let jitter = (Duration::from_millis(1), Duration::from_millis(2));
        match route_result(failing_result(ErrorKind::Timeout), 0, 0, 0, jitter) {
            Routing::Terminal(_) => {}
            Routing::Retry { .. } => panic!("max_retries=0 must never retry"),
        }
    }
}
