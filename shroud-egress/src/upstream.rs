//! Upstream dialing: attempt-list construction and the fallback cascade.

use std::time::Duration;

use shroud_proto::addr::{Endpoint, FallbackAddr};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Dial failures surfaced to the session as an `ERROR` frame.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("connect timeout to {target} after {ms}ms")]
    Timeout { target: Endpoint, ms: u64 },
    #[error("all {attempts} connect attempts failed, last: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Classify an upstream dial failure as a transient relay-infrastructure
/// error worth cascading past.
///
/// The upstream stack does not expose typed errors for these conditions, so
/// the classification is a case-insensitive message match kept behind this
/// one predicate.
pub fn is_transient_dial_error(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("proxy request") || msg.contains("cannot connect") || msg.contains("cloudflare")
}

/// Build the ordered attempt list for a CONNECT target.
///
/// An IP-literal target is dialed as-is with no fallbacks. A named target is
/// tried first, then each fallback in order; fallbacks without a port
/// inherit the target port.
pub fn build_attempts(target: &Endpoint, fallbacks: &[FallbackAddr]) -> Vec<Endpoint> {
    if target.is_ip_literal() {
        return vec![target.clone()];
    }
    let mut attempts = Vec::with_capacity(1 + fallbacks.len());
    attempts.push(target.clone());
    attempts.extend(fallbacks.iter().map(|fb| fb.endpoint(target.port)));
    attempts
}

/// Dial the attempt list in order. A transient failure moves to the next
/// attempt; any other failure stops the cascade.
pub async fn dial_cascade(
    attempts: &[Endpoint],
    connect_timeout_ms: u64,
) -> Result<(TcpStream, Endpoint), DialError> {
    let dial_timeout = Duration::from_millis(connect_timeout_ms);
    let mut last_err = String::new();

    for (i, attempt) in attempts.iter().enumerate() {
        debug!(target = %attempt, attempt = i + 1, total = attempts.len(), "dialing upstream");
        let result = timeout(
            dial_timeout,
            TcpStream::connect((attempt.host.as_str(), attempt.port)),
        )
        .await;

        let err = match result {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(target = %attempt, error = %e, "failed to set TCP_NODELAY");
                }
                return Ok((stream, attempt.clone()));
            }
            Ok(Err(e)) => DialError::Connect {
                target: attempt.clone(),
                source: e,
            },
            Err(_) => DialError::Timeout {
                target: attempt.clone(),
                ms: connect_timeout_ms,
            },
        };

        let msg = err.to_string();
        if is_transient_dial_error(&msg) {
            warn!(target = %attempt, error = %msg, "transient dial failure, trying fallback");
            last_err = msg;
            continue;
        }
        return Err(err);
    }

    Err(DialError::Exhausted {
        attempts: attempts.len(),
        last: last_err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(is_transient_dial_error("Proxy request failed"));
        assert!(is_transient_dial_error("cannot connect to cloudflare"));
        assert!(is_transient_dial_error("blocked by Cloudflare edge"));
        assert!(!is_transient_dial_error("connection refused"));
        assert!(!is_transient_dial_error("network unreachable"));
    }

    #[test]
    fn ip_literal_target_has_no_fallbacks() {
        let fallbacks = vec![FallbackAddr::parse("1.2.3.4:21415").unwrap()];
        let attempts = build_attempts(&Endpoint::new("9.9.9.9", 443), &fallbacks);
        assert_eq!(attempts, vec![Endpoint::new("9.9.9.9", 443)]);
    }

    #[test]
    fn named_target_appends_fallbacks_with_port_inheritance() {
        let fallbacks = vec![
            FallbackAddr::parse("1.2.3.4:21415").unwrap(),
            FallbackAddr::parse("proxy.example.net").unwrap(),
        ];
        let attempts = build_attempts(&Endpoint::new("cloudflare.com", 443), &fallbacks);
        assert_eq!(
            attempts,
            vec![
                Endpoint::new("cloudflare.com", 443),
                Endpoint::new("1.2.3.4", 21415),
                Endpoint::new("proxy.example.net", 443),
            ]
        );
    }

    #[test]
    fn v6_literal_target_short_circuits() {
        let fallbacks = vec![FallbackAddr::parse("1.2.3.4:21415").unwrap()];
        let attempts = build_attempts(&Endpoint::new("2001:db8::1", 443), &fallbacks);
        assert_eq!(attempts.len(), 1);
    }
}
