use thiserror::Error;

/// Classification of upstream REST failures. All variants are transient:
/// callers back off and retry via the rate-limit tracker, never surface
/// them to downstream clients.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("rate limited (HTTP {0})")]
    RateLimited(u16),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}
