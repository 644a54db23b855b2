//! Crate-wide error type.

/// Failures surfaced by the crawl engine and configuration store.
///
/// Per-URL failures (`Transport`, `HttpStatus`) are recovered locally by the
/// runtime: they are counted and emitted on the result stream, never aborting
/// a run. Lifecycle failures (`InvalidInput`, `Fatal`, `SimulationRejected`)
/// surface to the caller. `PolicyReject` marks a silent admission drop.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rejected by crawl policy: {0}")]
    PolicyReject(String),

    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("http status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("configuration simulation rejected: {0}")]
    SimulationRejected(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// True for errors the runtime swallows during admission (not failures).
    pub fn is_policy_reject(&self) -> bool {
        matches!(self, Error::PolicyReject(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
