pub type Result<T, E = IndexerError> = std::result::Result<T, E>;

/// Error taxonomy of the indexing pipeline.
///
/// The retryable variants (`NotFound`, `Transient`) make the scheduler
/// reschedule the affected seqno; everything else is permanent for the
/// failed unit of work and must not contaminate its peers.
#[derive(thiserror::Error, Debug)]
pub enum IndexerError {
    /// Resource is absent; callers may retry or skip.
    #[error("not found: {0}")]
    NotFound(&'static str),
    /// I/O or store timeout; the scheduler reschedules.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Structural decode failure; the seqno is skipped.
    #[error("malformed block: {0}")]
    MalformedBlock(#[source] anyhow::Error),
    /// VM fault during emulation or a get-method call.
    #[error("vm error: {0}")]
    Vm(String),
    /// A get-method ran but returned an unexpected shape.
    #[error("interface parse error: {0}")]
    InterfaceParse(&'static str),
    /// Short-circuit negative classification by code hash.
    #[error("code hash rejected")]
    CodeHashRejected,
    /// A transfer/burn payload did not match the expected schema.
    #[error("event parse error: {0}")]
    EventParse(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IndexerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Transient(_))
    }

    pub(crate) fn malformed(e: tycho_types::error::Error) -> Self {
        Self::MalformedBlock(anyhow::Error::new(e))
    }
}

impl From<tycho_types::error::Error> for IndexerError {
    fn from(e: tycho_types::error::Error) -> Self {
        Self::Internal(anyhow::Error::new(e))
    }
}
