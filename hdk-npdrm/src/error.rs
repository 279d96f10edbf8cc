use thiserror::Error;

#[derive(Debug, Error)]
pub enum NpdrmError {
    #[error("RAP must be 16 bytes, got {0}")]
    InvalidRap(usize),

    #[error("RIF is malformed: {0}")]
    InvalidRif(String),

    #[error("ACT.DAT is malformed: {0}")]
    InvalidActDat(String),

    #[error("IDPS must be 16 bytes, got {0}")]
    InvalidIdps(usize),

    #[error("activation key index {0} out of range")]
    ActKeyIndex(u32),

    #[error("RAP permutation box is not a permutation of 0..16")]
    InvalidPbox,
}
