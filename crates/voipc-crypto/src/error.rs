use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("packet too short for the sealed-frame wrapper: got {0} bytes")]
    FrameTooShort(usize),

    #[error("AEAD authentication failed")]
    AuthenticationFailed,

    #[error("RNG failure while generating key material")]
    RngFailure,
}
