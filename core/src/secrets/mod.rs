//! Credential confidentiality: the process key and the cipher built on it.

pub mod cipher;
pub mod key;

pub use cipher::CredentialCipher;
pub use key::KeyProvider;
