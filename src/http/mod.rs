//! HTTP-layer adapter: key derivation and the admission middleware.

mod admission;
mod keys;

pub use admission::{
    AdmissionConfig, AdmissionConfigBuilder, AdmissionLayer, AdmissionPolicy, AdmissionService,
    HeaderMode, MultiLimit,
};
pub use keys::{client_ip, derive_key, derive_login_key, AuthContext, KeyStrategy};
