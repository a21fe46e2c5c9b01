//! Helpers for Google Cloud Identity-Aware Proxy.

pub mod admin;
pub mod policy;
pub mod resolver;
pub mod secret;
pub mod verifier;

pub use self::{
    admin::{IamPolicy, IapPolicyClient},
    policy::{Binding, IapAppPolicy, InvalidResourceRef, Policy, ResourceRef, ServiceRef},
    resolver::{
        BackendService, BackendServiceLister, ComputeBackendServices, backend_iap_name,
        gcp_backend, gcp_backend_from_ingress, gcp_backend_from_service,
    },
    secret::{create_secret, oauth_client_secret},
    verifier::IapVerifier,
};

/// Header carrying the JWT that IAP signs for every proxied request.
pub const JWT_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Claim holding the authenticated user's email.
pub const EMAIL_CLAIM: &str = "email";
