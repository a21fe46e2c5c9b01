//! OAuth2 and OpenID Connect login flows for command line tools and local
//! development servers.

use n0_error::{Result, StdResultExt};

pub mod cache;
pub mod completion;
pub mod cookies;
pub mod credentials;
pub mod handlers;
pub mod oidc;
pub mod proxy;
pub mod token;
pub mod webflow;

pub use self::{
    cache::{CachedOidcLogin, FileTokenCache, TokenCache},
    completion::{Completion, completion},
    credentials::ClientCredentials,
    handlers::{AuthCodeFlow, AuthRedirect, CallbackError, CallbackParams, OAuthHandlers},
    oidc::{
        CommonClaims, IdTokenSource, IdTokenVerifier, OidcHandlers, OidcProvider,
        VerifiedIdToken, VerifyError,
    },
    proxy::{Proxy, Session, SessionStore},
    token::{RefreshingTokenSource, StaticTokenSource, Token, TokenRefresher, TokenSource},
    webflow::{BrowserOpener, WebFlowServer, WebFlowTimeouts},
};

pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// Scopes requested when none are configured.
pub fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// HTTP client for talking to identity providers.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        // Following redirects opens the client up to SSRF vulnerabilities.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .std_context("Failed to build HTTP client")
}

pub(crate) mod types {
    use oauth2::basic::BasicClient;
    use openidconnect::core::*;
    use openidconnect::*;

    /// An [`openidconnect::Client`] with all generics filled in.
    pub(crate) type OidcClient = Client<
        EmptyAdditionalClaims,
        CoreAuthDisplay,
        CoreGenderClaim,
        CoreJweContentEncryptionAlgorithm,
        CoreJsonWebKey,
        CoreAuthPrompt,
        StandardErrorResponse<CoreErrorResponseType>,
        StandardTokenResponse<
            IdTokenFields<
                EmptyAdditionalClaims,
                EmptyExtraTokenFields,
                CoreGenderClaim,
                CoreJweContentEncryptionAlgorithm,
                CoreJwsSigningAlgorithm,
            >,
            CoreTokenType,
        >,
        StandardTokenIntrospectionResponse<EmptyExtraTokenFields, CoreTokenType>,
        CoreRevocableToken,
        StandardErrorResponse<RevocationErrorResponseType>,
        EndpointSet,
        EndpointNotSet,
        EndpointNotSet,
        EndpointNotSet,
        EndpointMaybeSet,
        EndpointMaybeSet,
    >;

    /// A plain OAuth2 client with authorization and token endpoints.
    pub(crate) type OAuthClient =
        BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;
}
