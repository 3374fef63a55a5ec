//! OAuth2/OIDC authenticator.
//!
//! Drives the login state machine: `unauthenticated → authorizing →
//! callback-pending → authenticated`, with every state able to fall back to
//! `unauthenticated` on error or logout. Ordering within one attempt is
//! enforced by the encrypted, expiring login state the client carries, not by
//! any server-side session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::CookieJar;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::ConfigV1;

use super::claims::{ClaimsError, ClaimsProcessor, Details};
use super::cookies::{CookieTransport, CredentialStorage, ERROR_COOKIE, STATE_COOKIE};
use super::provider::{OidcProvider, ProviderError};
use super::state::{LoginState, StateCodec};

const LOGIN_STATE_TTL_SECS: i64 = 300;
const INDEX_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Error taxonomy. The user only ever sees `user_message`; full detail stays
/// in server logs.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Expired or mismatched login state, provider-reported denial, missing
    /// consent. The user can simply retry.
    #[error("{0}")]
    UserRecoverable(String),
    /// The provider rejected the requested scopes; an operator has to fix the
    /// scope configuration.
    #[error("{0}")]
    ScopeConfiguration(String),
    /// Crypto, discovery, exchange or cache-construction failures.
    #[error("{0}")]
    Internal(String),
}

impl AuthError {
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::UserRecoverable(_) => "Sign-in failed. Please try again.",
            AuthError::ScopeConfiguration(_) => {
                "The identity provider rejected the requested scopes. \
                 Review the provider's scope configuration."
            }
            AuthError::Internal(_) => "Sign-in failed due to an internal error.",
        }
    }

    fn log(&self) {
        match self {
            AuthError::UserRecoverable(detail) => debug!("Recoverable sign-in failure: {}", detail),
            AuthError::ScopeConfiguration(detail) => warn!("Scope configuration: {}", detail),
            AuthError::Internal(detail) => error!("Sign-in failure: {}", detail),
        }
    }
}

/// Outcome of authenticating an `/api/*` request.
pub enum ApiAuthOutcome {
    Authenticated {
        details: Details,
        /// Sealed storage to rewrite into cookies after a token refresh.
        refreshed_storage: Option<String>,
    },
    Unauthorized {
        /// The access token was confirmed invalid (not merely unverifiable);
        /// storage cookies should be deleted to force re-login.
        clear_storage: bool,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
}

pub struct Authenticator {
    provider: Arc<OidcProvider>,
    codec: StateCodec,
    pub cookies: CookieTransport,
    claims: ClaimsProcessor,
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    provider_name: String,
}

impl Authenticator {
    pub fn new(config: &ConfigV1, provider: Arc<OidcProvider>) -> Result<Self, ClaimsError> {
        let p = &config.provider;
        Ok(Authenticator {
            provider,
            codec: StateCodec::new(&p.client_secret),
            cookies: CookieTransport::new(
                !config.session.insecure_cookies,
                config.session.duration_secs,
            ),
            claims: ClaimsProcessor::new(&p.claims)?,
            http: reqwest::Client::new(),
            client_id: p.client_id.clone(),
            client_secret: p.client_secret.clone(),
            redirect_url: p.redirect_url.clone(),
            scopes: p.scopes.clone(),
            provider_name: p.name.clone(),
        })
    }

    /// `GET /oauth2/authorize`: mint a login state, store it in the state
    /// cookie and the OAuth2 `state` parameter, redirect to the provider with
    /// a PKCE S256 challenge and a fresh nonce.
    pub async fn authorize(&self, jar: CookieJar, raw_query: Option<&str>) -> Response {
        let endpoints = match self.provider.endpoints().await {
            Ok(e) => e,
            Err(e) => {
                return self.error_redirect(
                    jar,
                    "/",
                    AuthError::Internal(format!("authorize: {}", e)),
                )
            }
        };

        let pkce_verifier = random_token(48);
        let state = LoginState {
            pkce_verifier: pkce_verifier.clone(),
            csrf_token: uuid::Uuid::new_v4().to_string(),
            nonce: random_token(16),
            query: parse_query(raw_query),
            expiry: Utc::now() + chrono::Duration::seconds(LOGIN_STATE_TTL_SECS),
        };

        let encoded = match self.codec.encode(&state) {
            Ok(e) => e,
            Err(e) => {
                return self.error_redirect(
                    jar,
                    "/",
                    AuthError::Internal(format!("failed to encode login state: {}", e)),
                )
            }
        };

        let mut authorize_url = match Url::parse(&endpoints.authorization_endpoint) {
            Ok(u) => u,
            Err(e) => {
                return self.error_redirect(
                    jar,
                    "/",
                    AuthError::Internal(format!("bad authorization endpoint: {}", e)),
                )
            }
        };
        authorize_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", &encoded)
            .append_pair("nonce", &state.nonce)
            .append_pair("code_challenge", &code_challenge_s256(&pkce_verifier))
            .append_pair("code_challenge_method", "S256");

        let jar = jar
            .add(self.cookies.state_cookie(encoded))
            .add(self.cookies.provider_cookie(&self.provider_name));
        (jar, Redirect::to(authorize_url.as_str())).into_response()
    }

    /// `GET /oauth2/callback`: validate state, exchange the code, verify the
    /// token, persist credentials, redirect to the original path.
    ///
    /// Provider errors are classified first, but not answered until the
    /// redirect target has been recovered from state, so even a failed login
    /// lands the user back on a real page.
    pub async fn callback(&self, jar: CookieJar, raw_query: Option<&str>) -> Response {
        let params = parse_query(raw_query);
        let first = |name: &str| -> Option<String> {
            params.get(name).and_then(|v| v.first()).cloned()
        };
        let query_state = first("state");

        // Best-effort redirect recovery. The decoded copy is not trusted for
        // authentication until it matches the cookie below.
        let recovered = query_state
            .as_deref()
            .and_then(|s| self.codec.decode(s).ok());
        let target = recovered
            .as_ref()
            .map(|s| s.redirect_path())
            .unwrap_or_else(|| "/".to_string());

        if let Some(code) = first("error") {
            let description = first("error_description").unwrap_or_default();
            return self.error_redirect(jar, &target, classify_provider_error(&code, &description));
        }

        let Some(query_state) = query_state else {
            return self.error_redirect(
                jar,
                &target,
                AuthError::UserRecoverable("callback without a state parameter".into()),
            );
        };

        let cookie_state = jar
            .get(STATE_COOKIE)
            .map(|c| c.value().to_string())
            .unwrap_or_default();
        if cookie_state.is_empty() {
            // Cookie expired: the attempt is invalid even if the query copy
            // still decodes.
            return self.error_redirect(
                jar,
                &target,
                AuthError::UserRecoverable("login state cookie expired".into()),
            );
        }
        if cookie_state != query_state {
            return self.error_redirect(
                jar,
                &target,
                AuthError::UserRecoverable("state parameter does not match state cookie".into()),
            );
        }

        let state = match self.codec.decode(&query_state) {
            Ok(s) => s,
            Err(e) => {
                return self.error_redirect(
                    jar,
                    &target,
                    AuthError::UserRecoverable(format!("undecodable login state: {}", e)),
                )
            }
        };
        if state.is_expired() {
            return self.error_redirect(
                jar,
                &target,
                AuthError::UserRecoverable("login state expired".into()),
            );
        }

        let Some(code) = first("code") else {
            return self.error_redirect(
                jar,
                &target,
                AuthError::UserRecoverable("callback without an authorization code".into()),
            );
        };

        match self.complete_login(&code, &state).await {
            Ok(storage) => {
                let sealed = match self.codec.seal_json(&storage) {
                    Ok(s) => s,
                    Err(e) => {
                        return self.error_redirect(
                            jar,
                            &target,
                            AuthError::Internal(format!("failed to seal storage: {}", e)),
                        )
                    }
                };
                let jar = match self.cookies.set_storage(jar, &sealed) {
                    Ok(j) => j,
                    Err(e) => {
                        return self.error_redirect(
                            CookieJar::new(),
                            &target,
                            AuthError::Internal(format!("failed to store credentials: {}", e)),
                        )
                    }
                };
                let jar = jar.remove(self.cookies.clear_state_cookie());
                (jar, Redirect::to(&state.redirect_path())).into_response()
            }
            Err(e) => self.error_redirect(jar, &target, e),
        }
    }

    async fn complete_login(
        &self,
        code: &str,
        state: &LoginState,
    ) -> Result<CredentialStorage, AuthError> {
        let endpoints = self
            .provider
            .endpoints()
            .await
            .map_err(|e| AuthError::Internal(format!("callback: {}", e)))?;

        let response = self
            .http
            .post(&endpoints.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.redirect_url),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("code_verifier", &state.pkce_verifier),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Internal(format!("code exchange: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Internal(format!(
                "code exchange returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("code exchange body: {}", e)))?;
        let id_token = token
            .id_token
            .ok_or_else(|| AuthError::Internal("token response without id_token".into()))?;

        // Nonce equality against the original login nonce.
        self.provider
            .verify(&id_token, Some(&state.nonce))
            .await
            .map_err(|e| AuthError::Internal(format!("token verification: {}", e)))?;

        Ok(CredentialStorage {
            access_token: id_token,
            refresh_token: token.refresh_token.unwrap_or_default(),
            session_start: Utc::now(),
        })
    }

    /// Authentication for `/api/*` requests: verify the stored token, fall
    /// back to one refresh-token exchange, never retry beyond that.
    pub async fn authenticate_api(&self, jar: &CookieJar) -> ApiAuthOutcome {
        let Some(sealed) = self.cookies.read_storage(jar) else {
            return ApiAuthOutcome::Unauthorized {
                clear_storage: false,
            };
        };
        let storage: CredentialStorage = match self.codec.open_json(&sealed) {
            Ok(s) => s,
            Err(e) => {
                debug!("Unreadable credential storage, forcing re-login: {}", e);
                return ApiAuthOutcome::Unauthorized {
                    clear_storage: true,
                };
            }
        };

        match self.verify_to_details(&storage).await {
            Ok(details) => ApiAuthOutcome::Authenticated {
                details,
                refreshed_storage: None,
            },
            Err(verify_err) => {
                let confirmed_invalid = matches!(
                    verify_err,
                    ProviderError::Verification(_) | ProviderError::NonceMismatch
                );
                if storage.refresh_token.is_empty() {
                    debug!("Access token rejected and no refresh token: {}", verify_err);
                    return ApiAuthOutcome::Unauthorized {
                        clear_storage: confirmed_invalid,
                    };
                }
                match self.refresh(&storage).await {
                    Ok(refreshed) => match self.verify_to_details(&refreshed).await {
                        Ok(details) => {
                            let refreshed_storage = self.codec.seal_json(&refreshed).ok();
                            ApiAuthOutcome::Authenticated {
                                details,
                                refreshed_storage,
                            }
                        }
                        Err(e) => {
                            debug!("Refreshed token failed verification: {}", e);
                            ApiAuthOutcome::Unauthorized {
                                clear_storage: true,
                            }
                        }
                    },
                    Err(e) => {
                        debug!("Refresh-token exchange failed: {}", e);
                        ApiAuthOutcome::Unauthorized {
                            clear_storage: confirmed_invalid,
                        }
                    }
                }
            }
        }
    }

    async fn verify_to_details(
        &self,
        storage: &CredentialStorage,
    ) -> Result<Details, ProviderError> {
        // No nonce on re-verification: the login nonce was consumed at
        // callback time and refreshed tokens do not carry it.
        let claims = self.provider.verify(&storage.access_token, None).await?;
        self.claims
            .process(&claims, storage.session_start)
            .map_err(|e| ProviderError::Verification(format!("claims processing: {}", e)))
    }

    async fn refresh(&self, storage: &CredentialStorage) -> Result<CredentialStorage, AuthError> {
        let endpoints = self
            .provider
            .endpoints()
            .await
            .map_err(|e| AuthError::Internal(format!("refresh: {}", e)))?;

        let response = self
            .http
            .post(&endpoints.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &storage.refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Internal(format!("refresh exchange: {}", e)))?;
        if !response.status().is_success() {
            return Err(AuthError::Internal(format!(
                "refresh exchange returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("refresh body: {}", e)))?;
        let id_token = token
            .id_token
            .ok_or_else(|| AuthError::Internal("refresh response without id_token".into()))?;

        Ok(CredentialStorage {
            access_token: id_token,
            // Some providers rotate the refresh token on use.
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| storage.refresh_token.clone()),
            session_start: storage.session_start,
        })
    }

    /// Best-effort identity lookup for page rendering. Bounded so a slow
    /// provider cannot stall the index response.
    ///
    /// The caller must write any returned sealed storage back into cookies:
    /// providers may rotate the refresh token on use, and dropping the
    /// rotated storage would strand the session on a burned token.
    pub async fn check_identity(&self, jar: &CookieJar) -> Option<(Details, Option<String>)> {
        match tokio::time::timeout(INDEX_AUTH_TIMEOUT, self.authenticate_api(jar)).await {
            Ok(ApiAuthOutcome::Authenticated {
                details,
                refreshed_storage,
            }) => Some((details, refreshed_storage)),
            Ok(ApiAuthOutcome::Unauthorized { .. }) => None,
            Err(_) => {
                debug!("Identity check timed out; rendering unauthenticated");
                None
            }
        }
    }

    /// `POST /logout`: clear every storage cookie.
    pub fn logout(&self, jar: CookieJar) -> Response {
        let jar = self.cookies.clear_storage(jar);
        (jar, Redirect::to("/")).into_response()
    }

    fn error_redirect(&self, jar: CookieJar, target: &str, err: AuthError) -> Response {
        err.log();
        let jar = jar
            .add(self.cookies.hint_cookie(ERROR_COOKIE, &err.user_message()))
            .remove(self.cookies.clear_state_cookie());
        (jar, Redirect::to(target)).into_response()
    }
}

fn classify_provider_error(code: &str, description: &str) -> AuthError {
    let detail = format!("provider returned {}: {}", code, description);
    if code == "invalid_scope" {
        return AuthError::ScopeConfiguration(detail);
    }
    if code == "access_denied" || code.ends_with("_required") {
        return AuthError::UserRecoverable(detail);
    }
    AuthError::Internal(detail)
}

/// URL-safe random token of `bytes` entropy bytes.
fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// PKCE S256: `BASE64URL(SHA256(verifier))`.
fn code_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn parse_query(raw: Option<&str>) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let Some(raw) = raw else {
        return map;
    };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_challenge_matches_rfc7636_appendix_b() {
        // Verifier and challenge from RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge_s256(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_tokens_are_distinct_and_url_safe() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn query_parsing_keeps_repeated_keys() {
        let parsed = parse_query(Some("a=1&b=2&a=3"));
        assert_eq!(parsed["a"], vec!["1", "3"]);
        assert_eq!(parsed["b"], vec!["2"]);
    }

    #[test]
    fn provider_error_classification() {
        assert!(matches!(
            classify_provider_error("invalid_scope", "scope not allowed"),
            AuthError::ScopeConfiguration(_)
        ));
        assert!(matches!(
            classify_provider_error("access_denied", ""),
            AuthError::UserRecoverable(_)
        ));
        assert!(matches!(
            classify_provider_error("consent_required", ""),
            AuthError::UserRecoverable(_)
        ));
        assert!(matches!(
            classify_provider_error("server_error", "boom"),
            AuthError::Internal(_)
        ));
    }
}
