//! OAuth 2.1 building blocks for remote MCP servers.
//!
//! Covers authorization server discovery, dynamic client registration,
//! PKCE, the token endpoint, and the raw HTTP spoken on the loopback
//! redirect listener. Flow control lives in `mcp::oauth`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::core::builtin_oauth::{render_oauth_callback_page, OAuthCallbackVariant};
use crate::core::mcp_auth::{McpOAuthGrant, McpTokenStore, TokenStoreError};

/// Grants expiring within this many seconds are refreshed before use.
const REFRESH_LEEWAY_SECONDS: i64 = 60;
const CLIENT_NAME: &str = "toolrelay";
const DISCOVERY_DOCUMENTS: [&str; 3] = [
    "oauth-authorization-server",
    "openid-configuration",
    "oauth-protected-resource",
];

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{stage} request failed: {source}")]
    Http {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage} rejected ({status}): {body}")]
    Rejected {
        stage: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("stored grant for '{0}' has no token endpoint; authorize again")]
    MissingTokenEndpoint(String),
    #[error("random source unavailable: {0}")]
    Random(String),
    #[error("could not launch {program} for {url}")]
    Browser { program: &'static str, url: String },
    #[error(transparent)]
    Store(#[from] TokenStoreError),
}

/// Authorization server metadata (RFC 8414), or a protected-resource
/// document (RFC 9728) that delegates to one via `authorization_servers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    pub authorization_servers: Option<Vec<String>>,
}

impl AuthServerMetadata {
    fn is_usable(&self) -> bool {
        self.authorization_endpoint.is_some()
            || self.token_endpoint.is_some()
            || self.revocation_endpoint.is_some()
    }

    /// Space-separated scope list to request, if the server advertises any.
    pub fn requested_scope(&self) -> Option<String> {
        self.scopes_supported
            .as_ref()
            .filter(|scopes| !scopes.is_empty())
            .map(|scopes| scopes.join(" "))
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Fold this answer into `grant`. Fields the server left out keep their
    /// previous values, except the expiry, which is recomputed from
    /// `issued_at`.
    pub fn merge_into(self, grant: &McpOAuthGrant, issued_at: i64) -> McpOAuthGrant {
        McpOAuthGrant {
            expires_at_epoch_s: self.expires_in.and_then(|ttl| issued_at.checked_add(ttl)),
            refresh_token: self.refresh_token.or_else(|| grant.refresh_token.clone()),
            token_type: self.token_type.or_else(|| grant.token_type.clone()),
            scope: self.scope.or_else(|| grant.scope.clone()),
            access_token: self.access_token,
            ..grant.clone()
        }
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expires_soon(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.is_some_and(|at| at <= now.saturating_add(REFRESH_LEEWAY_SECONDS))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn parse_url(raw: &str) -> Result<Url, OAuthError> {
    Url::parse(raw).map_err(|err| OAuthError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

/// URL-safe, unpadded base64 of `len` random bytes.
pub fn random_token(len: usize) -> Result<String, OAuthError> {
    let mut bytes = vec![0_u8; len];
    getrandom::fill(&mut bytes).map_err(|err| OAuthError::Random(err.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub const METHOD: &'static str = "S256";

    pub fn generate() -> Result<Self, OAuthError> {
        Ok(Self::from_verifier(random_token(48)?))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// Query of the authorization request the user opens in a browser.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeQuery<'a> {
    pub client_id: Option<&'a str>,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub scope: Option<&'a str>,
    /// Sent as the RFC 8707 `resource` indicator.
    pub resource: Option<&'a str>,
}

pub fn authorization_url(endpoint: &str, query: AuthorizeQuery<'_>) -> Result<Url, OAuthError> {
    let mut url = parse_url(endpoint)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("response_type", "code");
        if let Some(client_id) = non_blank(query.client_id) {
            pairs.append_pair("client_id", client_id);
        }
        pairs
            .append_pair("redirect_uri", query.redirect_uri)
            .append_pair("state", query.state)
            .append_pair("code_challenge", query.code_challenge)
            .append_pair("code_challenge_method", Pkce::METHOD);
        if let Some(scope) = non_blank(query.scope) {
            pairs.append_pair("scope", scope);
        }
        if let Some(resource) = query.resource {
            pairs.append_pair("resource", resource);
        }
    }
    Ok(url)
}

/// Well-known metadata locations on the origin of `base_url`, or `None`
/// when it is not an HTTP(S) URL with a host.
fn discovery_urls(base_url: &str) -> Result<Option<Vec<String>>, OAuthError> {
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Ok(None);
    }
    let url = parse_url(base_url)?;
    let Some(host) = url.host_str() else {
        return Ok(None);
    };
    let origin = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    Ok(Some(
        DISCOVERY_DOCUMENTS
            .iter()
            .map(|document| format!("{origin}/.well-known/{document}"))
            .collect(),
    ))
}

/// Client for the authorization server's endpoints.
#[derive(Debug, Clone, Default)]
pub struct OAuthHttp {
    client: reqwest::Client,
}

impl OAuthHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find authorization server metadata for an MCP endpoint, following a
    /// protected-resource document to the servers it names.
    pub async fn discover(&self, base_url: &str) -> Result<Option<AuthServerMetadata>, OAuthError> {
        let Some(candidates) = discovery_urls(base_url)? else {
            return Ok(None);
        };
        for candidate in candidates {
            let Some(document) = self.fetch_metadata(&candidate).await else {
                continue;
            };
            if document.is_usable() {
                return Ok(Some(document));
            }
            for issuer in document.authorization_servers.iter().flatten() {
                let issuer = issuer.trim_end_matches('/');
                let location = format!("{issuer}/.well-known/oauth-authorization-server");
                let Some(mut delegated) = self.fetch_metadata(&location).await else {
                    continue;
                };
                delegated.issuer.get_or_insert_with(|| issuer.to_string());
                if delegated.is_usable() {
                    return Ok(Some(delegated));
                }
            }
        }
        Ok(None)
    }

    async fn fetch_metadata(&self, url: &str) -> Option<AuthServerMetadata> {
        let response = self.client.get(url).send().await.ok()?;
        let response = response.error_for_status().ok()?;
        match response.json().await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                debug!(url, error = %err, "Ignoring unparseable OAuth metadata");
                None
            }
        }
    }

    /// Dynamic client registration (RFC 7591) as a public client.
    pub async fn register_client(
        &self,
        registration_endpoint: &str,
        redirect_uri: &str,
    ) -> Result<String, OAuthError> {
        #[derive(Deserialize)]
        struct Registered {
            client_id: String,
        }

        const STAGE: &str = "client registration";
        let body = serde_json::json!({
            "client_name": CLIENT_NAME,
            "redirect_uris": [redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none",
        });
        let response = self
            .client
            .post(registration_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|source| OAuthError::Http {
                stage: STAGE,
                source,
            })?;
        let registered: Registered = read_json(STAGE, response).await?;
        Ok(registered.client_id)
    }

    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        client_id: Option<&str>,
        redirect_uri: &str,
        code: &str,
        verifier: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let form = vec![
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("code", code),
            ("code_verifier", verifier),
        ];
        self.token_request("token exchange", token_endpoint, client_id, form)
            .await
    }

    pub async fn refresh(
        &self,
        token_endpoint: &str,
        client_id: Option<&str>,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request("token refresh", token_endpoint, client_id, form)
            .await
    }

    async fn token_request<'a>(
        &self,
        stage: &'static str,
        token_endpoint: &str,
        client_id: Option<&'a str>,
        mut form: Vec<(&'static str, &'a str)>,
    ) -> Result<TokenResponse, OAuthError> {
        if let Some(client_id) = non_blank(client_id) {
            form.push(("client_id", client_id));
        }
        let response = self
            .client
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|source| OAuthError::Http { stage, source })?;
        read_json(stage, response).await
    }
}

async fn read_json<T: DeserializeOwned>(
    stage: &'static str,
    response: reqwest::Response,
) -> Result<T, OAuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::Rejected {
            stage,
            status,
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|source| OAuthError::Http { stage, source })
}

/// Access token to present for `server_id`.
///
/// A stored grant that expires within the leeway and carries a refresh
/// token is refreshed first, and the new grant is written back. Without a
/// grant this returns `Ok(None)` and callers fall back to a bare token.
pub async fn fresh_access_token(
    http: &OAuthHttp,
    store: &McpTokenStore,
    server_id: &str,
) -> Result<Option<String>, OAuthError> {
    let Some(grant) = store.grant(server_id)? else {
        return Ok(None);
    };
    let now = unix_now();
    let Some(refresh_token) = grant
        .refresh_token
        .clone()
        .filter(|_| expires_soon(grant.expires_at_epoch_s, now))
    else {
        return Ok(Some(grant.access_token));
    };
    let token_endpoint = grant
        .token_endpoint
        .as_deref()
        .ok_or_else(|| OAuthError::MissingTokenEndpoint(server_id.to_string()))?;

    debug!(server_id, "Refreshing MCP OAuth access token");
    let token = http
        .refresh(token_endpoint, grant.client_id.as_deref(), &refresh_token)
        .await?;
    let refreshed = token.merge_into(&grant, now);
    store.store_grant(server_id, &refreshed)?;
    store.store_access_token(server_id, &refreshed.access_token)?;
    Ok(Some(refreshed.access_token))
}

/// Hand `url` to the desktop's default browser.
pub fn open_in_browser(url: &str) -> Result<(), OAuthError> {
    let (program, leading_args): (&'static str, &[&str]) = if cfg!(target_os = "macos") {
        ("open", &[])
    } else if cfg!(windows) {
        ("cmd", &["/C", "start", ""])
    } else {
        ("xdg-open", &[])
    };
    let launched = std::process::Command::new(program)
        .args(leading_args)
        .arg(url)
        .status()
        .is_ok_and(|status| status.success());
    if launched {
        Ok(())
    } else {
        Err(OAuthError::Browser {
            program,
            url: url.to_string(),
        })
    }
}

/// Path and OAuth parameters of a request that reached the redirect URI.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    pub path: String,
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackQuery {
    /// Parse the request line of a raw HTTP request. Anything that is not
    /// `METHOD /origin-form-target ...` yields `None`.
    pub fn from_request(raw: &str) -> Option<Self> {
        let target = raw.lines().next()?.split_whitespace().nth(1)?;
        if !target.starts_with('/') {
            return None;
        }
        let url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;
        let mut query = Self {
            path: url.path().to_string(),
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "state" => &mut query.state,
                "code" => &mut query.code,
                "error" => &mut query.error,
                "error_description" => &mut query.error_description,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        Some(query)
    }
}

/// Answer a callback request with the rendered result page.
pub async fn write_callback_page<W: AsyncWrite + Unpin>(
    stream: &mut W,
    variant: OAuthCallbackVariant,
    heading: &str,
    detail: &str,
) -> std::io::Result<()> {
    let status = match variant {
        OAuthCallbackVariant::Success => "200 OK",
        OAuthCallbackVariant::Error => "400 Bad Request",
    };
    let page = render_oauth_callback_page("toolrelay OAuth", heading, detail, variant);
    write_response(stream, status, Some("text/html; charset=utf-8"), &page).await
}

pub async fn write_not_found<W: AsyncWrite + Unpin>(stream: &mut W) -> std::io::Result<()> {
    write_response(stream, "404 Not Found", None, "").await
}

async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: &str,
    content_type: Option<&str>,
    body: &str,
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {status}\r\n");
    if let Some(content_type) = content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}
