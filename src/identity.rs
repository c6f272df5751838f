use std::{env, fmt};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::{
    general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL},
    Engine,
};
use serde::Deserialize;
use serde_json::Value;

/// Environment variable holding an ambient OIDC identity token.
pub const AMBIENT_TOKEN_VAR: &str = "SIGSTORE_ID_TOKEN";

/// An opaque, time-bounded OIDC identity token.
///
/// Claims are read without validating the token signature; the certificate
/// authority is responsible for that.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

/// Unverified claims carried by an identity token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    /// Token issuer
    pub iss: Option<String>,
    /// Subject
    pub sub: Option<String>,
    /// Email address, when the provider includes it
    pub email: Option<String>,
    /// Expiry as unix seconds
    pub exp: Option<i64>,
}

impl IdentityToken {
    /// Wraps raw token text.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().trim().to_owned())
    }

    /// The raw token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes the JWT payload segment.
    pub fn claims(&self) -> Result<Claims> {
        let mut parts = self.0.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => bail!("Identity token is not a JWT"),
        };

        let decoded = BASE64_URL
            .decode(payload.trim_end_matches('='))
            .or_else(|_| BASE64.decode(payload))
            .map_err(|e| anyhow!("Failed to decode JWT payload: {e}"))?;

        serde_json::from_slice(&decoded).map_err(|e| anyhow!("Failed to parse JWT claims: {e}"))
    }

    /// The identity the certificate authority binds the certificate to.
    ///
    /// This is the value signed as proof of possession: the `email` claim when
    /// present, otherwise `sub`.
    pub fn subject(&self) -> Result<String> {
        let claims = self.claims()?;
        claims
            .email
            .or(claims.sub)
            .ok_or_else(|| anyhow!("Identity token has neither an 'email' nor a 'sub' claim"))
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(<redacted>)")
    }
}

impl From<String> for IdentityToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

impl From<&str> for IdentityToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// Source of identity tokens used when the caller does not supply one.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Obtains a fresh identity token.
    async fn obtain_token(&self) -> Result<IdentityToken>;
}

/// OIDC identity provider configured with an issuer and client credentials.
///
/// Uses an ambient token from [`AMBIENT_TOKEN_VAR`] when set. Otherwise, with a
/// client secret, performs the client-credentials grant against the issuer's
/// token endpoint. Interactive login is not supported.
#[derive(Clone)]
pub struct OidcProvider {
    issuer: String,
    client_id: String,
    client_secret: Option<String>,
    ambient_var: Option<String>,
    client: reqwest::Client,
}

impl fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcProvider")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("ambient_var", &self.ambient_var)
            .finish()
    }
}

#[derive(Deserialize)]
struct Discovery {
    token_endpoint: String,
}

impl OidcProvider {
    /// Creates a provider for the given issuer.
    pub fn new(issuer: String, client_id: String, client_secret: Option<String>) -> Self {
        Self {
            issuer: issuer.trim_end_matches('/').to_owned(),
            client_id,
            client_secret,
            ambient_var: Some(AMBIENT_TOKEN_VAR.to_owned()),
            client: reqwest::Client::new(),
        }
    }

    /// Overrides the environment variable checked for an ambient token.
    /// `None` disables ambient tokens.
    pub fn with_ambient_var(mut self, var: Option<String>) -> Self {
        self.ambient_var = var;
        self
    }

    /// The configured issuer URL.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn token_endpoint(&self) -> Result<String> {
        let url = format!("{}/.well-known/openid-configuration", self.issuer);
        log::trace!("Fetching OIDC discovery document from {url}");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("OIDC discovery failed with status {status}: {text}");
        }

        let discovery: Discovery = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse OIDC discovery document: {e}"))?;

        Ok(discovery.token_endpoint)
    }

    async fn client_credentials(&self, client_secret: &str) -> Result<IdentityToken> {
        let token_endpoint = self.token_endpoint().await?;
        log::debug!("Requesting identity token from {token_endpoint}");

        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", client_secret)
            .append_pair("scope", "openid email")
            .finish();

        let response = self
            .client
            .post(&token_endpoint)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            bail!("Token request failed with status {status}: {text}");
        }

        let response: Value = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse token response: {e}"))?;

        // Prefer the OIDC id_token; some issuers only return an access token.
        let token = response
            .get("id_token")
            .or_else(|| response.get("access_token"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Token response has no 'id_token' or 'access_token'"))?;

        Ok(IdentityToken::new(token))
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn obtain_token(&self) -> Result<IdentityToken> {
        if let Some(var) = &self.ambient_var {
            if let Ok(token) = env::var(var) {
                if !token.trim().is_empty() {
                    log::info!("Using ambient identity token from {var}");
                    return Ok(IdentityToken::new(token));
                }
            }
        }

        match &self.client_secret {
            Some(secret) => {
                let token = self.client_credentials(secret).await?;
                log::info!("Obtained identity token from {}", self.issuer);
                Ok(token)
            }
            None => bail!(
                "No identity token supplied, no ambient token is set and no client secret is configured for {}",
                self.issuer
            ),
        }
    }
}
