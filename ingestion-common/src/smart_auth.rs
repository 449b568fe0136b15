use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PrivateKeyParts;
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::http_client::{HttpClient, HttpError};

#[derive(Error, Debug)]
pub enum SmartAuthError {
    #[error("private key material could not be loaded: {0}")]
    InvalidKeyMaterial(String),
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token endpoint returned {status}: {body}")]
    TokenRequestFailed { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] HttpError),
    #[error("failed to build assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Rs384,
    Es384,
}

impl SigningAlgorithm {
    fn parse(raw: &str) -> Result<Self, SmartAuthError> {
        match raw {
            "RS384" => Ok(Self::Rs384),
            "ES384" => Ok(Self::Es384),
            other => Err(SmartAuthError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn jsonwebtoken_alg(self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs384 => Algorithm::RS384,
            SigningAlgorithm::Es384 => Algorithm::ES384,
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    jti: String,
}

#[derive(Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    key_ops: Vec<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    d: Option<String>,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    q: Option<String>,
}

#[derive(Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Clone)]
struct AccessTokenCache {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    300
}

/// Builds and signs short-lived SMART Backend Services client assertions and
/// exchanges them for a cached bearer access token.
///
/// Key ingestion mirrors `smart_auth.py`'s `_process_private_key`: PEM
/// material is used directly, JSON Web Key (or key set) material has its
/// first `sign`-capable key selected and reconstructed into a PEM the
/// `jsonwebtoken` crate can load, instead of the original's manual RSA CRT
/// parameter recovery.
pub struct SmartAssertionSigner {
    token_url: String,
    client_id: String,
    algorithm: SigningAlgorithm,
    encoding_key: EncodingKey,
    kid: Option<String>,
    http: HttpClient,
    cache: Mutex<Option<AccessTokenCache>>,
}

impl SmartAssertionSigner {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        private_key_material: &str,
        algorithm: &str,
        http: HttpClient,
    ) -> Result<Self, SmartAuthError> {
        let algorithm = SigningAlgorithm::parse(algorithm)?;
        let (encoding_key, kid) = load_signing_key(private_key_material, algorithm)?;
        Ok(Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            algorithm,
            encoding_key,
            kid,
            http,
            cache: Mutex::new(None),
        })
    }

    /// Builds and signs a fresh assertion with the given lifetime.
    pub fn create_assertion(&self, expires_in: Duration) -> Result<String, SmartAuthError> {
        let mut header = Header::new(self.algorithm.jsonwebtoken_alg());
        header.kid = self.kid.clone();

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            iss: self.client_id.clone(),
            sub: self.client_id.clone(),
            aud: self.token_url.clone(),
            exp: now + expires_in.as_secs() as i64,
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };

        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding_key)?)
    }

    /// Returns a cached access token if it has more than 60s left on its
    /// lifetime, otherwise exchanges a fresh assertion for a new one.
    pub async fn get_access_token(&self, scope: &str) -> Result<String, SmartAuthError> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.as_ref() {
                if OffsetDateTime::now_utc() < entry.expires_at - Duration::from_secs(60) {
                    return Ok(entry.access_token.clone());
                }
            }
        }

        let assertion = self.create_assertion(Duration::from_secs(300))?;
        let form = serde_urlencoded::to_string([
            ("grant_type", "client_credentials"),
            (
                "client_assertion_type",
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
            ),
            ("client_assertion", assertion.as_str()),
            ("scope", scope),
        ])
        .expect("static form fields always encode");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));

        let response = self
            .http
            .request(Method::POST, &self.token_url, headers, Some(form.into_bytes()))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SmartAuthError::TokenRequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|source| HttpError::Request {
                url: self.token_url.clone(),
                source,
            })?;

        let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(body.expires_in.max(0) as u64);
        *self.cache.lock().await = Some(AccessTokenCache {
            access_token: body.access_token.clone(),
            expires_at,
        });

        Ok(body.access_token)
    }

    pub async fn auth_header(&self, scope: &str) -> Result<(String, String), SmartAuthError> {
        let token = self.get_access_token(scope).await?;
        Ok(("Authorization".to_string(), format!("Bearer {token}")))
    }
}

fn load_signing_key(
    material: &str,
    algorithm: SigningAlgorithm,
) -> Result<(EncodingKey, Option<String>), SmartAuthError> {
    let trimmed = material.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        load_from_jwk(trimmed, algorithm)
    } else {
        let key = match algorithm {
            SigningAlgorithm::Rs384 => EncodingKey::from_rsa_pem(material.as_bytes()),
            SigningAlgorithm::Es384 => EncodingKey::from_ec_pem(material.as_bytes()),
        }
        .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
        Ok((key, None))
    }
}

fn load_from_jwk(
    trimmed: &str,
    algorithm: SigningAlgorithm,
) -> Result<(EncodingKey, Option<String>), SmartAuthError> {
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;

    let jwk = if value.get("keys").is_some() {
        let set: JwkSet = serde_json::from_value(value)
            .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
        set.keys
            .into_iter()
            .find(|k| k.key_ops.is_empty() || k.key_ops.iter().any(|op| op == "sign"))
            .ok_or_else(|| SmartAuthError::InvalidKeyMaterial("no signing key in key set".to_string()))?
    } else {
        serde_json::from_value(value).map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?
    };

    let kid = jwk.kid.clone();

    match (jwk.kty.as_str(), algorithm) {
        ("RSA", SigningAlgorithm::Rs384) => {
            let key = rsa_key_from_jwk(&jwk)?;
            let pem = key
                .to_pkcs8_pem(Default::default())
                .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
            let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
            Ok((encoding_key, kid))
        }
        ("EC", SigningAlgorithm::Es384) => {
            let d = jwk
                .d
                .as_ref()
                .ok_or_else(|| SmartAuthError::InvalidKeyMaterial("EC jwk missing d".to_string()))?;
            let bytes = decode_b64url(d)?;
            let secret = p384::SecretKey::from_slice(&bytes)
                .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
            let pem = secret
                .to_pkcs8_pem(Default::default())
                .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
            let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
            Ok((encoding_key, kid))
        }
        (kty, _) => Err(SmartAuthError::InvalidKeyMaterial(format!(
            "jwk kty {kty} incompatible with configured algorithm"
        ))),
    }
}

fn rsa_key_from_jwk(jwk: &Jwk) -> Result<RsaPrivateKey, SmartAuthError> {
    let n = decode_b64url_uint(jwk.n.as_deref())?;
    let e = decode_b64url_uint(jwk.e.as_deref())?;
    let d = decode_b64url_uint(jwk.d.as_deref())?;
    let p = decode_b64url_uint(jwk.p.as_deref())?;
    let q = decode_b64url_uint(jwk.q.as_deref())?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))?;
    // Exercises the crt parameters so malformed components fail fast here
    // rather than at first signing.
    let _ = key.dp();
    Ok(key)
}

fn decode_b64url(value: &str) -> Result<Vec<u8>, SmartAuthError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| SmartAuthError::InvalidKeyMaterial(err.to_string()))
}

fn decode_b64url_uint(value: Option<&str>) -> Result<BigUint, SmartAuthError> {
    let value = value.ok_or_else(|| SmartAuthError::InvalidKeyMaterial("jwk missing required RSA field".to_string()))?;
    let bytes = decode_b64url(value)?;
    Ok(BigUint::from_bytes_be(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_algorithms() {
        assert_eq!(SigningAlgorithm::parse("RS384").unwrap(), SigningAlgorithm::Rs384);
        assert_eq!(SigningAlgorithm::parse("ES384").unwrap(), SigningAlgorithm::Es384);
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        assert!(SigningAlgorithm::parse("HS256").is_err());
    }

    #[test]
    fn detects_jwk_by_leading_brace() {
        let material = r#"{"keys": []}"#;
        let value: Value = serde_json::from_str(material).unwrap();
        assert!(value.get("keys").is_some());
    }
}
