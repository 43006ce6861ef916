//! ES256 token minting and validation.
//!
//! A single process-lifetime ECDSA P-256 key pair signs both token shapes.
//! The pair is generated fresh at startup or loaded from PEM material on
//! disk; the public half is derived from the private key either way.

use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;

use super::{AuthError, Claims, TokenType};

/// Mints and verifies ES256 capability tokens.
pub struct TokenManager {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenManager {
    /// Generate a fresh P-256 key pair for this process.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyMaterial`] when PEM encoding fails.
    pub fn generate(issuer: impl Into<String>) -> Result<Self, AuthError> {
        let secret = SecretKey::random(&mut OsRng);
        Self::from_secret_key(issuer.into(), &secret)
    }

    /// Load the key pair from externally stored PKCS#8 PEM material.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyMaterial`] when the PEM does not hold a
    /// valid P-256 private key.
    pub fn from_pem(issuer: impl Into<String>, private_pem: &str) -> Result<Self, AuthError> {
        let secret = SecretKey::from_pkcs8_pem(private_pem)
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))?;
        Self::from_secret_key(issuer.into(), &secret)
    }

    fn from_secret_key(issuer: String, secret: &SecretKey) -> Result<Self, AuthError> {
        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))?;
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))?;

        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))?;
        let decoding_key = DecodingKey::from_ec_pem(public_pem.as_bytes())
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))?;

        Ok(Self {
            issuer,
            encoding_key,
            decoding_key,
        })
    }

    /// The issuer stamped into every minted token.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mint an instance token granting attachment to `instance_id`.
    ///
    /// Lifetime is deliberately short (the caller passes ≤ 2 minutes);
    /// clients fetch a fresh attach URL immediately before dialing.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyMaterial`] when signing fails.
    pub fn generate_instance_token(
        &self,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            typ: TokenType::Instance,
            sub: instance_id.to_owned(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: Some(now),
            exp: now.saturating_add(ttl_secs(ttl)),
            instance_id: Some(instance_id.to_owned()),
        };
        self.sign(&claims)
    }

    /// Mint a user token for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyMaterial`] when signing fails.
    pub fn generate_user_token(&self, user_id: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            typ: TokenType::User,
            sub: user_id.to_owned(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: None,
            exp: now.saturating_add(ttl_secs(ttl)),
            instance_id: None,
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::ES256), claims, &self.encoding_key)
            .map_err(|e| AuthError::KeyMaterial(e.to_string()))
    }

    /// Sign arbitrary claims. Test hook for expired/mismatched tokens.
    #[doc(hidden)]
    pub fn sign_claims_for_test(&self, claims: &Claims) -> Result<String, AuthError> {
        self.sign(claims)
    }

    /// Parse and verify a token.
    ///
    /// Rejects non-ECDSA signing algorithms, bad signatures, expired
    /// tokens, and tokens whose issuer is not this manager's issuer.
    ///
    /// # Errors
    ///
    /// Returns the matching [`AuthError`] variant for each rejection.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        // Pin the algorithm before any signature work: a header carrying
        // anything but ES256 is rejected outright.
        let header = jsonwebtoken::decode_header(token).map_err(|_| AuthError::Malformed)?;
        if header.alg != Algorithm::ES256 {
            return Err(AuthError::WrongAlgorithm);
        }

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::Expired,
                ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    AuthError::WrongAlgorithm
                }
                ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey => {
                    AuthError::InvalidSignature
                }
                _ => AuthError::Malformed,
            })?;

        Ok(data.claims)
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}
