//! Authenticated transport for registry requests
//!
//! A logical request runs through a small chain: custom headers are merged
//! in, the request is sent once, and a `401` answer is resolved by parsing
//! the `WWW-Authenticate` challenge and either exchanging credentials for a
//! bearer token at the challenge realm or retrying with the stored basic
//! credentials. Tokens are fetched per call and never cached, so concurrent
//! calls sharing one client never race on token state.

use crate::error::{RegscanError, Result};
use base64::Engine;
use reqwest::{Client, Request, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// Authentication scheme announced by a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeScheme {
    Bearer,
    Basic,
}

/// A parsed `WWW-Authenticate` challenge. Exists only for the duration of a
/// single authentication round-trip.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub scheme: ChallengeScheme,
    pub realm: String,
    pub service: Option<String>,
    pub scope: Vec<String>,
}

impl AuthChallenge {
    /// Parses a `WWW-Authenticate` header value, e.g.
    /// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:foo:pull"`.
    pub fn parse(header: &str) -> Result<Self> {
        let (scheme, params_str) = if let Some(rest) = header.strip_prefix("Bearer ") {
            (ChallengeScheme::Bearer, rest)
        } else if let Some(rest) = header.strip_prefix("Basic ") {
            (ChallengeScheme::Basic, rest)
        } else {
            return Err(RegscanError::Auth(format!(
                "unsupported auth challenge: {}",
                header
            )));
        };

        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in split_params(params_str) {
            params.insert(key, value);
        }

        let realm = match params.get("realm") {
            Some(realm) => realm.clone(),
            None if scheme == ChallengeScheme::Basic => String::new(),
            None => {
                return Err(RegscanError::Auth(format!(
                    "auth challenge missing realm: {}",
                    header
                )));
            }
        };

        // A scope value holds space-separated scopes; each scope may itself
        // contain commas (pull,push actions), so the value must be taken
        // whole before splitting.
        let scope = params
            .get("scope")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(AuthChallenge {
            scheme,
            realm,
            service: params.get("service").cloned(),
            scope,
        })
    }

    /// Extracts the challenge from a response, if the response demands one.
    /// Returns `None` on any status other than 401.
    pub fn from_response(resp: &Response) -> Result<Option<Self>> {
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let header = match resp.headers().get(reqwest::header::WWW_AUTHENTICATE) {
            Some(h) => h
                .to_str()
                .map_err(|e| RegscanError::Auth(format!("invalid auth header: {}", e)))?,
            None => return Ok(None),
        };
        AuthChallenge::parse(header).map(Some)
    }
}

/// Splits a challenge parameter list into key/value pairs. Quoted values are
/// taken verbatim up to the closing quote, so commas inside a quoted scope
/// never start a new parameter.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }
        let Some((key, after)) = rest.split_once('=') else { break };
        let key = key.trim().to_string();

        let value = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    rest = &quoted[end + 1..];
                    quoted[..end].to_string()
                }
                None => {
                    rest = "";
                    quoted.to_string()
                }
            }
        } else {
            match after.find(',') {
                Some(end) => {
                    rest = &after[end + 1..];
                    after[..end].trim().to_string()
                }
                None => {
                    rest = "";
                    after.trim().to_string()
                }
            }
        };

        params.push((key, value));
    }

    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    /// The bearer token, preferring `token` over `access_token`.
    fn into_token(self) -> Result<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| RegscanError::Auth("auth token cannot be empty".to_string()))
    }
}

/// Authenticated execution path wrapping a `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    username: String,
    password: String,
    headers: HashMap<String, String>,
}

impl Transport {
    pub fn new(
        client: Client,
        username: String,
        password: String,
        headers: HashMap<String, String>,
    ) -> Self {
        Self { client, username, password, headers }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Executes a request through the chain: merge custom headers, send, and
    /// on a bearer challenge fetch a token and retry once. A basic challenge
    /// is retried with the stored credentials; without credentials it
    /// surfaces as [`RegscanError::BasicAuthRequired`].
    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        for (key, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| RegscanError::Validation(format!("invalid header name {:?}: {}", key, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| RegscanError::Validation(format!("invalid header value for {:?}: {}", key, e)))?;
            request.headers_mut().insert(name, value);
        }

        let retry = request
            .try_clone()
            .ok_or_else(|| RegscanError::Validation("request body is not replayable".to_string()))?;

        let response = self.client.execute(request).await?;

        let challenge = match AuthChallenge::from_response(&response)? {
            Some(c) => c,
            None => return Ok(response),
        };

        match challenge.scheme {
            ChallengeScheme::Basic => {
                if self.username.is_empty() && self.password.is_empty() {
                    return Err(RegscanError::BasicAuthRequired);
                }
                self.retry_with_basic(retry).await
            }
            ChallengeScheme::Bearer => {
                let token = self.fetch_token(&challenge).await?;
                self.retry_with_token(retry, &token).await
            }
        }
    }

    async fn retry_with_basic(&self, mut request: Request) -> Result<Response> {
        let value =
            reqwest::header::HeaderValue::from_str(&format!("Basic {}", self.basic_credentials()))
                .map_err(|e| RegscanError::Auth(format!("invalid basic credentials: {}", e)))?;
        request.headers_mut().insert(reqwest::header::AUTHORIZATION, value);
        Ok(self.client.execute(request).await?)
    }

    async fn retry_with_token(&self, mut request: Request, token: &str) -> Result<Response> {
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RegscanError::Auth(format!("invalid bearer token: {}", e)))?;
        request.headers_mut().insert(reqwest::header::AUTHORIZATION, value);
        Ok(self.client.execute(request).await?)
    }

    /// Exchanges credentials for a bearer token at the challenge realm.
    /// Basic credentials are presented on this request only.
    async fn fetch_token(&self, challenge: &AuthChallenge) -> Result<String> {
        let mut realm = Url::parse(&challenge.realm)
            .map_err(|e| RegscanError::Auth(format!("invalid token realm {:?}: {}", challenge.realm, e)))?;

        {
            let mut query = realm.query_pairs_mut();
            if let Some(service) = &challenge.service {
                if !service.is_empty() {
                    query.append_pair("service", service);
                }
            }
            for scope in &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        tracing::debug!(realm = %realm, "fetching bearer token");

        let mut token_request = self.client.get(realm.clone());
        if !self.username.is_empty() || !self.password.is_empty() {
            token_request = token_request.basic_auth(&self.username, Some(&self.password));
        }

        let response = token_request.send().await?;

        if response.status() == StatusCode::FORBIDDEN && is_gcr_realm(&realm) {
            // GCR answers 403 instead of 401 on missing credentials; treat it
            // as a demand for basic auth.
            return Err(RegscanError::BasicAuthRequired);
        }

        if !response.status().is_success() {
            return Err(RegscanError::Auth(format!(
                "getting token failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        token.into_token()
    }

    /// Returns the bearer token required for a specific resource URL, or
    /// `None` when the registry answers without a challenge.
    /// [`RegscanError::BasicAuthRequired`] signals a basic-auth registry.
    pub async fn token(&self, url: &str) -> Result<Option<String>> {
        tracing::debug!(url, "probing auth requirements");

        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::FORBIDDEN {
            if let Ok(parsed) = Url::parse(url) {
                if is_gcr_realm(&parsed) {
                    return Err(RegscanError::BasicAuthRequired);
                }
            }
        }

        let challenge = match AuthChallenge::from_response(&response)? {
            Some(c) => c,
            None => return Ok(None),
        };

        match challenge.scheme {
            ChallengeScheme::Basic => Err(RegscanError::BasicAuthRequired),
            ChallengeScheme::Bearer => self.fetch_token(&challenge).await.map(Some),
        }
    }

    /// Returns the authorization headers a third party needs to fetch the
    /// given URL: a bearer header when a token can be obtained, a basic
    /// header synthesized from stored credentials when the registry demands
    /// basic auth, and no headers when the resource is anonymous.
    pub async fn headers(&self, url: &str) -> Result<HashMap<String, String>> {
        match self.token(url).await {
            Ok(Some(token)) => Ok(HashMap::from([(
                "Authorization".to_string(),
                format!("Bearer {}", token),
            )])),
            Ok(None) => Ok(HashMap::new()),
            Err(RegscanError::BasicAuthRequired) => Ok(HashMap::from([(
                "Authorization".to_string(),
                format!("Basic {}", self.basic_credentials()),
            )])),
            Err(err) => Err(err),
        }
    }

    fn basic_credentials(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password))
    }
}

/// Translates a response status into the error taxonomy. 404 becomes
/// `NotFound`; any other non-2xx becomes `UnexpectedStatus`.
pub async fn translate_error(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RegscanError::NotFound(context.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegscanError::UnexpectedStatus { status, message })
}

fn is_gcr_realm(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => host == "gcr.io" || host.ends_with(".gcr.io"),
        None => false,
    }
}
