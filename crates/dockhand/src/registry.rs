//! Remote image registry lookups for update checks.
//!
//! Speaks just enough of the Docker Registry HTTP API v2 to read the current
//! manifest digest of a tag, using the anonymous bearer token flow.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use serde::Deserialize;
use std::time::Duration;

use crate::engine::split_reference;
use crate::settings::ProxyCell;

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Source of "what digest does the registry serve for this tag".
#[async_trait]
pub trait RemoteDigests: Send + Sync {
    /// `None` when the reference is pinned by digest and cannot move.
    async fn remote_digest(&self, image: &str) -> Result<Option<String>>;
}

/// Parsed `registry/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Returns `None` for digest references.
    pub fn parse(image: &str) -> Option<Self> {
        if image.contains('@') {
            return None;
        }
        let (name, tag) = split_reference(image);
        let tag = tag.unwrap_or("latest").to_string();

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        Some(Self {
            registry,
            repository,
            tag,
        })
    }

    fn manifest_url(&self) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            self.registry, self.repository, self.tag
        )
    }
}

/// Fields of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Bearer ")?;
        let mut challenge = BearerChallenge::default();
        for part in split_params(rest) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

// Commas inside quoted values (scope lists) do not separate parameters.
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client. The proxy is read from the settings cell on every call.
#[derive(Clone)]
pub struct RegistryClient {
    proxy: ProxyCell,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(proxy: ProxyCell) -> Self {
        Self {
            proxy,
            timeout: Duration::from_secs(15),
        }
    }

    fn http(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("dockhand/", env!("CARGO_PKG_VERSION")));
        if let Some(url) = self.proxy.get().url {
            builder = builder.proxy(reqwest::Proxy::all(&url).context("invalid proxy url")?);
        }
        builder.build().context("building registry HTTP client")
    }

    async fn fetch_token(
        &self,
        client: &reqwest::Client,
        challenge: &BearerChallenge,
    ) -> Result<String> {
        let mut query = Vec::new();
        if let Some(ref service) = challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(ref scope) = challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let response = client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .context("requesting registry token")?;
        if !response.status().is_success() {
            bail!("registry token request failed: {}", response.status());
        }
        let body: TokenResponse = response.json().await.context("decoding registry token")?;
        body.token
            .or(body.access_token)
            .context("registry token response had no token")
    }
}

#[async_trait]
impl RemoteDigests for RegistryClient {
    async fn remote_digest(&self, image: &str) -> Result<Option<String>> {
        let Some(reference) = ImageReference::parse(image) else {
            return Ok(None);
        };
        let client = self.http()?;
        let url = reference.manifest_url();

        let mut response = client
            .head(&url)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .with_context(|| format!("querying {url}"))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .and_then(BearerChallenge::parse)
                .context("registry did not offer a bearer challenge")?;
            let token = self.fetch_token(&client, &challenge).await?;
            response = client
                .head(&url)
                .header(ACCEPT, MANIFEST_ACCEPT)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .with_context(|| format!("querying {url}"))?;
        }

        if !response.status().is_success() {
            bail!("registry returned {} for {}", response.status(), image);
        }
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        debug!("Remote digest for {}: {:?}", image, digest);
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_references_are_normalized() {
        assert_eq!(
            ImageReference::parse("nginx").unwrap(),
            ImageReference {
                registry: DOCKER_HUB_REGISTRY.to_string(),
                repository: "library/nginx".to_string(),
                tag: "latest".to_string(),
            }
        );
        let r = ImageReference::parse("grafana/grafana:10.2").unwrap();
        assert_eq!(r.repository, "grafana/grafana");
        assert_eq!(r.tag, "10.2");
    }

    #[test]
    fn private_registries_keep_their_host() {
        let r = ImageReference::parse("registry.local:5000/team/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, "v1");
        assert_eq!(
            r.manifest_url(),
            "https://registry.local:5000/v2/team/app/manifests/v1"
        );
        assert!(ImageReference::parse("nginx@sha256:abcd").is_none());
    }

    #[test]
    fn parses_bearer_challenge_with_quoted_commas() {
        let c = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/nginx:pull,push"));
        assert!(BearerChallenge::parse("Basic realm=\"x\"").is_none());
    }
}
