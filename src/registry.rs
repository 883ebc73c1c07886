//! Upstream distribution registry
//!
//! Fetches and parses the upstream JSON registry (the shape Microsoft
//! publishes: `{"Default": ..., "Distributions": [...]}`), converting entries
//! into catalog distro records. The raw document is cached under
//! `cache/distributions.json` for diagnostics.

use log::debug;
use serde::Deserialize;

use crate::catalog::{Architecture, Distro};
use crate::constants::{DEFAULT_COMMAND_TIMEOUT, MAX_REDIRECTS, USER_AGENT};
use crate::error::{classify_http_status, classify_http_transport, Error, Result};

/// Upstream document shape. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDocument {
    #[serde(rename = "Default")]
    pub default: Option<String>,
    #[serde(rename = "Distributions", default)]
    pub distributions: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: Option<String>,
    #[serde(rename = "Amd64PackageUrl", default)]
    pub amd64_package_url: Option<String>,
    #[serde(rename = "Arm64PackageUrl", default)]
    pub arm64_package_url: Option<String>,
    #[serde(rename = "Amd64WslUrl", default)]
    pub amd64_wsl_url: Option<String>,
    #[serde(rename = "Arm64WslUrl", default)]
    pub arm64_wsl_url: Option<String>,
    #[serde(rename = "StoreAppId", default)]
    pub store_app_id: Option<String>,
}

impl RegistryEntry {
    /// Prefer the modern `.wsl` package, then the legacy appx package,
    /// x64 before arm64.
    fn source_url(&self) -> Option<&str> {
        self.amd64_wsl_url
            .as_deref()
            .or(self.amd64_package_url.as_deref())
            .or(self.arm64_wsl_url.as_deref())
            .or(self.arm64_package_url.as_deref())
    }

    fn architecture(&self) -> Architecture {
        let has_x64 = self.amd64_wsl_url.is_some() || self.amd64_package_url.is_some();
        let has_arm64 = self.arm64_wsl_url.is_some() || self.arm64_package_url.is_some();
        match (has_x64, has_arm64) {
            (true, true) => Architecture::Both,
            (false, true) => Architecture::Arm64,
            _ => Architecture::X64,
        }
    }
}

/// A fetched registry: the raw document text plus the converted records.
#[derive(Debug)]
pub struct FetchedRegistry {
    pub raw: String,
    pub default: Option<String>,
    pub distros: Vec<Distro>,
}

/// GET the upstream registry and convert it.
pub async fn fetch(url: &str) -> Result<FetchedRegistry> {
    debug!("fetching distribution registry from {url}");

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(DEFAULT_COMMAND_TIMEOUT)
        .build()
        .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_http_transport(url, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_http_status(url, status.as_u16()));
    }

    let raw = response
        .text()
        .await
        .map_err(|e| classify_http_transport(url, &e))?;

    let parsed = parse(&raw)?;
    Ok(FetchedRegistry {
        raw,
        default: parsed.0,
        distros: parsed.1,
    })
}

/// Parse a registry document into distro records. Entries with no download
/// URL (store-only distributions) are skipped.
pub fn parse(raw: &str) -> Result<(Option<String>, Vec<Distro>)> {
    let document: RegistryDocument = serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("malformed registry document: {e}")))?;

    let default = document.default.map(|d| d.to_lowercase());
    let distros = document
        .distributions
        .iter()
        .filter_map(|entry| {
            let url = entry.source_url()?;
            Some(Distro {
                name: entry.name.to_lowercase(),
                display_name: entry
                    .friendly_name
                    .clone()
                    .unwrap_or_else(|| entry.name.clone()),
                version: String::new(),
                description: String::new(),
                architecture: entry.architecture(),
                source_url: url.to_string(),
                expected_size: None,
                expected_digest: None,
                local_path: None,
                available: false,
                package_member: None,
            })
        })
        .collect();

    Ok((default, distros))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Default": "Ubuntu",
        "Distributions": [
            {
                "Name": "Ubuntu",
                "FriendlyName": "Ubuntu",
                "StoreAppId": "9PDXGNCFSCZV",
                "Amd64WslUrl": "https://wslstorestorage.blob.core.windows.net/wslblob/Ubuntu2404-240425.wsl",
                "Arm64WslUrl": "https://wslstorestorage.blob.core.windows.net/wslblob/Ubuntu2404-240425-arm64.wsl"
            },
            {
                "Name": "Ubuntu-22.04",
                "FriendlyName": "Ubuntu 22.04 LTS",
                "Amd64PackageUrl": "https://wsldownload.azureedge.net/Ubuntu2204-221101.AppxBundle"
            },
            {
                "Name": "StoreOnly",
                "FriendlyName": "Store Only",
                "StoreAppId": "9NONSENSE"
            }
        ]
    }"#;

    #[test]
    fn parses_upstream_shape() {
        let (default, distros) = parse(SAMPLE).unwrap();
        assert_eq!(default.as_deref(), Some("ubuntu"));
        // The store-only entry has no fetchable URL.
        assert_eq!(distros.len(), 2);

        let ubuntu = &distros[0];
        assert_eq!(ubuntu.name, "ubuntu");
        assert_eq!(ubuntu.architecture, Architecture::Both);
        assert!(ubuntu.source_url.ends_with(".wsl"));

        let jammy = &distros[1];
        assert_eq!(jammy.name, "ubuntu-22.04");
        assert_eq!(jammy.display_name, "Ubuntu 22.04 LTS");
        assert_eq!(jammy.architecture, Architecture::X64);
        assert!(jammy.source_url.ends_with(".AppxBundle"));
    }

    #[test]
    fn wsl_url_preferred_over_package_url() {
        let raw = r#"{"Distributions": [{
            "Name": "d",
            "Amd64PackageUrl": "https://x/legacy.appxbundle",
            "Amd64WslUrl": "https://x/modern.wsl"
        }]}"#;
        let (_, distros) = parse(raw).unwrap();
        assert_eq!(distros[0].source_url, "https://x/modern.wsl");
    }

    #[test]
    fn arm64_only_entry() {
        let raw = r#"{"Distributions": [{
            "Name": "d",
            "Arm64WslUrl": "https://x/d-arm64.wsl"
        }]}"#;
        let (_, distros) = parse(raw).unwrap();
        assert_eq!(distros[0].architecture, Architecture::Arm64);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse("{ not json").is_err());
        assert!(parse(r#"{"Distributions": "nope"}"#).is_err());
    }

    #[tokio::test]
    async fn fetch_classifies_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE))
            .mount(&server)
            .await;

        let fetched = fetch(&format!("{}/registry.json", server.uri())).await.unwrap();
        assert_eq!(fetched.distros.len(), 2);
        assert!(fetched.raw.contains("Ubuntu-22.04"));

        Mock::given(method("GET"))
            .and(path("/down.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let err = fetch(&format!("{}/down.json", server.uri())).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransientNetwork);
    }
}
