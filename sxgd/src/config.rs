// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Service configuration.
//!
//! Loaded from TOML. Lifetimes are written the way the flags spell them
//! (`"72h"`, `"30m"`, `"10s"`); the format's expiry caps are enforced at
//! validation time so the rest of the crate never re-checks them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

/// Hard cap on any exchange lifetime.
pub const MAX_EXPIRY: Duration = Duration::from_secs(168 * 3600);
/// Cap on the JavaScript lifetime without the insecure override.
pub const MAX_GOOD_JS_EXPIRY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub server: ServerConfig,
    pub sxg: SxgConfig,
}

/// Where the daemon listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// The serving endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Endpoint producing signed exchanges. The target URL arrives either
    /// as the `sign_param` query parameter or appended to this path.
    pub doc_path: String,
    pub sign_param: String,
    /// Endpoint serving augmented chains by digest.
    pub cert_path: String,
    pub validity_path: String,
    pub health_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            doc_path: "/priv/doc".to_string(),
            sign_param: "sign".to_string(),
            cert_path: "/webpkg/cert".to_string(),
            validity_path: "/webpkg/validity".to_string(),
            health_path: "/healthz".to_string(),
        }
    }
}

/// Exchange production settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SxgConfig {
    /// Signed exchange version token.
    pub version: String,
    /// Merkle Integrity record size in bytes.
    pub mi_record_size: usize,
    /// Base URL the `cert-url` parameter is derived from; the chain digest
    /// is appended as a path segment.
    pub cert_url: String,
    /// Maximum payload size eligible for signing, or `"none"`.
    #[serde(with = "size_limit_serde")]
    pub size_limit: Option<usize>,
    /// Lifetime of exchanges; at most 168h. Not applied to JavaScript.
    #[serde(with = "duration_serde")]
    pub expiry: Duration,
    /// Lifetime of JavaScript exchanges (and HTML with inline scripts);
    /// at most 24h unless `insecure_js_expiry` is set.
    #[serde(with = "duration_serde")]
    pub js_expiry: Duration,
    pub insecure_js_expiry: bool,
    /// Filename assumed for slash-ended URLs.
    pub index_file: String,
    /// Directory for materialized exchanges; empty disables the tier.
    pub sxg_dir: String,
    pub sxg_ext: String,
    /// Extension for validity URLs; a UNIX timestamp follows it.
    pub validity_ext: String,
    /// Reserved; any non-empty value is rejected at validation.
    pub validity_dir: String,
    /// Extra request headers, `"Name: value"` each.
    pub request_headers: Vec<String>,
    /// `conservative` honors only author-declared preloads; `aggressive`
    /// also synthesizes them per the toggles below.
    pub task_set: String,
    pub preload_css: bool,
    pub preload_js: bool,
    /// Whether preloads that are not packaged as signed subresources keep
    /// their `Link` headers in the exchange.
    pub keep_non_sxg_preloads: bool,
    #[serde(with = "duration_serde")]
    pub fetch_timeout: Duration,
    pub max_preload_depth: usize,
    pub max_preloads_per_resource: usize,
    pub cert: CertConfig,
}

impl Default for SxgConfig {
    fn default() -> Self {
        SxgConfig {
            version: "1b3".to_string(),
            mi_record_size: 4096,
            cert_url: String::new(),
            size_limit: Some(4194304),
            expiry: Duration::from_secs(72 * 3600),
            js_expiry: Duration::from_secs(12 * 3600),
            insecure_js_expiry: false,
            index_file: "index.html".to_string(),
            sxg_dir: String::new(),
            sxg_ext: ".sxg".to_string(),
            validity_ext: ".validity".to_string(),
            validity_dir: String::new(),
            request_headers: vec![],
            task_set: "aggressive".to_string(),
            preload_css: true,
            preload_js: false,
            keep_non_sxg_preloads: false,
            fetch_timeout: Duration::from_secs(10),
            max_preload_depth: 2,
            max_preloads_per_resource: 16,
            cert: CertConfig::default(),
        }
    }
}

/// Certificate material and augmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    /// PEM chain file, leaf first.
    pub pem_file: PathBuf,
    /// PEM private key matching the leaf.
    pub key_file: PathBuf,
    /// Pre-augmented `application/cert-chain+cbor` file; when set, OCSP and
    /// SCT settings below are unused.
    pub cert_cbor: String,
    /// OCSP responder override; empty discovers it from the leaf's
    /// AuthorityInfoAccess extension.
    pub ocsp_responder: String,
    /// Static DER OCSP response; bypasses fetching.
    pub ocsp_file: String,
    /// Static TLS-encoded SCT list.
    pub sct_file: String,
    /// Directory persisting augmented chains by digest; empty selects the
    /// null cache.
    pub cache_dir: String,
    /// Accept certificates without the CanSignHttpExchanges extension or a
    /// live OCSP responder.
    pub allow_test_cert: bool,
    #[serde(with = "duration_serde")]
    pub refresh_interval: Duration,
}

impl Default for CertConfig {
    fn default() -> Self {
        CertConfig {
            pem_file: PathBuf::from("cert.pem"),
            key_file: PathBuf::from("priv.key"),
            cert_cbor: String::new(),
            ocsp_responder: String::new(),
            ocsp_file: String::new(),
            sct_file: String::new(),
            cache_dir: String::new(),
            allow_test_cert: false,
            refresh_interval: Duration::from_secs(3600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: ListenConfig::default(),
            server: ServerConfig::default(),
            sxg: SxgConfig::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl Config {
    /// Check everything that must hold before components are built. All
    /// problems are reported at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        if crate::exchange::Version::parse(&self.sxg.version).is_none() {
            problems.push(format!("unknown sxg version {:?}", self.sxg.version));
        }
        if self.sxg.mi_record_size == 0 {
            problems.push("mi_record_size must be positive".to_string());
        }
        match Url::parse(&self.sxg.cert_url) {
            Ok(url) if url.scheme() == "https" => {}
            Ok(_) => problems.push("cert_url must be an https:// url".to_string()),
            Err(_) => problems.push("cert_url must be a valid absolute url".to_string()),
        }
        if self.sxg.expiry.is_zero() || self.sxg.expiry > MAX_EXPIRY {
            problems.push("expiry must be positive and at most 168h".to_string());
        }
        let max_js = if self.sxg.insecure_js_expiry {
            MAX_EXPIRY
        } else {
            MAX_GOOD_JS_EXPIRY
        };
        if self.sxg.js_expiry.is_zero() || self.sxg.js_expiry > max_js {
            problems.push(format!(
                "js_expiry must be positive and at most {}h",
                max_js.as_secs() / 3600
            ));
        }
        if !self.sxg.validity_dir.is_empty() {
            problems.push("validity_dir is not implemented yet".to_string());
        }
        if !matches!(self.sxg.task_set.as_str(), "conservative" | "aggressive") {
            problems.push(format!(
                "task_set must be \"conservative\" or \"aggressive\", got {:?}",
                self.sxg.task_set
            ));
        }
        for header in &self.sxg.request_headers {
            if parse_header_line(header).is_none() {
                problems.push(format!("invalid request_headers entry {header:?}"));
            }
        }
        if !self.sxg.cert.ocsp_responder.is_empty()
            && Url::parse(&self.sxg.cert.ocsp_responder).is_err()
        {
            problems.push("ocsp_responder must be a valid url".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", problems.join("; "))
        }
    }

    /// The parsed `request_headers` entries. Call after [`Config::validate`].
    pub fn request_header_pairs(&self) -> Vec<(String, String)> {
        self.sxg
            .request_headers
            .iter()
            .filter_map(|line| parse_header_line(line))
            .collect()
    }
}

fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Load a TOML configuration with fallback options.
///
/// With no explicit path, `CONFIGURATION_DIRECTORY` is consulted for the
/// default filename; failing that, defaults are used.
pub fn load_config<T>(path: Option<PathBuf>, default_name: &str) -> anyhow::Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    let path = path.or_else(|| {
        std::env::var("CONFIGURATION_DIRECTORY")
            .ok()
            .map(PathBuf::from)
            .map(|base| base.join(default_name))
            .filter(|p| p.is_file())
    });
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read from path {path:?}"))?;
            tracing::info!(path = %path.display(), "Read configuration file");
            toml::from_str(&raw).context("configuration file is invalid")
        }
        None => {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        }
    }
}

/// Durations written like the flags spell them: `"72h"`, `"30m"`, `"10s"`.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(D::Error::custom)
    }
}

/// A byte count or the string `"none"`.
mod size_limit_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bytes(u64),
        Keyword(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<usize>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_u64(*bytes as u64),
            None => serializer.serialize_str("none"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<usize>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Bytes(bytes) => Ok(Some(bytes as usize)),
            Repr::Keyword(word) if word == "none" => Ok(None),
            Repr::Keyword(word) => Err(D::Error::custom(format!(
                "size limit must be a byte count or \"none\", got {word:?}"
            ))),
        }
    }
}

pub(crate) fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("duration {raw:?} is missing a unit (h, m, or s)"))?;
    let (number, unit) = raw.split_at(split);
    let number: u64 = number
        .parse()
        .with_context(|| format!("duration {raw:?} has no numeric part"))?;
    let seconds = match unit {
        "h" => number * 3600,
        "m" => number * 60,
        "s" => number,
        other => anyhow::bail!("duration unit {other:?} is not one of h, m, s"),
    };
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn format_duration(value: Duration) -> String {
    let secs = value.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
