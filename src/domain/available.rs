//! Operator-allocated domains and ports
//!
//! - [`AvailableDomain`] - a domain or `*.base` wildcard users may put websites on
//! - [`WildcardDomains`] - wildcard set used to pick shared TLS certificates
//! - [`AvailablePort`] - a port range users may publish

use serde::{Deserialize, Serialize};

use super::application::{is_valid_domain_with, PortProtocol};
use super::ValidationError;

/// A domain the operator has allocated for user websites
///
/// # Examples
///
/// ```rust
/// use showcase_k8s::domain::AvailableDomain;
///
/// let domain = AvailableDomain::new("*.trap.show");
/// assert!(domain.matches("x.trap.show"));
/// assert!(!domain.matches("trap.show"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableDomain {
    /// `example.com` or `*.example.com`
    pub domain: String,
    /// Sub-domains or wildcards carved out of `domain`
    #[serde(default)]
    pub exclude_domains: Vec<String>,
    /// Whether auth middlewares exist for websites on this domain
    #[serde(default)]
    pub auth_available: bool,
}

impl AvailableDomain {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn with_excludes(mut self, excludes: &[&str]) -> Self {
        self.exclude_domains = excludes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_auth(mut self, auth_available: bool) -> Self {
        self.auth_available = auth_available;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_domain_with(&self.domain, true) {
            return Err(ValidationError::new(
                "domain",
                format!("invalid available domain {:?}", self.domain),
            ));
        }
        for exclude in &self.exclude_domains {
            if !is_valid_domain_with(exclude, true) {
                return Err(ValidationError::new(
                    "excludeDomains",
                    format!("invalid exclude domain {:?}", exclude),
                ));
            }
            if !domain_covers(&self.domain, exclude.trim_start_matches("*.")) {
                return Err(ValidationError::new(
                    "excludeDomains",
                    format!("{} is not part of {}", exclude, self.domain),
                ));
            }
        }
        Ok(())
    }

    /// True when `fqdn` is covered by this domain and by no exclude entry
    pub fn matches(&self, fqdn: &str) -> bool {
        domain_covers(&self.domain, fqdn)
            && !self
                .exclude_domains
                .iter()
                .any(|exclude| domain_covers(exclude, fqdn))
    }

    pub fn is_wildcard(&self) -> bool {
        self.domain.starts_with("*.")
    }
}

/// Whether `pattern` (literal or `*.base`) covers `fqdn`
///
/// A wildcard covers every name strictly below its base, at any depth.
fn domain_covers(pattern: &str, fqdn: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => fqdn
            .strip_suffix(base)
            .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
        None => pattern == fqdn,
    }
}

/// Collection helpers over the operator's domain list
pub trait AvailableDomainSlice {
    /// First domain entry covering `fqdn`, if any
    fn find_match(&self, fqdn: &str) -> Option<&AvailableDomain>;

    fn is_available(&self, fqdn: &str) -> bool {
        self.find_match(fqdn).is_some()
    }

    fn is_auth_available(&self, fqdn: &str) -> bool {
        self.find_match(fqdn).is_some_and(|d| d.auth_available)
    }
}

impl AvailableDomainSlice for [AvailableDomain] {
    fn find_match(&self, fqdn: &str) -> Option<&AvailableDomain> {
        self.iter().find(|d| d.matches(fqdn))
    }
}

impl AvailableDomainSlice for Vec<AvailableDomain> {
    fn find_match(&self, fqdn: &str) -> Option<&AvailableDomain> {
        self.as_slice().find_match(fqdn)
    }
}

/// Wildcard domains that get one shared certificate per target domain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WildcardDomains(Vec<String>);

impl WildcardDomains {
    pub fn new(domains: Vec<String>) -> Result<Self, ValidationError> {
        for d in &domains {
            if !d.starts_with("*.") || !is_valid_domain_with(d, true) {
                return Err(ValidationError::new(
                    "wildcardDomains",
                    format!("{:?} is not a wildcard domain", d),
                ));
            }
        }
        Ok(Self(domains))
    }

    /// Collect the wildcard entries of the available domains
    pub fn from_available(domains: &[AvailableDomain]) -> Self {
        Self(
            domains
                .iter()
                .filter(|d| d.is_wildcard())
                .map(|d| d.domain.clone())
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Domain the certificate for `fqdn` is issued for
    ///
    /// The most specific wildcard whose base is a suffix of `fqdn` anchors the
    /// result; everything left of the fqdn's parent collapses into one `*`.
    /// Uncovered names get a certificate of their own.
    ///
    /// ```rust
    /// use showcase_k8s::domain::WildcardDomains;
    ///
    /// let wildcards = WildcardDomains::new(vec!["*.google.com".into()]).unwrap();
    /// assert_eq!(
    ///     wildcards.tls_target_domain("grand.children.google.com"),
    ///     "*.children.google.com"
    /// );
    /// assert_eq!(wildcards.tls_target_domain("test.yahoo.com"), "test.yahoo.com");
    /// ```
    pub fn tls_target_domain(&self, fqdn: &str) -> String {
        let covered = self
            .iter()
            .filter(|w| domain_covers(w, fqdn))
            .max_by_key(|w| w.len());
        match (covered, fqdn.split_once('.')) {
            (Some(_), Some((_, parent))) => format!("*.{}", parent),
            _ => fqdn.to_string(),
        }
    }
}

/// A port range users may publish
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailablePort {
    pub start: u16,
    pub end: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

impl AvailablePort {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.start == 0 || self.start > self.end {
            return Err(ValidationError::new(
                "ports",
                format!("invalid port range {}-{}", self.start, self.end),
            ));
        }
        Ok(())
    }

    pub fn contains(&self, port: u16, protocol: PortProtocol) -> bool {
        self.protocol == protocol && (self.start..=self.end).contains(&port)
    }
}

/// Collection helpers over the operator's port ranges
pub trait AvailablePortSlice {
    fn is_available(&self, port: u16, protocol: PortProtocol) -> bool;
}

impl AvailablePortSlice for [AvailablePort] {
    fn is_available(&self, port: u16, protocol: PortProtocol) -> bool {
        self.iter().any(|range| range.contains(port, protocol))
    }
}

impl AvailablePortSlice for Vec<AvailablePort> {
    fn is_available(&self, port: u16, protocol: PortProtocol) -> bool {
        self.as_slice().is_available(port, protocol)
    }
}
