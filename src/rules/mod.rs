mod pattern;

use std::time::Duration;

use anyhow::{Context, Result, ensure};

use crate::settings::RulesSettings;

pub use pattern::match_pattern;

const RELEASE_SIGNATURE_TTL: Duration = Duration::from_secs(5 * 60);
const RELEASE_TTL: Duration = Duration::from_secs(30 * 60);
const INDEX_TTL: Duration = Duration::from_secs(60 * 60);

/// Pass-through lists and TTL policy compiled from the configuration.
///
/// TTL selection layers, in order: built-in overrides for package-repository
/// metadata, configured `special_ttl` patterns (first match wins), and the
/// configured default. When `respect_headers` is set, `Cache-Control` may
/// lower the selected TTL afterwards but never raise it.
#[derive(Debug)]
pub struct Rules {
    passthrough: Vec<String>,
    https_passthrough: Vec<String>,
    special_ttl: Vec<(String, Duration)>,
    default_ttl: Duration,
    respect_headers: bool,
}

impl Rules {
    pub fn new(cfg: &RulesSettings, default_ttl: Duration, respect_headers: bool) -> Result<Self> {
        for pattern in cfg.passthrough.iter().chain(&cfg.https_passthrough) {
            ensure!(!pattern.is_empty(), "rule patterns must not be empty");
        }

        let mut special_ttl = Vec::with_capacity(cfg.special_ttl.len());
        for (pattern, ttl) in &cfg.special_ttl {
            ensure!(!pattern.is_empty(), "special_ttl patterns must not be empty");
            let ttl = humantime::parse_duration(ttl)
                .with_context(|| format!("invalid TTL '{ttl}' for pattern '{pattern}'"))?;
            special_ttl.push((pattern.clone(), ttl));
        }

        Ok(Self {
            passthrough: cfg.passthrough.clone(),
            https_passthrough: cfg.https_passthrough.clone(),
            special_ttl,
            default_ttl,
            respect_headers,
        })
    }

    pub fn should_passthrough(&self, url: &str) -> bool {
        self.passthrough
            .iter()
            .any(|pattern| match_pattern(url, pattern))
    }

    /// Whether a CONNECT tunnel to `host` (port already stripped) is allowed.
    pub fn should_allow_https(&self, host: &str) -> bool {
        self.https_passthrough
            .iter()
            .any(|pattern| match_pattern(host, pattern))
    }

    pub fn ttl_for(&self, url: &str) -> Duration {
        // Repository signatures churn fastest, then the Release files that
        // reference them, then the package indices themselves.
        if url.contains("InRelease") || url.contains("Release.gpg") {
            return RELEASE_SIGNATURE_TTL;
        }
        if url.contains("/Release") && !url.contains("InRelease") {
            return RELEASE_TTL;
        }
        if url.contains("/Packages") || url.contains("/Sources") {
            return INDEX_TTL;
        }

        for (pattern, ttl) in &self.special_ttl {
            if match_pattern(url, pattern) {
                return *ttl;
            }
        }

        self.default_ttl
    }

    /// TTL for a fetched response, clamped by `Cache-Control` when the proxy
    /// is configured to respect origin headers. A zero result suppresses
    /// caching entirely.
    pub fn effective_ttl(&self, url: &str, cache_control: Option<&str>) -> Duration {
        let ttl = self.ttl_for(url);
        if !self.respect_headers {
            return ttl;
        }

        let Some(cache_control) = cache_control else {
            return ttl;
        };

        let mut max_age = None;
        for directive in cache_control.split(',') {
            let directive = directive.trim();
            if directive.eq_ignore_ascii_case("no-cache") || directive.eq_ignore_ascii_case("no-store")
            {
                return Duration::ZERO;
            }
            if let Some(value) = directive.strip_prefix("max-age=")
                && let Ok(secs) = value.trim().parse::<u64>()
            {
                max_age = Some(Duration::from_secs(secs));
            }
        }

        match max_age {
            Some(age) if age > Duration::ZERO && age < ttl => age,
            _ => ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn rules_with(settings: RulesSettings, respect_headers: bool) -> Rules {
        Rules::new(&settings, Duration::from_secs(86_400), respect_headers).expect("compile rules")
    }

    fn default_rules() -> Rules {
        rules_with(RulesSettings::default(), false)
    }

    #[test]
    fn builtin_overrides_pick_repository_ttls() {
        let rules = default_rules();
        assert_eq!(
            rules.ttl_for("http://deb.debian.org/debian/dists/stable/InRelease"),
            Duration::from_secs(300)
        );
        assert_eq!(
            rules.ttl_for("http://deb.debian.org/debian/dists/stable/Release.gpg"),
            Duration::from_secs(300)
        );
        assert_eq!(
            rules.ttl_for("http://deb.debian.org/debian/dists/stable/Release"),
            Duration::from_secs(1800)
        );
        assert_eq!(
            rules.ttl_for("http://mirror/dists/main/binary-amd64/Packages.gz"),
            Duration::from_secs(3600)
        );
        assert_eq!(
            rules.ttl_for("http://mirror/dists/main/source/Sources.xz"),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn special_ttl_applies_after_builtins() {
        let mut special = HashMap::new();
        special.insert("*.iso".to_string(), "12h".to_string());
        let rules = rules_with(
            RulesSettings {
                special_ttl: special,
                ..Default::default()
            },
            false,
        );
        assert_eq!(
            rules.ttl_for("http://mirror/images/netinst.iso"),
            Duration::from_secs(12 * 3600)
        );
        assert_eq!(
            rules.ttl_for("http://mirror/pool/foo.deb"),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn invalid_special_ttl_is_a_config_error() {
        let mut special = HashMap::new();
        special.insert("*.iso".to_string(), "soon".to_string());
        let err = Rules::new(
            &RulesSettings {
                special_ttl: special,
                ..Default::default()
            },
            Duration::from_secs(60),
            false,
        )
        .expect_err("bogus duration must fail");
        assert!(err.to_string().contains("invalid TTL"));
    }

    #[test]
    fn empty_patterns_are_rejected() {
        let settings = RulesSettings {
            passthrough: vec![String::new()],
            ..Default::default()
        };
        assert!(Rules::new(&settings, Duration::from_secs(60), false).is_err());
    }

    #[test]
    fn passthrough_lists_match_urls_and_hosts() {
        let rules = rules_with(
            RulesSettings {
                passthrough: vec!["*meta.example*".to_string()],
                https_passthrough: vec!["*.example.com".to_string()],
                ..Default::default()
            },
            false,
        );
        assert!(rules.should_passthrough("http://meta.example/api"));
        assert!(!rules.should_passthrough("http://mirror/pool/foo.deb"));
        assert!(rules.should_allow_https("api.example.com"));
        assert!(!rules.should_allow_https("evil.example"));
    }

    #[test]
    fn cache_control_is_ignored_unless_configured() {
        let rules = default_rules();
        assert_eq!(
            rules.effective_ttl("http://mirror/pool/foo.deb", Some("no-store")),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn no_store_forces_zero_ttl() {
        let rules = rules_with(RulesSettings::default(), true);
        assert_eq!(
            rules.effective_ttl("http://mirror/pool/foo.deb", Some("no-store")),
            Duration::ZERO
        );
        assert_eq!(
            rules.effective_ttl("http://mirror/pool/foo.deb", Some("private, no-cache")),
            Duration::ZERO
        );
    }

    #[test]
    fn max_age_lowers_but_never_raises() {
        let rules = rules_with(RulesSettings::default(), true);
        assert_eq!(
            rules.effective_ttl("http://mirror/pool/foo.deb", Some("max-age=60")),
            Duration::from_secs(60)
        );
        // A max-age above the policy TTL must not extend it.
        assert_eq!(
            rules.effective_ttl("http://mirror/dists/stable/InRelease", Some("max-age=999999")),
            Duration::from_secs(300)
        );
        // max-age=0 is not an extension signal either; policy TTL stands.
        assert_eq!(
            rules.effective_ttl("http://mirror/pool/foo.deb", Some("max-age=0")),
            Duration::from_secs(86_400)
        );
    }
}
