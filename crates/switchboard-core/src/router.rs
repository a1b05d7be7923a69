//! Routing Engine
//!
//! Maps an incoming operation description to a candidate backend ID by
//! content rather than load: keyword/domain scoring against a free-text
//! query, or weighted matching against a property map. A routing miss is
//! not an error - both strategies return `None` and the caller falls back
//! to the load balancer.

use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Flat score added per domain substring match.
const DOMAIN_BONUS: f64 = 5.0;
/// Score added when the query looks arithmetic and the backend advertises
/// a calculation capability.
const ARITHMETIC_BONUS: f64 = 10.0;
/// Per-key property match scores: exact, contained, case-insensitive.
const PROPERTY_EXACT: f64 = 10.0;
const PROPERTY_CONTAINED: f64 = 5.0;
const PROPERTY_SUBSTRING: f64 = 3.0;
/// Multiplier applied when the `priority` property matched.
const PRIORITY_MULTIPLIER: f64 = 1.5;

/// Routing metadata registered alongside a backend.
#[derive(Debug, Clone, Default)]
pub struct RouteProfile {
    /// Keywords the backend claims (scored by length on match)
    pub keywords: Vec<String>,
    /// Domains the backend serves (flat bonus on substring match)
    pub domains: Vec<String>,
    /// Free-form properties for property-map routing
    pub properties: HashMap<String, String>,
    /// Capability names, used for intent detection
    pub capabilities: Vec<String>,
}

impl RouteProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn handles_arithmetic(&self) -> bool {
        self.capabilities.iter().any(|c| {
            let c = c.to_lowercase();
            c.contains("math") || c.contains("calc") || c.contains("arithmetic")
        })
    }
}

/// Content-based router over registered backends.
///
/// Profiles are kept in registration order so score ties break toward
/// the first-seen backend.
pub struct Router {
    profiles: Vec<(String, RouteProfile)>,
    arithmetic: Regex,
}

impl Router {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            // Two operands separated by an arithmetic operator
            arithmetic: Regex::new(r"\d+\s*[-+*/%^]\s*\d+").expect("static regex"),
        }
    }

    /// Registers routing metadata for a backend.
    ///
    /// Re-registering an existing ID replaces its profile in place,
    /// preserving its position in the tie-break order.
    pub fn register(&mut self, backend_id: impl Into<String>, profile: RouteProfile) {
        let backend_id = backend_id.into();
        if let Some(entry) = self.profiles.iter_mut().find(|(id, _)| *id == backend_id) {
            entry.1 = profile;
        } else {
            self.profiles.push((backend_id, profile));
        }
    }

    /// Removes a backend from routing.
    pub fn unregister(&mut self, backend_id: &str) {
        self.profiles.retain(|(id, _)| id != backend_id);
    }

    /// Number of registered profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Routes a free-text query by keyword and domain scoring.
    ///
    /// The query is lower-cased once. Each backend scores:
    /// - substring keyword match: + keyword length
    /// - whole-word keyword match: + keyword length again
    /// - domain substring match: + flat bonus
    /// - arithmetic-looking query against a calculation-capable backend:
    ///   + flat bonus
    ///
    /// # Returns
    ///
    /// The highest-scoring backend ID, ties broken by registration
    /// order; `None` when nothing scored above zero (routing miss).
    pub fn route_by_keywords(&self, query: &str) -> Option<String> {
        let query_lc = query.to_lowercase();
        let words: Vec<&str> = query_lc
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let is_arithmetic = self.arithmetic.is_match(&query_lc);

        let mut best: Option<(&str, f64)> = None;
        for (backend_id, profile) in &self.profiles {
            let mut score = 0.0;

            for keyword in &profile.keywords {
                let kw = keyword.to_lowercase();
                if kw.is_empty() {
                    continue;
                }
                if query_lc.contains(&kw) {
                    score += kw.len() as f64;
                    if words.iter().any(|w| *w == kw) {
                        // Exact word-boundary match counts double
                        score += kw.len() as f64;
                    }
                }
            }

            for domain in &profile.domains {
                if query_lc.contains(&domain.to_lowercase()) {
                    score += DOMAIN_BONUS;
                }
            }

            if is_arithmetic && profile.handles_arithmetic() {
                score += ARITHMETIC_BONUS;
            }

            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((backend_id, score));
            }
        }

        if let Some((id, score)) = best {
            debug!(backend_id = id, score, "keyword route selected");
        }
        best.map(|(id, _)| id.to_string())
    }

    /// Routes by matching a query property map against registered
    /// property maps.
    ///
    /// Per matching key: exact value 10, one value containing the other
    /// 5, case-insensitive substring 3. A match on the `priority` key
    /// multiplies the backend's total by 1.5.
    ///
    /// # Returns
    ///
    /// The highest-scoring backend ID, or `None` on a routing miss.
    pub fn route_by_properties(&self, query: &HashMap<String, String>) -> Option<String> {
        let mut best: Option<(&str, f64)> = None;
        for (backend_id, profile) in &self.profiles {
            let mut score = 0.0;
            let mut priority_matched = false;

            for (key, wanted) in query {
                let Some(registered) = profile.properties.get(key) else {
                    continue;
                };
                let contribution = if registered == wanted {
                    PROPERTY_EXACT
                } else if registered.contains(wanted.as_str()) || wanted.contains(registered.as_str()) {
                    PROPERTY_CONTAINED
                } else if registered
                    .to_lowercase()
                    .contains(&wanted.to_lowercase())
                    || wanted.to_lowercase().contains(&registered.to_lowercase())
                {
                    PROPERTY_SUBSTRING
                } else {
                    0.0
                };
                if contribution > 0.0 && key == "priority" {
                    priority_matched = true;
                }
                score += contribution;
            }

            if priority_matched {
                score *= PRIORITY_MULTIPLIER;
            }

            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((backend_id, score));
            }
        }

        if let Some((id, score)) = best {
            debug!(backend_id = id, score, "property route selected");
        }
        best.map(|(id, _)| id.to_string())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(profiles: Vec<(&str, RouteProfile)>) -> Router {
        let mut router = Router::new();
        for (id, profile) in profiles {
            router.register(id, profile);
        }
        router
    }

    #[test]
    fn test_keyword_substring_match() {
        let router = router_with(vec![(
            "files",
            RouteProfile::new().with_keywords(vec!["filesystem".to_string()]),
        )]);
        assert_eq!(
            router.route_by_keywords("read something from the filesystem"),
            Some("files".to_string())
        );
    }

    #[test]
    fn test_keyword_miss_returns_none() {
        let router = router_with(vec![(
            "files",
            RouteProfile::new().with_keywords(vec!["filesystem".to_string()]),
        )]);
        assert_eq!(router.route_by_keywords("translate this sentence"), None);
    }

    #[test]
    fn test_longer_keyword_outscores_shorter() {
        let router = router_with(vec![
            ("a", RouteProfile::new().with_keywords(vec!["file".to_string()])),
            (
                "b",
                RouteProfile::new().with_keywords(vec!["filesystem".to_string()]),
            ),
        ]);
        // "filesystem" contains "file" too, but b's keyword is longer
        assert_eq!(
            router.route_by_keywords("filesystem please"),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_exact_word_match_counts_double() {
        let router = router_with(vec![
            ("sub", RouteProfile::new().with_keywords(vec!["looku".to_string()])),
            ("word", RouteProfile::new().with_keywords(vec!["base".to_string()])),
        ]);
        // "base" appears as a whole word (8 points), "looku" only as a
        // substring of "lookup" (5 points)
        assert_eq!(
            router.route_by_keywords("base lookup"),
            Some("word".to_string())
        );
    }

    #[test]
    fn test_tie_breaks_first_seen() {
        let router = router_with(vec![
            ("first", RouteProfile::new().with_keywords(vec!["query".to_string()])),
            ("second", RouteProfile::new().with_keywords(vec!["query".to_string()])),
        ]);
        assert_eq!(
            router.route_by_keywords("run a query"),
            Some("first".to_string())
        );
    }

    #[test]
    fn test_domain_bonus() {
        let router = router_with(vec![
            ("generic", RouteProfile::new().with_keywords(vec!["data".to_string()])),
            (
                "weather",
                RouteProfile::new().with_domains(vec!["weather".to_string()]),
            ),
        ]);
        assert_eq!(
            router.route_by_keywords("weather data for tomorrow"),
            Some("weather".to_string())
        );
    }

    #[test]
    fn test_arithmetic_intent_detection() {
        let router = router_with(vec![
            ("text", RouteProfile::new().with_keywords(vec!["what".to_string()])),
            (
                "calc",
                RouteProfile::new()
                    .with_keywords(vec!["is".to_string()])
                    .with_capabilities(vec!["math.evaluate".to_string()]),
            ),
        ]);
        assert_eq!(
            router.route_by_keywords("what is 12 * 7"),
            Some("calc".to_string())
        );
    }

    #[test]
    fn test_arithmetic_requires_capable_backend() {
        let router = router_with(vec![(
            "text",
            RouteProfile::new().with_keywords(vec!["summarize".to_string()]),
        )]);
        // Arithmetic query, but no calculation-capable backend and no
        // keyword match either
        assert_eq!(router.route_by_keywords("3 + 4"), None);
    }

    #[test]
    fn test_property_exact_match() {
        let mut props = HashMap::new();
        props.insert("region".to_string(), "eu-west".to_string());
        let router = router_with(vec![(
            "eu",
            RouteProfile::new().with_properties(props.clone()),
        )]);
        assert_eq!(router.route_by_properties(&props), Some("eu".to_string()));
    }

    #[test]
    fn test_property_scoring_tiers() {
        let mut exact = HashMap::new();
        exact.insert("model".to_string(), "large".to_string());
        let mut contained = HashMap::new();
        contained.insert("model".to_string(), "large-v2".to_string());
        let mut cased = HashMap::new();
        cased.insert("model".to_string(), "LARGE-V2".to_string());

        let router = router_with(vec![
            ("exact", RouteProfile::new().with_properties(exact)),
            ("contained", RouteProfile::new().with_properties(contained)),
            ("cased", RouteProfile::new().with_properties(cased)),
        ]);

        let mut query = HashMap::new();
        query.insert("model".to_string(), "large".to_string());
        // exact (10) beats contained (5) beats case-insensitive (3)
        assert_eq!(router.route_by_properties(&query), Some("exact".to_string()));

        let router = router_with(vec![
            (
                "contained",
                RouteProfile::new().with_properties({
                    let mut m = HashMap::new();
                    m.insert("model".to_string(), "large-v2".to_string());
                    m
                }),
            ),
            (
                "cased",
                RouteProfile::new().with_properties({
                    let mut m = HashMap::new();
                    m.insert("model".to_string(), "LARGE-V2".to_string());
                    m
                }),
            ),
        ]);
        assert_eq!(
            router.route_by_properties(&query),
            Some("contained".to_string())
        );
    }

    #[test]
    fn test_priority_multiplier() {
        let mut plain = HashMap::new();
        plain.insert("tier".to_string(), "premium".to_string());
        plain.insert("region".to_string(), "us".to_string());

        let mut prioritized = HashMap::new();
        prioritized.insert("priority".to_string(), "high".to_string());
        prioritized.insert("region".to_string(), "us".to_string());

        let router = router_with(vec![
            ("plain", RouteProfile::new().with_properties(plain)),
            ("prio", RouteProfile::new().with_properties(prioritized)),
        ]);

        let mut query = HashMap::new();
        query.insert("tier".to_string(), "premium".to_string());
        query.insert("priority".to_string(), "high".to_string());
        query.insert("region".to_string(), "us".to_string());

        // plain: tier 10 + region 10 = 20; prio: (priority 10 + region 10) * 1.5 = 30
        assert_eq!(router.route_by_properties(&query), Some("prio".to_string()));
    }

    #[test]
    fn test_property_miss_returns_none() {
        let router = router_with(vec![(
            "a",
            RouteProfile::new().with_properties(HashMap::new()),
        )]);
        let mut query = HashMap::new();
        query.insert("region".to_string(), "eu".to_string());
        assert_eq!(router.route_by_properties(&query), None);
    }

    #[test]
    fn test_unregister() {
        let mut router = router_with(vec![(
            "a",
            RouteProfile::new().with_keywords(vec!["query".to_string()]),
        )]);
        assert_eq!(router.len(), 1);
        router.unregister("a");
        assert!(router.is_empty());
        assert_eq!(router.route_by_keywords("query"), None);
    }

    #[test]
    fn test_reregister_keeps_position() {
        let mut router = router_with(vec![
            ("a", RouteProfile::new().with_keywords(vec!["query".to_string()])),
            ("b", RouteProfile::new().with_keywords(vec!["query".to_string()])),
        ]);
        // Re-register "a" with the same keyword; it should still win ties
        router.register("a", RouteProfile::new().with_keywords(vec!["query".to_string()]));
        assert_eq!(router.route_by_keywords("query"), Some("a".to_string()));
        assert_eq!(router.len(), 2);
    }
}
