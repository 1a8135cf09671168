//! Filter rule data model
//!
//! A filter's identity is its normalized text; the graph interns filters so
//! equal text always resolves to the same entry. Variants are a closed sum
//! type; the URL matching dialect kept here is deliberately small, the
//! storage and reconciliation logic never depends on it.

use std::collections::HashMap;

use crate::storage::SubscriptionId;

// =============================================================================
// Content Types
// =============================================================================

bitflags::bitflags! {
    /// Request content type mask for URL filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContentType: u32 {
        const OTHER = 1 << 0;
        const SCRIPT = 1 << 1;
        const IMAGE = 1 << 2;
        const STYLESHEET = 1 << 3;
        const OBJECT = 1 << 4;
        const SUBDOCUMENT = 1 << 5;
        const DOCUMENT = 1 << 6;
        const XMLHTTPREQUEST = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const FONT = 1 << 9;
        const MEDIA = 1 << 10;
        const PING = 1 << 11;
        const POPUP = 1 << 12;
        const ELEMHIDE = 1 << 13;
    }
}

impl ContentType {
    /// Mask applied when a filter names no type options: everything except
    /// the types that must be requested explicitly.
    pub fn default_mask() -> ContentType {
        ContentType::all() - ContentType::DOCUMENT - ContentType::ELEMHIDE - ContentType::POPUP
    }

    /// Look up a `$`-option type name. Distinct from the bitflags-generated
    /// `from_name`, which matches the uppercase flag identifiers.
    pub fn parse_name(name: &str) -> Option<ContentType> {
        match name {
            "other" => Some(ContentType::OTHER),
            "script" => Some(ContentType::SCRIPT),
            "image" => Some(ContentType::IMAGE),
            "stylesheet" => Some(ContentType::STYLESHEET),
            "object" => Some(ContentType::OBJECT),
            "subdocument" => Some(ContentType::SUBDOCUMENT),
            "document" => Some(ContentType::DOCUMENT),
            "xmlhttprequest" => Some(ContentType::XMLHTTPREQUEST),
            "websocket" => Some(ContentType::WEBSOCKET),
            "font" => Some(ContentType::FONT),
            "media" => Some(ContentType::MEDIA),
            "ping" => Some(ContentType::PING),
            "popup" => Some(ContentType::POPUP),
            "elemhide" => Some(ContentType::ELEMHIDE),
            _ => None,
        }
    }
}

// =============================================================================
// Domain Restrictions
// =============================================================================

/// Domain activation spec for a filter.
///
/// Entries map a domain to include (true) or exclude (false); lookups walk
/// the document domain from most to least specific, first hit wins. With no
/// include entries the filter is active everywhere not excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSpec {
    map: HashMap<String, bool>,
    default_active: bool,
}

impl DomainSpec {
    /// Parse a domain source split on `separator` (`|` in filter options,
    /// `,` in element-hide prefixes). `~` marks an exclusion.
    pub fn parse(source: &str, separator: char) -> DomainSpec {
        let mut map = HashMap::new();
        let mut has_include = false;
        for raw in source.split(separator) {
            let raw = raw.trim().to_ascii_lowercase();
            if raw.is_empty() {
                continue;
            }
            match raw.strip_prefix('~') {
                Some(domain) if !domain.is_empty() => {
                    map.insert(domain.to_string(), false);
                }
                Some(_) => {}
                None => {
                    has_include = true;
                    map.insert(raw, true);
                }
            }
        }
        let default_active = !has_include;
        DomainSpec { map, default_active }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether the filter has no positive domain restriction, i.e. applies
    /// generically. Used to suppress generic hiding on fragile hosts.
    pub fn is_generic(&self) -> bool {
        self.map.is_empty() || self.default_active
    }

    pub fn is_active_on(&self, doc_domain: &str) -> bool {
        if self.map.is_empty() {
            return true;
        }
        let doc_domain = doc_domain.trim_end_matches('.').to_ascii_lowercase();
        let mut current: &str = &doc_domain;
        loop {
            if let Some(&active) = self.map.get(current) {
                return active;
            }
            match current.find('.') {
                Some(dot) => current = &current[dot + 1..],
                None => break,
            }
        }
        self.default_active
    }
}

// =============================================================================
// Filter Variants
// =============================================================================

/// Details of a blocking or whitelisting URL filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFilter {
    pub pattern: String,
    pub content_types: ContentType,
    pub domains: DomainSpec,
    /// None: both parties; Some(true): third-party only; Some(false):
    /// first-party only.
    pub third_party: Option<bool>,
    pub match_case: bool,
    pub collapse: bool,
}

/// Details of an element-hiding rule or exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElemHideData {
    pub selector: String,
    pub domains: DomainSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    Comment,
    Invalid { reason: String },
    Blocking(UrlFilter),
    Whitelist(UrlFilter),
    ElemHide(ElemHideData),
    ElemHideException(ElemHideData),
}

/// A single filter rule, identified by its normalized text.
#[derive(Debug, Clone)]
pub struct Filter {
    pub text: String,
    pub kind: FilterKind,
    pub disabled: bool,
    pub hit_count: u64,
    pub last_hit: u64,
    /// Subscriptions containing this filter; no duplicates even when the
    /// filter appears several times in one subscription.
    pub subscriptions: Vec<SubscriptionId>,
}

impl Filter {
    /// Normalize rule text before interning: comments are trimmed,
    /// element-hide rules lose whitespace in the domain part only, all
    /// other rules lose whitespace entirely.
    pub fn normalize(text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') {
            return trimmed.to_string();
        }
        if let Some((domains, rest)) = split_elemhide(trimmed) {
            let (separator, selector) = rest;
            let domains: String = domains.chars().filter(|c| !c.is_whitespace()).collect();
            return format!("{domains}{separator}{}", selector.trim());
        }
        trimmed.chars().filter(|c| !c.is_whitespace()).collect()
    }

    /// Parse normalized text into a filter. Never fails; unparseable rules
    /// become `FilterKind::Invalid` so they can still be stored and listed.
    pub fn from_text(text: &str) -> Filter {
        let kind = parse_kind(text);
        Filter {
            text: text.to_string(),
            kind,
            disabled: false,
            hit_count: 0,
            last_hit: 0,
            subscriptions: Vec::new(),
        }
    }

    /// Whether the filter participates in matching at all (not a comment or
    /// invalid rule).
    pub fn is_active(&self) -> bool {
        matches!(
            self.kind,
            FilterKind::Blocking(_)
                | FilterKind::Whitelist(_)
                | FilterKind::ElemHide(_)
                | FilterKind::ElemHideException(_)
        )
    }

    pub fn is_url_filter(&self) -> bool {
        matches!(self.kind, FilterKind::Blocking(_) | FilterKind::Whitelist(_))
    }

    pub fn is_elemhide(&self) -> bool {
        matches!(self.kind, FilterKind::ElemHide(_) | FilterKind::ElemHideException(_))
    }

    pub fn elemhide_data(&self) -> Option<&ElemHideData> {
        match &self.kind {
            FilterKind::ElemHide(data) | FilterKind::ElemHideException(data) => Some(data),
            _ => None,
        }
    }

    pub fn url_filter(&self) -> Option<&UrlFilter> {
        match &self.kind {
            FilterKind::Blocking(f) | FilterKind::Whitelist(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_active_on_domain(&self, doc_domain: &str) -> bool {
        match &self.kind {
            FilterKind::Blocking(f) | FilterKind::Whitelist(f) => f.domains.is_active_on(doc_domain),
            FilterKind::ElemHide(data) | FilterKind::ElemHideException(data) => {
                data.domains.is_active_on(doc_domain)
            }
            _ => false,
        }
    }

    /// Match a URL request against this filter. Only URL filters match.
    pub fn matches(&self, url: &str, content_type: ContentType, doc_domain: &str, third_party: bool) -> bool {
        let details = match self.url_filter() {
            Some(details) => details,
            None => return false,
        };
        if !details.content_types.intersects(content_type) {
            return false;
        }
        if let Some(wanted) = details.third_party {
            if wanted != third_party {
                return false;
            }
        }
        if !details.domains.is_active_on(doc_domain) {
            return false;
        }
        pattern_matches(&details.pattern, url, details.match_case)
    }
}

// =============================================================================
// Text Parsing
// =============================================================================

/// Locate an element-hide separator, returning the domain part and the
/// separator + selector.
fn split_elemhide(text: &str) -> Option<(&str, (&str, &str))> {
    if let Some(pos) = text.find("#@#") {
        return Some((&text[..pos], ("#@#", &text[pos + 3..])));
    }
    if let Some(pos) = text.find("##") {
        return Some((&text[..pos], ("##", &text[pos + 2..])));
    }
    None
}

fn parse_kind(text: &str) -> FilterKind {
    if text.is_empty() {
        return FilterKind::Invalid { reason: "empty filter".to_string() };
    }
    if text.starts_with('!') {
        return FilterKind::Comment;
    }

    if let Some((domains, (separator, selector))) = split_elemhide(text) {
        if selector.is_empty() {
            return FilterKind::Invalid { reason: "missing selector".to_string() };
        }
        let data = ElemHideData {
            selector: selector.to_string(),
            domains: DomainSpec::parse(domains, ','),
        };
        return if separator == "#@#" {
            FilterKind::ElemHideException(data)
        } else {
            FilterKind::ElemHide(data)
        };
    }

    let (whitelist, rest) = match text.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    match parse_url_filter(rest) {
        Ok(details) => {
            if whitelist {
                FilterKind::Whitelist(details)
            } else {
                FilterKind::Blocking(details)
            }
        }
        Err(reason) => FilterKind::Invalid { reason },
    }
}

fn parse_url_filter(text: &str) -> Result<UrlFilter, String> {
    let (pattern, options_text) = match text.rfind('$') {
        Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
        None => (text, None),
    };
    if pattern.is_empty() {
        return Err("empty pattern".to_string());
    }

    let mut include_types = ContentType::empty();
    let mut exclude_types = ContentType::empty();
    let mut domains = DomainSpec::default();
    let mut third_party = None;
    let mut match_case = false;
    let mut collapse = true;

    if let Some(options_text) = options_text {
        for raw in options_text.split(',') {
            let option = raw.trim().to_ascii_lowercase();
            if option.is_empty() {
                continue;
            }
            if let Some(value) = option.strip_prefix("domain=") {
                domains = DomainSpec::parse(value, '|');
                continue;
            }
            match option.as_str() {
                "third-party" => third_party = Some(true),
                "~third-party" => third_party = Some(false),
                "match-case" => match_case = true,
                "collapse" => collapse = true,
                "~collapse" => collapse = false,
                _ => {
                    let (negated, name) = match option.strip_prefix('~') {
                        Some(rest) => (true, rest),
                        None => (false, option.as_str()),
                    };
                    match ContentType::parse_name(name) {
                        Some(mask) if negated => exclude_types |= mask,
                        Some(mask) => include_types |= mask,
                        None => return Err(format!("unknown option: {raw}")),
                    }
                }
            }
        }
    }

    let content_types = if include_types.is_empty() {
        ContentType::default_mask() - exclude_types
    } else {
        include_types - exclude_types
    };

    Ok(UrlFilter {
        pattern: pattern.to_string(),
        content_types,
        domains,
        third_party,
        match_case,
        collapse,
    })
}

// =============================================================================
// Pattern Matching
// =============================================================================

/// Small ABP-style pattern match: `||` host anchor, `|` edge anchors, `*`
/// wildcard, `^` separator placeholder. Not a full dialect.
fn pattern_matches(pattern: &str, url: &str, match_case: bool) -> bool {
    let (pattern, url) = if match_case {
        (pattern.to_string(), url.to_string())
    } else {
        (pattern.to_ascii_lowercase(), url.to_ascii_lowercase())
    };

    let (pattern, anchored_start, host_anchor) = if let Some(rest) = pattern.strip_prefix("||") {
        (rest.to_string(), false, true)
    } else if let Some(rest) = pattern.strip_prefix('|') {
        (rest.to_string(), true, false)
    } else {
        (pattern, false, false)
    };
    let (pattern, anchored_end) = match pattern.strip_suffix('|') {
        Some(rest) => (rest.to_string(), true),
        None => (pattern, false),
    };

    let pieces: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, piece) in pieces.iter().enumerate() {
        let must_anchor = i == 0 && (anchored_start || host_anchor);
        match find_piece(&url, piece, pos, must_anchor, host_anchor) {
            Some(end) => pos = end,
            None => return false,
        }
    }
    // A trailing ^ may have consumed the virtual end-of-URL position.
    if anchored_end {
        return pos >= url.len();
    }
    true
}

/// Find one literal piece (with `^` separator placeholders) at or after
/// `from`. Returns the position after the match.
fn find_piece(url: &str, piece: &str, from: usize, anchored: bool, host_anchor: bool) -> Option<usize> {
    if piece.is_empty() {
        return Some(from);
    }
    let url_bytes = url.as_bytes();
    let starts: Vec<usize> = if anchored && !host_anchor {
        vec![from]
    } else {
        (from..=url.len().saturating_sub(1)).collect()
    };
    'outer: for start in starts {
        let mut u = start;
        for pc in piece.bytes() {
            if u >= url_bytes.len() {
                // `^` also matches the end of the URL.
                if pc == b'^' {
                    u += 1;
                    continue;
                }
                continue 'outer;
            }
            let uc = url_bytes[u];
            let ok = if pc == b'^' {
                !(uc.is_ascii_alphanumeric() || uc == b'%' || uc == b'_' || uc == b'-' || uc == b'.')
            } else {
                pc == uc
            };
            if !ok {
                if anchored && !host_anchor {
                    return None;
                }
                continue 'outer;
            }
            u += 1;
        }
        if host_anchor && !is_host_anchored(url, start) {
            continue;
        }
        return Some(u.min(url.len() + 1));
    }
    None
}

/// For a `||` anchor the match must begin at the host start or at a label
/// boundary inside the host.
fn is_host_anchored(url: &str, start: usize) -> bool {
    let host_start = match url.find("://") {
        Some(pos) => pos + 3,
        None => 0,
    };
    if start == host_start {
        return true;
    }
    start > host_start && url.as_bytes().get(start - 1) == Some(&b'.')
}
