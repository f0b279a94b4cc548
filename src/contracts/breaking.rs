//! Heuristic breaking-change detection, one strategy per contract kind.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::contract::ContractKind;

/// Share of old lines that may disappear before a generic contract
/// counts as broken.
pub const LINE_LOSS_THRESHOLD: f64 = 0.20;

const MAX_EVIDENCE: usize = 10;

static ROUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[\w{][\w\-.{}:/]*").expect("route regex is valid"));

static JSON_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([A-Za-z_$][\w\-$]*)"\s*:"#).expect("json key regex is valid"));

static GRAPHQL_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:extend\s+)?(?:type|input|enum|interface|union|scalar)\s+([A-Za-z_]\w*)")
        .expect("graphql type regex is valid")
});

static GRAPHQL_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*([A-Za-z_]\w*)\s*(?:\([^)]*\))?\s*:")
        .expect("graphql field regex is valid")
});

static TS_EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"export\s+(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|const|let|var|class|interface|type|enum|namespace)\s+([A-Za-z_$][\w$]*)",
    )
    .expect("typescript export regex is valid")
});

static PROTO_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:message|service|enum|rpc)\s+([A-Za-z_]\w*)")
        .expect("protobuf regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Every `/path/{param}` token must survive.
    RouteTokens,
    /// Every declared key or type/field name must survive.
    SchemaKeys,
    /// Every exported symbol must survive.
    ExportedSymbols,
    /// At most 20% of old lines may disappear.
    LineSet,
    /// The publisher said so.
    Declared,
    /// Nothing to compare against.
    FirstVersion,
}

impl Strategy {
    pub fn for_kind(kind: ContractKind) -> Self {
        match kind {
            ContractKind::OpenApi => Strategy::RouteTokens,
            ContractKind::JsonSchema | ContractKind::GraphQl => Strategy::SchemaKeys,
            ContractKind::TypeScript | ContractKind::Protobuf => Strategy::ExportedSymbols,
            ContractKind::Other => Strategy::LineSet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakingAssessment {
    pub breaking: bool,
    pub strategy: Strategy,
    /// Human-readable reasons, e.g. removed routes or symbols.
    pub evidence: Vec<String>,
}

impl BreakingAssessment {
    fn new(breaking: bool, strategy: Strategy, evidence: Vec<String>) -> Self {
        Self {
            breaking,
            strategy,
            evidence,
        }
    }
}

/// Decide whether `next` breaks consumers of `previous`.
///
/// A publisher's explicit flag wins. The first version is never breaking.
/// When the kind's strategy finds nothing to compare in the old content,
/// the line-set comparison is used instead.
pub fn assess(
    kind: ContractKind,
    previous: Option<&str>,
    next: &str,
    declared: Option<bool>,
) -> BreakingAssessment {
    if let Some(breaking) = declared {
        return BreakingAssessment::new(
            breaking,
            Strategy::Declared,
            vec!["declared by publisher".to_string()],
        );
    }
    let Some(previous) = previous else {
        return BreakingAssessment::new(false, Strategy::FirstVersion, Vec::new());
    };

    let strategy = Strategy::for_kind(kind);
    let old_names = match strategy {
        Strategy::RouteTokens => routes(previous),
        Strategy::SchemaKeys => schema_names(kind, previous),
        Strategy::ExportedSymbols => exported_symbols(kind, previous),
        _ => BTreeSet::new(),
    };
    if old_names.is_empty() {
        return line_set(previous, next);
    }

    let missing: Vec<String> = match strategy {
        Strategy::SchemaKeys => {
            let new_names = schema_names(kind, next);
            old_names.difference(&new_names).cloned().collect()
        }
        _ => old_names
            .into_iter()
            .filter(|name| !next.contains(name.as_str()))
            .collect(),
    };
    let label = match strategy {
        Strategy::RouteTokens => "removed route",
        Strategy::SchemaKeys => "removed key",
        _ => "removed symbol",
    };
    let evidence = missing
        .iter()
        .take(MAX_EVIDENCE)
        .map(|name| format!("{} {}", label, name))
        .collect();
    BreakingAssessment::new(!missing.is_empty(), strategy, evidence)
}

fn routes(content: &str) -> BTreeSet<String> {
    ROUTE_RE
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches(['/', '.', ':']).to_string())
        .filter(|r| r.len() > 1)
        .collect()
}

fn schema_names(kind: ContractKind, content: &str) -> BTreeSet<String> {
    match kind {
        ContractKind::GraphQl => GRAPHQL_TYPE_RE
            .captures_iter(content)
            .chain(GRAPHQL_FIELD_RE.captures_iter(content))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        _ => JSON_KEY_RE
            .captures_iter(content)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
    }
}

fn exported_symbols(kind: ContractKind, content: &str) -> BTreeSet<String> {
    let re = match kind {
        ContractKind::Protobuf => &*PROTO_DECL_RE,
        _ => &*TS_EXPORT_RE,
    };
    re.captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn line_set(previous: &str, next: &str) -> BreakingAssessment {
    let old: BTreeSet<&str> = previous
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if old.is_empty() {
        return BreakingAssessment::new(false, Strategy::LineSet, Vec::new());
    }
    let new: BTreeSet<&str> = next.lines().map(str::trim).collect();
    let missing: Vec<&str> = old.iter().copied().filter(|l| !new.contains(l)).collect();
    let ratio = missing.len() as f64 / old.len() as f64;
    let breaking = ratio > LINE_LOSS_THRESHOLD;
    let mut evidence = vec![format!(
        "{} of {} lines removed ({:.0}%)",
        missing.len(),
        old.len(),
        ratio * 100.0
    )];
    if breaking {
        evidence.extend(
            missing
                .iter()
                .take(MAX_EVIDENCE)
                .map(|l| format!("removed line: {}", l)),
        );
    }
    BreakingAssessment::new(breaking, Strategy::LineSet, evidence)
}
