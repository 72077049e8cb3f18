//! Reconciliation of research candidates into one decision per technology
//! category.
//!
//! This module does no I/O. The orchestrator loads candidates from the
//! store, calls [`reconcile`], then either re-dispatches the returned
//! opportunities or commits the decisions.

use keystone_core::{
    CompatibilityNote, CompatibilityRelation, Confidence, DeclaredDefault, ExplicitRequirement,
    OpportunityId, Provenance, Recommendation, ResearchContext, TechCategory,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::config::Severity;

/// A technology proposed for one category, before reconciliation decides on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub opportunity: Option<OpportunityId>,
    pub category: TechCategory,
    pub name: String,
    pub version: Option<String>,
    pub source: Option<String>,
    pub alternatives: Vec<String>,
    pub rationale: Option<String>,
    pub compatibility_notes: Vec<CompatibilityNote>,
    pub confidence: Confidence,
    pub provenance: Provenance,
    /// Notes recorded by reconciliation, e.g. which alternative lost a tie-break.
    pub resolution_notes: Vec<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Candidate {
    pub fn researched(opportunity: OpportunityId, recommendation: Recommendation) -> Self {
        Self {
            opportunity: Some(opportunity),
            category: opportunity.technology_category(),
            name: recommendation.recommendation.trim().to_string(),
            version: non_empty(&recommendation.version),
            source: non_empty(&recommendation.source),
            alternatives: recommendation.alternatives,
            rationale: non_empty(&recommendation.rationale),
            compatibility_notes: recommendation.compatibility_notes,
            confidence: recommendation.confidence,
            provenance: Provenance::Researched,
            resolution_notes: Vec::new(),
        }
    }

    pub fn explicit(requirement: &ExplicitRequirement, opportunity: Option<OpportunityId>) -> Self {
        Self {
            opportunity,
            category: requirement.category,
            name: requirement.technology.trim().to_string(),
            version: requirement.version.as_deref().and_then(non_empty),
            source: None,
            alternatives: Vec::new(),
            rationale: Some("Named explicitly in the requirements".to_string()),
            compatibility_notes: Vec::new(),
            confidence: Confidence::High,
            provenance: Provenance::ExplicitRequirement,
            resolution_notes: Vec::new(),
        }
    }

    pub fn declared_default(opportunity: OpportunityId, default: &DeclaredDefault) -> Self {
        Self {
            opportunity: Some(opportunity),
            category: opportunity.technology_category(),
            name: default.technology.trim().to_string(),
            version: default.version.as_deref().and_then(non_empty),
            source: None,
            alternatives: Vec::new(),
            rationale: default.rationale.clone(),
            compatibility_notes: Vec::new(),
            confidence: Confidence::Low,
            provenance: Provenance::Default,
            resolution_notes: vec![format!("Declared default for {}", opportunity)],
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.provenance == Provenance::ExplicitRequirement
    }

    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}", self.name, version),
            None => self.name.clone(),
        }
    }

    /// Where the candidate came from, for notes and issue descriptions.
    pub fn origin(&self) -> String {
        match (self.provenance, self.opportunity) {
            (Provenance::ExplicitRequirement, _) => "explicit requirement".to_string(),
            (_, Some(opportunity)) => opportunity.to_string(),
            (_, None) => self.provenance.as_str().to_string(),
        }
    }

    fn catalog_index(&self) -> usize {
        self.opportunity
            .map(|o| o.catalog_index())
            .unwrap_or(OpportunityId::ALL.len())
    }

    /// Fills details this candidate lacks from an agreeing candidate.
    fn absorb(&mut self, other: Candidate) {
        if self.version.is_none() {
            self.version = other.version;
        }
        if self.source.is_none() {
            self.source = other.source;
        }
        if self.alternatives.is_empty() {
            self.alternatives = other.alternatives;
        }
        if self.is_explicit() && other.rationale.is_some() {
            self.rationale = other.rationale;
        }
        for note in other.compatibility_notes {
            if !self.compatibility_notes.contains(&note) {
                self.compatibility_notes.push(note);
            }
        }
        if self.opportunity.is_none() {
            self.opportunity = other.opportunity;
        }
    }
}

/// Deterministic rule that decided a tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    ExplicitRequirement,
    HigherConfidence,
    CatalogOrder,
}

impl fmt::Display for TieBreakRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExplicitRequirement => "explicit requirement",
            Self::HigherConfidence => "higher confidence",
            Self::CatalogOrder => "catalog order",
        })
    }
}

/// Orders two candidates: returns `(winner, loser, rule)` indices.
fn tie_break(candidates: &[Candidate], a: usize, b: usize) -> (usize, usize, TieBreakRule) {
    let (x, y) = (&candidates[a], &candidates[b]);
    if x.is_explicit() != y.is_explicit() {
        return if x.is_explicit() {
            (a, b, TieBreakRule::ExplicitRequirement)
        } else {
            (b, a, TieBreakRule::ExplicitRequirement)
        };
    }
    if x.confidence != y.confidence {
        return if x.confidence > y.confidence {
            (a, b, TieBreakRule::HigherConfidence)
        } else {
            (b, a, TieBreakRule::HigherConfidence)
        };
    }
    if y.catalog_index() < x.catalog_index() {
        (b, a, TieBreakRule::CatalogOrder)
    } else {
        (a, b, TieBreakRule::CatalogOrder)
    }
}

/// Explicit requirements make any issue low severity; otherwise differing
/// confidence is medium and equal confidence is high.
fn severity_of(winner: &Candidate, loser: &Candidate) -> Severity {
    if winner.is_explicit() || loser.is_explicit() {
        Severity::Low
    } else if winner.confidence != loser.confidence {
        Severity::Medium
    } else {
        Severity::High
    }
}

/// Spellings that name the same technology, as `(alias, canonical)`.
const ALIASES: &[(&str, &str)] = &[
    ("postgres", "postgresql"),
    ("pg", "postgresql"),
    ("mongo", "mongodb"),
    ("golang", "go"),
    ("k8s", "kubernetes"),
    ("node", "nodejs"),
    ("vue", "vuejs"),
];

fn is_version(word: &str) -> bool {
    let word = word.strip_prefix('v').unwrap_or(word);
    word.starts_with(|c: char| c.is_ascii_digit())
}

/// Lowercases, drops a trailing version word and the separators `.`, `-`
/// and `_`. Other punctuation is kept, so `C`, `C++` and `C#` stay distinct.
fn canonical(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mut words: Vec<&str> = lowered.split_whitespace().collect();
    if words.len() > 1 && words.last().is_some_and(|w| is_version(w)) {
        words.pop();
    }
    let joined: String = words
        .concat()
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '_'))
        .collect();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == joined)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(joined)
}

/// Name equality up to case, separators, a trailing version and known
/// aliases: `Postgres` matches `PostgreSQL 16`, `Java` never matches
/// `JavaScript`.
pub fn names_match(a: &str, b: &str) -> bool {
    let (a, b) = (canonical(a), canonical(b));
    !a.is_empty() && a == b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Two candidates for the same category.
    Conflict,
    /// A candidate's compatibility notes contradict another decision.
    Incoherence,
    /// An expected decision is missing.
    Gap,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Incoherence => "incoherence",
            Self::Gap => "gap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    TieBreak {
        winner: String,
        loser: String,
        rule: TieBreakRule,
    },
    Redispatch {
        opportunity: OpportunityId,
    },
    DefaultApplied {
        technology: String,
    },
    /// Nothing could fill the gap; reported, never fabricated.
    HardGap,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TieBreak { winner, rule, .. } => write!(f, "tie-break ({}): kept {}", rule, winner),
            Self::Redispatch { opportunity } => write!(f, "re-dispatch {}", opportunity),
            Self::DefaultApplied { technology } => write!(f, "declared default {}", technology),
            Self::HardGap => f.write_str("hard gap"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub category: TechCategory,
    pub description: String,
    pub opportunities: Vec<OpportunityId>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedispatchRequest {
    pub opportunity: OpportunityId,
    /// Conflict description appended to the research context.
    pub follow_up: String,
}

/// A candidate that did not make it into the decision set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub candidate: Candidate,
    pub reason: String,
}

pub struct ReconcileInput<'a> {
    pub context: &'a ResearchContext,
    pub candidates: Vec<Candidate>,
    /// Every opportunity created in the foundation phase.
    pub selected: &'a [OpportunityId],
    pub skipped: &'a HashMap<OpportunityId, String>,
    /// Targeted re-dispatch rounds each opportunity has left.
    pub remaining_budget: &'a HashMap<OpportunityId, u32>,
    pub threshold: Severity,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// One candidate per category, in category order.
    pub decisions: Vec<Candidate>,
    pub dropped: Vec<Dropped>,
    pub issues: Vec<Issue>,
    pub redispatch: Vec<RedispatchRequest>,
}

impl Reconciliation {
    /// True when nothing needs re-dispatching and the decisions can be committed.
    pub fn is_final(&self) -> bool {
        self.redispatch.is_empty()
    }

    pub fn hard_gaps(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|i| i.resolution == Resolution::HardGap)
    }
}

struct Reconciler<'a> {
    input: &'a ReconcileInput<'a>,
    candidates: Vec<Candidate>,
    removed: HashSet<usize>,
    escalated: BTreeSet<OpportunityId>,
    drop_reasons: HashMap<OpportunityId, String>,
    /// Candidate pairs already settled by the coherence check.
    settled_pairs: HashSet<(usize, usize)>,
    out: Reconciliation,
}

impl<'a> Reconciler<'a> {
    fn can_escalate(&self, severity: Severity, opportunity: Option<OpportunityId>) -> bool {
        let Some(opportunity) = opportunity else {
            return false;
        };
        severity >= self.input.threshold
            && !self.input.skipped.contains_key(&opportunity)
            && self.input.selected.contains(&opportunity)
            && self
                .input
                .remaining_budget
                .get(&opportunity)
                .copied()
                .unwrap_or(0)
                > 0
    }

    fn escalate(&mut self, opportunity: OpportunityId, follow_up: String) {
        if self.escalated.insert(opportunity) {
            self.out.redispatch.push(RedispatchRequest {
                opportunity,
                follow_up,
            });
        }
    }

    /// Settles a pairwise issue: escalates the loser or drops it by tie-break.
    fn settle(&mut self, kind: IssueKind, a: usize, b: usize, description: String) {
        let (winner, loser, rule) = tie_break(&self.candidates, a, b);
        let severity = severity_of(&self.candidates[winner], &self.candidates[loser]);
        let loser_opportunity = self.candidates[loser].opportunity;
        let opportunities: Vec<OpportunityId> = [
            self.candidates[winner].opportunity,
            loser_opportunity,
        ]
        .into_iter()
        .flatten()
        .collect();

        let resolution = match loser_opportunity {
            Some(opportunity)
                if !self.candidates[loser].is_explicit()
                    && (self.escalated.contains(&opportunity)
                        || self.can_escalate(severity, Some(opportunity))) =>
            {
                self.escalate(opportunity, description.clone());
                Resolution::Redispatch { opportunity }
            }
            _ => {
                let note = format!(
                    "Chosen over {} ({}) by {}: {}",
                    self.candidates[loser].label(),
                    self.candidates[loser].origin(),
                    rule,
                    description
                );
                self.candidates[winner].resolution_notes.push(note);
                self.removed.insert(loser);
                if let Some(opportunity) = loser_opportunity {
                    self.drop_reasons
                        .entry(opportunity)
                        .or_insert_with(|| description.clone());
                }
                self.out.dropped.push(Dropped {
                    candidate: self.candidates[loser].clone(),
                    reason: description.clone(),
                });
                Resolution::TieBreak {
                    winner: self.candidates[winner].label(),
                    loser: self.candidates[loser].label(),
                    rule,
                }
            }
        };

        self.out.issues.push(Issue {
            kind,
            severity,
            category: self.candidates[loser].category,
            description,
            opportunities,
            resolution,
        });
    }

    fn active(&self) -> Vec<usize> {
        (0..self.candidates.len())
            .filter(|i| !self.removed.contains(i))
            .collect()
    }

    /// Same-category candidates naming different technologies.
    fn detect_conflicts(&mut self) {
        let mut categories: Vec<TechCategory> =
            self.candidates.iter().map(|c| c.category).collect();
        categories.sort();
        categories.dedup();

        for category in categories {
            // Candidates are kept in precedence order, so the first one leads
            let group: Vec<usize> = self
                .active()
                .into_iter()
                .filter(|&i| self.candidates[i].category == category)
                .collect();
            if group.len() < 2 {
                continue;
            }
            let leader = group[0];

            for &other in &group[1..] {
                if names_match(&self.candidates[leader].name, &self.candidates[other].name) {
                    let agreeing = self.candidates[other].clone();
                    self.candidates[leader].absorb(agreeing);
                    self.removed.insert(other);
                    continue;
                }

                let description = format!(
                    "{} recommends {} but {} recommends {} for {}",
                    self.candidates[other].origin(),
                    self.candidates[other].label(),
                    self.candidates[leader].origin(),
                    self.candidates[leader].label(),
                    category
                );
                self.settle(IssueKind::Conflict, leader, other, description);
            }
        }
    }

    /// Compatibility notes that contradict another surviving candidate.
    fn detect_incoherence(&mut self) {
        for i in 0..self.candidates.len() {
            let notes = self.candidates[i].compatibility_notes.clone();
            for note in notes {
                if self.removed.contains(&i) {
                    break;
                }
                let CompatibilityNote::Structured {
                    relation,
                    technology,
                    category,
                    ..
                } = note
                else {
                    continue;
                };

                let others: Vec<usize> = self
                    .active()
                    .into_iter()
                    .filter(|&j| {
                        j != i && self.candidates[j].category != self.candidates[i].category
                    })
                    .collect();
                let target = match (relation, category) {
                    (CompatibilityRelation::IncompatibleWith, _) => others
                        .into_iter()
                        .find(|&j| names_match(&self.candidates[j].name, &technology)),
                    (CompatibilityRelation::Requires, Some(category)) => {
                        let in_category: Vec<usize> = others
                            .into_iter()
                            .filter(|&j| self.candidates[j].category == category)
                            .collect();
                        // Satisfied while any candidate for the category still names it
                        if in_category
                            .iter()
                            .any(|&j| names_match(&self.candidates[j].name, &technology))
                        {
                            None
                        } else {
                            in_category.first().copied()
                        }
                    }
                    _ => None,
                };
                let Some(j) = target else {
                    continue;
                };
                if !self.settled_pairs.insert((i.min(j), i.max(j))) {
                    continue;
                }

                let description = match relation {
                    CompatibilityRelation::Requires => format!(
                        "{} recommends {} which requires {} but {} recommends {}",
                        self.candidates[i].origin(),
                        self.candidates[i].label(),
                        technology,
                        self.candidates[j].origin(),
                        self.candidates[j].label()
                    ),
                    _ => format!(
                        "{} recommends {} which is incompatible with {} from {}",
                        self.candidates[i].origin(),
                        self.candidates[i].label(),
                        self.candidates[j].label(),
                        self.candidates[j].origin()
                    ),
                };
                self.settle(IssueKind::Incoherence, i, j, description);
            }
        }
    }

    /// Selected or expected opportunities whose category ended up without a decision.
    fn detect_gaps(&mut self) {
        let input = self.input;
        let mut expected: Vec<OpportunityId> = input.selected.to_vec();
        expected.extend(input.context.unknowns.iter().map(|u| u.opportunity));
        expected.sort_by_key(|o| o.catalog_index());
        expected.dedup();

        for opportunity in expected {
            let category = opportunity.technology_category();
            let covered = self
                .active()
                .into_iter()
                .any(|i| self.candidates[i].category == category);
            if covered || self.escalated.contains(&opportunity) {
                continue;
            }

            let reason = if !input.selected.contains(&opportunity) {
                "was never selected".to_string()
            } else if let Some(skip) = input.skipped.get(&opportunity) {
                format!("was skipped ({})", skip)
            } else if let Some(dropped) = self.drop_reasons.get(&opportunity) {
                format!("lost reconciliation ({})", dropped)
            } else {
                "produced no usable recommendation".to_string()
            };
            let description = format!("{} {}", opportunity, reason);

            let default = input.context.defaults.get(&opportunity);
            let severity = if default.is_some() {
                Severity::Low
            } else {
                Severity::High
            };

            let resolution = if self.can_escalate(severity, Some(opportunity)) {
                self.escalate(
                    opportunity,
                    format!(
                        "No recommendation for {} survived reconciliation: {}",
                        category, description
                    ),
                );
                Resolution::Redispatch { opportunity }
            } else if let Some(default) = default {
                self.candidates
                    .push(Candidate::declared_default(opportunity, default));
                Resolution::DefaultApplied {
                    technology: default.technology.clone(),
                }
            } else {
                Resolution::HardGap
            };

            self.out.issues.push(Issue {
                kind: IssueKind::Gap,
                severity,
                category,
                description,
                opportunities: vec![opportunity],
                resolution,
            });
        }
    }

    fn finish(mut self) -> Reconciliation {
        let mut decisions: Vec<Candidate> = self
            .candidates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !self.removed.contains(i))
            .map(|(_, c)| c)
            .collect();
        decisions.sort_by_key(|c| c.category);
        self.out.decisions = decisions;
        self.out
    }
}

/// Runs the coherence check, conflict detection and gap detection in that
/// order, settling each issue by tie-break or escalation. The coherence
/// check runs once more after conflicts are settled, since a tie-break can
/// remove the candidate a `requires` note was satisfied by.
pub fn reconcile(input: ReconcileInput<'_>) -> Reconciliation {
    let mut candidates = input.candidates.clone();
    // Explicit requirements first, then by confidence and catalog order
    candidates.sort_by(|a, b| {
        b.is_explicit()
            .cmp(&a.is_explicit())
            .then(b.confidence.cmp(&a.confidence))
            .then(a.catalog_index().cmp(&b.catalog_index()))
    });

    let mut reconciler = Reconciler {
        input: &input,
        candidates,
        removed: HashSet::new(),
        escalated: BTreeSet::new(),
        drop_reasons: HashMap::new(),
        settled_pairs: HashSet::new(),
        out: Reconciliation::default(),
    };

    reconciler.detect_incoherence();
    reconciler.detect_conflicts();
    reconciler.detect_incoherence();
    reconciler.detect_gaps();
    reconciler.finish()
}
