use std::collections::{HashMap, HashSet};

/// A parsed lexical query: required phrases, bag-of-words terms grouped into
/// AND'd `term_groups` (each group is itself a set of OR alternatives — a
/// singleton group is a plain required term), and hard-excluded terms
/// (`-term`). No regex crate is used here — tokenization is a hand-rolled
/// character scan, matching the donor's `ingestion::extract`/`chunker` style
/// of text handling.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedQuery {
    pub phrases: Vec<Vec<String>>,
    pub term_groups: Vec<Vec<String>>,
    pub excluded: Vec<String>,
}

/// Splits on whitespace, lowercases, strips leading/trailing punctuation
/// from each token. `"` toggles phrase capture; a leading `-` marks a term
/// or phrase as excluded. The default connective between adjacent bare terms
/// is AND (each becomes its own required group); a literal `OR` between two
/// specific bare terms merges them into one alternatives group instead, so
/// only a term actually joined by `OR` is treated as optional.
pub fn parse_query(raw: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    let mut join_with_previous_group = false;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        let mut negated = false;
        if chars[i] == '-' {
            negated = true;
            i += 1;
        }

        if i < chars.len() && chars[i] == '"' {
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            let phrase_text: String = chars[start..i].iter().collect();
            i += 1; // skip closing quote if present
            let tokens = tokenize(&phrase_text);
            if !tokens.is_empty() {
                if negated {
                    parsed.excluded.extend(tokens);
                } else {
                    parsed.phrases.push(tokens);
                }
            }
            join_with_previous_group = false;
            continue;
        }

        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        let word = trim_punctuation(&word);
        if word.is_empty() {
            continue;
        }

        if !negated && word.eq_ignore_ascii_case("OR") {
            // OR is a connective, not a term: the next bare term joins the
            // group the previous bare term started instead of opening a new
            // (implicitly AND'd) one.
            join_with_previous_group = true;
            continue;
        }

        if negated {
            parsed.excluded.push(word.to_lowercase());
            join_with_previous_group = false;
        } else if join_with_previous_group {
            if let Some(group) = parsed.term_groups.last_mut() {
                group.push(word.to_lowercase());
            } else {
                parsed.term_groups.push(vec![word.to_lowercase()]);
            }
            join_with_previous_group = false;
        } else {
            parsed.term_groups.push(vec![word.to_lowercase()]);
        }
    }

    parsed
}

fn trim_punctuation(word: &str) -> &str {
    word.trim_matches(|c: char| c.is_ascii_punctuation() && c != '-')
}

/// Lowercase whitespace/punctuation tokenizer shared by phrase parsing and
/// document indexing, so both sides of a match agree on token boundaries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Per-tenant inverted index over evidence-span text, keyed by token.
#[derive(Default)]
pub struct LexicalIndex {
    postings: HashMap<String, HashSet<u64>>,
    doc_tokens: HashMap<u64, Vec<String>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index_document(&mut self, span_id: u64, text: &str) {
        self.remove_document(span_id);
        let tokens = tokenize(text);
        for token in &tokens {
            self.postings.entry(token.clone()).or_default().insert(span_id);
        }
        self.doc_tokens.insert(span_id, tokens);
    }

    pub fn remove_document(&mut self, span_id: u64) {
        if let Some(tokens) = self.doc_tokens.remove(&span_id) {
            for token in tokens {
                if let Some(set) = self.postings.get_mut(&token) {
                    set.remove(&span_id);
                }
            }
        }
    }

    /// Scores candidate spans against a parsed query. A negated term present
    /// in the document hard-excludes it (score 0.0, not merely penalized).
    /// Phrase matches score 2.0 per matched phrase. Each bare-term group is
    /// required (AND across groups — a document missing every alternative in
    /// any one group is excluded), scoring 1.0 per matched alternative within
    /// the group (OR within the group), matching SPEC_FULL.md's weighting.
    pub fn search(&self, query: &ParsedQuery, k: usize) -> Vec<(u64, f32)> {
        let mut candidates: HashSet<u64> = HashSet::new();
        for phrase in &query.phrases {
            if let Some(first) = phrase.first() {
                if let Some(ids) = self.postings.get(first) {
                    candidates.extend(ids);
                }
            }
        }
        for group in &query.term_groups {
            for term in group {
                if let Some(ids) = self.postings.get(term) {
                    candidates.extend(ids);
                }
            }
        }

        let mut scored: Vec<(u64, f32)> = candidates
            .into_iter()
            .filter_map(|span_id| self.score_document(span_id, query))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Scores one specific span against `query`, independent of the top-`k`
    /// `search` path — used by Stage 5 feature extraction, which needs a
    /// lexical rank for every candidate span, not just the top matches.
    pub fn score_span(&self, span_id: u64, query: &ParsedQuery) -> f32 {
        self.score_document(span_id, query).map(|(_, score)| score).unwrap_or(0.0)
    }

    fn score_document(&self, span_id: u64, query: &ParsedQuery) -> Option<(u64, f32)> {
        let tokens = self.doc_tokens.get(&span_id)?;
        let token_set: HashSet<&str> = tokens.iter().map(|s| s.as_str()).collect();

        if query.excluded.iter().any(|term| token_set.contains(term.as_str())) {
            return None;
        }

        let mut score = 0.0f32;
        for phrase in &query.phrases {
            if contains_subsequence(tokens, phrase) {
                score += 2.0;
            } else {
                return None;
            }
        }
        for group in &query.term_groups {
            let matched = group.iter().filter(|term| token_set.contains(term.as_str())).count();
            if matched == 0 {
                return None;
            }
            score += matched as f32;
        }

        if score == 0.0 {
            None
        } else {
            Some((span_id, score))
        }
    }
}

fn contains_subsequence(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_query_requires_exact_adjacency() {
        let mut index = LexicalIndex::new();
        index.index_document(1, "we decided to ship feature x next quarter");
        index.index_document(2, "ship was delayed, feature x decided later");

        let parsed = parse_query("\"decided to ship\"");
        let results = index.search(&parsed, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn negated_term_excludes_document_entirely() {
        let mut index = LexicalIndex::new();
        index.index_document(1, "decision to delay the launch");
        index.index_document(2, "decision to ship the launch");

        let parsed = parse_query("decision -delay");
        let results = index.search(&parsed, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 2);
    }

    #[test]
    fn explicit_or_scores_by_match_count_without_requiring_every_term() {
        let mut index = LexicalIndex::new();
        index.index_document(1, "assumption about latency and throughput");
        index.index_document(2, "assumption about latency only");

        let parsed = parse_query("latency OR throughput");
        let results = index.search(&parsed, 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn bare_terms_default_to_and_and_exclude_partial_matches() {
        let mut index = LexicalIndex::new();
        index.index_document(1, "assumption about latency and throughput");
        index.index_document(2, "assumption about latency only");

        let parsed = parse_query("latency throughput");
        let results = index.search(&parsed, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn no_match_returns_empty_rather_than_falling_back() {
        let mut index = LexicalIndex::new();
        index.index_document(1, "unrelated content entirely");
        let parsed = parse_query("nonexistent term");
        assert!(index.search(&parsed, 10).is_empty());
    }
}
