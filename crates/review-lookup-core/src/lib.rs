use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

/// Minimum number of recent reviews from one college before that college may be shown
/// for a (paper, tutor) pair.
pub const DISCLOSURE_THRESHOLD: usize = 3;

/// Three years of 365.25 days. A review at least this old is marked aged.
pub const RETENTION_WINDOW: Duration = Duration::seconds(94_672_800);

pub const OBSCURED_ID_PREFIX: &str = "rv_";

/// Inclusive bounds for `rating` answers.
pub const RATING_MIN: u64 = 1;
pub const RATING_MAX: u64 = 5;

const BUNDLED_CATALOG_JSON: &str = include_str!("../../../catalog/catalog.json");

/// Questions whose answers are checked against the paper catalog instead of an option list.
const CATALOG_CHECKED_QUESTIONS: [&str; 2] = ["subject", "paper"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("submitter profile MUST be complete before submitting a review")]
    ProfileIncomplete,
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReviewId(pub Ulid);

impl ReviewId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReviewId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReviewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One answer in a review form: free text, a rating, or a multi-select.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseValue {
    Text(String),
    Number(serde_json::Number),
    List(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponses {
    pub tutor: String,
    pub subject: String,
    pub paper: String,
    pub paper_code: String,
    pub paper_name: String,
    pub paper_level: String,
    #[serde(flatten)]
    pub answers: BTreeMap<String, ResponseValue>,
}

impl ReviewResponses {
    /// Check a submitted payload for completeness and markup.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when a required field is blank, an answer key is
    /// not a plain identifier, or any text value carries markup characters.
    pub fn validate(&self) -> Result<(), EngineError> {
        let required = [
            ("tutor", &self.tutor),
            ("subject", &self.subject),
            ("paper", &self.paper),
            ("paperCode", &self.paper_code),
            ("paperName", &self.paper_name),
            ("paperLevel", &self.paper_level),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(EngineError::Validation(format!("{key} MUST be provided")));
            }
            reject_markup(key, value)?;
        }

        for (key, value) in &self.answers {
            if !is_answer_key(key) {
                return Err(EngineError::Validation(format!("unexpected response field `{key}`")));
            }
            match value {
                ResponseValue::Text(text) => reject_markup(key, text)?,
                ResponseValue::List(items) => {
                    for item in items {
                        reject_markup(key, item)?;
                    }
                }
                ResponseValue::Number(_) => {}
            }
        }

        Ok(())
    }
}

fn is_answer_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn reject_markup(key: &str, value: &str) -> Result<(), EngineError> {
    if value.contains(['<', '>']) {
        return Err(EngineError::Validation(format!("{key} MUST NOT contain markup")));
    }
    Ok(())
}

/// A review as held by the record store. `id` is absent only for records that were
/// delivered without their store identifier; such records are never emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub id: Option<ReviewId>,
    pub responses: ReviewResponses,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    pub college: Option<String>,
}

/// Verified identity handed over by the authentication collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Submitter {
    pub user_id: String,
    pub college: Option<String>,
    pub profile_complete: bool,
}

/// Stamp a validated submission with a fresh identifier and the submitter's college.
///
/// # Errors
/// Returns [`EngineError::ProfileIncomplete`] when the submitter has no completed profile,
/// or [`EngineError::Validation`] when the responses fail [`ReviewResponses::validate`] or
/// [`Catalog::check_responses`].
pub fn build_review_record(
    submitter: &Submitter,
    responses: ReviewResponses,
    submitted_at: OffsetDateTime,
    catalog: &Catalog,
) -> Result<ReviewRecord, EngineError> {
    if submitter.user_id.trim().is_empty() {
        return Err(EngineError::Validation("submitter user_id MUST be provided".to_string()));
    }

    let college = submitter
        .college
        .as_deref()
        .map(str::trim)
        .filter(|college| !college.is_empty());
    let Some(college) = college.filter(|_| submitter.profile_complete) else {
        return Err(EngineError::ProfileIncomplete);
    };

    responses.validate()?;
    catalog.check_responses(&responses)?;

    Ok(ReviewRecord {
        id: Some(ReviewId::new()),
        responses,
        submitted_at,
        college: Some(college.to_string()),
    })
}

/// Untrusted search parameters, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SearchParams {
    #[serde(default)]
    pub tutor: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub paper: Option<Vec<String>>,
    #[serde(default)]
    pub college: Option<Vec<String>>,
}

impl SearchParams {
    /// Collect decoded query-string pairs into search parameters.
    ///
    /// `tutor` and `subject` may appear at most once. `paper` and `college` may repeat, in
    /// either plain or `[]` form. Every other key is rejected.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidQuery`] for unknown keys or repeated single-valued keys.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.into();
            match key.as_ref() {
                "tutor" => set_single(&mut params.tutor, "tutor", value)?,
                "subject" => set_single(&mut params.subject, "subject", value)?,
                "paper" | "paper[]" => params.paper.get_or_insert_with(Vec::new).push(value),
                "college" | "college[]" => params.college.get_or_insert_with(Vec::new).push(value),
                other => {
                    return Err(EngineError::InvalidQuery(format!(
                        "unsupported search parameter `{other}`"
                    )))
                }
            }
        }
        Ok(params)
    }

    #[must_use]
    pub fn into_query(self) -> SearchQuery {
        SearchQuery {
            tutor: non_blank(self.tutor),
            subject: non_blank(self.subject),
            papers: normalize_set(self.paper),
            colleges: normalize_set(self.college),
        }
    }
}

fn set_single(slot: &mut Option<String>, key: &str, value: String) -> Result<(), EngineError> {
    if slot.is_some() {
        return Err(EngineError::InvalidQuery(format!("{key} MUST be a single string")));
    }
    *slot = Some(value);
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn normalize_set(values: Option<Vec<String>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// A validated search. Colleges gate disclosure only and never select records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchQuery {
    pub tutor: Option<String>,
    pub subject: Option<String>,
    pub papers: Vec<String>,
    pub colleges: Vec<String>,
}

impl SearchQuery {
    #[must_use]
    pub fn college_filter_applied(&self) -> bool {
        !self.colleges.is_empty()
    }

    #[must_use]
    pub fn store_filter(&self) -> StoreFilter {
        StoreFilter {
            tutor: self.tutor.clone(),
            subject: self.subject.clone(),
            papers: self.papers.clone(),
        }
    }
}

/// The part of a search that may be pushed down into the record store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoreFilter {
    pub tutor: Option<String>,
    pub subject: Option<String>,
    pub papers: Vec<String>,
}

/// Case folding shared by the matcher and any store that precomputes folded columns.
#[must_use]
pub fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

fn contains_literal(haystack: &str, needle: Option<&str>) -> bool {
    match needle {
        Some(needle) if !needle.trim().is_empty() => {
            fold_case(haystack).contains(&fold_case(needle))
        }
        _ => true,
    }
}

#[must_use]
pub fn matches(record: &ReviewRecord, query: &SearchQuery) -> bool {
    let responses = &record.responses;
    if !contains_literal(&responses.tutor, query.tutor.as_deref()) {
        return false;
    }
    if !contains_literal(&responses.subject, query.subject.as_deref()) {
        return false;
    }
    query.papers.is_empty()
        || query.papers.iter().any(|paper| contains_literal(&responses.paper_code, Some(paper)))
}

/// Inclusive on the aged side: exactly [`RETENTION_WINDOW`] elapsed counts as old.
#[must_use]
pub fn is_old(record: &ReviewRecord, now: OffsetDateTime) -> bool {
    now - record.submitted_at >= RETENTION_WINDOW
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ObscuredId(pub String);

impl Display for ObscuredId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed one-way mapping from store identifiers to public tokens.
#[derive(Clone, Default)]
pub struct IdentityObscurer {
    salt: Vec<u8>,
}

impl Debug for IdentityObscurer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityObscurer").finish_non_exhaustive()
    }
}

impl IdentityObscurer {
    #[must_use]
    pub fn new(salt: impl AsRef<[u8]>) -> Self {
        Self { salt: salt.as_ref().to_vec() }
    }

    #[must_use]
    pub fn obscure(&self, id: ReviewId) -> ObscuredId {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt);
        hasher.update([0_u8]);
        hasher.update(id.0.to_bytes());
        ObscuredId(format!("{OBSCURED_ID_PREFIX}{}", hex::encode(hasher.finalize())))
    }
}

/// A matched record after per-record annotation. Carries the true college for counting
/// and deliberately has no serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedRecord {
    pub obscured_id: ObscuredId,
    pub responses: ReviewResponses,
    pub college: Option<String>,
    pub is_old: bool,
}

/// Returns `None` when the record has no identifier to obscure.
#[must_use]
pub fn annotate(
    record: &ReviewRecord,
    now: OffsetDateTime,
    obscurer: &IdentityObscurer,
) -> Option<AnnotatedRecord> {
    let id = record.id?;
    Some(AnnotatedRecord {
        obscured_id: obscurer.obscure(id),
        responses: record.responses.clone(),
        college: record.college.clone(),
        is_old: is_old(record, now),
    })
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupKey {
    pub paper: String,
    pub tutor: String,
}

impl GroupKey {
    #[must_use]
    pub fn of(responses: &ReviewResponses) -> Self {
        Self { paper: responses.paper.clone(), tutor: normalize_tutor(&responses.tutor) }
    }
}

#[must_use]
pub fn normalize_tutor(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisclosureGroup {
    pub key: GroupKey,
    pub members: Vec<AnnotatedRecord>,
}

/// Partition by (paper, normalized tutor). Groups keep first-appearance order and members
/// keep input order.
#[must_use]
pub fn group_records(records: Vec<AnnotatedRecord>) -> Vec<DisclosureGroup> {
    let mut positions: BTreeMap<GroupKey, usize> = BTreeMap::new();
    let mut groups: Vec<DisclosureGroup> = Vec::new();

    for record in records {
        let key = GroupKey::of(&record.responses);
        let position = match positions.get(&key) {
            Some(position) => *position,
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push(DisclosureGroup { key, members: Vec::new() });
                groups.len() - 1
            }
        };
        groups[position].members.push(record);
    }

    groups
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DisclosureDecision {
    pub eligible_colleges: Vec<String>,
    pub included: bool,
}

/// Recent-review counts per college. Aged reviews and blank colleges are not counted.
///
/// Spellings that differ only in case share one count, reported under the most frequent
/// recent spelling (ties go to the smallest spelling).
#[must_use]
pub fn recent_college_counts(group: &DisclosureGroup) -> BTreeMap<String, usize> {
    let mut buckets: BTreeMap<String, BTreeMap<&str, usize>> = BTreeMap::new();
    for member in group.members.iter().filter(|member| !member.is_old) {
        let Some(college) = member.college.as_deref().map(str::trim) else {
            continue;
        };
        if college.is_empty() {
            continue;
        }
        *buckets.entry(fold_case(college)).or_default().entry(college).or_insert(0) += 1;
    }

    buckets
        .into_values()
        .filter_map(|spellings| {
            let total: usize = spellings.values().sum();
            let display = spellings
                .iter()
                .max_by(|(lhs, lhs_count), (rhs, rhs_count)| {
                    lhs_count.cmp(rhs_count).then_with(|| rhs.cmp(lhs))
                })
                .map(|(spelling, _)| (*spelling).to_string())?;
            Some((display, total))
        })
        .collect()
}

/// Apply the k-anonymity rule to one group.
///
/// Eligible colleges come back in ascending order. With a college filter the group survives
/// only when a requested college is itself eligible; the disclosed list is never narrowed
/// to the requested colleges.
#[must_use]
pub fn evaluate_disclosure(group: &DisclosureGroup, requested: &[String]) -> DisclosureDecision {
    let eligible_colleges: Vec<String> = recent_college_counts(group)
        .into_iter()
        .filter(|(_, count)| *count >= DISCLOSURE_THRESHOLD)
        .map(|(college, _)| college)
        .collect();

    let included = requested.is_empty()
        || requested.iter().any(|wanted| {
            let wanted = fold_case(wanted.trim());
            eligible_colleges.iter().any(|college| fold_case(college) == wanted)
        });

    DisclosureDecision { eligible_colleges, included }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedReview {
    pub obscured_id: ObscuredId,
    pub responses: ReviewResponses,
    pub is_old: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub college: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub reviews: Vec<AnnotatedReview>,
    pub college_filter_applied: bool,
}

/// Server-side counters for one search. Never part of the response body.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SearchStats {
    pub candidates: usize,
    pub matched: usize,
    pub missing_id: usize,
    pub groups: usize,
    pub groups_withheld: usize,
    pub reviews_returned: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub results: SearchResults,
    pub stats: SearchStats,
}

fn disclose(group: DisclosureGroup, decision: DisclosureDecision) -> Vec<AnnotatedReview> {
    let college = Some(decision.eligible_colleges).filter(|colleges| !colleges.is_empty());
    group
        .members
        .into_iter()
        .map(|member| AnnotatedReview {
            obscured_id: member.obscured_id,
            responses: member.responses,
            is_old: member.is_old,
            college: college.clone(),
        })
        .collect()
}

/// Run the full search pipeline over an already-fetched batch.
///
/// `now` is the reference time for recency; the computation reads no clock and keeps no
/// state between calls.
#[must_use]
pub fn build_search_results(
    records: &[ReviewRecord],
    query: &SearchQuery,
    now: OffsetDateTime,
    obscurer: &IdentityObscurer,
) -> SearchOutcome {
    let mut stats = SearchStats { candidates: records.len(), ..SearchStats::default() };

    let matched: Vec<&ReviewRecord> =
        records.iter().filter(|record| matches(record, query)).collect();
    stats.matched = matched.len();

    let annotated: Vec<AnnotatedRecord> =
        matched.into_iter().filter_map(|record| annotate(record, now, obscurer)).collect();
    stats.missing_id = stats.matched - annotated.len();

    let groups = group_records(annotated);
    stats.groups = groups.len();

    let mut reviews: Vec<AnnotatedReview> = Vec::new();
    for group in groups {
        let decision = evaluate_disclosure(&group, &query.colleges);
        if !decision.included {
            stats.groups_withheld += 1;
            continue;
        }
        reviews.extend(disclose(group, decision));
    }
    stats.reviews_returned = reviews.len();

    SearchOutcome {
        results: SearchResults { reviews, college_filter_applied: query.college_filter_applied() },
        stats,
    }
}

/// Distinct tutor names containing `search`, ordered case-insensitively.
#[must_use]
pub fn list_tutors<I, S>(names: I, search: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let needle = Some(search);
    let mut tutors: Vec<String> = names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .filter(|name| !name.trim().is_empty() && contains_literal(name, needle))
        .collect();
    tutors.sort_by(|lhs, rhs| {
        lhs.to_lowercase().cmp(&rhs.to_lowercase()).then_with(|| lhs.cmp(rhs))
    });
    tutors.dedup();
    tutors
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Dropdown,
    Radio,
    Select,
    Rating,
    Text,
    Textarea,
}

/// One question of the review form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Question {
    pub id: String,
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl Question {
    fn accepts(&self, value: &ResponseValue) -> bool {
        match (self.kind, value) {
            (QuestionKind::Dropdown | QuestionKind::Radio, ResponseValue::Text(text)) => {
                CATALOG_CHECKED_QUESTIONS.contains(&self.id.as_str())
                    || self.options.iter().any(|option| option == text)
            }
            (QuestionKind::Select, ResponseValue::List(items)) => {
                items.iter().all(|item| self.options.iter().any(|option| option == item))
            }
            (QuestionKind::Rating, ResponseValue::Number(number)) => {
                number.as_u64().is_some_and(|rating| (RATING_MIN..=RATING_MAX).contains(&rating))
            }
            (QuestionKind::Text | QuestionKind::Textarea, ResponseValue::Text(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CatalogPaper {
    pub id: String,
    pub code: String,
    pub name: String,
    pub level: String,
}

/// Reference data for the review form: papers by subject, the question schema and the
/// known colleges.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    pub subjects: BTreeMap<String, Vec<CatalogPaper>>,
    pub questions: Vec<Question>,
    pub colleges: Vec<String>,
}

impl Catalog {
    /// Parse and check a catalog document.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] when the JSON is malformed or inconsistent.
    pub fn from_json(body: &str) -> Result<Self, EngineError> {
        let catalog: Self = serde_json::from_str(body)
            .map_err(|err| EngineError::InvalidCatalog(err.to_string()))?;
        catalog.check()?;
        Ok(catalog)
    }

    /// The catalog compiled into the crate.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] if the bundled document does not parse.
    pub fn bundled() -> Result<Self, EngineError> {
        Self::from_json(BUNDLED_CATALOG_JSON)
    }

    fn check(&self) -> Result<(), EngineError> {
        let mut question_ids: Vec<&str> = Vec::with_capacity(self.questions.len());
        for question in &self.questions {
            if !is_answer_key(&question.id) {
                return Err(EngineError::InvalidCatalog(format!(
                    "question id `{}` is not a plain identifier",
                    question.id
                )));
            }
            if question_ids.contains(&question.id.as_str()) {
                return Err(EngineError::InvalidCatalog(format!(
                    "question id `{}` is declared twice",
                    question.id
                )));
            }
            question_ids.push(&question.id);

            let needs_options = match question.kind {
                QuestionKind::Select => true,
                QuestionKind::Dropdown | QuestionKind::Radio => {
                    !CATALOG_CHECKED_QUESTIONS.contains(&question.id.as_str())
                }
                QuestionKind::Rating | QuestionKind::Text | QuestionKind::Textarea => false,
            };
            if needs_options && question.options.is_empty() {
                return Err(EngineError::InvalidCatalog(format!(
                    "question `{}` MUST list its options",
                    question.id
                )));
            }
        }

        let mut paper_ids: Vec<&str> = Vec::new();
        for paper in self.subjects.values().flatten() {
            if paper_ids.contains(&paper.id.as_str()) {
                return Err(EngineError::InvalidCatalog(format!(
                    "paper id `{}` is listed twice",
                    paper.id
                )));
            }
            paper_ids.push(&paper.id);
        }

        if self.colleges.iter().any(|college| college.trim().is_empty()) {
            return Err(EngineError::InvalidCatalog("college names MUST NOT be blank".to_string()));
        }

        Ok(())
    }

    /// The subject and catalog entry for a paper id.
    #[must_use]
    pub fn find_paper(&self, paper_id: &str) -> Option<(&str, &CatalogPaper)> {
        self.subjects.iter().find_map(|(subject, papers)| {
            papers.iter().find(|paper| paper.id == paper_id).map(|paper| (subject.as_str(), paper))
        })
    }

    /// Check a submission against the question schema and the paper catalog.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for unknown answers, missing required answers,
    /// answers of the wrong type or outside their options, ratings outside
    /// [`RATING_MIN`]..=[`RATING_MAX`], and paper details that disagree with the catalog.
    pub fn check_responses(&self, responses: &ReviewResponses) -> Result<(), EngineError> {
        if let Some(key) = responses
            .answers
            .keys()
            .find(|key| !self.questions.iter().any(|question| &question.id == *key))
        {
            return Err(EngineError::Validation(format!("unexpected response field `{key}`")));
        }

        for question in &self.questions {
            let Some(value) = answer(responses, &question.id).filter(|value| !is_blank(value))
            else {
                if question.required {
                    return Err(EngineError::Validation(format!(
                        "{} MUST be answered",
                        question.id
                    )));
                }
                continue;
            };
            if !question.accepts(&value) {
                return Err(EngineError::Validation(format!(
                    "invalid value for {}",
                    question.id
                )));
            }
        }

        let Some((subject, paper)) = self.find_paper(&responses.paper) else {
            return Err(EngineError::Validation(format!("unknown paper `{}`", responses.paper)));
        };
        let mismatch = [
            ("subject", subject, responses.subject.as_str()),
            ("paperCode", paper.code.as_str(), responses.paper_code.as_str()),
            ("paperName", paper.name.as_str(), responses.paper_name.as_str()),
            ("paperLevel", paper.level.as_str(), responses.paper_level.as_str()),
        ]
        .into_iter()
        .find(|(_, expected, given)| expected != given);
        if let Some((field, _, _)) = mismatch {
            return Err(EngineError::Validation(format!(
                "{field} does not match paper `{}`",
                responses.paper
            )));
        }

        Ok(())
    }
}

fn answer<'a>(responses: &'a ReviewResponses, id: &str) -> Option<Cow<'a, ResponseValue>> {
    let fixed = match id {
        "tutor" => &responses.tutor,
        "subject" => &responses.subject,
        "paper" => &responses.paper,
        _ => return responses.answers.get(id).map(Cow::Borrowed),
    };
    Some(Cow::Owned(ResponseValue::Text(fixed.clone())))
}

fn is_blank(value: &ResponseValue) -> bool {
    matches!(value, ResponseValue::Text(text) if text.trim().is_empty())
}
