use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use review_lookup_core::{
    build_review_record, build_search_results, list_tutors, Catalog, IdentityObscurer,
    ObscuredId, ReviewRecord, ReviewResponses, SearchParams, SearchResults, Submitter,
};
use review_lookup_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// A review submission. `submitted_at` is never read from a request body; only trusted
/// local callers may set it, and it defaults to the current UTC time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReviewRequest {
    pub submitter: Submitter,
    pub responses: ReviewResponses,
    #[serde(skip)]
    pub submitted_at: Option<OffsetDateTime>,
}

/// Acknowledgement for an accepted review. Only the obscured form of the new id is echoed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReviewResult {
    pub obscured_id: ObscuredId,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

/// Read a catalog document from `path`, or fall back to the bundled catalog.
///
/// # Errors
/// Returns an error when the file cannot be read or the catalog is invalid.
pub fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    let Some(path) = path else {
        return Catalog::bundled().context("bundled catalog is invalid");
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let catalog = Catalog::from_json(&body)
        .with_context(|| format!("failed to load catalog {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        subjects = catalog.subjects.len(),
        questions = catalog.questions.len(),
        "loaded review catalog"
    );
    Ok(catalog)
}

#[derive(Debug, Clone)]
pub struct ReviewLookupApi {
    db_path: PathBuf,
    obscurer: IdentityObscurer,
    catalog: Arc<Catalog>,
}

impl ReviewLookupApi {
    #[must_use]
    pub fn new(db_path: PathBuf, obscurer: IdentityObscurer, catalog: Catalog) -> Self {
        Self { db_path, obscurer, catalog: Arc::new(catalog) }
    }

    /// Subjects, papers, questions and colleges that submissions are checked against.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Search stored reviews and apply college disclosure rules.
    ///
    /// `now` defaults to the current UTC time.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read. Invalid parameters are rejected
    /// earlier, by [`SearchParams::from_pairs`] or deserialization.
    pub fn search(
        &self,
        params: SearchParams,
        now: Option<OffsetDateTime>,
    ) -> Result<SearchResults> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        let query = params.into_query();
        let candidates = store.fetch_candidates(&query.store_filter())?;
        let outcome = build_search_results(&candidates, &query, now, &self.obscurer);

        let stats = outcome.stats;
        if stats.missing_id > 0 {
            tracing::warn!(count = stats.missing_id, "search skipped reviews without identifiers");
        }
        tracing::debug!(
            candidates = stats.candidates,
            matched = stats.matched,
            groups = stats.groups,
            groups_withheld = stats.groups_withheld,
            reviews_returned = stats.reviews_returned,
            college_filter_applied = outcome.results.college_filter_applied,
            "search completed"
        );

        Ok(outcome.results)
    }

    /// Distinct tutor names containing `search`, case-insensitively ordered.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn tutors(&self, search: &str) -> Result<Vec<String>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let names = store.tutor_names(search)?;
        Ok(list_tutors(names, search))
    }

    /// Validate and persist one submitted review.
    ///
    /// # Errors
    /// Returns an error wrapping [`review_lookup_core::EngineError`] when the submitter or
    /// responses are rejected, or a store error when persistence fails.
    pub fn submit_review(&self, input: SubmitReviewRequest) -> Result<SubmitReviewResult> {
        let submitted_at = input.submitted_at.unwrap_or_else(OffsetDateTime::now_utc);
        let record =
            build_review_record(&input.submitter, input.responses, submitted_at, &self.catalog)?;

        let mut store = self.open_store()?;
        store.migrate()?;
        store.write_review(&record, &input.submitter.user_id)?;

        let obscured_id = record
            .id
            .map(|id| self.obscurer.obscure(id))
            .ok_or_else(|| anyhow::anyhow!("accepted review has no identifier"))?;
        tracing::info!(obscured_id = %obscured_id, "review submitted");

        Ok(SubmitReviewResult { obscured_id, submitted_at })
    }

    /// Every stored review with raw identifiers. Administrative use only.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_reviews(&self) -> Result<Vec<ReviewRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_reviews()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use review_lookup_core::{EngineError, ResponseValue};
    use time::Duration;

    use super::*;

    const FIXTURE_CATALOG: &str = r#"{
        "subjects": {
            "History": [
                { "id": "h1", "code": "H1", "name": "Fixture paper", "level": "FHS" },
                { "id": "h2", "code": "H2", "name": "Fixture paper", "level": "FHS" }
            ]
        },
        "questions": [
            { "id": "tutor", "question": "Tutor", "type": "text", "required": true },
            { "id": "subject", "question": "Subject", "type": "dropdown", "required": true },
            { "id": "paper", "question": "Paper", "type": "dropdown", "required": true },
            { "id": "rating_overall", "question": "Overall", "type": "rating" },
            { "id": "comments", "question": "Comments", "type": "textarea" }
        ],
        "colleges": ["Balliol", "Keble", "Oriel"]
    }"#;

    fn test_api(db_path: &std::path::Path, obscurer: IdentityObscurer) -> ReviewLookupApi {
        let catalog = match Catalog::from_json(FIXTURE_CATALOG) {
            Ok(catalog) => catalog,
            Err(err) => panic!("fixture catalog should load: {err}"),
        };
        ReviewLookupApi::new(db_path.to_path_buf(), obscurer, catalog)
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("review-lookup-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn submitter(user_id: &str, college: &str) -> Submitter {
        Submitter {
            user_id: user_id.to_string(),
            college: Some(college.to_string()),
            profile_complete: true,
        }
    }

    fn responses(tutor: &str, paper_code: &str) -> ReviewResponses {
        let mut answers = BTreeMap::new();
        answers.insert("comments".to_string(), ResponseValue::Text("Helpful".to_string()));
        ReviewResponses {
            tutor: tutor.to_string(),
            subject: "History".to_string(),
            paper: paper_code.to_lowercase(),
            paper_code: paper_code.to_string(),
            paper_name: "Fixture paper".to_string(),
            paper_level: "FHS".to_string(),
            answers,
        }
    }

    fn submit(
        api: &ReviewLookupApi,
        user: &Submitter,
        tutor: &str,
        paper_code: &str,
        age_days: i64,
    ) -> Result<SubmitReviewResult> {
        api.submit_review(SubmitReviewRequest {
            submitter: user.clone(),
            responses: responses(tutor, paper_code),
            submitted_at: Some(fixture_now() - Duration::days(age_days)),
        })
    }

    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.would_apply_versions, vec![1, 2, 3]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(3));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn submitted_reviews_are_searchable_with_disclosure() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));
        let balliol = submitter("user-1", "Balliol");
        let keble = submitter("user-2", "Keble");

        for age in [10, 20, 30] {
            let _ = submit(&api, &balliol, "Dr Ada", "H1", age)?;
        }
        let _ = submit(&api, &keble, "Dr Ada", "H1", 40)?;
        let _ = submit(&api, &keble, "Dr Grace", "H2", 40)?;

        let params = SearchParams {
            college: Some(vec!["Balliol".to_string()]),
            ..SearchParams::default()
        };
        let results = api.search(params, Some(fixture_now()))?;
        assert!(results.college_filter_applied);
        assert_eq!(results.reviews.len(), 4);
        assert!(results
            .reviews
            .iter()
            .all(|review| review.college == Some(vec!["Balliol".to_string()])));

        let unfiltered = api.search(SearchParams::default(), Some(fixture_now()))?;
        assert!(!unfiltered.college_filter_applied);
        assert_eq!(unfiltered.reviews.len(), 5);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn submit_echoes_obscured_id_only() -> Result<()> {
        let db_path = unique_temp_db_path();
        let obscurer = IdentityObscurer::new("salt");
        let api = test_api(&db_path, obscurer.clone());

        let result = submit(&api, &submitter("user-1", "Oriel"), "Dr Ada", "H1", 0)?;
        let stored = api.list_reviews()?;
        assert_eq!(stored.len(), 1);
        let Some(raw_id) = stored[0].id else {
            panic!("stored review should carry an identifier");
        };

        assert_eq!(result.obscured_id, obscurer.obscure(raw_id));
        assert_ne!(result.obscured_id.0, raw_id.to_string());
        assert_eq!(stored[0].college.as_deref(), Some("Oriel"));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn search_folds_case_beyond_ascii() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));
        let _ = submit(&api, &submitter("user-1", "Oriel"), "Dr \u{212A}ant", "H1", 0)?;
        let _ = submit(&api, &submitter("user-2", "Oriel"), "Dr Hume", "H1", 0)?;

        let params = SearchParams { tutor: Some("kant".to_string()), ..SearchParams::default() };
        let results = api.search(params, Some(fixture_now()))?;
        assert_eq!(results.reviews.len(), 1);
        assert_eq!(results.reviews[0].responses.tutor, "Dr \u{212A}ant");

        let params = SearchParams { paper: Some(vec!["h".to_string()]), ..SearchParams::default() };
        assert_eq!(api.search(params, Some(fixture_now()))?.reviews.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn submissions_outside_catalog_are_rejected() {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));
        let user = submitter("user-1", "Oriel");

        let mut off_scale = responses("Dr Ada", "H1");
        off_scale
            .answers
            .insert("rating_overall".to_string(), ResponseValue::Number(9_000_u16.into()));
        let mut wrong_code = responses("Dr Ada", "H1");
        wrong_code.paper_code = "H2".to_string();

        for bad in [off_scale, wrong_code, responses("Dr Ada", "H9")] {
            let request = SubmitReviewRequest {
                submitter: user.clone(),
                responses: bad,
                submitted_at: None,
            };
            let err = match api.submit_review(request) {
                Ok(result) => panic!("submission should be rejected, got {result:?}"),
                Err(err) => err,
            };
            assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Validation(_))));
        }

        assert_eq!(api.list_reviews().ok().map(|reviews| reviews.len()), Some(0));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn load_catalog_reads_file_or_falls_back_to_bundled() -> Result<()> {
        let bundled = load_catalog(None)?;
        assert!(bundled.find_paper("hist-1").is_some());

        let path = unique_temp_db_path().with_extension("json");
        std::fs::write(&path, FIXTURE_CATALOG)?;
        let loaded = load_catalog(Some(&path))?;
        assert_eq!(loaded.colleges, vec!["Balliol", "Keble", "Oriel"]);

        std::fs::write(&path, "{}")?;
        assert!(load_catalog(Some(&path)).is_err());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn incomplete_profiles_cannot_submit() {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));
        let mut user = submitter("user-1", "Oriel");
        user.profile_complete = false;

        let err = match submit(&api, &user, "Dr Ada", "H1", 0) {
            Ok(result) => panic!("submission should be rejected, got {result:?}"),
            Err(err) => err,
        };
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::ProfileIncomplete));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn tutors_are_distinct_and_filtered() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = test_api(&db_path, IdentityObscurer::new("salt"));
        let user = submitter("user-1", "Oriel");
        for tutor in ["dr zed", "Dr Ada", "Dr Ada", "Prof Grace"] {
            let _ = submit(&api, &user, tutor, "H1", 0)?;
        }

        assert_eq!(
            api.tutors("")?,
            vec!["Dr Ada".to_string(), "dr zed".to_string(), "Prof Grace".to_string()]
        );
        assert_eq!(api.tutors("DR")?, vec!["Dr Ada".to_string(), "dr zed".to_string()]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
