use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::StorageError;
use crate::evaluation::leaderboard::build_leaderboard;
use crate::model::{
    EvaluationCriterion, EvaluationResult, LeaderboardEntry, MetaPrompt, ModelConfig,
    PromptVariation, TestCase,
};

/// Fields of a new criterion; the repository assigns the ID.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCriterion {
    pub name: String,
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub model_config: ModelConfig,
}

fn default_weight() -> f64 {
    1.0
}

/// Partial update of a criterion. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub weight: Option<f64>,
    pub model_config: Option<ModelConfig>,
}

/// CRUD contract the pipeline and handlers consume. Listings are in ID order.
pub trait Repository: Send + Sync {
    fn create_meta_prompt(
        &self,
        base_prompt: String,
        generated_prompt: String,
        model_config: ModelConfig,
    ) -> MetaPrompt;
    fn get_meta_prompt(&self, id: u64) -> Option<MetaPrompt>;
    fn list_meta_prompts(&self) -> Vec<MetaPrompt>;
    fn update_meta_prompt(&self, id: u64, generated_prompt: String)
        -> Result<MetaPrompt, StorageError>;

    fn create_variation(
        &self,
        meta_prompt_id: u64,
        content: String,
        model_config: ModelConfig,
    ) -> PromptVariation;
    fn get_variation(&self, id: u64) -> Option<PromptVariation>;
    fn variations_for_meta_prompt(&self, meta_prompt_id: u64) -> Vec<PromptVariation>;
    fn update_variation(&self, id: u64, content: String) -> Result<PromptVariation, StorageError>;
    /// Removes the variation and its results. Returns false if it did not exist.
    fn delete_variation(&self, id: u64) -> bool;

    fn create_test_case(&self, meta_prompt_id: u64, input: String) -> TestCase;
    fn get_test_case(&self, id: u64) -> Option<TestCase>;
    fn test_cases_for_meta_prompt(&self, meta_prompt_id: u64) -> Vec<TestCase>;
    fn update_test_case(&self, id: u64, input: String) -> Result<TestCase, StorageError>;
    /// Removes the test case and its results.
    fn delete_test_case(&self, id: u64) -> bool;

    fn create_criterion(&self, criterion: NewCriterion) -> EvaluationCriterion;
    fn get_criterion(&self, id: u64) -> Option<EvaluationCriterion>;
    fn list_criteria(&self) -> Vec<EvaluationCriterion>;
    fn update_criterion(
        &self,
        id: u64,
        patch: CriterionPatch,
    ) -> Result<EvaluationCriterion, StorageError>;
    /// Removes the criterion and its results.
    fn delete_criterion(&self, id: u64) -> bool;

    /// The `id` on the input is ignored.
    fn create_result(&self, result: EvaluationResult) -> EvaluationResult;
    fn get_result(&self, id: u64) -> Option<EvaluationResult>;
    fn results_for_variation(&self, variation_id: u64) -> Vec<EvaluationResult>;
    fn results_for_test_case(&self, test_case_id: u64) -> Vec<EvaluationResult>;
    /// Drop every stored result of `variation_ids` and store `results` in
    /// their place, as one write. Rows whose variation, test case or
    /// criterion no longer exists are skipped. Returns how many were stored.
    fn replace_results(&self, variation_ids: &[u64], results: Vec<EvaluationResult>) -> usize;

    fn get_leaderboard(&self, meta_prompt_id: u64) -> Vec<LeaderboardEntry> {
        let variations = self.variations_for_meta_prompt(meta_prompt_id);
        let criteria = self.list_criteria();
        let results: Vec<EvaluationResult> = variations
            .iter()
            .flat_map(|v| self.results_for_variation(v.id))
            .collect();
        build_leaderboard(&variations, &criteria, &results)
    }
}

struct Table<T> {
    next_id: u64,
    rows: BTreeMap<u64, T>,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }

    fn insert_with(&mut self, build: impl FnOnce(u64) -> T) -> T {
        let id = self.next_id;
        self.next_id += 1;
        let row = build(id);
        self.rows.insert(id, row.clone());
        row
    }

    fn get(&self, id: u64) -> Option<T> {
        self.rows.get(&id).cloned()
    }

    fn filtered(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows.values().filter(|r| pred(*r)).cloned().collect()
    }

    fn update(
        &mut self,
        kind: &'static str,
        id: u64,
        apply: impl FnOnce(&mut T),
    ) -> Result<T, StorageError> {
        let row = self
            .rows
            .get_mut(&id)
            .ok_or(StorageError::NotFound { kind, id })?;
        apply(row);
        Ok(row.clone())
    }
}

struct Tables {
    meta_prompts: Table<MetaPrompt>,
    variations: Table<PromptVariation>,
    test_cases: Table<TestCase>,
    criteria: Table<EvaluationCriterion>,
    results: Table<EvaluationResult>,
}

impl Tables {
    fn references_live_rows(&self, r: &EvaluationResult) -> bool {
        self.variations.rows.contains_key(&r.variation_id)
            && self.test_cases.rows.contains_key(&r.test_case_id)
            && self.criteria.rows.contains_key(&r.criterion_id)
    }

    fn drop_results(&mut self, keep: impl Fn(&EvaluationResult) -> bool) -> usize {
        let before = self.results.rows.len();
        self.results.rows.retain(|_, r| keep(r));
        before - self.results.rows.len()
    }
}

/// Process-local repository. Contents are lost on restart.
pub struct MemRepository {
    tables: RwLock<Tables>,
}

impl Default for MemRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                meta_prompts: Table::new(),
                variations: Table::new(),
                test_cases: Table::new(),
                criteria: Table::new(),
                results: Table::new(),
            }),
        }
    }
}

impl Repository for MemRepository {
    fn create_meta_prompt(
        &self,
        base_prompt: String,
        generated_prompt: String,
        model_config: ModelConfig,
    ) -> MetaPrompt {
        let row = self.tables.write().meta_prompts.insert_with(|id| MetaPrompt {
            id,
            base_prompt,
            generated_prompt,
            model_config,
        });
        debug!(id = row.id, "Stored meta prompt");
        row
    }

    fn get_meta_prompt(&self, id: u64) -> Option<MetaPrompt> {
        self.tables.read().meta_prompts.get(id)
    }

    fn list_meta_prompts(&self) -> Vec<MetaPrompt> {
        self.tables.read().meta_prompts.filtered(|_| true)
    }

    fn update_meta_prompt(
        &self,
        id: u64,
        generated_prompt: String,
    ) -> Result<MetaPrompt, StorageError> {
        self.tables
            .write()
            .meta_prompts
            .update("meta prompt", id, |m| m.generated_prompt = generated_prompt)
    }

    fn create_variation(
        &self,
        meta_prompt_id: u64,
        content: String,
        model_config: ModelConfig,
    ) -> PromptVariation {
        self.tables.write().variations.insert_with(|id| PromptVariation {
            id,
            meta_prompt_id,
            content,
            model_config,
        })
    }

    fn get_variation(&self, id: u64) -> Option<PromptVariation> {
        self.tables.read().variations.get(id)
    }

    fn variations_for_meta_prompt(&self, meta_prompt_id: u64) -> Vec<PromptVariation> {
        self.tables
            .read()
            .variations
            .filtered(|v| v.meta_prompt_id == meta_prompt_id)
    }

    fn update_variation(&self, id: u64, content: String) -> Result<PromptVariation, StorageError> {
        self.tables
            .write()
            .variations
            .update("variation", id, |v| v.content = content)
    }

    fn delete_variation(&self, id: u64) -> bool {
        let mut tables = self.tables.write();
        if tables.variations.rows.remove(&id).is_none() {
            return false;
        }
        let removed = tables.drop_results(|r| r.variation_id != id);
        debug!(id, removed, "Deleted variation");
        true
    }

    fn create_test_case(&self, meta_prompt_id: u64, input: String) -> TestCase {
        self.tables.write().test_cases.insert_with(|id| TestCase {
            id,
            meta_prompt_id,
            input,
        })
    }

    fn get_test_case(&self, id: u64) -> Option<TestCase> {
        self.tables.read().test_cases.get(id)
    }

    fn test_cases_for_meta_prompt(&self, meta_prompt_id: u64) -> Vec<TestCase> {
        self.tables
            .read()
            .test_cases
            .filtered(|t| t.meta_prompt_id == meta_prompt_id)
    }

    fn update_test_case(&self, id: u64, input: String) -> Result<TestCase, StorageError> {
        self.tables
            .write()
            .test_cases
            .update("test case", id, |t| t.input = input)
    }

    fn delete_test_case(&self, id: u64) -> bool {
        let mut tables = self.tables.write();
        if tables.test_cases.rows.remove(&id).is_none() {
            return false;
        }
        tables.drop_results(|r| r.test_case_id != id);
        true
    }

    fn create_criterion(&self, criterion: NewCriterion) -> EvaluationCriterion {
        self.tables
            .write()
            .criteria
            .insert_with(|id| EvaluationCriterion {
                id,
                name: criterion.name,
                description: criterion.description,
                weight: criterion.weight,
                model_config: criterion.model_config,
            })
    }

    fn get_criterion(&self, id: u64) -> Option<EvaluationCriterion> {
        self.tables.read().criteria.get(id)
    }

    fn list_criteria(&self) -> Vec<EvaluationCriterion> {
        self.tables.read().criteria.filtered(|_| true)
    }

    fn update_criterion(
        &self,
        id: u64,
        patch: CriterionPatch,
    ) -> Result<EvaluationCriterion, StorageError> {
        self.tables.write().criteria.update("criterion", id, |c| {
            if let Some(name) = patch.name {
                c.name = name;
            }
            if let Some(description) = patch.description {
                c.description = description;
            }
            if let Some(weight) = patch.weight {
                c.weight = weight;
            }
            if let Some(model_config) = patch.model_config {
                c.model_config = model_config;
            }
        })
    }

    fn delete_criterion(&self, id: u64) -> bool {
        let mut tables = self.tables.write();
        if tables.criteria.rows.remove(&id).is_none() {
            return false;
        }
        tables.drop_results(|r| r.criterion_id != id);
        true
    }

    fn create_result(&self, result: EvaluationResult) -> EvaluationResult {
        self.tables
            .write()
            .results
            .insert_with(|id| EvaluationResult { id, ..result })
    }

    fn get_result(&self, id: u64) -> Option<EvaluationResult> {
        self.tables.read().results.get(id)
    }

    fn results_for_variation(&self, variation_id: u64) -> Vec<EvaluationResult> {
        self.tables
            .read()
            .results
            .filtered(|r| r.variation_id == variation_id)
    }

    fn results_for_test_case(&self, test_case_id: u64) -> Vec<EvaluationResult> {
        self.tables
            .read()
            .results
            .filtered(|r| r.test_case_id == test_case_id)
    }

    fn replace_results(&self, variation_ids: &[u64], results: Vec<EvaluationResult>) -> usize {
        let mut tables = self.tables.write();
        let cleared = tables.drop_results(|r| !variation_ids.contains(&r.variation_id));

        let mut stored = 0;
        for result in results {
            if !tables.references_live_rows(&result) {
                continue;
            }
            tables
                .results
                .insert_with(|id| EvaluationResult { id, ..result });
            stored += 1;
        }
        debug!(cleared, stored, "Replaced evaluation results");
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderKind;

    fn openai() -> ModelConfig {
        ModelConfig::for_provider(ProviderKind::OpenAi)
    }

    fn new_criterion(name: &str) -> NewCriterion {
        NewCriterion {
            name: name.into(),
            description: format!("{} matters", name),
            weight: 1.0,
            model_config: openai(),
        }
    }

    fn result(variation_id: u64, test_case_id: u64, criterion_id: u64, score: f64) -> EvaluationResult {
        EvaluationResult {
            id: 0,
            variation_id,
            test_case_id,
            criterion_id,
            score,
            response: String::new(),
            evaluator_model: "A".into(),
            degraded_agents: 0,
        }
    }

    #[test]
    fn test_ids_start_at_one_per_kind() {
        let repo = MemRepository::new();
        let m1 = repo.create_meta_prompt("base".into(), "gen".into(), openai());
        let m2 = repo.create_meta_prompt("base".into(), "gen2".into(), openai());
        let v1 = repo.create_variation(m1.id, "v".into(), openai());
        let t1 = repo.create_test_case(m1.id, "hello".into());

        assert_eq!((m1.id, m2.id), (1, 2));
        assert_eq!(v1.id, 1);
        assert_eq!(t1.id, 1);
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let repo = MemRepository::new();
        let v1 = repo.create_variation(1, "a".into(), openai());
        assert!(repo.delete_variation(v1.id));
        assert!(!repo.delete_variation(v1.id));
        let v2 = repo.create_variation(1, "b".into(), openai());
        assert_eq!(v2.id, 2);
        assert!(repo.get_variation(v1.id).is_none());
    }

    #[test]
    fn test_listing_filters_by_meta_prompt() {
        let repo = MemRepository::new();
        repo.create_variation(1, "a".into(), openai());
        repo.create_variation(2, "b".into(), openai());
        repo.create_variation(1, "c".into(), openai());

        let contents: Vec<String> = repo
            .variations_for_meta_prompt(1)
            .into_iter()
            .map(|v| v.content)
            .collect();
        assert_eq!(contents, vec!["a", "c"]);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let repo = MemRepository::new();
        let err = repo.update_variation(42, "x".into()).unwrap_err();
        assert_eq!(
            err,
            StorageError::NotFound {
                kind: "variation",
                id: 42
            }
        );
        assert!(repo.update_test_case(1, "x".into()).is_err());
        assert!(repo.update_meta_prompt(1, "x".into()).is_err());
    }

    #[test]
    fn test_update_content() {
        let repo = MemRepository::new();
        let v = repo.create_variation(1, "old".into(), openai());
        let updated = repo.update_variation(v.id, "new".into()).unwrap();
        assert_eq!(updated.content, "new");
        assert_eq!(repo.get_variation(v.id).unwrap().content, "new");
    }

    #[test]
    fn test_criterion_patch_is_partial() {
        let repo = MemRepository::new();
        let c = repo.create_criterion(new_criterion("Clarity"));
        let patched = repo
            .update_criterion(
                c.id,
                CriterionPatch {
                    weight: Some(2.5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(patched.weight, 2.5);
        assert_eq!(patched.name, "Clarity");
        assert_eq!(patched.description, "Clarity matters");
    }

    /// Meta prompt 1 with two variations, two test cases and one criterion.
    fn populated() -> MemRepository {
        let repo = MemRepository::new();
        let meta = repo.create_meta_prompt("base".into(), "gen".into(), openai());
        repo.create_variation(meta.id, "v1".into(), openai());
        repo.create_variation(meta.id, "v2".into(), openai());
        repo.create_test_case(meta.id, "t1".into());
        repo.create_test_case(meta.id, "t2".into());
        repo.create_criterion(new_criterion("Clarity"));
        repo
    }

    #[test]
    fn test_result_ids_assigned_by_repository() {
        let repo = MemRepository::new();
        let a = repo.create_result(result(1, 1, 1, 5.0));
        let b = repo.create_result(result(1, 2, 1, 6.0));
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(repo.get_result(2).unwrap().score, 6.0);
        assert_eq!(repo.results_for_test_case(2).len(), 1);
    }

    #[test]
    fn test_replace_results_swaps_only_listed_variations() {
        let repo = populated();
        repo.replace_results(&[1, 2], vec![result(1, 1, 1, 5.0), result(2, 1, 1, 7.0)]);

        let stored = repo.replace_results(&[1], vec![result(1, 2, 1, 9.0)]);
        assert_eq!(stored, 1);

        let v1 = repo.results_for_variation(1);
        assert_eq!(v1.len(), 1);
        assert_eq!((v1[0].test_case_id, v1[0].score), (2, 9.0));
        assert_eq!(repo.results_for_variation(2).len(), 1);
    }

    #[test]
    fn test_replace_results_skips_deleted_entities() {
        let repo = populated();
        assert!(repo.delete_variation(1));
        assert!(repo.delete_test_case(2));

        let stored = repo.replace_results(
            &[1, 2],
            vec![
                result(1, 1, 1, 5.0),
                result(2, 2, 1, 6.0),
                result(2, 1, 9, 6.0),
                result(2, 1, 1, 7.0),
            ],
        );
        assert_eq!(stored, 1);
        assert!(repo.results_for_variation(1).is_empty());
        assert_eq!(repo.results_for_variation(2)[0].score, 7.0);
    }

    #[test]
    fn test_deletes_cascade_to_results() {
        let repo = populated();
        repo.replace_results(
            &[1, 2],
            vec![result(1, 1, 1, 5.0), result(1, 2, 1, 6.0), result(2, 1, 1, 7.0)],
        );

        assert!(repo.delete_test_case(2));
        assert_eq!(repo.results_for_variation(1).len(), 1);

        assert!(repo.delete_variation(1));
        assert!(repo.results_for_variation(1).is_empty());
        assert!(repo.get_result(3).is_some());

        assert!(repo.delete_criterion(1));
        assert!(repo.results_for_test_case(1).is_empty());
        assert!(!repo.delete_criterion(1));
    }

    #[test]
    fn test_get_leaderboard() {
        let repo = MemRepository::new();
        let meta = repo.create_meta_prompt("base".into(), "gen".into(), openai());
        let v1 = repo.create_variation(meta.id, "first".into(), openai());
        let v2 = repo.create_variation(meta.id, "second".into(), openai());
        let other = repo.create_variation(meta.id + 1, "elsewhere".into(), openai());
        let c = repo.create_criterion(new_criterion("Clarity"));

        repo.create_result(result(v1.id, 1, c.id, 6.9));
        repo.create_result(result(v2.id, 1, c.id, 7.2));
        repo.create_result(result(other.id, 1, c.id, 10.0));

        let board = repo.get_leaderboard(meta.id);
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].variation_id, v2.id);
        assert_eq!(board[0].scores["Clarity"], 7.2);
        assert_eq!(board[1].variation_id, v1.id);
    }
}
