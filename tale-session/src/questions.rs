use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tale_core::{LessonQuestion, Result, TaleError};

/// Lesson-question sampling. Within a session, uniqueness is guaranteed by
/// the `exclude` list the engine maintains (question text is the key; the
/// catalog has no stable ids).
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// How many distinct questions the topic can supply.
    async fn available(&self, topic: &str) -> Result<usize>;

    /// A question for `topic` not present in `exclude`, or `None` when the
    /// topic is exhausted.
    async fn sample(&self, topic: &str, exclude: &[String]) -> Result<Option<LessonQuestion>>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    topics: BTreeMap<String, Vec<CatalogQuestion>>,
}

#[derive(Debug, Deserialize)]
struct CatalogQuestion {
    question: String,
    answers: Vec<String>,
    correct_index: usize,
    explanation: String,
}

/// Question source backed by a JSON catalog (see `assets/questions.json` for
/// the bundled default).
pub struct CatalogQuestionSource {
    topics: BTreeMap<String, Vec<LessonQuestion>>,
}

impl CatalogQuestionSource {
    /// The catalog bundled with the crate.
    pub fn builtin() -> Self {
        Self::from_json_str(include_str!("../assets/questions.json"))
            .expect("bundled catalog is valid")
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| TaleError::Question(format!("catalog parse: {e}")))?;

        let mut topics = BTreeMap::new();
        for (topic, questions) in file.topics {
            let mut parsed = Vec::with_capacity(questions.len());
            for q in questions {
                if q.answers.len() < 2 || q.correct_index >= q.answers.len() {
                    return Err(TaleError::Question(format!(
                        "malformed question in topic {topic:?}: {:?}",
                        q.question
                    )));
                }
                parsed.push(LessonQuestion {
                    topic: topic.clone(),
                    question: q.question,
                    answers: q.answers,
                    correct_index: q.correct_index,
                    explanation: q.explanation,
                });
            }
            topics.insert(topic, parsed);
        }
        Ok(Self { topics })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TaleError::Question(format!("catalog read: {e}")))?;
        Self::from_json_str(&json)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

#[async_trait]
impl QuestionSource for CatalogQuestionSource {
    async fn available(&self, topic: &str) -> Result<usize> {
        Ok(self.topics.get(topic).map(Vec::len).unwrap_or(0))
    }

    async fn sample(&self, topic: &str, exclude: &[String]) -> Result<Option<LessonQuestion>> {
        let Some(pool) = self.topics.get(topic) else {
            return Ok(None);
        };
        let candidates: Vec<&LessonQuestion> =
            pool.iter().filter(|q| !exclude.contains(&q.question)).collect();
        if candidates.is_empty() {
            tracing::debug!(topic, "question topic exhausted");
            return Ok(None);
        }
        let index = rand::rng().random_range(0..candidates.len());
        Ok(Some(candidates[index].clone()))
    }
}
