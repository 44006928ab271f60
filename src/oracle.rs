use crate::coverage::BloomLevel;
use std::collections::HashSet;
use tracing::warn;

/// Scores how relevant a question is to a learning outcome, in [0,1].
///
/// Implementations are injected into the engine at construction time so tests
/// (and alternative scorers) can swap them freely. Errors are per-pair: the
/// engine logs and skips the pair, it never aborts a run over one failure.
pub trait SimilarityOracle: Send + Sync {
    fn similarity(&self, lo_text: &str, question_text: &str) -> anyhow::Result<f64>;
}

/// Oracles can return garbage; callers get a sane score regardless.
/// NaN collapses to 0.0, anything else is clamped into [0,1].
pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_nan() {
        warn!("oracle returned NaN similarity, treating as 0.0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&raw) {
        warn!(score = raw, "oracle similarity out of [0,1], clamping");
    }
    raw.clamp(0.0, 1.0)
}

/// Deterministic fallback scorer: Jaccard similarity over lower-cased
/// alphanumeric token sets. Good enough to make the daemon usable without a
/// remote model, and fully predictable in tests.
#[derive(Debug, Default)]
pub struct LexicalOracle;

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

impl SimilarityOracle for LexicalOracle {
    fn similarity(&self, lo_text: &str, question_text: &str) -> anyhow::Result<f64> {
        let a = tokens(lo_text);
        let b = tokens(question_text);
        if a.is_empty() || b.is_empty() {
            return Ok(0.0);
        }
        let inter = a.intersection(&b).count();
        let union = a.union(&b).count();
        Ok(inter as f64 / union as f64)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedMcq {
    pub text: String,
    pub options: Vec<String>,
    pub correct_answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedStructured {
    pub text: String,
    pub marks: f64,
    pub sample_answer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratedBundle {
    pub mcqs: Vec<GeneratedMcq>,
    pub structured: Vec<GeneratedStructured>,
}

/// Drafts exam questions for a learning outcome. Like the similarity oracle,
/// this is a seam: the in-tree implementation is a deterministic template
/// writer, a model-backed one plugs in behind the same trait.
pub trait QuestionGenerator: Send + Sync {
    fn generate(
        &self,
        lo_text: &str,
        bloom: BloomLevel,
        mcq_count: usize,
        structured_count: usize,
    ) -> anyhow::Result<GeneratedBundle>;
}

/// Generator output is repaired, never rejected: callers always get an MCQ
/// with at least 4 usable options and a correct answer that exists.
pub fn repair_mcq(mcq: GeneratedMcq) -> GeneratedMcq {
    let mut options: Vec<String> = mcq
        .options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();

    if options.len() < 4 {
        warn!(
            have = options.len(),
            "generated MCQ is short on options, padding with placeholders"
        );
        while options.len() < 4 {
            let letter = (b'A' + options.len() as u8) as char;
            options.push(format!("Option {}", letter));
        }
    }

    let correct = match mcq.correct_answer {
        Some(ans) if !ans.trim().is_empty() => ans.trim().to_string(),
        _ => options[0].clone(),
    };

    GeneratedMcq {
        text: mcq.text,
        options,
        correct_answer: Some(correct),
    }
}

fn bloom_stem(level: BloomLevel) -> &'static str {
    match level {
        BloomLevel::Remember => "State the key facts involved when you",
        BloomLevel::Understand => "Explain in your own words what it means to",
        BloomLevel::Apply => "Work through a concrete example where you",
        BloomLevel::Analyze => "Break down the steps required to",
        BloomLevel::Evaluate => "Justify the best approach to",
        BloomLevel::Create => "Design a solution in which you",
    }
}

#[derive(Debug, Default)]
pub struct TemplateGenerator;

impl QuestionGenerator for TemplateGenerator {
    fn generate(
        &self,
        lo_text: &str,
        bloom: BloomLevel,
        mcq_count: usize,
        structured_count: usize,
    ) -> anyhow::Result<GeneratedBundle> {
        let outcome = lo_text.trim().trim_end_matches('.');
        let mut bundle = GeneratedBundle::default();

        for i in 0..mcq_count {
            let correct = format!("It directly demonstrates the ability to {}", outcome);
            bundle.mcqs.push(GeneratedMcq {
                text: format!(
                    "Q{}: Which statement best shows that a student can {}?",
                    i + 1,
                    outcome
                ),
                options: vec![
                    correct.clone(),
                    "It restates the outcome without demonstrating it".to_string(),
                    "It addresses a different learning outcome".to_string(),
                    "It is unrelated to the module content".to_string(),
                ],
                correct_answer: Some(correct),
            });
        }

        for i in 0..structured_count {
            bundle.structured.push(GeneratedStructured {
                text: format!("Q{}: {} {}.", i + 1, bloom_stem(bloom), outcome),
                marks: 10.0,
                sample_answer: Some(format!(
                    "A full answer demonstrates the ability to {} with justified reasoning.",
                    outcome
                )),
            });
        }

        Ok(bundle)
    }
}
