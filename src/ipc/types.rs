use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::oracle::{LexicalOracle, QuestionGenerator, SimilarityOracle, TemplateGenerator};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    // Injected capabilities; background workers clone the Arcs.
    pub oracle: Arc<dyn SimilarityOracle>,
    pub generator: Arc<dyn QuestionGenerator>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            oracle: Arc::new(LexicalOracle),
            generator: Arc::new(TemplateGenerator),
        }
    }
}
